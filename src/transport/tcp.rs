//! TCP transport with idle-heartbeat supervision.
//!
//! One combined loop per connection handles both reads and the keepalive:
//! inbound bytes reset the idle clock; once the connection sits idle past
//! the threshold a probe goes out and a reply must arrive within a bounded
//! window. Probe writes share the send mutex with application writes so
//! frames never interleave on the wire.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::codec::modbus::TCP_PROBE;
use crate::codec::{ByteWindow, Frame, FrameCodec};

use super::correlator::{self, RequestSlot};
use super::reconnect::{self, ReconnectPolicy};
use super::state::{ConnectionState, StateChangeEvent, StateTracker};
use super::{dispatch_frames, Result, Transport, TransportError, FRAME_CAPACITY};

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Idle time before a probe is sent.
    pub idle: Duration,
    /// How long to wait for any reply to the probe.
    pub reply_window: Duration,
    pub probe: Vec<u8>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(5),
            reply_window: Duration::from_secs(1),
            probe: TCP_PROBE.to_vec(),
        }
    }
}

struct Link {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    shutdown: CancellationToken,
}

struct Shared {
    host: String,
    port: u16,
    codec: Arc<dyn FrameCodec>,
    policy: ReconnectPolicy,
    heartbeat: HeartbeatConfig,
    tracker: StateTracker,
    slot: RequestSlot,
    frames_tx: broadcast::Sender<Frame>,
    link: Mutex<Option<Link>>,
    // Serializes reconnection sequences, manual and automatic
    reconnect_gate: Mutex<()>,
}

pub struct TcpTransport {
    shared: Arc<Shared>,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16, codec: Arc<dyn FrameCodec>) -> Self {
        Self::with_options(
            host,
            port,
            codec,
            ReconnectPolicy::default(),
            HeartbeatConfig::default(),
        )
    }

    pub fn with_options(
        host: impl Into<String>,
        port: u16,
        codec: Arc<dyn FrameCodec>,
        policy: ReconnectPolicy,
        heartbeat: HeartbeatConfig,
    ) -> Self {
        let (frames_tx, _) = broadcast::channel(FRAME_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                host: host.into(),
                port,
                codec,
                policy,
                heartbeat,
                tracker: StateTracker::new(),
                slot: RequestSlot::new(),
                frames_tx,
                link: Mutex::new(None),
                reconnect_gate: Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.tracker.current()
    }
}

impl Shared {
    async fn open_link(self: &Arc<Self>) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            TransportError::TransportUnavailable(format!("{}: {}", addr, e))
        })?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let writer = Arc::new(Mutex::new(writer));
        let shutdown = CancellationToken::new();
        {
            let mut link = self.link.lock().await;
            // A racing reconnect may have left a live loop behind
            if let Some(previous) = link.replace(Link {
                writer: writer.clone(),
                shutdown: shutdown.clone(),
            }) {
                previous.shutdown.cancel();
            }
        }
        log::info!("TCP link to {} established", addr);
        tokio::spawn(run_loop(self.clone(), reader, writer, shutdown));
        Ok(())
    }

    async fn teardown(&self) {
        let mut link = self.link.lock().await;
        if let Some(link) = link.take() {
            link.shutdown.cancel();
        }
        drop(link);
        self.slot.fail_pending().await;
    }

    async fn reconnect_with_policy(self: &Arc<Self>) -> Result<()> {
        let _gate = self.reconnect_gate.lock().await;
        if self.tracker.is_connected() {
            return Ok(());
        }
        let shared = self.clone();
        reconnect::run_with_policy(&self.policy, &self.tracker, move || {
            let shared = shared.clone();
            async move {
                shared.teardown().await;
                shared.open_link().await
            }
        })
        .await
    }
}

async fn run_loop(
    shared: Arc<Shared>,
    mut reader: OwnedReadHalf,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    shutdown: CancellationToken,
) {
    let mut window = ByteWindow::new();
    let mut buf = [0u8; 1024];
    let mut last_activity = Instant::now();
    let idle = shared.heartbeat.idle;
    let loss_reason;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            res = reader.read(&mut buf) => match res {
                Ok(0) => {
                    loss_reason = "Connection closed by peer".to_string();
                    break;
                }
                Ok(n) => {
                    last_activity = Instant::now();
                    window.append(&buf[..n]);
                    dispatch_frames(&*shared.codec, &mut window, &shared.slot, &shared.frames_tx).await;
                }
                Err(e) => {
                    loss_reason = format!("Read error: {}", e);
                    break;
                }
            },
            _ = tokio::time::sleep_until(last_activity + idle) => {
                log::debug!("Idle for {:?}, sending heartbeat probe", idle);
                let sent = {
                    let mut w = writer.lock().await;
                    w.write_all(&shared.heartbeat.probe).await
                };
                if let Err(e) = sent {
                    loss_reason = format!("Heartbeat write failed: {}", e);
                    break;
                }
                let reply = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    res = tokio::time::timeout(shared.heartbeat.reply_window, reader.read(&mut buf)) => res,
                };
                match reply {
                    Ok(Ok(n)) if n > 0 => {
                        last_activity = Instant::now();
                        window.append(&buf[..n]);
                        dispatch_frames(&*shared.codec, &mut window, &shared.slot, &shared.frames_tx).await;
                    }
                    Ok(Ok(_)) => {
                        loss_reason = "Connection closed during heartbeat".to_string();
                        break;
                    }
                    Ok(Err(e)) => {
                        loss_reason = format!("Heartbeat read failed: {}", e);
                        break;
                    }
                    Err(_) => {
                        loss_reason = "Heartbeat timed out".to_string();
                        break;
                    }
                }
            }
        }
    }

    // An explicit disconnect is not a loss
    if shutdown.is_cancelled() {
        return;
    }
    shared
        .tracker
        .transition(ConnectionState::Lost, loss_reason, true);
    shared.teardown().await;
    spawn_recovery(shared);
}

// Recovery runs on its own task: the loop future must not contain the
// reconnect future, which in turn spawns the loop.
fn spawn_recovery(shared: Arc<Shared>) {
    tokio::spawn(async move {
        if let Err(e) = shared.reconnect_with_policy().await {
            log::error!("TCP recovery failed: {}", e);
        }
    });
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> Result<()> {
        if self.shared.tracker.is_connected() {
            return Ok(());
        }
        self.shared.tracker.transition(
            ConnectionState::Connecting,
            format!("Connecting to {}:{}", self.shared.host, self.shared.port),
            true,
        );
        match self.shared.open_link().await {
            Ok(()) => {
                self.shared
                    .tracker
                    .transition(ConnectionState::Connected, "Connected", true);
                Ok(())
            }
            Err(e) => {
                self.shared.tracker.transition(
                    ConnectionState::Disconnected,
                    format!("Connect failed: {}", e),
                    true,
                );
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.shared.teardown().await;
        self.shared
            .tracker
            .transition(ConnectionState::Disconnected, "Disconnected", true);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.shared.tracker.is_connected()
    }

    async fn send(&self, bytes: &[u8]) -> Result<()> {
        let writer = {
            let link = self.shared.link.lock().await;
            match link.as_ref() {
                Some(link) => link.writer.clone(),
                None => return Err(TransportError::NotConnected),
            }
        };
        let mut writer = writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        log::trace!("Sent {} bytes: {}", bytes.len(), hex::encode(bytes));
        Ok(())
    }

    async fn send_and_receive(
        &self,
        opcode: u8,
        payload: &[u8],
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Frame> {
        let rx = self.shared.slot.register(opcode, timeout).await?;
        let bytes = self.shared.codec.encode(opcode, payload);
        if let Err(e) = self.send(&bytes).await {
            self.shared.slot.clear().await;
            return Err(e);
        }
        correlator::await_response(&self.shared.slot, rx, timeout, &cancel).await
    }

    fn subscribe_frames(&self) -> broadcast::Receiver<Frame> {
        self.shared.frames_tx.subscribe()
    }

    fn subscribe_state(&self) -> broadcast::Receiver<StateChangeEvent> {
        self.shared.tracker.subscribe()
    }

    async fn reconnect(&self) -> Result<()> {
        self.shared.reconnect_with_policy().await
    }
}

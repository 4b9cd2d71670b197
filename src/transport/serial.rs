//! Serial transport for RS-232/485 attached instruments.
//!
//! A background read loop feeds the accumulator and fans out assembled
//! frames. Hardware presence is watched through an injected port-event
//! feed: detach of our port tears the handle down and marks the
//! connection Lost, a later attach of the same port runs the bounded
//! reconnection policy. Reconnection sequences are serialized so only one
//! runs at a time.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::sync::CancellationToken;

use crate::codec::{ByteWindow, Frame, FrameCodec};
use crate::device::port_monitor::{PortEvent, PortMonitor};

use super::correlator::{self, RequestSlot};
use super::reconnect::{self, ReconnectPolicy};
use super::state::{ConnectionState, StateChangeEvent, StateTracker};
use super::{
    dispatch_frames, ConnectionParams, DataBits, Parity, Result, StopBits, Transport,
    TransportError, FRAME_CAPACITY,
};

struct Link {
    writer: Arc<Mutex<WriteHalf<SerialStream>>>,
    shutdown: CancellationToken,
}

struct Shared {
    port_name: String,
    baud_rate: u32,
    data_bits: DataBits,
    parity: Parity,
    stop_bits: StopBits,
    codec: Arc<dyn FrameCodec>,
    policy: ReconnectPolicy,
    tracker: StateTracker,
    slot: RequestSlot,
    frames_tx: broadcast::Sender<Frame>,
    link: Mutex<Option<Link>>,
    reconnect_gate: Mutex<()>,
}

pub struct SerialTransport {
    shared: Arc<Shared>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl SerialTransport {
    pub fn new(params: &ConnectionParams, codec: Arc<dyn FrameCodec>) -> Result<Self> {
        Self::with_policy(params, codec, ReconnectPolicy::default())
    }

    pub fn with_policy(
        params: &ConnectionParams,
        codec: Arc<dyn FrameCodec>,
        policy: ReconnectPolicy,
    ) -> Result<Self> {
        let (port_name, baud_rate, data_bits, parity, stop_bits) = match params {
            ConnectionParams::Serial {
                port,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => (port.clone(), *baud_rate, *data_bits, *parity, *stop_bits),
            ConnectionParams::Tcp { .. } => {
                return Err(TransportError::TransportUnavailable(
                    "serial connection parameters required".into(),
                ))
            }
        };
        let (frames_tx, _) = broadcast::channel(FRAME_CAPACITY);
        Ok(Self {
            shared: Arc::new(Shared {
                port_name,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
                codec,
                policy,
                tracker: StateTracker::new(),
                slot: RequestSlot::new(),
                frames_tx,
                link: Mutex::new(None),
                reconnect_gate: Mutex::new(()),
            }),
            watch_task: Mutex::new(None),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.shared.port_name
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.tracker.current()
    }

    /// Start consuming a presence feed from `monitor`.
    pub async fn watch(&self, monitor: &mut dyn PortMonitor) -> Result<()> {
        monitor
            .start()
            .await
            .map_err(|e| TransportError::TransportUnavailable(e.to_string()))?;
        match monitor.take_receiver() {
            Some(rx) => {
                self.attach_port_events(rx).await;
                Ok(())
            }
            None => Err(TransportError::TransportUnavailable(
                "port monitor has no event receiver".into(),
            )),
        }
    }

    /// Wire a raw attach/detach event feed to this transport. Events for
    /// other ports are ignored.
    pub async fn attach_port_events(&self, mut rx: mpsc::Receiver<PortEvent>) {
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    PortEvent::Detached(name) if name == shared.port_name => {
                        log::warn!("Port {} detached", name);
                        shared.tracker.transition(
                            ConnectionState::Lost,
                            format!("Device on {} unplugged", name),
                            true,
                        );
                        shared.teardown().await;
                    }
                    PortEvent::Attached(name) if name == shared.port_name => {
                        if shared.tracker.is_connected() {
                            continue;
                        }
                        log::info!("Port {} attached, attempting reconnect", name);
                        if let Err(e) = shared.reconnect_with_policy().await {
                            log::error!("Reconnect after attach failed: {}", e);
                        }
                    }
                    _ => {}
                }
            }
        });
        let mut guard = self.watch_task.lock().await;
        if let Some(previous) = guard.replace(task) {
            previous.abort();
        }
    }
}

impl Shared {
    async fn open_link(self: &Arc<Self>) -> Result<()> {
        let builder = tokio_serial::new(&self.port_name, self.baud_rate)
            .data_bits(self.data_bits.to_serial())
            .parity(self.parity.to_serial())
            .stop_bits(self.stop_bits.to_serial())
            .timeout(Duration::from_millis(100));
        let stream = builder.open_native_async().map_err(|e| {
            TransportError::TransportUnavailable(format!("{}: {}", self.port_name, e))
        })?;
        #[cfg(unix)]
        let stream = {
            let mut stream = stream;
            if let Err(e) = stream.set_exclusive(false) {
                log::warn!("Could not clear exclusive mode on {}: {}", self.port_name, e);
            }
            stream
        };
        let (reader, writer) = tokio::io::split(stream);
        let writer = Arc::new(Mutex::new(writer));
        let shutdown = CancellationToken::new();
        {
            let mut link = self.link.lock().await;
            // A racing reconnect may have left a live loop behind
            if let Some(previous) = link.replace(Link {
                writer,
                shutdown: shutdown.clone(),
            }) {
                previous.shutdown.cancel();
            }
        }
        log::info!("Opened {} at {} baud", self.port_name, self.baud_rate);
        tokio::spawn(read_loop(self.clone(), reader, shutdown));
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

async fn read_loop(shared: Arc<Shared>, mut reader: ReadHalf<SerialStream>, shutdown: CancellationToken) {
    let mut window = ByteWindow::new();
    let mut buf = [0u8; 512];
    let loss_reason;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            res = reader.read(&mut buf) => match res {
                Ok(0) => {
                    loss_reason = "Port closed".to_string();
                    break;
                }
                Ok(n) => {
                    window.append(&buf[..n]);
                    dispatch_frames(&*shared.codec, &mut window, &shared.slot, &shared.frames_tx).await;
                }
                Err(e) => {
                    loss_reason = format!("Read error: {}", e);
                    break;
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
            log::error!("Serial recovery failed: {}", e);
        }
    });
}

#[async_trait::async_trait]
impl Transport for SerialTransport {
    async fn connect(&self) -> Result<()> {
        if self.shared.tracker.is_connected() {
            return Ok(());
        }
        self.shared.tracker.transition(
            ConnectionState::Connecting,
            format!("Opening {}", self.shared.port_name),
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
                    format!("Open failed: {}", e),
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

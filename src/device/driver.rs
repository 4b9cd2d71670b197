//! Instrument drivers: handshake and measurement orchestration on top of
//! a transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::color::{OP_IDENTIFY, OP_MEASURE};
use crate::transport::Transport;

use super::identity::InstrumentIdentity;
use super::measurement::MeasurementResult;
use super::{DeviceError, Result};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
const MEASUREMENT_TIMEOUT: Duration = Duration::from_secs(10);
const RESULT_CAPACITY: usize = 32;

/// Identify the instrument through the correlator. A transport-level
/// connection without a valid handshake response is not a connection.
async fn handshake(transport: &dyn Transport) -> Result<InstrumentIdentity> {
    let frame = transport
        .send_and_receive(
            OP_IDENTIFY,
            &[],
            HANDSHAKE_TIMEOUT,
            CancellationToken::new(),
        )
        .await?;
    if !frame.is_ack_ok() {
        return Err(DeviceError::HandshakeFailed(format!(
            "instrument rejected identify, ack {:#04x}",
            frame.status
        )));
    }
    let identity = InstrumentIdentity::parse(&frame.payload)
        .map_err(|e| DeviceError::HandshakeFailed(e.to_string()))?;
    log::info!(
        "Identified {} {} (firmware {})",
        identity.name,
        identity.model,
        identity.firmware_version
    );
    Ok(identity)
}

async fn run_measurement(
    transport: &dyn Transport,
    instrument_serial: &str,
    cancel: CancellationToken,
) -> Result<MeasurementResult> {
    let frame = transport
        .send_and_receive(OP_MEASURE, &[], MEASUREMENT_TIMEOUT, cancel)
        .await?;
    if !frame.is_ack_ok() {
        return Err(DeviceError::MeasurementFailed(format!(
            "instrument rejected measurement, ack {:#04x}",
            frame.status
        )));
    }
    MeasurementResult::parse(&frame.payload, instrument_serial)
        .map_err(|e| DeviceError::MeasurementFailed(e.to_string()))
}

/// CR family: request/response only.
pub struct CrInstrument {
    transport: Arc<dyn Transport>,
    identity: Mutex<Option<InstrumentIdentity>>,
}

impl CrInstrument {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            identity: Mutex::new(None),
        }
    }

    /// Transport connect followed by the identify handshake. Any failure
    /// after the transport came up tears it back down.
    pub async fn connect(&self) -> Result<InstrumentIdentity> {
        self.transport.connect().await?;
        match handshake(self.transport.as_ref()).await {
            Ok(identity) => {
                *self.identity.lock().await = Some(identity.clone());
                Ok(identity)
            }
            Err(e) => {
                log::warn!("Handshake failed, tearing connection down: {}", e);
                let _ = self.transport.disconnect().await;
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self) -> Result<()> {
        *self.identity.lock().await = None;
        self.transport.disconnect().await?;
        Ok(())
    }

    pub async fn identity(&self) -> Option<InstrumentIdentity> {
        self.identity.lock().await.clone()
    }

    pub async fn run_measurement(&self, cancel: CancellationToken) -> Result<MeasurementResult> {
        let serial = {
            let identity = self.identity.lock().await;
            match identity.as_ref() {
                Some(identity) => identity.internal_whiteboard_sn.clone(),
                None => {
                    return Err(DeviceError::MeasurementFailed(
                        "not connected: no handshake identity".into(),
                    ))
                }
            }
        };
        run_measurement(self.transport.as_ref(), &serial, cancel).await
    }
}

/// PTS family: same handshake and on-demand measurement as CR, plus a
/// continuous mode that republishes every decoded measurement frame to
/// any number of listeners.
pub struct PtsInstrument {
    transport: Arc<dyn Transport>,
    identity: Mutex<Option<InstrumentIdentity>>,
    results_tx: broadcast::Sender<MeasurementResult>,
    stream_task: Mutex<Option<JoinHandle<()>>>,
}

impl PtsInstrument {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (results_tx, _) = broadcast::channel(RESULT_CAPACITY);
        Self {
            transport,
            identity: Mutex::new(None),
            results_tx,
            stream_task: Mutex::new(None),
        }
    }

    pub async fn connect(&self) -> Result<InstrumentIdentity> {
        self.transport.connect().await?;
        match handshake(self.transport.as_ref()).await {
            Ok(identity) => {
                *self.identity.lock().await = Some(identity.clone());
                Ok(identity)
            }
            Err(e) => {
                log::warn!("Handshake failed, tearing connection down: {}", e);
                let _ = self.transport.disconnect().await;
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.stop_streaming().await;
        *self.identity.lock().await = None;
        self.transport.disconnect().await?;
        Ok(())
    }

    pub async fn identity(&self) -> Option<InstrumentIdentity> {
        self.identity.lock().await.clone()
    }

    pub async fn run_measurement(&self, cancel: CancellationToken) -> Result<MeasurementResult> {
        let serial = self
            .identity()
            .await
            .map(|i| i.internal_whiteboard_sn)
            .ok_or_else(|| {
                DeviceError::MeasurementFailed("not connected: no handshake identity".into())
            })?;
        run_measurement(self.transport.as_ref(), &serial, cancel).await
    }

    pub fn subscribe_measurements(&self) -> broadcast::Receiver<MeasurementResult> {
        self.results_tx.subscribe()
    }

    /// Start republishing decoded measurement frames until `cancel` fires
    /// or the transport frame stream closes. Fan-out, not
    /// request/response: frames arrive at the instrument's own pace.
    pub async fn start_streaming(&self, cancel: CancellationToken) -> Result<()> {
        let serial = self
            .identity()
            .await
            .map(|i| i.internal_whiteboard_sn)
            .ok_or_else(|| {
                DeviceError::MeasurementFailed("not connected: no handshake identity".into())
            })?;
        let mut frames = self.transport.subscribe_frames();
        let results_tx = self.results_tx.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = frames.recv() => match res {
                        Ok(frame) if frame.opcode == OP_MEASURE && frame.is_ack_ok() => {
                            match MeasurementResult::parse(&frame.payload, &serial) {
                                Ok(result) => {
                                    let _ = results_tx.send(result);
                                }
                                Err(e) => {
                                    log::warn!("Dropping undecodable measurement frame: {}", e)
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Measurement stream lagged, {} frames dropped", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        let mut guard = self.stream_task.lock().await;
        if let Some(previous) = guard.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    pub async fn stop_streaming(&self) {
        if let Some(task) = self.stream_task.lock().await.take() {
            task.abort();
        }
    }
}

pub mod correlator;
pub mod reconnect;
pub mod serial;
pub mod state;
pub mod tcp;

pub use correlator::RequestSlot;
pub use reconnect::{Backoff, ReconnectPolicy};
pub use serial::SerialTransport;
pub use state::{ConnectionState, StateChangeEvent, StateTracker};
pub use tcp::TcpTransport;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::codec::{CodecError, Frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    Seven,
    Eight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    One,
    Two,
    OnePointFive,
}

impl DataBits {
    pub(crate) fn to_serial(self) -> tokio_serial::DataBits {
        match self {
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

impl Parity {
    pub(crate) fn to_serial(self) -> tokio_serial::Parity {
        match self {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

impl StopBits {
    pub(crate) fn to_serial(self) -> tokio_serial::StopBits {
        match self {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
            StopBits::OnePointFive => {
                // Not representable on this platform layer
                log::warn!("1.5 stop bits unsupported, falling back to 2");
                tokio_serial::StopBits::Two
            }
        }
    }
}

/// How to reach an instrument. Immutable once a transport is built from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionParams {
    Serial {
        port: String,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
    },
    Tcp {
        host: String,
        port: u16,
    },
}

impl ConnectionParams {
    /// Common serial defaults for the instruments: 9600 8N1.
    pub fn serial_default(port: impl Into<String>) -> Self {
        Self::Serial {
            port: port.into(),
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Request timed out")]
    RequestTimeout,

    #[error("Another request is in progress")]
    RequestInProgress,

    #[error("Reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A live connection to an instrument: owns the OS handle, a background
/// read loop and the request slot, and fans out decoded frames and state
/// transitions.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn is_connected(&self) -> bool;

    /// Write raw bytes, serialized against every other writer on this
    /// transport (including the TCP heartbeat).
    async fn send(&self, bytes: &[u8]) -> Result<()>;

    /// Encode and send a request, then wait for the next inbound frame
    /// carrying the same opcode. At most one request may be outstanding
    /// per transport; a concurrent call fails with `RequestInProgress`.
    /// Correlation is by opcode alone, so two outstanding requests must
    /// never share an opcode.
    async fn send_and_receive(
        &self,
        opcode: u8,
        payload: &[u8],
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Frame>;

    /// Every frame assembled by the read loop, in assembly order.
    fn subscribe_frames(&self) -> broadcast::Receiver<Frame>;

    /// Every connection state transition.
    fn subscribe_state(&self) -> broadcast::Receiver<StateChangeEvent>;

    /// Manual reconnect; runs the same bounded-retry policy as automatic
    /// recovery.
    async fn reconnect(&self) -> Result<()>;
}

pub(crate) const FRAME_CAPACITY: usize = 64;

/// Drain every complete frame out of the window: resolve the pending
/// request first, then fan out on the frame channel. Codec errors have
/// already consumed the offending bytes, so the drain always progresses.
pub(crate) async fn dispatch_frames(
    codec: &dyn crate::codec::FrameCodec,
    window: &mut crate::codec::ByteWindow,
    slot: &RequestSlot,
    frames_tx: &broadcast::Sender<Frame>,
) {
    loop {
        match codec.extract(window) {
            Ok(Some(frame)) => {
                log::debug!(
                    "Frame assembled: opcode {:#04x}, status {:#04x}, {} payload bytes",
                    frame.opcode,
                    frame.status,
                    frame.payload.len()
                );
                slot.try_complete(&frame).await;
                let _ = frames_tx.send(frame);
            }
            Ok(None) => break,
            Err(e) => log::warn!("Discarded frame: {}", e),
        }
    }
}

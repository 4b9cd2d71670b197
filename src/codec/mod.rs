pub mod accumulator;
pub mod color;
pub mod modbus;

pub use accumulator::ByteWindow;
pub use color::{ChecksumMode, ColorCodec};
pub use modbus::{MbapCodec, RtuCodec};

/// One complete unit of either wire protocol.
///
/// For the instrument protocol `opcode` is the command byte and `status`
/// the acknowledge byte (0 = success). For Modbus frames `opcode` carries
/// the function code and `status` the unit address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub status: u8,
    pub payload: Vec<u8>,
    pub checksum: u16,
}

impl Frame {
    pub fn is_ack_ok(&self) -> bool {
        self.status == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Checksum mismatch: computed {computed:#06x}, received {received:#06x}")]
    ChecksumMismatch { computed: u16, received: u16 },
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Wire-format codec driven by the transport read loops.
///
/// `encode` builds an outgoing request for an opcode. `extract` pulls the
/// next complete frame out of the accumulated byte window, consuming its
/// bytes, or returns `Ok(None)` when more data is needed.
pub trait FrameCodec: Send + Sync {
    fn encode(&self, opcode: u8, payload: &[u8]) -> Vec<u8>;
    fn extract(&self, window: &mut ByteWindow) -> Result<Option<Frame>>;
}

//! Communication engine for PTS and CR laboratory color-measurement
//! instruments.
//!
//! The engine layers, bottom up:
//! - [`codec`]: the instrument's framed binary protocol plus Modbus-RTU
//!   and MBAP, and the accumulator that reassembles frames from
//!   fragmented reads.
//! - [`transport`]: serial and TCP connections with background read
//!   loops, a TCP idle heartbeat, a bounded-retry reconnection policy and
//!   a single-slot request/response correlator.
//! - [`device`]: instrument drivers composing transport, codec and
//!   correlator into handshake and measurement sequences, plus serial
//!   port discovery and presence watching.
//! - [`config`]: explicit last-used-parameters handling, injected rather
//!   than global.
//!
//! No logger is installed here; the crate logs through the `log` facade.

pub mod codec;
pub mod config;
pub mod device;
pub mod transport;

pub use codec::{ChecksumMode, CodecError, ColorCodec, Frame, MbapCodec, RtuCodec};
pub use config::{ConnectionConfig, MemoryParamsStore, ParamsStore};
pub use device::{
    CrInstrument, DeviceError, DeviceFamily, InstrumentIdentity, MeasurementResult, PtsInstrument,
};
pub use transport::{
    ConnectionParams, ConnectionState, ReconnectPolicy, SerialTransport, StateChangeEvent,
    TcpTransport, Transport, TransportError,
};

//! Message Protocol: protobuf wire types, framing and the transport seams.

mod conversions;
mod encoding;
pub mod proto;

use crate::{channel::ChannelError, messages::Message};
use core::fmt::Debug;
use thiserror::Error;

pub use encoding::{decode_message, encode_message, ProtoBufEncodingLayer, MAX_FRAME_LEN};

/// Failure to turn a wire message into a domain value.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("{field} must be {expected} bytes, got {got}")]
    ByteLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{0} is missing")]
    MissingField(&'static str),
    #[error("unknown {field} {value}")]
    UnknownKind { field: &'static str, value: u32 },
    #[error("protobuf: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame of {got} bytes is shorter than its length prefix")]
    Truncated { got: usize },
    #[error("length prefix says {declared} bytes, frame carries {got}")]
    LengthMismatch { declared: usize, got: usize },
    #[error("message of {0} bytes exceeds the frame limit")]
    TooLarge(usize),
    #[error("protobuf: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("protobuf: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

/// Byte-level transport, addressed by participant id.
pub trait BytesBus: Debug + Send + Sync {
    fn send_to_participant(&self, recipient: &str, msg: &[u8]);
}

/// Outbound side of the transport. Delivery is at least once and may
/// reorder messages.
pub trait MessageBus: Debug + Send + Sync {
    fn send(&self, msg: Message);
}

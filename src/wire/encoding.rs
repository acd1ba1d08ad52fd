use super::{proto::EnvelopeMsg, BytesBus, MessageBus, WireError};
use crate::messages::Message;
use prost::{bytes::BufMut, Message as _};
use tracing::{error, trace};

const PREFIX_LEN: usize = 4;

/// Largest envelope we send or accept.
pub const MAX_FRAME_LEN: usize = 16 << 20;

/// Frames `msg` as a 4 byte big-endian length followed by the protobuf
/// envelope. `encode_length_delimited` would write a LEB128 varint instead.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, WireError> {
    let envelope = EnvelopeMsg::from(msg);
    let len = envelope.encoded_len();
    if len > MAX_FRAME_LEN {
        return Err(WireError::TooLarge(len));
    }
    let mut buf = Vec::with_capacity(PREFIX_LEN + len);
    buf.put_u32(len as u32);
    envelope.encode(&mut buf)?;
    Ok(buf)
}

/// Inverse of [encode_message]. The frame must contain exactly one message.
pub fn decode_message(frame: &[u8]) -> Result<Message, WireError> {
    if frame.len() < PREFIX_LEN {
        return Err(WireError::Truncated { got: frame.len() });
    }
    let (prefix, body) = frame.split_at(PREFIX_LEN);
    let mut len_bytes = [0u8; PREFIX_LEN];
    len_bytes.copy_from_slice(prefix);
    let declared = u32::from_be_bytes(len_bytes) as usize;
    if declared > MAX_FRAME_LEN {
        return Err(WireError::TooLarge(declared));
    }
    if declared != body.len() {
        return Err(WireError::LengthMismatch {
            declared,
            got: body.len(),
        });
    }
    let envelope = EnvelopeMsg::decode(body)?;
    Ok(Message::try_from(envelope)?)
}

/// Sends typed messages over a [BytesBus].
#[derive(Debug)]
pub struct ProtoBufEncodingLayer<B: BytesBus> {
    pub bus: B,
}

impl<B: BytesBus> ProtoBufEncodingLayer<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }
}

impl<B: BytesBus> MessageBus for ProtoBufEncodingLayer<B> {
    fn send(&self, msg: Message) {
        match encode_message(&msg) {
            Ok(buf) => {
                trace!(recipient = %msg.recipient, len = buf.len(), "sending message");
                self.bus.send_to_participant(&msg.recipient, &buf);
            }
            Err(e) => error!(recipient = %msg.recipient, error = %e, "dropping unencodable message"),
        }
    }
}

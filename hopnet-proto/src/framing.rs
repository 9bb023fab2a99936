//! Length-prefixed message framing.
//!
//! Frames are laid out as:
//! - 4 bytes: network magic
//! - 4 bytes: big-endian payload length
//! - N bytes: serialized [`SignedMessage`]

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use hopnet_core::serialization;

use crate::error::{ProtoError, ProtoResult};
use crate::messages::SignedMessage;

/// Magic bytes opening every hopnet frame.
pub const NETWORK_MAGIC: [u8; 4] = *b"hop1";

/// Upper bound on a frame payload. Balance proofs and locks are small;
/// anything near this limit is hostile.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

const HEADER_SIZE: usize = 8;

/// Codec turning a byte stream into [`SignedMessage`] values.
#[derive(Debug, Default)]
pub struct MessageCodec {
    current_length: Option<usize>,
}

impl MessageCodec {
    /// Create a codec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame a message into bytes without a live stream.
    pub fn frame(message: &SignedMessage) -> ProtoResult<Vec<u8>> {
        let payload = serialization::serialize(message)?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ProtoError::MessageTooLarge { size: payload.len(), max: MAX_MESSAGE_SIZE });
        }
        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
        out.extend_from_slice(&NETWORK_MAGIC);
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }
}

impl Decoder for MessageCodec {
    type Item = SignedMessage;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> ProtoResult<Option<Self::Item>> {
        if self.current_length.is_none() {
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }

            let magic: [u8; 4] = src[0..4].try_into().unwrap();
            if magic != NETWORK_MAGIC {
                return Err(ProtoError::InvalidMagic { expected: NETWORK_MAGIC, actual: magic });
            }

            let length = u32::from_be_bytes(src[4..8].try_into().unwrap()) as usize;
            if length > MAX_MESSAGE_SIZE {
                return Err(ProtoError::MessageTooLarge { size: length, max: MAX_MESSAGE_SIZE });
            }
            self.current_length = Some(length);
        }

        let length = self.current_length.unwrap();
        if src.len() < HEADER_SIZE + length {
            src.reserve(HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length);
        self.current_length = None;

        let message: SignedMessage = serialization::deserialize(&payload)?;
        Ok(Some(message))
    }
}

impl Encoder<SignedMessage> for MessageCodec {
    type Error = ProtoError;

    fn encode(&mut self, message: SignedMessage, dst: &mut BytesMut) -> ProtoResult<()> {
        let payload = serialization::serialize(&message)?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ProtoError::MessageTooLarge { size: payload.len(), max: MAX_MESSAGE_SIZE });
        }

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_slice(&NETWORK_MAGIC);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

//! Codec for encoding/decoding protocol messages

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Incomplete message")]
    IncompleteMessage,
}

/// Length-prefixed bincode message codec
///
/// Format: [length: u32 big-endian][payload: bincode serialized message]
pub struct MessageCodec;

impl MessageCodec {
    /// Encode a message to bytes
    pub fn encode<M: Serialize>(msg: &M) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > crate::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a message from the front of `buf`
    ///
    /// Returns Ok(Some(message)) if a complete message was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error
    pub fn decode<M: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<M>, CodecError> {
        // Need at least 4 bytes for length header
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > crate::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        // Check if we have the full message
        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let msg_bytes = buf.split_to(length);

        let msg: M = bincode::deserialize(&msg_bytes)?;
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ClientMessage, Mirror};

    #[test]
    fn test_encode_decode() {
        let msg = ClientMessage::RequireDomain {
            mode: "".to_string(),
        };

        let encoded = MessageCodec::encode(&msg).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());

        let decoded: Option<ClientMessage> = MessageCodec::decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(msg));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_decode_incomplete() {
        let msg = ClientMessage::QuerySpecificIcmpLengthTrigger { length: 96 };
        let encoded = MessageCodec::encode(&msg).unwrap();

        // Only provide length header
        let mut buf = BytesMut::from(&encoded[..4]);
        let result: Option<ClientMessage> = MessageCodec::decode(&mut buf).unwrap();
        assert_eq!(result, None);

        // Provide rest of message
        buf.extend_from_slice(&encoded[4..]);
        let result: Option<ClientMessage> = MessageCodec::decode(&mut buf).unwrap();
        assert_eq!(result, Some(msg));
    }

    #[test]
    fn test_decode_multiple_in_buffer() {
        let msg1 = ClientMessage::RemoteIp;
        let msg2 = ClientMessage::CreateTunnel {
            mirrors: vec![Mirror::tcp("m1", 9000)],
        };

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&MessageCodec::encode(&msg1).unwrap());
        buf.extend_from_slice(&MessageCodec::encode(&msg2).unwrap());

        let first: Option<ClientMessage> = MessageCodec::decode(&mut buf).unwrap();
        let second: Option<ClientMessage> = MessageCodec::decode(&mut buf).unwrap();
        assert_eq!(first, Some(msg1));
        assert_eq!(second, Some(msg2));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_oversized_length_header_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(crate::MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);

        let result: Result<Option<ClientMessage>, _> = MessageCodec::decode(&mut buf);
        assert!(matches!(result, Err(CodecError::MessageTooLarge(_))));
    }
}

//! Length-prefixed JSON framing for peer links.
//!
//! Each frame is a 4-byte big-endian length followed by one JSON-encoded
//! [`Message`]. A bad length prefix is a stream error and ends the
//! connection; a well-framed payload that fails to parse or validate is
//! surfaced as [`Frame::Invalid`] so the reader can drop it and carry on.

use bytes::{Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::ProtocolError;
use crate::protocol::Message;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Message),
    Invalid(ProtocolError),
}

#[derive(Debug)]
pub struct MessageCodec {
    inner: LengthDelimitedCodec,
}

impl MessageCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .big_endian()
                .length_field_length(4)
                .max_frame_length(max_frame_length)
                .new_codec(),
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

impl Decoder for MessageCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => Ok(Some(match Message::from_slice(&bytes) {
                Ok(message) => Frame::Message(message),
                Err(e) => Frame::Invalid(e),
            })),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = item
            .to_bytes()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.encode(Bytes::from(bytes), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;
    use bytes::BufMut;

    fn raw_frame(payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        buf
    }

    #[test]
    fn test_length_prefix_is_big_endian() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Message::new(1, MessageKind::Heartbeat, 3), &mut buf)
            .unwrap();

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);
        let body: serde_json::Value = serde_json::from_slice(&buf[4..]).unwrap();
        assert_eq!(body["type"], "HEARTBEAT");
    }

    #[test]
    fn test_decodes_split_frames() {
        let mut codec = MessageCodec::default();
        let full = raw_frame(br#"{"sender":2,"type":"ANSWER","timestamp":9}"#);
        let mut buf = BytesMut::from(&full[..6]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&full[6..]);
        match codec.decode(&mut buf).unwrap() {
            Some(Frame::Message(m)) => {
                assert_eq!(m.sender, 2);
                assert_eq!(m.kind, MessageKind::Answer);
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_garbage_payload_keeps_stream_aligned() {
        let mut codec = MessageCodec::default();
        let mut buf = raw_frame(b"not json at all");
        buf.extend_from_slice(&raw_frame(br#"{"sender":4,"type":"REPLY","timestamp":1}"#));

        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Invalid(ProtocolError::Malformed(_)))
        ));
        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(Frame::Message(_))));
    }

    #[test]
    fn test_oversized_frame_is_stream_error() {
        let mut codec = MessageCodec::new(64);
        let mut buf = BytesMut::new();
        buf.put_u32(10_000);
        buf.put_slice(&[b'x'; 16]);
        assert!(codec.decode(&mut buf).is_err());
    }
}

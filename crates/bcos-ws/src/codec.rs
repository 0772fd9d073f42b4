//! Binary framing.
//!
//! ```text
//! Frame      : type u16 BE | status u16 BE | seq [u8; 32] | payload ...
//! TopicFrame : topic_len u16 BE | topic [u8; topic_len] | data ...
//! ```
//!
//! Decoding goes through [`Reader`], which checks `offset + n <= len` before
//! every read, so truncated or hostile input yields a [`CodecError`] instead
//! of a panic.

use std::fmt;

use bcos_core::constants::SEQ_LEN;
use bcos_core::seq_token;
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CodecError;
use crate::message::MessageType;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 2 + 2 + SEQ_LEN;

/// Size of the topic length prefix.
pub const TOPIC_PREFIX_LEN: usize = 2;

/// Opaque 32-byte correlation token.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Seq([u8; SEQ_LEN]);

impl Seq {
    /// A fresh token, unique for practical purposes.
    pub fn generate() -> Self {
        Self(seq_token())
    }

    /// Wrap raw bytes, which must be exactly 32 long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        <[u8; SEQ_LEN]>::try_from(bytes)
            .map(Self)
            .map_err(|_| CodecError::InvalidSeqLength(bytes.len()))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; SEQ_LEN] {
        &self.0
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({self})")
    }
}

/// One message on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Raw message type; see [`MessageType`].
    pub msg_type: u16,
    /// Status code, 0 on success.
    pub status: u16,
    /// Correlation token.
    pub seq: Seq,
    /// Body.
    pub payload: Bytes,
}

impl Frame {
    /// New outbound frame with a fresh seq and status 0.
    pub fn new(msg_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type: msg_type.code(),
            status: 0,
            seq: Seq::generate(),
            payload: payload.into(),
        }
    }

    /// Reply carrying this frame's seq.
    pub fn reply(&self, msg_type: MessageType, status: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type: msg_type.code(),
            status,
            seq: self.seq,
            payload: payload.into(),
        }
    }

    /// Typed view of `msg_type`, if known.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.msg_type).ok()
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u16(self.msg_type);
        buf.put_u16(self.status);
        buf.put_slice(self.seq.as_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse wire bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::TooShort {
                len: buf.len(),
                min: HEADER_LEN,
            });
        }
        let mut reader = Reader::new(buf);
        let msg_type = reader.u16()?;
        let status = reader.u16()?;
        let seq = Seq::from_slice(reader.take(SEQ_LEN)?)?;
        let payload = Bytes::copy_from_slice(reader.rest());
        Ok(Self {
            msg_type,
            status,
            seq,
            payload,
        })
    }
}

/// Topic-addressed body of AMOP request and broadcast frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicFrame {
    /// Topic name. On the wire it is a length-prefixed byte string; topics
    /// are subscribed and matched by name, so it must be UTF-8.
    pub topic: String,
    /// Application data.
    pub data: Bytes,
}

impl TopicFrame {
    /// Build from parts.
    pub fn new(topic: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            data: data.into(),
        }
    }

    /// Serialize; fails if the topic does not fit a u16 length.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let topic_len = u16::try_from(self.topic.len())
            .map_err(|_| CodecError::TopicTooLong(self.topic.len()))?;
        let mut buf = BytesMut::with_capacity(TOPIC_PREFIX_LEN + self.topic.len() + self.data.len());
        buf.put_u16(topic_len);
        buf.put_slice(self.topic.as_bytes());
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    /// Parse; fails if the declared topic length overruns the buffer or the
    /// topic bytes are not UTF-8 ([`CodecError::InvalidTopic`]).
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < TOPIC_PREFIX_LEN {
            return Err(CodecError::TooShort {
                len: buf.len(),
                min: TOPIC_PREFIX_LEN,
            });
        }
        let mut reader = Reader::new(buf);
        let topic_len = usize::from(reader.u16()?);
        let topic = std::str::from_utf8(reader.take(topic_len)?)
            .map_err(|_| CodecError::InvalidTopic)?
            .to_owned();
        let data = Bytes::copy_from_slice(reader.rest());
        Ok(Self { topic, data })
    }
}

/// Bounds-checked cursor over a byte slice.
struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(CodecError::Overrun {
                offset: self.offset,
                need: n,
                len: self.buf.len(),
            })?;
        let out = &self.buf[self.offset..end];
        self.offset = end;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.offset..];
        self.offset = self.buf.len();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn seq_of(byte: u8) -> Seq {
        Seq::from_slice(&[byte; SEQ_LEN]).unwrap()
    }

    #[test]
    fn header_layout_is_big_endian() {
        let frame = Frame {
            msg_type: 0x0111,
            status: 0x0203,
            seq: seq_of(b'a'),
            payload: Bytes::from_static(b"xyz"),
        };
        let bytes = frame.encode();
        assert_eq!(bytes.len(), HEADER_LEN + 3);
        assert_eq!(&bytes[..4], &[0x01, 0x11, 0x02, 0x03]);
        assert_eq!(&bytes[4..36], &[b'a'; 32]);
        assert_eq!(&bytes[36..], b"xyz");
    }

    #[test]
    fn decode_header_only_frame() {
        let frame = Frame::new(MessageType::Handshake, Bytes::new());
        let back = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(back, frame);
        assert!(back.payload.is_empty());
        assert_eq!(back.message_type(), Some(MessageType::Handshake));
    }

    #[test]
    fn every_short_buffer_fails() {
        let full = Frame::new(MessageType::RpcRequest, &b"body"[..]).encode();
        for len in 0..HEADER_LEN {
            assert_matches!(
                Frame::decode(&full[..len]),
                Err(CodecError::TooShort { min: HEADER_LEN, .. })
            );
        }
    }

    #[test]
    fn seq_must_be_32_bytes() {
        assert_matches!(Seq::from_slice(&[0; 31]), Err(CodecError::InvalidSeqLength(31)));
        assert_matches!(Seq::from_slice(&[0; 33]), Err(CodecError::InvalidSeqLength(33)));
        assert!(Seq::from_slice(&[0; 32]).is_ok());
    }

    #[test]
    fn generated_seqs_differ() {
        assert_ne!(Seq::generate(), Seq::generate());
    }

    #[test]
    fn reply_keeps_seq() {
        let req = Frame::new(MessageType::AmopRequest, &b"q"[..]);
        let resp = req.reply(MessageType::AmopResponse, 0, &b"a"[..]);
        assert_eq!(resp.seq, req.seq);
        assert_eq!(resp.message_type(), Some(MessageType::AmopResponse));
    }

    #[test]
    fn topic_frame_layout() {
        let tf = TopicFrame::new("hello", &b"world"[..]);
        let bytes = tf.encode().unwrap();
        assert_eq!(&bytes[..2], &[0, 5]);
        assert_eq!(&bytes[2..7], b"hello");
        assert_eq!(&bytes[7..], b"world");
    }

    #[test]
    fn topic_frame_rejects_overrun() {
        // declares 10 topic bytes, carries 3
        let buf = [0u8, 10, b'a', b'b', b'c'];
        assert_matches!(
            TopicFrame::decode(&buf),
            Err(CodecError::Overrun { offset: 2, need: 10, len: 5 })
        );
    }

    #[test]
    fn topic_frame_rejects_tiny_buffer() {
        assert_matches!(TopicFrame::decode(&[]), Err(CodecError::TooShort { .. }));
        assert_matches!(TopicFrame::decode(&[0]), Err(CodecError::TooShort { .. }));
    }

    #[test]
    fn topic_frame_empty_topic_and_data() {
        let back = TopicFrame::decode(&[0, 0]).unwrap();
        assert!(back.topic.is_empty());
        assert!(back.data.is_empty());
    }

    #[test]
    fn topic_frame_rejects_long_topic() {
        let tf = TopicFrame::new("t".repeat(65_536), Bytes::new());
        assert_matches!(tf.encode(), Err(CodecError::TopicTooLong(65_536)));
        let tf = TopicFrame::new("t".repeat(65_535), Bytes::new());
        assert!(tf.encode().is_ok());
    }

    #[test]
    fn topic_frame_rejects_invalid_utf8() {
        let buf = [0u8, 2, 0xff, 0xfe, b'x'];
        assert_matches!(TopicFrame::decode(&buf), Err(CodecError::InvalidTopic));
    }

    #[test]
    fn topic_frame_length_counts_utf8_bytes() {
        let tf = TopicFrame::new("价格", &b"1"[..]);
        let buf = tf.encode().unwrap();
        assert_eq!(&buf[..2], &[0u8, 6]);
        assert_eq!(TopicFrame::decode(&buf).unwrap(), tf);
    }

    proptest! {
        #[test]
        fn frame_round_trip(
            msg_type in any::<u16>(),
            status in any::<u16>(),
            seq in proptest::array::uniform32(any::<u8>()),
            payload in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let frame = Frame { msg_type, status, seq: Seq(seq), payload: Bytes::from(payload) };
            prop_assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
        }

        #[test]
        fn topic_frame_round_trip(
            topic in "[a-zA-Z0-9_./-]{0,300}",
            data in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let tf = TopicFrame::new(topic, data);
            prop_assert_eq!(TopicFrame::decode(&tf.encode().unwrap()).unwrap(), tf);
        }

        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
            let _ = Frame::decode(&bytes);
            let _ = TopicFrame::decode(&bytes);
        }
    }
}

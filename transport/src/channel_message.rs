use std::fmt::{Debug, Display, Formatter};
use std::time::SystemTime;
use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes};
use uuid::Uuid;
use crate::error::TransportError;
use crate::member::Member;

bitflags! {
    /// Per-message options, chosen by the sender. The transport interprets only the ack related
    ///  bits; all other bits (including unknown ones) are carried through unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SendOptions: u32 {
        /// The payload is an opaque byte array rather than an application-serialized object
        const BYTE_MESSAGE = 0x0001;
        /// The receiver acknowledges the message, and the sender waits for it
        const USE_ACK = 0x0002;
        /// The ack is sent after the receiver's callback finished, reporting its outcome
        const SYNCHRONIZED_ACK = 0x0004;
        /// Hint for higher layers that the caller does not wait for completion
        const ASYNCHRONOUS = 0x0008;

        const _ = !0;
    }
}

impl SendOptions {
    pub fn sync_ack() -> SendOptions {
        SendOptions::USE_ACK | SendOptions::SYNCHRONIZED_ACK
    }

    pub fn async_ack() -> SendOptions {
        SendOptions::USE_ACK
    }

    pub fn ack_mode(self) -> AckMode {
        if !self.contains(SendOptions::USE_ACK) {
            AckMode::None
        }
        else if self.contains(SendOptions::SYNCHRONIZED_ACK) {
            AckMode::AfterDispatch
        }
        else {
            AckMode::BeforeDispatch
        }
    }
}

/// When (and whether) the receiver writes an acknowledgement for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    None,
    /// 'async ack': ACK as soon as the message is decoded
    BeforeDispatch,
    /// 'sync ack': ACK or FAIL_ACK depending on the callback's outcome
    AfterDispatch,
}

#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct UniqueId(pub [u8; 16]);

impl UniqueId {
    pub const SERIALIZED_LEN: usize = 16;

    pub fn new_random() -> UniqueId {
        UniqueId(*Uuid::new_v4().as_bytes())
    }
}
impl Debug for UniqueId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}
impl Display for UniqueId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}

/// The unit of replication. The transport carries it as the payload of one frame, and never
///  modifies it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelMessage {
    pub options: SendOptions,
    /// millis since epoch at the sending node
    pub timestamp: u64,
    pub unique_id: UniqueId,
    /// the member that sent the message
    pub address: Member,
    pub payload: Bytes,
}

impl ChannelMessage {
    pub fn new(address: Member, options: SendOptions, payload: impl Into<Bytes>) -> ChannelMessage {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        ChannelMessage {
            options,
            timestamp,
            unique_id: UniqueId::new_random(),
            address,
            payload: payload.into(),
        }
    }

    pub fn serialized_len(&self) -> usize {
        4 + 8 + UniqueId::SERIALIZED_LEN + self.address.serialized_len() + 4 + self.payload.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> Result<(), TransportError> {
        let payload_len = u32::try_from(self.payload.len())
            .map_err(|_| TransportError::framing(format!("payload of {} bytes is too long to be serialized", self.payload.len())))?;

        buf.put_u32(self.options.bits());
        buf.put_u64(self.timestamp);
        buf.put_slice(&self.unique_id.0);
        self.address.ser(buf);
        buf.put_u32(payload_len);
        buf.put_slice(&self.payload);
        Ok(())
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ChannelMessage> {
        let options = SendOptions::from_bits_retain(buf.try_get_u32()?);
        let timestamp = buf.try_get_u64()?;

        let mut unique_id = [0u8; UniqueId::SERIALIZED_LEN];
        if buf.remaining() < unique_id.len() {
            bail!("message too short for its unique id");
        }
        buf.copy_to_slice(&mut unique_id);

        let address = Member::try_deser(buf)?;

        let payload_len = buf.try_get_u32()? as usize;
        if buf.remaining() != payload_len {
            bail!("message announces a payload of {} bytes, but {} bytes remain", payload_len, buf.remaining());
        }
        let payload = buf.copy_to_bytes(payload_len);

        Ok(ChannelMessage {
            options,
            timestamp,
            unique_id: UniqueId(unique_id),
            address,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;
    use std::net::SocketAddr;

    fn member() -> Member {
        Member::new(12345, SocketAddr::from(([10,1,2,3], 4000)))
    }

    #[rstest]
    #[case::none(SendOptions::empty(), AckMode::None)]
    #[case::byte_message(SendOptions::BYTE_MESSAGE, AckMode::None)]
    #[case::sync_without_use(SendOptions::SYNCHRONIZED_ACK, AckMode::None)]
    #[case::async_ack(SendOptions::async_ack(), AckMode::BeforeDispatch)]
    #[case::sync_ack(SendOptions::sync_ack(), AckMode::AfterDispatch)]
    #[case::sync_ack_asynchronous(SendOptions::sync_ack() | SendOptions::ASYNCHRONOUS, AckMode::AfterDispatch)]
    fn test_ack_mode(#[case] options: SendOptions, #[case] expected: AckMode) {
        assert_eq!(options.ack_mode(), expected);
    }

    #[rstest]
    #[case::empty_payload(SendOptions::empty(), b"".as_slice())]
    #[case::sync_ack(SendOptions::sync_ack(), b"session delta".as_slice())]
    #[case::unknown_bits(SendOptions::from_bits_retain(0x8000_0041), b"x".as_slice())]
    fn test_ser_deser(#[case] options: SendOptions, #[case] payload: &'static [u8]) {
        let msg = ChannelMessage::new(member(), options, payload);

        let mut buf = BytesMut::new();
        msg.ser(&mut buf).unwrap();
        assert_eq!(buf.len(), msg.serialized_len());

        let deser = ChannelMessage::try_deser(&mut buf.freeze()).unwrap();
        assert_eq!(deser, msg);
        assert_eq!(deser.options.bits(), options.bits());
    }

    #[test]
    fn test_ser_layout() {
        let msg = ChannelMessage {
            options: SendOptions::sync_ack(),
            timestamp: 0x0102,
            unique_id: UniqueId([9; 16]),
            address: Member::new(3, SocketAddr::from(([1,2,3,4], 5))),
            payload: Bytes::from_static(b"ab"),
        };

        let mut buf = BytesMut::new();
        msg.ser(&mut buf).unwrap();

        let mut expected = vec![0,0,0,6, 0,0,0,0,0,0,1,2];
        expected.extend_from_slice(&[9; 16]);
        expected.extend_from_slice(&[0,0,0,0,0,3, 0,5, 4, 1,2,3,4]);
        expected.extend_from_slice(&[0,0,0,2, b'a', b'b']);
        assert_eq!(buf.as_ref(), expected.as_slice());
    }

    #[rstest]
    #[case::truncated_payload(2)]
    #[case::trailing_bytes(4)]
    fn test_deser_payload_len_mismatch(#[case] announced_len: u8) {
        let msg = ChannelMessage::new(member(), SendOptions::empty(), b"abc".as_slice());
        let mut buf = BytesMut::new();
        msg.ser(&mut buf).unwrap();

        let len_offset = buf.len() - 3 - 1;
        buf[len_offset] = announced_len;
        assert!(ChannelMessage::try_deser(&mut buf.freeze()).is_err());
    }

    #[test]
    fn test_new_generates_unique_ids() {
        let a = ChannelMessage::new(member(), SendOptions::empty(), Bytes::new());
        let b = ChannelMessage::new(member(), SendOptions::empty(), Bytes::new());
        assert_ne!(a.unique_id, b.unique_id);
    }
}

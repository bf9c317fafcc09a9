use alloc::vec;
use alloc::vec::Vec;

use crate::{
    packet::{
        connect::{ConnAck, Connect},
        decode::DecodePacket,
        encode::{Encode, EncodePacket},
        publish::Publish,
        subscribe::{SubAck, Subscribe},
        unsubscribe::Unsubscribe,
    },
    protocol::{FixedHeader, PacketType},
};

pub mod connect;
pub mod decode;
pub(crate) mod encode;
pub mod publish;
pub mod subscribe;
pub mod unsubscribe;

#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Packet<'a> {
    Connect(Connect<'a>),
    ConnAck(ConnAck),
    Publish(Publish<'a>),
    PubAck(PacketId),
    PubRec(PacketId),
    PubRel(PacketId),
    PubComp(PacketId),
    Subscribe(Subscribe<'a>),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe<'a>),
    UnsubAck(PacketId),
    PingReq,
    PingResp,
    Disconnect,
}

/// Outcome of [`decode`] on a buffer that may hold a partial packet.
#[derive(Debug, PartialEq)]
pub enum Decoded<'a> {
    /// A complete packet and the number of bytes it occupied.
    Packet(Packet<'a>, usize),
    /// The buffer ends before the packet does. Retry with more bytes.
    NeedMoreData,
}

/// Decodes the packet at the head of `buf`.
pub fn decode(buf: &[u8]) -> Result<Decoded<'_>, crate::Error> {
    let Some(&first) = buf.first() else {
        return Ok(Decoded::NeedMoreData);
    };

    // Reserved type codes fail fast, before waiting for the rest of the packet.
    PacketType::try_from(first >> 4)?;

    let Some((remaining_len, len_bytes)) = decode::remaining_length(&buf[1..])? else {
        return Ok(Decoded::NeedMoreData);
    };

    let header = FixedHeader::from_first_byte(first, remaining_len)?;
    let start = 1 + len_bytes;
    let end = start + remaining_len;

    if buf.len() < end {
        return Ok(Decoded::NeedMoreData);
    }

    let packet = Packet::decode(&header, &buf[start..end])?;
    Ok(Decoded::Packet(packet, end))
}

impl<'buf> Packet<'buf> {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::ConnAck(_) => PacketType::ConnAck,
            Self::Publish(_) => PacketType::Publish,
            Self::PubAck(_) => PacketType::PubAck,
            Self::PubRec(_) => PacketType::PubRec,
            Self::PubRel(_) => PacketType::PubRel,
            Self::PubComp(_) => PacketType::PubComp,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::SubAck(_) => PacketType::SubAck,
            Self::Unsubscribe(_) => PacketType::Unsubscribe,
            Self::UnsubAck(_) => PacketType::UnsubAck,
            Self::PingReq => PacketType::PingReq,
            Self::PingResp => PacketType::PingResp,
            Self::Disconnect => PacketType::Disconnect,
        }
    }

    pub(crate) fn encode(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        match self {
            Self::Connect(packet) => encode_packet(packet, cursor),
            Self::ConnAck(packet) => encode_packet(packet, cursor),
            Self::Publish(packet) => encode_packet(packet, cursor),
            Self::PubAck(id) => only_packet_id(cursor, PacketType::PubAck, *id),
            Self::PubRec(id) => only_packet_id(cursor, PacketType::PubRec, *id),
            Self::PubRel(id) => only_packet_id(cursor, PacketType::PubRel, *id),
            Self::PubComp(id) => only_packet_id(cursor, PacketType::PubComp, *id),
            Self::Subscribe(packet) => encode_packet(packet, cursor),
            Self::SubAck(packet) => encode_packet(packet, cursor),
            Self::Unsubscribe(packet) => encode_packet(packet, cursor),
            Self::UnsubAck(id) => only_packet_id(cursor, PacketType::UnsubAck, *id),
            Self::PingReq => empty_body(cursor, PacketType::PingReq),
            Self::PingResp => empty_body(cursor, PacketType::PingResp),
            Self::Disconnect => empty_body(cursor, PacketType::Disconnect),
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Self::Connect(packet) => packet.required_space(),
            Self::ConnAck(packet) => packet.required_space(),
            Self::Publish(packet) => packet.required_space(),
            Self::Subscribe(packet) => packet.required_space(),
            Self::SubAck(packet) => packet.required_space(),
            Self::Unsubscribe(packet) => packet.required_space(),
            Self::PubAck(_)
            | Self::PubRec(_)
            | Self::PubRel(_)
            | Self::PubComp(_)
            | Self::UnsubAck(_) => 2,
            Self::PingReq | Self::PingResp | Self::Disconnect => 0,
        }
    }

    /// Size of the whole frame: fixed header, remaining length and body.
    pub fn required_space(&self) -> Result<usize, crate::Error> {
        let body = self.body_len();
        Ok(1 + encode::remaining_length_size(body)? + body)
    }

    /// Serializes the packet into a freshly allocated frame.
    pub fn to_vec(&self) -> Result<Vec<u8>, crate::Error> {
        let mut buf = vec![0u8; self.required_space()?];
        let mut cursor = encode::Cursor::new(&mut buf);
        self.encode(&mut cursor)?;
        Ok(buf)
    }

    pub(crate) fn decode(header: &FixedHeader, body: &'buf [u8]) -> Result<Self, crate::Error> {
        let cursor = &mut decode::Cursor::new(body);

        if header.remaining_len != cursor.remaining() {
            return Err(crate::Error::MalformedRemainingLength);
        }

        let flags = header.flags;

        match header.packet_type {
            PacketType::Connect => Connect::decode(flags, cursor).map(Packet::Connect),
            PacketType::ConnAck => ConnAck::decode(flags, cursor).map(Packet::ConnAck),
            PacketType::Publish => Publish::decode(flags, cursor).map(Packet::Publish),
            PacketType::PubAck => read_only_packet_id(cursor).map(Packet::PubAck),
            PacketType::PubRec => read_only_packet_id(cursor).map(Packet::PubRec),
            PacketType::PubRel => read_only_packet_id(cursor).map(Packet::PubRel),
            PacketType::PubComp => read_only_packet_id(cursor).map(Packet::PubComp),
            PacketType::Subscribe => Subscribe::decode(flags, cursor).map(Packet::Subscribe),
            PacketType::SubAck => SubAck::decode(flags, cursor).map(Packet::SubAck),
            PacketType::Unsubscribe => {
                Unsubscribe::decode(flags, cursor).map(Packet::Unsubscribe)
            }
            PacketType::UnsubAck => read_only_packet_id(cursor).map(Packet::UnsubAck),
            PacketType::PingReq => cursor.expect_empty().map(|_| Packet::PingReq),
            PacketType::PingResp => cursor.expect_empty().map(|_| Packet::PingResp),
            PacketType::Disconnect => cursor.expect_empty().map(|_| Packet::Disconnect),
        }
    }
}

fn encode_packet<P: EncodePacket>(
    packet: &P,
    cursor: &mut encode::Cursor<'_>,
) -> Result<(), crate::Error> {
    let header = ((P::PACKET_TYPE as u8) << 4) | (packet.flags() & 0x0F);
    cursor.write_u8(header)?;

    encode::remaining_length(packet.required_space(), cursor)?;

    packet.encode_body(cursor)
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let qos = match value {
            0 => Self::AtMostOnce,
            1 => Self::AtLeastOnce,
            2 => Self::ExactlyOnce,
            _ => return Err(crate::Error::InvalidQoS),
        };

        Ok(qos)
    }
}

impl Encode for QoS {
    fn encode(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        (*self as u8).encode(cursor)
    }

    fn required_space(&self) -> usize {
        1
    }
}

/// Non-zero 16-bit identifier correlating a request with its acknowledgements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PacketId(u16);

impl PacketId {
    pub fn get(&self) -> u16 {
        self.0
    }

    fn decode(cursor: &mut decode::Cursor) -> Result<Self, crate::Error> {
        Self::try_from(cursor.read_u16()?)
    }
}

impl TryFrom<u16> for PacketId {
    type Error = crate::Error;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        if id == 0 {
            return Err(crate::Error::MalformedPacket);
        }

        Ok(Self(id))
    }
}

impl From<PacketId> for u16 {
    fn from(value: PacketId) -> Self {
        value.0
    }
}

impl Encode for PacketId {
    fn encode(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        self.0.encode(cursor)
    }

    fn required_space(&self) -> usize {
        2
    }
}

fn read_only_packet_id(cursor: &mut decode::Cursor<'_>) -> Result<PacketId, crate::Error> {
    let packet_id = PacketId::decode(cursor)?;
    cursor.expect_empty()?;
    Ok(packet_id)
}

fn only_packet_id(
    cursor: &mut encode::Cursor,
    packet_type: PacketType,
    packet_id: PacketId,
) -> Result<(), crate::Error> {
    let flags = match packet_type {
        PacketType::PubRel => 0b0010,
        _ => 0,
    };

    cursor.write_u8(((packet_type as u8) << 4) | flags)?;
    cursor.write_u8(2)?;
    packet_id.encode(cursor)
}

fn empty_body(cursor: &mut encode::Cursor, packet_type: PacketType) -> Result<(), crate::Error> {
    cursor.write_u8((packet_type as u8) << 4)?;
    cursor.write_u8(0)
}

use crate::{
    packet::{
        PacketId, QoS,
        decode::{self, DecodePacket},
        encode::{self, Encode},
    },
    protocol::{DUP_MASK, PacketType, QOS_MASK, RETAIN_MASK},
};

#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Publish<'a> {
    pub flags: Flags,
    pub topic: &'a str,
    pub packet_id: Option<PacketId>,
    pub payload: &'a [u8],
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Flags {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
}

impl TryFrom<u8> for Flags {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let dup = value & DUP_MASK != 0;
        let qos = QoS::try_from((value & QOS_MASK) >> 1)?;
        let retain = value & RETAIN_MASK != 0;

        if dup && qos == QoS::AtMostOnce {
            return Err(crate::Error::MalformedPacket);
        }

        Ok(Self { dup, qos, retain })
    }
}

impl From<&Flags> for u8 {
    fn from(value: &Flags) -> Self {
        (value.dup as u8) << 3 | (value.qos as u8) << 1 | (value.retain as u8)
    }
}

impl encode::EncodePacket for Publish<'_> {
    const PACKET_TYPE: PacketType = PacketType::Publish;

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        self.topic.encode(cursor)?;
        if let Some(id) = self.packet_id {
            id.encode(cursor)?;
        }
        cursor.write_bytes(self.payload)
    }

    fn flags(&self) -> u8 {
        (&self.flags).into()
    }

    fn required_space(&self) -> usize {
        self.topic.required_space()
            + self.packet_id.map(|id| id.required_space()).unwrap_or(0)
            + self.payload.len()
    }
}

impl<'buf> DecodePacket<'buf> for Publish<'buf> {
    fn decode(flags: u8, cursor: &mut decode::Cursor<'buf>) -> Result<Self, crate::Error> {
        let flags = Flags::try_from(flags)?;

        let topic = cursor.read_utf8()?;
        if topic.is_empty() || topic.contains(['+', '#']) {
            return Err(crate::Error::MalformedPacket);
        }

        let packet_id = if let QoS::AtMostOnce = flags.qos {
            None
        } else {
            Some(PacketId::decode(cursor)?)
        };

        let payload = cursor.read_rest();

        Ok(Publish {
            flags,
            topic,
            packet_id,
            payload,
        })
    }
}

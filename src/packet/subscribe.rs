use heapless::Vec;

use crate::{
    packet::{
        PacketId, QoS,
        decode::{self, DecodePacket},
        encode::{self, Encode},
    },
    protocol::{MAX_TOPICS_PER_REQUEST, PacketType},
};

#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Subscribe<'a> {
    pub packet_id: PacketId,
    pub topics: Vec<Subscription<'a>, MAX_TOPICS_PER_REQUEST>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Subscription<'a> {
    pub topic_filter: &'a str,
    pub qos: QoS,
}

impl<'buf> DecodePacket<'buf> for Subscribe<'buf> {
    fn decode(_: u8, cursor: &mut decode::Cursor<'buf>) -> Result<Self, crate::Error> {
        let packet_id = PacketId::decode(cursor)?;

        let mut topics = Vec::new();

        while !cursor.is_empty() {
            let topic_filter = cursor.read_utf8()?;
            let qos = QoS::try_from(cursor.read_u8()?)?;

            topics
                .push(Subscription { topic_filter, qos })
                .map_err(|_| crate::Error::SubVectorIsFull)?;
        }

        if topics.is_empty() {
            return Err(crate::Error::MalformedPacket);
        }

        Ok(Subscribe { packet_id, topics })
    }
}

impl encode::EncodePacket for Subscribe<'_> {
    const PACKET_TYPE: PacketType = PacketType::Subscribe;

    fn flags(&self) -> u8 {
        0b0010
    }

    fn required_space(&self) -> usize {
        self.packet_id.required_space()
            + self
                .topics
                .iter()
                .map(|sub| sub.topic_filter.required_space() + sub.qos.required_space())
                .sum::<usize>()
    }

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        self.packet_id.encode(cursor)?;

        for sub in &self.topics {
            sub.topic_filter.encode(cursor)?;
            sub.qos.encode(cursor)?;
        }

        Ok(())
    }
}

/// Per-filter result carried by SUBACK.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubAckReturnCode {
    Success(QoS),
    Failure,
}

impl TryFrom<u8> for SubAckReturnCode {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x80 => Ok(Self::Failure),
            0..=2 => QoS::try_from(value).map(Self::Success),
            _ => Err(crate::Error::InvalidSubAckReturnCode),
        }
    }
}

impl From<SubAckReturnCode> for u8 {
    fn from(value: SubAckReturnCode) -> Self {
        match value {
            SubAckReturnCode::Success(qos) => qos as u8,
            SubAckReturnCode::Failure => 0x80,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SubAck {
    pub packet_id: PacketId,
    pub return_codes: Vec<SubAckReturnCode, MAX_TOPICS_PER_REQUEST>,
}

impl<'buf> DecodePacket<'buf> for SubAck {
    fn decode(_: u8, cursor: &mut decode::Cursor<'buf>) -> Result<Self, crate::Error> {
        let packet_id = PacketId::decode(cursor)?;

        let mut return_codes = Vec::new();

        while !cursor.is_empty() {
            let code = SubAckReturnCode::try_from(cursor.read_u8()?)?;

            return_codes
                .push(code)
                .map_err(|_| crate::Error::SubVectorIsFull)?;
        }

        if return_codes.is_empty() {
            return Err(crate::Error::MalformedPacket);
        }

        Ok(SubAck {
            packet_id,
            return_codes,
        })
    }
}

impl encode::EncodePacket for SubAck {
    const PACKET_TYPE: PacketType = PacketType::SubAck;

    fn flags(&self) -> u8 {
        0
    }

    fn required_space(&self) -> usize {
        self.packet_id.required_space() + self.return_codes.len()
    }

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        self.packet_id.encode(cursor)?;

        for code in &self.return_codes {
            u8::from(*code).encode(cursor)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suback_codes() {
        let body = [0x00, 0x0A, 0x00, 0x02, 0x80];
        let mut cursor = decode::Cursor::new(&body);
        let packet = SubAck::decode(0, &mut cursor).unwrap();

        assert_eq!(packet.packet_id.get(), 10);
        assert_eq!(
            packet.return_codes.as_slice(),
            &[
                SubAckReturnCode::Success(QoS::AtMostOnce),
                SubAckReturnCode::Success(QoS::ExactlyOnce),
                SubAckReturnCode::Failure,
            ]
        );
    }

    #[test]
    fn suback_invalid_code() {
        let body = [0x00, 0x0A, 0x03];
        let mut cursor = decode::Cursor::new(&body);

        assert_eq!(
            SubAck::decode(0, &mut cursor),
            Err(crate::Error::InvalidSubAckReturnCode)
        );
    }

    #[test]
    fn suback_without_codes() {
        let body = [0x00, 0x0A];
        let mut cursor = decode::Cursor::new(&body);

        assert_eq!(
            SubAck::decode(0, &mut cursor),
            Err(crate::Error::MalformedPacket)
        );
    }

    #[test]
    fn subscribe_decode() {
        let body = [0x00, 0x01, 0x00, 0x03, b'a', b'/', b'#', 0x01];
        let mut cursor = decode::Cursor::new(&body);
        let packet = Subscribe::decode(0b0010, &mut cursor).unwrap();

        assert_eq!(packet.packet_id.get(), 1);
        assert_eq!(
            packet.topics.as_slice(),
            &[Subscription {
                topic_filter: "a/#",
                qos: QoS::AtLeastOnce
            }]
        );
    }

    #[test]
    fn subscribe_truncated_filter() {
        let body = [0x00, 0x01, 0x00, 0x09, b'a'];
        let mut cursor = decode::Cursor::new(&body);

        assert_eq!(
            Subscribe::decode(0b0010, &mut cursor),
            Err(crate::Error::UnexpectedEof)
        );
    }
}

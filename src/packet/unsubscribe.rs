use heapless::Vec;

use crate::{
    packet::{
        PacketId,
        decode::{self, DecodePacket},
        encode::{self, Encode},
    },
    protocol::{MAX_TOPICS_PER_REQUEST, PacketType},
};

#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Unsubscribe<'a> {
    pub packet_id: PacketId,
    pub topics: Vec<&'a str, MAX_TOPICS_PER_REQUEST>,
}

impl<'buf> DecodePacket<'buf> for Unsubscribe<'buf> {
    fn decode(_: u8, cursor: &mut decode::Cursor<'buf>) -> Result<Self, crate::Error> {
        let packet_id = PacketId::decode(cursor)?;

        let mut topics = Vec::new();

        while !cursor.is_empty() {
            let topic = cursor.read_utf8()?;
            topics
                .push(topic)
                .map_err(|_| crate::Error::SubVectorIsFull)?;
        }

        if topics.is_empty() {
            return Err(crate::Error::MalformedPacket);
        }

        Ok(Unsubscribe { packet_id, topics })
    }
}

impl encode::EncodePacket for Unsubscribe<'_> {
    const PACKET_TYPE: PacketType = PacketType::Unsubscribe;

    fn flags(&self) -> u8 {
        0b0010
    }

    fn required_space(&self) -> usize {
        let mut required = self.packet_id.required_space();

        for topic in &self.topics {
            required += topic.required_space();
        }

        required
    }

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        self.packet_id.encode(cursor)?;

        for topic in &self.topics {
            topic.encode(cursor)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsubscribe_requires_topics() {
        let body = [0x00, 0x04];
        let mut cursor = decode::Cursor::new(&body);

        assert_eq!(
            Unsubscribe::decode(0b0010, &mut cursor),
            Err(crate::Error::MalformedPacket)
        );
    }

    #[test]
    fn unsubscribe_two_topics() {
        let body = [0x00, 0x04, 0x00, 0x01, b'a', 0x00, 0x01, b'b'];
        let mut cursor = decode::Cursor::new(&body);
        let packet = Unsubscribe::decode(0b0010, &mut cursor).unwrap();

        assert_eq!(packet.packet_id.get(), 4);
        assert_eq!(packet.topics.as_slice(), &["a", "b"]);
    }
}

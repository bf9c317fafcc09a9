/// Largest value the variable-length remaining-length field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Upper bound of topics in one SUBSCRIBE, UNSUBSCRIBE or SUBACK.
pub const MAX_TOPICS_PER_REQUEST: usize = 16;

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_TLS_PORT: u16 = 8883;

pub(crate) const DUP_MASK: u8 = 0b1000;
pub(crate) const QOS_MASK: u8 = 0b0110;
pub(crate) const RETAIN_MASK: u8 = 0b0001;

pub(crate) const LENGTH_MASK: u8 = 0x7F;
pub(crate) const LENGTH_CONTINUATION: u8 = 0x80;

pub(crate) const SESSION_PRESENT_MASK: u8 = 0x01;

pub(crate) const USERNAME_MASK: u8 = 0x80;
pub(crate) const PASSWORD_MASK: u8 = 0x40;
pub(crate) const WILL_RETAIN_MASK: u8 = 0x20;
pub(crate) const WILL_QOS_SHIFT: u8 = 3;
pub(crate) const WILL_FLAG_MASK: u8 = 0x04;
pub(crate) const CLEAN_SESSION_MASK: u8 = 0x02;
pub(crate) const RESERVED_CONNECT_MASK: u8 = 0x01;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    pub(crate) fn validate_flags(&self, flags: u8) -> bool {
        match self {
            Self::Publish => true,
            Self::PubRel | Self::Subscribe | Self::Unsubscribe => flags == 0b0010,
            _ => flags == 0,
        }
    }

    /// Packets a broker sends to a client. Anything else arriving at a client
    /// is a protocol violation.
    pub(crate) fn is_server_to_client(&self) -> bool {
        !matches!(
            self,
            Self::Connect | Self::Subscribe | Self::Unsubscribe | Self::PingReq | Self::Disconnect
        )
    }
}

impl TryFrom<u8> for PacketType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let packet_type = match value {
            1 => Self::Connect,
            2 => Self::ConnAck,
            3 => Self::Publish,
            4 => Self::PubAck,
            5 => Self::PubRec,
            6 => Self::PubRel,
            7 => Self::PubComp,
            8 => Self::Subscribe,
            9 => Self::SubAck,
            10 => Self::Unsubscribe,
            11 => Self::UnsubAck,
            12 => Self::PingReq,
            13 => Self::PingResp,
            14 => Self::Disconnect,
            _ => return Err(crate::Error::InvalidPacketType),
        };

        Ok(packet_type)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_len: usize,
}

impl FixedHeader {
    pub(crate) fn from_first_byte(byte: u8, remaining_len: usize) -> Result<Self, crate::Error> {
        let packet_type = PacketType::try_from(byte >> 4)?;
        let flags = byte & 0x0F;

        if !packet_type.validate_flags(flags) {
            return Err(crate::Error::InvalidFlags);
        }

        Ok(Self {
            packet_type,
            flags,
            remaining_len,
        })
    }
}

/// MQTT protocol revision announced in CONNECT.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolVersion {
    /// MQTT 3.1, protocol name `MQIsdp`.
    V31 = 3,
    /// MQTT 3.1.1, protocol name `MQTT`.
    #[default]
    V311 = 4,
}

impl ProtocolVersion {
    pub fn name(&self) -> &'static str {
        match self {
            Self::V31 => "MQIsdp",
            Self::V311 => "MQTT",
        }
    }

    pub fn level(&self) -> u8 {
        *self as u8
    }

    pub(crate) fn from_name_and_level(name: &str, level: u8) -> Result<Self, crate::Error> {
        match (name, level) {
            ("MQIsdp", 3) => Ok(Self::V31),
            ("MQTT", 4) => Ok(Self::V311),
            _ => Err(crate::Error::InvalidProtocol),
        }
    }
}

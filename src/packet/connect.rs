use crate::{
    packet::{
        QoS,
        decode::{self, DecodePacket},
        encode::{self, Binary, Encode},
    },
    protocol::{
        CLEAN_SESSION_MASK, PASSWORD_MASK, PacketType, ProtocolVersion, RESERVED_CONNECT_MASK,
        SESSION_PRESENT_MASK, USERNAME_MASK, WILL_FLAG_MASK, WILL_QOS_SHIFT, WILL_RETAIN_MASK,
    },
};

#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Connect<'a> {
    pub protocol: ProtocolVersion,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: &'a str,
    pub will: Option<Will<'a>>,
    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
}

#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Will<'a> {
    pub qos: QoS,
    pub retain: bool,
    pub topic: &'a str,
    pub payload: &'a [u8],
}

impl Connect<'_> {
    fn connect_flags(&self) -> u8 {
        let mut flags = 0;

        if self.username.is_some() {
            flags |= USERNAME_MASK;
        }

        if self.password.is_some() {
            flags |= PASSWORD_MASK;
        }

        if let Some(will) = &self.will {
            flags |= WILL_FLAG_MASK | (will.qos as u8) << WILL_QOS_SHIFT;

            if will.retain {
                flags |= WILL_RETAIN_MASK;
            }
        }

        if self.clean_session {
            flags |= CLEAN_SESSION_MASK;
        }

        flags
    }
}

impl<'buf> DecodePacket<'buf> for Connect<'buf> {
    fn decode(_: u8, cursor: &mut decode::Cursor<'buf>) -> Result<Self, crate::Error> {
        let name = cursor.read_utf8()?;
        let level = cursor.read_u8()?;
        let protocol = ProtocolVersion::from_name_and_level(name, level)?;

        let flags = cursor.read_u8()?;
        if flags & RESERVED_CONNECT_MASK != 0 {
            return Err(crate::Error::MalformedPacket);
        }

        let clean_session = flags & CLEAN_SESSION_MASK != 0;
        let will_flag = flags & WILL_FLAG_MASK != 0;
        let will_qos = QoS::try_from((flags >> WILL_QOS_SHIFT) & 0b11)?;
        let will_retain = flags & WILL_RETAIN_MASK != 0;
        let password_flag = flags & PASSWORD_MASK != 0;
        let username_flag = flags & USERNAME_MASK != 0;

        if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(crate::Error::MalformedPacket);
        }

        if password_flag && !username_flag {
            return Err(crate::Error::MalformedPacket);
        }

        let keep_alive = cursor.read_u16()?;
        let client_id = cursor.read_utf8()?;

        let will = if will_flag {
            Some(Will {
                topic: cursor.read_utf8()?,
                payload: cursor.read_binary_chunk()?,
                qos: will_qos,
                retain: will_retain,
            })
        } else {
            None
        };

        let username = if username_flag {
            Some(cursor.read_utf8()?)
        } else {
            None
        };

        let password = if password_flag {
            Some(cursor.read_binary_chunk()?)
        } else {
            None
        };

        cursor.expect_empty()?;

        Ok(Connect {
            protocol,
            clean_session,
            keep_alive,
            client_id,
            will,
            username,
            password,
        })
    }
}

impl encode::EncodePacket for Connect<'_> {
    const PACKET_TYPE: PacketType = PacketType::Connect;

    fn flags(&self) -> u8 {
        0
    }

    fn required_space(&self) -> usize {
        let mut required = self.protocol.name().required_space()
            + self.protocol.level().required_space()
            + self.connect_flags().required_space()
            + self.keep_alive.required_space()
            + self.client_id.required_space();

        if let Some(will) = &self.will {
            required += will.topic.required_space();
            required += Binary(will.payload).required_space();
        }

        if let Some(username) = &self.username {
            required += username.required_space();
        }

        if let Some(password) = &self.password {
            required += Binary(password).required_space();
        }

        required
    }

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        self.protocol.name().encode(cursor)?;
        self.protocol.level().encode(cursor)?;
        self.connect_flags().encode(cursor)?;
        self.keep_alive.encode(cursor)?;
        self.client_id.encode(cursor)?;

        if let Some(will) = &self.will {
            will.topic.encode(cursor)?;
            Binary(will.payload).encode(cursor)?;
        }

        if let Some(username) = &self.username {
            username.encode(cursor)?;
        }

        if let Some(password) = &self.password {
            Binary(password).encode(cursor)?;
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

impl<'buf> DecodePacket<'buf> for ConnAck {
    fn decode(_: u8, cursor: &mut decode::Cursor<'buf>) -> Result<Self, crate::Error> {
        let flags = cursor.read_u8()?;

        if flags & !SESSION_PRESENT_MASK != 0 {
            return Err(crate::Error::MalformedPacket);
        }

        let session_present = flags & SESSION_PRESENT_MASK != 0;
        let return_code = ConnectReturnCode::try_from(cursor.read_u8()?)?;

        if return_code != ConnectReturnCode::Accepted && session_present {
            return Err(crate::Error::MalformedPacket);
        }

        cursor.expect_empty()?;

        Ok(ConnAck {
            session_present,
            return_code,
        })
    }
}

impl encode::EncodePacket for ConnAck {
    const PACKET_TYPE: PacketType = PacketType::ConnAck;

    fn flags(&self) -> u8 {
        0
    }

    fn required_space(&self) -> usize {
        2
    }

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        (self.session_present as u8).encode(cursor)?;
        (self.return_code as u8).encode(cursor)
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let code = match value {
            0 => Self::Accepted,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUserNameOrPassword,
            5 => Self::NotAuthorized,
            _ => return Err(crate::Error::InvalidConnectReturnCode),
        };

        Ok(code)
    }
}

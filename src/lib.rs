#![no_std]

extern crate alloc;

#[macro_use]
mod fmt;

pub mod address;
pub mod client;
pub mod connection;
pub(crate) mod incoming;
pub(crate) mod keep_alive;
pub mod options;
pub mod packet;
pub(crate) mod packet_id_pool;
pub mod parser;
pub mod protocol;
pub mod session;
pub mod time;
pub mod topics;

pub use address::Address;
pub use client::{Client, Connector};
pub use options::{ConnectOptions, LastWill, ReconnectPolicy};
pub use packet::connect::ConnectReturnCode;
pub use packet::subscribe::SubAckReturnCode;
pub use packet::{PacketId, QoS};
pub use protocol::ProtocolVersion;
pub use session::{Event, Message, State};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    InvalidFlags,
    MalformedRemainingLength,
    InvalidPacketType,
    MalformedPacket,
    InvalidProtocol,
    InvalidConnectReturnCode,
    InvalidSubAckReturnCode,
    InvalidQoS,
    InvalidUtf8,
    UnexpectedEof,
    PacketTooLarge,
    BufferTooSmall,
    VectorIsFull,
    SubVectorIsFull,
    TransportError,
    RemoteClosed,
    TimeError,
    TimedOut,
    KeepAliveTimeout,
    ProtocolViolation,
    NoPacketIdAvailable,
    ConnectionRefused(ConnectReturnCode),
    NotConnected,
    AlreadyConnected,
    InvalidTopic,
    InvalidClientId,
    InvalidOptions,
    InvalidAddress,
}

/// Coarse classification of [`Error`], used to decide how the client reacts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorKind {
    /// Malformed bytes on the wire. The stream cannot be resynchronised.
    Framing,
    /// Well-formed packet that is not valid in the current session state.
    ProtocolViolation,
    /// The byte stream failed or was closed.
    Transport,
    /// The broker answered CONNECT with a non-zero return code.
    ConnectRejected,
    /// A deadline elapsed.
    Timeout,
    /// The caller asked for something invalid; nothing was sent.
    Usage,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidFlags
            | Self::MalformedRemainingLength
            | Self::InvalidPacketType
            | Self::MalformedPacket
            | Self::InvalidProtocol
            | Self::InvalidConnectReturnCode
            | Self::InvalidSubAckReturnCode
            | Self::InvalidQoS
            | Self::InvalidUtf8
            | Self::UnexpectedEof
            | Self::PacketTooLarge
            | Self::BufferTooSmall => ErrorKind::Framing,
            Self::ProtocolViolation | Self::VectorIsFull => ErrorKind::ProtocolViolation,
            Self::TransportError | Self::RemoteClosed => ErrorKind::Transport,
            Self::ConnectionRefused(_) => ErrorKind::ConnectRejected,
            Self::TimedOut | Self::KeepAliveTimeout | Self::TimeError => ErrorKind::Timeout,
            Self::SubVectorIsFull
            | Self::NoPacketIdAvailable
            | Self::NotConnected
            | Self::AlreadyConnected
            | Self::InvalidTopic
            | Self::InvalidClientId
            | Self::InvalidOptions
            | Self::InvalidAddress => ErrorKind::Usage,
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidFlags => write!(f, "invalid fixed header flags"),
            Self::MalformedRemainingLength => write!(f, "malformed remaining length"),
            Self::InvalidPacketType => write!(f, "reserved or unknown packet type"),
            Self::MalformedPacket => write!(f, "malformed packet"),
            Self::InvalidProtocol => write!(f, "unsupported protocol name or level"),
            Self::InvalidConnectReturnCode => write!(f, "invalid CONNACK return code"),
            Self::InvalidSubAckReturnCode => write!(f, "invalid SUBACK return code"),
            Self::InvalidQoS => write!(f, "invalid QoS"),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::UnexpectedEof => write!(f, "string or field exceeds remaining length"),
            Self::PacketTooLarge => write!(f, "packet exceeds maximum remaining length"),
            Self::BufferTooSmall => write!(f, "packet does not fit the receive buffer"),
            Self::VectorIsFull => write!(f, "inbound QoS 2 table is full"),
            Self::SubVectorIsFull => write!(f, "too many topics in one request"),
            Self::TransportError => write!(f, "transport error"),
            Self::RemoteClosed => write!(f, "connection closed by peer"),
            Self::TimeError => write!(f, "clock error"),
            Self::TimedOut => write!(f, "timed out"),
            Self::KeepAliveTimeout => write!(f, "no response to PINGREQ"),
            Self::ProtocolViolation => write!(f, "protocol violation"),
            Self::NoPacketIdAvailable => write!(f, "no packet identifier available"),
            Self::ConnectionRefused(code) => write!(f, "connection refused: {:?}", code),
            Self::NotConnected => write!(f, "not connected"),
            Self::AlreadyConnected => write!(f, "already connected"),
            Self::InvalidTopic => write!(f, "invalid topic name or filter"),
            Self::InvalidClientId => write!(f, "invalid client identifier"),
            Self::InvalidOptions => write!(f, "invalid connect options"),
            Self::InvalidAddress => write!(f, "invalid broker address"),
        }
    }
}

impl core::error::Error for Error {}

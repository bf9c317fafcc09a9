//! Connection configuration.

use alloc::{
    string::{String, ToString},
    vec::Vec,
};

use crate::{QoS, protocol::ProtocolVersion, topics};

const DEFAULT_KEEP_ALIVE_SECS: u16 = 60;
const FALLBACK_CONNECT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_ACK_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RECONNECT_MS: u64 = 1_000;
const MAX_V31_CLIENT_ID_LEN: usize = 23;

/// Message the broker publishes on our behalf if we vanish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl LastWill {
    pub fn new(topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        }
    }
}

/// What to do after an unexpected loss of the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReconnectPolicy {
    Never,
    Fixed { delay_ms: u64 },
    /// Doubles the delay on every failed attempt, capped at `max_ms`.
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Fixed {
            delay_ms: DEFAULT_RECONNECT_MS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (starting at 1), or
    /// `None` when no attempt should be made.
    pub fn delay_ms(&self, attempt: u32) -> Option<u64> {
        match *self {
            Self::Never => None,
            Self::Fixed { delay_ms } => Some(delay_ms),
            Self::Exponential { initial_ms, max_ms } => {
                let shift = attempt.saturating_sub(1).min(63);
                let delay = initial_ms
                    .checked_mul(1u64 << shift)
                    .unwrap_or(u64::MAX)
                    .min(max_ms);
                Some(delay)
            }
        }
    }
}

/// Everything CONNECT carries plus the client-side timing policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub protocol: ProtocolVersion,
    pub clean_session: bool,
    /// Seconds, 0 disables keep-alive.
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<LastWill>,
    /// Defaults to the keep-alive interval.
    pub connect_timeout_ms: Option<u64>,
    /// `None` waits for acknowledgements forever.
    pub ack_timeout_ms: Option<u64>,
    pub reconnect: ReconnectPolicy,
    /// Restore granted subscriptions after reconnecting with a clean session.
    pub resubscribe: bool,
    /// Hold QoS 0 publishes made while (re)connecting.
    pub queue_qos0: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            protocol: ProtocolVersion::default(),
            clean_session: true,
            keep_alive: DEFAULT_KEEP_ALIVE_SECS,
            username: None,
            password: None,
            will: None,
            connect_timeout_ms: None,
            ack_timeout_ms: Some(DEFAULT_ACK_TIMEOUT_MS),
            reconnect: ReconnectPolicy::default(),
            resubscribe: true,
            queue_qos0: true,
        }
    }
}

impl ConnectOptions {
    pub fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            ..Default::default()
        }
    }

    pub fn protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    pub fn credentials(mut self, username: &str, password: Option<&[u8]>) -> Self {
        self.username = Some(username.to_string());
        self.password = password.map(|p| p.to_vec());
        self
    }

    pub fn will(mut self, will: LastWill) -> Self {
        self.will = Some(will);
        self
    }

    pub fn connect_timeout_ms(mut self, timeout: u64) -> Self {
        self.connect_timeout_ms = Some(timeout);
        self
    }

    pub fn ack_timeout_ms(mut self, timeout: Option<u64>) -> Self {
        self.ack_timeout_ms = timeout;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn resubscribe(mut self, resubscribe: bool) -> Self {
        self.resubscribe = resubscribe;
        self
    }

    pub fn queue_qos0(mut self, queue: bool) -> Self {
        self.queue_qos0 = queue;
        self
    }

    pub(crate) fn keep_alive_ms(&self) -> u64 {
        u64::from(self.keep_alive) * 1000
    }

    pub(crate) fn effective_connect_timeout_ms(&self) -> u64 {
        match (self.connect_timeout_ms, self.keep_alive) {
            (Some(timeout), _) => timeout,
            (None, 0) => FALLBACK_CONNECT_TIMEOUT_MS,
            (None, _) => self.keep_alive_ms(),
        }
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        if !self.clean_session && self.client_id.is_empty() {
            return Err(crate::Error::InvalidClientId);
        }

        if self.protocol == ProtocolVersion::V31
            && !(1..=MAX_V31_CLIENT_ID_LEN).contains(&self.client_id.len())
        {
            return Err(crate::Error::InvalidClientId);
        }

        if self.client_id.len() > u16::MAX as usize || self.client_id.contains('\0') {
            return Err(crate::Error::InvalidClientId);
        }

        if self.password.is_some() && self.username.is_none() {
            return Err(crate::Error::InvalidOptions);
        }

        if let Some(will) = &self.will {
            topics::validate_topic(&will.topic)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = ConnectOptions::default();

        assert!(options.clean_session);
        assert_eq!(options.keep_alive, 60);
        assert_eq!(options.protocol, ProtocolVersion::V311);
        assert_eq!(options.effective_connect_timeout_ms(), 60_000);
        assert_eq!(options.ack_timeout_ms, Some(30_000));
        assert_eq!(options.reconnect, ReconnectPolicy::Fixed { delay_ms: 1000 });
        assert!(options.validate().is_ok());
    }

    #[test]
    fn connect_timeout_without_keep_alive() {
        let options = ConnectOptions::new("c1").keep_alive(0);
        assert_eq!(options.effective_connect_timeout_ms(), 30_000);

        let options = options.connect_timeout_ms(500);
        assert_eq!(options.effective_connect_timeout_ms(), 500);
    }

    #[test]
    fn persistent_session_needs_client_id() {
        let options = ConnectOptions::default().clean_session(false);
        assert_eq!(options.validate(), Err(crate::Error::InvalidClientId));
    }

    #[test]
    fn v31_client_id_length() {
        let base = ConnectOptions::default().protocol(ProtocolVersion::V31);
        assert_eq!(base.validate(), Err(crate::Error::InvalidClientId));

        let mut long = base.clone();
        long.client_id = "x".repeat(24);
        assert_eq!(long.validate(), Err(crate::Error::InvalidClientId));

        let mut ok = base;
        ok.client_id = "x".repeat(23);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn password_needs_username() {
        let mut options = ConnectOptions::new("c1");
        options.password = Some(b"pw".to_vec());
        assert_eq!(options.validate(), Err(crate::Error::InvalidOptions));

        let options = ConnectOptions::new("c1").credentials("user", Some(b"pw".as_slice()));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn will_topic_is_checked() {
        let options =
            ConnectOptions::new("c1").will(LastWill::new("status/#", b"gone", QoS::AtMostOnce, false));
        assert_eq!(options.validate(), Err(crate::Error::InvalidTopic));
    }

    #[test]
    fn exponential_backoff() {
        let policy = ReconnectPolicy::Exponential {
            initial_ms: 100,
            max_ms: 1000,
        };

        assert_eq!(policy.delay_ms(1), Some(100));
        assert_eq!(policy.delay_ms(2), Some(200));
        assert_eq!(policy.delay_ms(4), Some(800));
        assert_eq!(policy.delay_ms(5), Some(1000));
        assert_eq!(policy.delay_ms(200), Some(1000));
        assert_eq!(ReconnectPolicy::Never.delay_ms(1), None);
    }
}

use alloc::string::{String, ToString};

use crate::protocol::{DEFAULT_PORT, DEFAULT_TLS_PORT};

/// Broker location handed to a [`crate::Connector`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    pub port: u16,
    /// The scheme asked for an encrypted transport.
    pub secure: bool,
}

impl Default for Address {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            secure: false,
        }
    }
}

impl Address {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            secure: false,
        }
    }

    /// Parses `mqtt://host:port`, `tcp://`, `mqtts://`, `ssl://`, `tls://` or
    /// a bare `host[:port]`. Missing parts fall back to `localhost` and the
    /// scheme's default port.
    pub fn parse(url: &str) -> Result<Self, crate::Error> {
        let (secure, rest) = match url.split_once("://") {
            Some(("mqtt" | "tcp", rest)) => (false, rest),
            Some(("mqtts" | "ssl" | "tls", rest)) => (true, rest),
            Some(_) => return Err(crate::Error::InvalidAddress),
            None => (false, url),
        };

        // credentials and paths are not part of the address
        let rest = rest.rsplit_once('@').map(|(_, host)| host).unwrap_or(rest);
        let rest = rest.split_once('/').map(|(host, _)| host).unwrap_or(rest);

        let default_port = if secure { DEFAULT_TLS_PORT } else { DEFAULT_PORT };

        let parse_port = |port: &str| port.parse::<u16>().map_err(|_| crate::Error::InvalidAddress);

        let (host, port) = match rest.strip_prefix('[') {
            // IPv6 literal, the port can only follow the closing bracket
            Some(bracketed) => {
                let (host, tail) = bracketed
                    .split_once(']')
                    .ok_or(crate::Error::InvalidAddress)?;

                let port = match tail {
                    "" => default_port,
                    _ => parse_port(tail.strip_prefix(':').ok_or(crate::Error::InvalidAddress)?)?,
                };

                (host, port)
            }
            None => match rest.rsplit_once(':') {
                Some((host, port)) => (host, parse_port(port)?),
                None => (rest, default_port),
            },
        };

        if port == 0 {
            return Err(crate::Error::InvalidAddress);
        }

        let host = if host.is_empty() { "localhost" } else { host };

        Ok(Self {
            host: host.to_string(),
            port,
            secure,
        })
    }
}

impl core::str::FromStr for Address {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl core::fmt::Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let scheme = if self.secure { "mqtts" } else { "mqtt" };

        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::format;

    use super::*;

    #[test]
    fn full_url() {
        let address = Address::parse("mqtt://broker.local:1884").unwrap();

        assert_eq!(address.host, "broker.local");
        assert_eq!(address.port, 1884);
        assert!(!address.secure);
    }

    #[test]
    fn default_ports() {
        assert_eq!(Address::parse("tcp://broker").unwrap().port, 1883);

        let secure = Address::parse("mqtts://broker").unwrap();
        assert_eq!(secure.port, 8883);
        assert!(secure.secure);
    }

    #[test]
    fn bare_host() {
        assert_eq!(Address::parse("10.0.0.2:7000").unwrap(), Address::new("10.0.0.2", 7000));
        assert_eq!(Address::parse("").unwrap(), Address::default());
    }

    #[test]
    fn strips_credentials_and_path() {
        let address = Address::parse("mqtt://user:pw@broker:1999/ignored").unwrap();

        assert_eq!(address, Address::new("broker", 1999));
    }

    #[test]
    fn rejects_unknown_scheme_and_bad_port() {
        assert_eq!(Address::parse("http://broker"), Err(crate::Error::InvalidAddress));
        assert_eq!(Address::parse("broker:port"), Err(crate::Error::InvalidAddress));
        assert_eq!(Address::parse("broker:0"), Err(crate::Error::InvalidAddress));
    }

    #[test]
    fn display() {
        let address = Address::parse("ssl://broker").unwrap();
        assert_eq!(format!("{}", address), "mqtts://broker:8883");

        let address = Address::parse("[::1]").unwrap();
        assert_eq!(format!("{}", address), "mqtt://[::1]:1883");
    }

    #[test]
    fn bracketed_ipv6() {
        assert_eq!(Address::parse("mqtt://[::1]:1884").unwrap(), Address::new("::1", 1884));
        assert_eq!(Address::parse("[fe80::2]").unwrap(), Address::new("fe80::2", 1883));

        let secure = Address::parse("mqtts://user@[::1]/path").unwrap();
        assert_eq!(secure.host, "::1");
        assert_eq!(secure.port, 8883);

        assert_eq!(Address::parse("[::1"), Err(crate::Error::InvalidAddress));
        assert_eq!(Address::parse("[::1]1884"), Err(crate::Error::InvalidAddress));
    }
}

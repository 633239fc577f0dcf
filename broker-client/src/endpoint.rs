use std::fmt;

use crate::BrokerError;

/// Port the Gearman job server listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 4730;

/// One job-server address, `host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`.
    pub fn parse(raw: &str) -> Result<Self, BrokerError> {
        let raw = raw.trim();
        let invalid = || BrokerError::InvalidEndpoint(raw.to_string());

        if raw.is_empty() {
            return Err(invalid());
        }

        let (host, port) = if let Some(rest) = raw.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            match tail {
                "" => (host, None),
                tail => (host, Some(tail.strip_prefix(':').ok_or_else(invalid)?)),
            }
        } else {
            match raw.rsplit_once(':') {
                Some((host, port)) if !host.contains(':') => (host, Some(port)),
                // bare IPv6 without brackets carries no port
                Some(_) => (raw, None),
                None => (raw, None),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Parse every entry; the first malformed one aborts.
    pub fn parse_all<S: AsRef<str>>(raw: &[S]) -> Result<Vec<Self>, BrokerError> {
        if raw.is_empty() {
            return Err(BrokerError::NoServers);
        }
        raw.iter().map(|entry| Self::parse(entry.as_ref())).collect()
    }

    /// Address in the form `tokio::net::TcpStream::connect` accepts.
    pub fn address(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

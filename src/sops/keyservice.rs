//! Keyservice addressing and reachability checks

use crate::error::{Error, Result};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::info;

/// Timeout for the keyservice reachability probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

fn address_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:tcp://)?(\[[0-9A-Fa-f:.]+\]|[A-Za-z0-9_.\-]+):([0-9]{1,5})$")
            .expect("static regex")
    })
}

/// Parsed keyservice TCP address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyserviceAddr {
    host: String,
    port: u16,
}

impl KeyserviceAddr {
    /// Parse `host:port` or `tcp://host:port`
    pub fn parse(addr: &str) -> Result<Self> {
        let addr = addr.trim();
        let captures = address_pattern().captures(addr).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "Keyservice address must be host:port or tcp://host:port, got {:?}",
                addr
            ))
        })?;

        let port: u16 = captures[2].parse().map_err(|_| {
            Error::InvalidConfig(format!("Keyservice port out of range in {:?}", addr))
        })?;
        if port == 0 {
            return Err(Error::InvalidConfig(format!(
                "Keyservice port must not be 0 in {:?}",
                addr
            )));
        }

        Ok(KeyserviceAddr {
            host: captures[1].to_string(),
            port,
        })
    }

    /// URI form passed to `sops --keyservice`
    pub fn uri(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }

    /// `host:port` form for socket connections
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check that something accepts TCP connections at this address
    pub async fn probe(&self, timeout: Duration) -> Result<()> {
        let target = self.target();
        match tokio::time::timeout(timeout, TcpStream::connect(&target)).await {
            Ok(Ok(_stream)) => {
                info!("Keyservice at {} accepted a connection", target);
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::Internal(format!(
                "Timed out connecting to keyservice at {} after {:?}",
                target, timeout
            ))),
        }
    }
}

impl fmt::Display for KeyserviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

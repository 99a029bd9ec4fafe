//! Sentinel `+switch-master` notification parsing.
//!
//! Payload: `<service-name> <old-ip> <old-port> <new-ip> <new-port>`,
//! space-separated ASCII.

use std::net::IpAddr;

use crate::config::Endpoint;

/// Why a switch notification could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyParseError {
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),

    #[error("invalid address '{0}'")]
    Address(String),

    #[error("invalid port '{0}'")]
    Port(String),

    #[error("payload is not valid UTF-8")]
    Encoding,
}

/// A primary change announced by the discovery service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyChange {
    pub service_name: String,
    pub old_primary: Endpoint,
    pub new_primary: Endpoint,
}

impl TopologyChange {
    /// Parse a notification payload.
    ///
    /// An empty (or all-whitespace) payload is not an error: it yields
    /// `Ok(None)` and the notification is ignored.
    pub fn parse(payload: &[u8]) -> Result<Option<Self>, TopologyParseError> {
        let text = std::str::from_utf8(payload).map_err(|_| TopologyParseError::Encoding)?;
        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.is_empty() {
            return Ok(None);
        }
        let [service_name, old_ip, old_port, new_ip, new_port] = fields[..] else {
            return Err(TopologyParseError::FieldCount(fields.len()));
        };

        Ok(Some(Self {
            service_name: service_name.to_string(),
            old_primary: endpoint(old_ip, old_port)?,
            new_primary: endpoint(new_ip, new_port)?,
        }))
    }
}

fn endpoint(ip: &str, port: &str) -> Result<Endpoint, TopologyParseError> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| TopologyParseError::Address(ip.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| TopologyParseError::Port(port.to_string()))?;
    Ok(Endpoint::new(ip.to_string(), port))
}

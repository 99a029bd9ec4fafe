//! Connection string parsing.
//!
//! Format: comma-separated tokens. Bare tokens are `host[:port]` endpoints,
//! `key=value` tokens are options (keys are case-insensitive):
//!
//! ```text
//! 10.0.0.1:26379,10.0.0.2:26379,serviceName=mymaster,connectTimeout=2000
//! ```
//!
//! A non-empty `serviceName` switches the connector to Sentinel mode: the
//! endpoints are then sentinels, and the data endpoint is resolved from them.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use super::ConfigError;

/// Default Redis port.
pub const DEFAULT_PORT: u16 = 6379;
/// Default Sentinel port.
pub const DEFAULT_SENTINEL_PORT: u16 = 26379;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);
const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_millis(5000);

/// A broker address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`.
    pub fn parse(text: &str, default_port: u16) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidEndpoint(text.to_string());
        let text = text.trim();
        if text.is_empty() {
            return Err(invalid());
        }

        if let Some(rest) = text.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            host.parse::<IpAddr>().map_err(|_| invalid())?;
            let port = match tail.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid())?,
                None if tail.is_empty() => default_port,
                None => return Err(invalid()),
            };
            return Ok(Self::new(host, port));
        }

        // Unbracketed IPv6 literal without a port.
        if text.parse::<IpAddr>().is_ok() {
            return Ok(Self::new(text, default_port));
        }

        match text.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse().map_err(|_| invalid())?;
                Ok(Self::new(host, port))
            }
            Some(_) => Err(invalid()),
            None => Ok(Self::new(text, default_port)),
        }
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

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Which command set a session is allowed to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommandMode {
    /// Data commands (scripts, pub/sub).
    #[default]
    Standard,
    /// Discovery commands only (`SENTINEL ...`, pub/sub).
    Sentinel,
}

/// Options parsed from a connection string.
///
/// Immutable once resolved, except that [`retarget`](Self::retarget)
/// replaces the endpoint list when the connector re-homes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub endpoints: Vec<Endpoint>,
    pub service_name: Option<String>,
    pub connect_timeout: Duration,
    pub sync_timeout: Duration,
    pub default_database: i64,
    pub user: Option<String>,
    pub password: Option<String>,
    pub client_name: Option<String>,
    /// Fail `connect` when no endpoint answers (otherwise keep retrying).
    pub abort_on_connect_fail: bool,
    pub command_mode: CommandMode,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            service_name: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            default_database: 0,
            user: None,
            password: None,
            client_name: None,
            abort_on_connect_fail: true,
            command_mode: CommandMode::Standard,
        }
    }
}

impl ConnectionOptions {
    /// Parse a connection string.
    pub fn parse(connection_string: &str) -> Result<Self, ConfigError> {
        if connection_string.trim().is_empty() {
            return Err(ConfigError::Empty);
        }

        let mut options = Self::default();
        let mut hosts = Vec::new();
        let mut unknown = Vec::new();
        let mut ignore_unknown = false;

        for token in connection_string.split(',').map(str::trim) {
            if token.is_empty() {
                continue;
            }
            let Some((key, value)) = token.split_once('=') else {
                hosts.push(token);
                continue;
            };
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "servicename" => {
                    options.service_name = Some(value.to_string()).filter(|s| !s.is_empty());
                }
                "connecttimeout" => options.connect_timeout = parse_millis(key, value)?,
                "synctimeout" => options.sync_timeout = parse_millis(key, value)?,
                "defaultdatabase" => {
                    options.default_database = value.parse().map_err(|_| invalid(key, value))?;
                }
                "user" => options.user = Some(value.to_string()),
                "password" => options.password = Some(value.to_string()),
                "name" => options.client_name = Some(value.to_string()),
                "abortconnect" => options.abort_on_connect_fail = parse_bool(key, value)?,
                "ignoreunknown" => ignore_unknown = parse_bool(key, value)?,
                _ => unknown.push(key.trim().to_string()),
            }
        }

        if let Some(key) = unknown.into_iter().next().filter(|_| !ignore_unknown) {
            return Err(ConfigError::UnknownOption(key));
        }

        let default_port = if options.is_sentinel() {
            DEFAULT_SENTINEL_PORT
        } else {
            DEFAULT_PORT
        };
        options.endpoints = hosts
            .into_iter()
            .map(|h| Endpoint::parse(h, default_port))
            .collect::<Result<_, _>>()?;

        if options.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }

        Ok(options)
    }

    /// True when a service name designates Sentinel mode.
    pub fn is_sentinel(&self) -> bool {
        self.service_name.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Options for the discovery session: same endpoints, discovery command set.
    pub fn sentinel_options(&self) -> Self {
        Self {
            endpoints: self.endpoints.clone(),
            service_name: self.service_name.clone(),
            connect_timeout: self.connect_timeout,
            sync_timeout: self.sync_timeout,
            command_mode: CommandMode::Sentinel,
            ..Self::default()
        }
    }

    /// First configured endpoint; the one re-home compares against.
    pub fn primary_endpoint(&self) -> Option<&Endpoint> {
        self.endpoints.first()
    }

    /// Replace the endpoint list with a single endpoint.
    pub fn retarget(&mut self, endpoint: Endpoint) {
        self.endpoints.clear();
        self.endpoints.push(endpoint);
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.trim().to_string(),
        value: value.to_string(),
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| invalid(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_endpoint() {
        let options = ConnectionOptions::parse("localhost:6380").unwrap();
        assert_eq!(options.endpoints, vec![Endpoint::new("localhost", 6380)]);
        assert!(!options.is_sentinel());
        assert_eq!(options.command_mode, CommandMode::Standard);
        assert_eq!(options.connect_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_parse_default_port() {
        let options = ConnectionOptions::parse("redis-a").unwrap();
        assert_eq!(options.endpoints[0].port, DEFAULT_PORT);
    }

    #[test]
    fn test_parse_sentinel_mode() {
        let options = ConnectionOptions::parse(
            "10.0.0.1,10.0.0.2:26380, serviceName=mymaster, syncTimeout=1500",
        )
        .unwrap();
        assert!(options.is_sentinel());
        assert_eq!(options.service_name.as_deref(), Some("mymaster"));
        assert_eq!(
            options.endpoints,
            vec![
                Endpoint::new("10.0.0.1", DEFAULT_SENTINEL_PORT),
                Endpoint::new("10.0.0.2", 26380),
            ]
        );
        assert_eq!(options.sync_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_empty_service_name_is_not_sentinel() {
        let options = ConnectionOptions::parse("localhost,serviceName=").unwrap();
        assert!(!options.is_sentinel());
        assert_eq!(options.endpoints[0].port, DEFAULT_PORT);
    }

    #[test]
    fn test_parse_options_case_insensitive() {
        let options = ConnectionOptions::parse(concat!(
            "h:1,CONNECTTIMEOUT=10,DefaultDatabase=3,password=s3cret,",
            "user=app,name=bus,abortConnect=false",
        ))
        .unwrap();
        assert_eq!(options.connect_timeout, Duration::from_millis(10));
        assert_eq!(options.default_database, 3);
        assert_eq!(options.password.as_deref(), Some("s3cret"));
        assert_eq!(options.user.as_deref(), Some("app"));
        assert_eq!(options.client_name.as_deref(), Some("bus"));
        assert!(!options.abort_on_connect_fail);
    }

    #[test]
    fn test_unknown_option_rejected() {
        let err = ConnectionOptions::parse("h:1,bogus=1").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOption(k) if k == "bogus"));
    }

    #[test]
    fn test_unknown_option_ignored_when_requested() {
        let options = ConnectionOptions::parse("h:1,bogus=1,ignoreUnknown=true").unwrap();
        assert_eq!(options.endpoints.len(), 1);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            ConnectionOptions::parse("h:1,connectTimeout=soon"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            ConnectionOptions::parse("h:notaport"),
            Err(ConfigError::InvalidEndpoint(_))
        ));
        assert!(matches!(ConnectionOptions::parse("  "), Err(ConfigError::Empty)));
        assert!(matches!(
            ConnectionOptions::parse("serviceName=x"),
            Err(ConfigError::NoEndpoints)
        ));
    }

    #[test]
    fn test_sentinel_options() {
        let options =
            ConnectionOptions::parse("s1:26379,serviceName=svc,password=pw,defaultDatabase=2")
                .unwrap();
        let sentinel = options.sentinel_options();
        assert_eq!(sentinel.command_mode, CommandMode::Sentinel);
        assert_eq!(sentinel.endpoints, options.endpoints);
        assert_eq!(sentinel.service_name.as_deref(), Some("svc"));
        assert_eq!(sentinel.password, None);
        assert_eq!(sentinel.default_database, 0);
    }

    #[test]
    fn test_retarget_replaces_endpoints() {
        let mut options = ConnectionOptions::parse("a:1,b:2").unwrap();
        options.retarget(Endpoint::new("c", 3));
        assert_eq!(options.endpoints, vec![Endpoint::new("c", 3)]);
        assert_eq!(options.primary_endpoint(), Some(&Endpoint::new("c", 3)));
    }

    #[test]
    fn test_endpoint_ipv6() {
        assert_eq!(
            Endpoint::parse("[::1]:7000", DEFAULT_PORT).unwrap(),
            Endpoint::new("::1", 7000)
        );
        assert_eq!(
            Endpoint::parse("::1", DEFAULT_PORT).unwrap(),
            Endpoint::new("::1", DEFAULT_PORT)
        );
        assert_eq!(Endpoint::new("::1", 7000).to_string(), "[::1]:7000");
    }

    #[test]
    fn test_endpoint_from_socket_addr() {
        let addr: SocketAddr = "10.0.0.2:6380".parse().unwrap();
        assert_eq!(Endpoint::from(addr).to_string(), "10.0.0.2:6380");
    }
}

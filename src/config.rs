//! Environment-driven proxy configuration
//!
//! Every knob comes from the process environment. Loading goes through a
//! lookup closure so tests can inject variables without touching the
//! real environment, and every failure is a typed [`ConfigError`] naming
//! the offending variable.

use crate::tracker::TrackerLimits;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// One upstream server as configured in `SERVERS`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ServerSettings {
    /// `host:port` the proxy forwards to over plain HTTP
    pub host: String,
    /// Maximum concurrent proxied requests, absent = unlimited
    #[serde(default, rename = "connectionsLimit")]
    pub connections_limit: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    pub bind: String,
    pub servers: Vec<ServerSettings>,
    /// Empty set means no origin is allowed (gate rejects every request)
    pub allowed_origins: Option<HashSet<String>>,
    pub allowed_ips: Option<HashSet<IpAddr>>,
    /// Header whose value identifies the source; falls back to peer IP
    pub source_id_header: Option<String>,
    pub ip_connections_limit: Option<u64>,
    pub total_connections_limit: Option<u64>,
    /// Idle-connection header read timeout, absent = disabled
    pub connection_timeout: Option<Duration>,
    /// Upstream request transfer timeout, absent = disabled
    pub req_transfer_timeout: Option<Duration>,
    pub max_req_bytes: Option<u64>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// Backend `/info` polling interval, absent = polling off
    pub servers_check_interval: Option<Duration>,
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = match lookup("PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|e| ConfigError::Invalid {
                var: "PORT",
                reason: e.to_string(),
            })?,
            None => return Err(ConfigError::Missing("PORT")),
        };

        let bind = lookup("BIND").unwrap_or_else(|| "0.0.0.0".to_string());

        let servers = match lookup("SERVERS") {
            Some(raw) => parse_servers(&raw)?,
            None => return Err(ConfigError::Missing("SERVERS")),
        };

        let allowed_origins = lookup("ALLOWED_ORIGINS").map(|raw| csv_set(&raw));

        let allowed_ips = match lookup("ALLOWED_IPS") {
            Some(raw) => Some(parse_ip_set(&raw)?),
            None => None,
        };

        let source_id_header = lookup("SOURCE_ID_HEADER")
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty());

        Ok(Self {
            port,
            bind,
            servers,
            allowed_origins,
            allowed_ips,
            source_id_header,
            ip_connections_limit: parse_optional_u64(&lookup, "IP_CONNECTIONS_LIMIT")?,
            total_connections_limit: parse_optional_u64(&lookup, "TOTAL_CONNECTIONS_LIMIT")?,
            connection_timeout: parse_optional_millis(&lookup, "CONNECTION_TIMEOUT")?,
            req_transfer_timeout: parse_optional_millis(&lookup, "REQ_TRANSFER_TIMEOUT")?,
            max_req_bytes: parse_optional_u64(&lookup, "MAX_REQ_BYTES")?,
            tls_cert: lookup("TLS_CERT"),
            tls_key: lookup("TLS_KEY"),
            servers_check_interval: parse_optional_millis(&lookup, "SERVERS_CHECK_INTERVAL")?,
        })
    }

    pub fn tracker_limits(&self) -> TrackerLimits {
        TrackerLimits {
            per_key: self.ip_connections_limit,
            global: self.total_connections_limit,
        }
    }
}

fn parse_servers(raw: &str) -> Result<Vec<ServerSettings>, ConfigError> {
    let servers: Vec<ServerSettings> =
        serde_json::from_str(raw).map_err(|e| ConfigError::Invalid {
            var: "SERVERS",
            reason: e.to_string(),
        })?;
    if servers.is_empty() {
        return Err(ConfigError::Invalid {
            var: "SERVERS",
            reason: "server list is empty".to_string(),
        });
    }
    if let Some(entry) = servers.iter().find(|s| s.host.trim().is_empty()) {
        return Err(ConfigError::Invalid {
            var: "SERVERS",
            reason: format!("server entry has empty host: {entry:?}"),
        });
    }
    Ok(servers)
}

fn parse_ip_set(raw: &str) -> Result<HashSet<IpAddr>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpAddr>().map_err(|e| ConfigError::Invalid {
                var: "ALLOWED_IPS",
                reason: format!("{s}: {e}"),
            })
        })
        .collect()
}

fn csv_set(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_optional_u64<F>(lookup: &F, var: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                var,
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}

fn parse_optional_millis<F>(lookup: &F, var: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_optional_u64(lookup, var)?.map(Duration::from_millis))
}

//! Endpoint addresses.
//!
//! An endpoint is advertised as an opaque `scheme://host:port[?query]`
//! string. The scheme selects the transport; the rest is parsed into an
//! [`Address`] only when a transport actually needs it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Errors from parsing an endpoint string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("malformed endpoint: {0}")]
    Malformed(String),
    #[error("invalid port in endpoint {endpoint}")]
    InvalidPort { endpoint: String },
}

fn endpoint_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<scheme>[A-Za-z][A-Za-z0-9+.\-]*)://(?P<host>\[[^\]]+\]|[^:/?\[\]]+):(?P<port>\d+)/?(?:\?(?P<query>.*))?$",
        )
        .unwrap_or_else(|_| unreachable!("endpoint pattern is a valid regex"))
    })
}

/// A parsed `scheme://host:port?query` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, String>,
}

impl Address {
    /// Parses an endpoint string.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError`] when the string does not have the
    /// `scheme://host:port` shape or the port does not fit in a `u16`.
    pub fn parse(endpoint: &str) -> Result<Self, AddressError> {
        let caps = endpoint_regex()
            .captures(endpoint.trim())
            .ok_or_else(|| AddressError::Malformed(endpoint.to_string()))?;

        let port = caps["port"]
            .parse::<u16>()
            .map_err(|_| AddressError::InvalidPort {
                endpoint: endpoint.to_string(),
            })?;

        let query = caps
            .name("query")
            .map(|q| parse_query(q.as_str()))
            .unwrap_or_default();

        Ok(Self {
            scheme: caps["scheme"].to_ascii_lowercase(),
            host: caps["host"].to_string(),
            port,
            query,
        })
    }

    /// `host:port`, suitable for socket APIs.
    #[must_use]
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn ssl_enabled(&self) -> bool {
        self.query
            .get("sslEnabled")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)?;
        let mut sep = '?';
        for (k, v) in &self.query {
            write!(f, "{sep}{k}={v}")?;
            sep = '&';
        }
        Ok(())
    }
}

fn parse_query(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// Returns the scheme of an endpoint string without fully parsing it.
#[must_use]
pub fn scheme_of(endpoint: &str) -> Option<&str> {
    endpoint.split_once("://").map(|(scheme, _)| scheme)
}

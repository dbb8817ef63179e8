//! Proxy configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default DNS-over-HTTPS endpoint (JSON API).
pub const DEFAULT_DOH_ENDPOINT: &str = "https://cloudflare-dns.com/dns-query";

/// Port used to reach the relay when none is configured.
pub const DEFAULT_RELAY_PORT: u16 = 443;

/// Configuration record handed to the proxy at startup.
///
/// The short keys of the legacy `config.json` format are accepted as
/// aliases, so existing files load unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Relay host name, optionally followed by a WebSocket path
    /// (e.g. `relay.example.com/ws`)
    #[serde(alias = "domain")]
    pub relay_domain: String,

    /// Shared secret sent to the relay in every control message
    #[serde(alias = "psw", default)]
    pub credential: String,

    /// Local SOCKS5 listen port
    #[serde(alias = "sport", default = "default_listen_port")]
    pub listen_port: u16,

    /// Local SOCKS5 listen address
    #[serde(alias = "sbind", default = "default_listen_addr")]
    pub listen_addr: String,

    /// Address to dial instead of resolving `relay_domain`; also replaces
    /// the destination of direct connections
    #[serde(alias = "wkip", default)]
    pub relay_ip: Option<String>,

    /// Port to dial the relay on
    #[serde(alias = "wkport", default)]
    pub relay_port: Option<u16>,

    /// Host announced to the relay for edge-network destinations; when set,
    /// edge destinations are tunnelled instead of connected directly
    #[serde(alias = "proxyip", default)]
    pub edge_proxy_ip: Option<String>,

    /// Port announced together with `edge_proxy_ip`
    #[serde(alias = "proxyport", default)]
    pub edge_proxy_port: Option<u16>,

    /// Host names always treated as on the edge network
    #[serde(alias = "cfhs", default)]
    pub edge_hostnames: Vec<String>,

    /// DNS-over-HTTPS JSON endpoint
    #[serde(default = "default_doh_endpoint")]
    pub doh_endpoint: String,

    /// Skip certificate verification when connecting to the relay
    #[serde(default)]
    pub insecure: bool,
}

fn default_listen_port() -> u16 {
    1080
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_doh_endpoint() -> String {
    DEFAULT_DOH_ENDPOINT.to_string()
}

impl ProxyConfig {
    /// Create a configuration with defaults for everything but the relay.
    pub fn new(relay_domain: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            relay_domain: relay_domain.into(),
            credential: credential.into(),
            listen_port: default_listen_port(),
            listen_addr: default_listen_addr(),
            relay_ip: None,
            relay_port: None,
            edge_proxy_ip: None,
            edge_proxy_port: None,
            edge_hostnames: Vec::new(),
            doh_endpoint: default_doh_endpoint(),
            insecure: false,
        }
    }

    /// Load, normalize and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    /// Parse, normalize and validate a JSON configuration document.
    pub fn from_json(content: &str) -> Result<Self> {
        let mut config: ProxyConfig = serde_json::from_str(content)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Treat empty strings and zero ports as absent.
    pub fn normalize(&mut self) {
        fn blank(value: &mut Option<String>) {
            if value.as_deref().map_or(false, |v| v.trim().is_empty()) {
                *value = None;
            }
        }
        blank(&mut self.relay_ip);
        blank(&mut self.edge_proxy_ip);
        if self.relay_port == Some(0) {
            self.relay_port = None;
        }
        if self.edge_proxy_port == Some(0) {
            self.edge_proxy_port = None;
        }
        self.edge_hostnames.retain(|h| !h.trim().is_empty());
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.relay_host().is_empty() {
            return Err(Error::config("relay_domain cannot be empty"));
        }
        if self.listen_addr.is_empty() {
            return Err(Error::config("listen_addr cannot be empty"));
        }
        if !(self.doh_endpoint.starts_with("https://") || self.doh_endpoint.starts_with("http://")) {
            return Err(Error::config(format!(
                "doh_endpoint must be an http(s) URL, got {}",
                self.doh_endpoint
            )));
        }
        Ok(())
    }

    /// Local listen address as `addr:port`.
    pub fn listen_socket(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }

    /// `host[:port]` part of `relay_domain`, as used in the relay URL.
    pub fn relay_authority(&self) -> &str {
        match self.relay_domain.find('/') {
            Some(i) => &self.relay_domain[..i],
            None => &self.relay_domain,
        }
    }

    /// Host part of `relay_domain` (used for SNI).
    pub fn relay_host(&self) -> &str {
        let authority = self.relay_authority();
        match split_port(authority) {
            Some((host, _)) => host,
            None => authority,
        }
    }

    /// Port written into `relay_domain`, if any.
    pub fn relay_domain_port(&self) -> Option<u16> {
        split_port(self.relay_authority()).map(|(_, port)| port)
    }

    /// WebSocket request path taken from `relay_domain`.
    pub fn relay_path(&self) -> &str {
        match self.relay_domain.find('/') {
            Some(i) => &self.relay_domain[i..],
            None => "/",
        }
    }

    /// Where the relay's TCP connection is actually dialed.
    pub fn relay_dial_target(&self) -> (&str, u16) {
        let host = self.relay_ip.as_deref().unwrap_or_else(|| self.relay_host());
        let port = self
            .relay_port
            .or_else(|| self.relay_domain_port())
            .unwrap_or(DEFAULT_RELAY_PORT);
        (host, port)
    }
}

/// Split a trailing `:port` off `host:port`. Bare IPv6 literals are left alone.
fn split_port(authority: &str) -> Option<(&str, u16)> {
    let (host, port) = authority.rsplit_once(':')?;
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return None;
    }
    let port = port.parse().ok()?;
    Some((host.trim_start_matches('[').trim_end_matches(']'), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::from_json(r#"{"relay_domain": "relay.example.com"}"#).unwrap();
        assert_eq!(config.listen_port, 1080);
        assert_eq!(config.listen_addr, "127.0.0.1");
        assert_eq!(config.doh_endpoint, DEFAULT_DOH_ENDPOINT);
        assert!(config.relay_ip.is_none());
        assert!(!config.insecure);
        assert_eq!(config.relay_dial_target(), ("relay.example.com", 443));
    }

    #[test]
    fn test_short_keys() {
        let json = r#"{
            "domain": "relay.example.com",
            "psw": "secret",
            "sport": 1081,
            "sbind": "0.0.0.0",
            "wkip": "203.0.113.7",
            "wkport": 8443,
            "proxyip": "198.51.100.1",
            "proxyport": 443,
            "cfhs": ["app.example.org"]
        }"#;
        let config = ProxyConfig::from_json(json).unwrap();
        assert_eq!(config.credential, "secret");
        assert_eq!(config.listen_socket(), "0.0.0.0:1081");
        assert_eq!(config.relay_dial_target(), ("203.0.113.7", 8443));
        assert_eq!(config.edge_proxy_ip.as_deref(), Some("198.51.100.1"));
        assert_eq!(config.edge_proxy_port, Some(443));
        assert_eq!(config.edge_hostnames, vec!["app.example.org".to_string()]);
    }

    #[test]
    fn test_blank_values_are_absent() {
        let json = r#"{"domain": "relay.example.com", "wkip": "", "wkport": 0, "proxyip": " ", "cfhs": [""]}"#;
        let config = ProxyConfig::from_json(json).unwrap();
        assert!(config.relay_ip.is_none());
        assert!(config.relay_port.is_none());
        assert!(config.edge_proxy_ip.is_none());
        assert!(config.edge_hostnames.is_empty());
    }

    #[test]
    fn test_relay_path() {
        let config = ProxyConfig::new("relay.example.com/tunnel", "x");
        assert_eq!(config.relay_host(), "relay.example.com");
        assert_eq!(config.relay_path(), "/tunnel");

        let config = ProxyConfig::new("relay.example.com", "x");
        assert_eq!(config.relay_path(), "/");
    }

    #[test]
    fn test_relay_domain_with_port() {
        let config = ProxyConfig::new("relay.example.com:8443/ws", "x");
        assert_eq!(config.relay_authority(), "relay.example.com:8443");
        assert_eq!(config.relay_host(), "relay.example.com");
        assert_eq!(config.relay_domain_port(), Some(8443));
        assert_eq!(config.relay_path(), "/ws");
        assert_eq!(config.relay_dial_target(), ("relay.example.com", 8443));
        assert!(config.validate().is_ok());

        // An explicit relay_port still wins
        let mut config = ProxyConfig::new("relay.example.com:8443", "x");
        config.relay_ip = Some("203.0.113.7".into());
        config.relay_port = Some(2053);
        assert_eq!(config.relay_dial_target(), ("203.0.113.7", 2053));

        let config = ProxyConfig::new("relay.example.com", "x");
        assert_eq!(config.relay_domain_port(), None);
    }

    #[test]
    fn test_split_port() {
        assert_eq!(split_port("relay.example.com:443"), Some(("relay.example.com", 443)));
        assert_eq!(split_port("[2001:db8::1]:8443"), Some(("2001:db8::1", 8443)));
        assert_eq!(split_port("2001:db8::1"), None);
        assert_eq!(split_port("relay.example.com"), None);
        assert_eq!(split_port("relay.example.com:http"), None);
    }

    #[test]
    fn test_validation() {
        assert!(ProxyConfig::new("", "x").validate().is_err());
        assert!(ProxyConfig::new("/path-only", "x").validate().is_err());

        let mut config = ProxyConfig::new("relay.example.com", "x");
        config.doh_endpoint = "dns.example.com".into();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        assert!(ProxyConfig::from_json(r#"{"psw": "x"}"#).is_err());
    }
}

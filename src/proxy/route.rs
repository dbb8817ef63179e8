//! Direct-versus-tunnel routing decision.
//!
//! Pure function of the classification and configuration; performs no I/O.

use std::fmt;

use crate::classify::Classification;
use crate::config::ProxyConfig;

/// How a session reaches its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMode {
    /// Raw TCP connection to the destination
    Direct,
    /// Through the relay tunnel
    Tunnel,
}

impl fmt::Display for RouteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteMode::Direct => f.write_str("direct"),
            RouteMode::Tunnel => f.write_str("tunnel"),
        }
    }
}

/// Where a session connects, computed once per session.
///
/// For [`RouteMode::Direct`] `host`/`port` are dialed; for
/// [`RouteMode::Tunnel`] they are announced to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    /// Chosen path
    pub mode: RouteMode,
    /// Target host
    pub host: String,
    /// Target port
    pub port: u16,
}

/// Decide how to reach a classified destination requested on `port`.
pub fn route(classification: &Classification, port: u16, config: &ProxyConfig) -> RouteDecision {
    match (&config.edge_proxy_ip, classification.on_edge) {
        (None, true) => RouteDecision {
            mode: RouteMode::Direct,
            host: config
                .relay_ip
                .clone()
                .unwrap_or_else(|| classification.resolved.clone()),
            port,
        },
        (Some(edge_proxy), true) => RouteDecision {
            mode: RouteMode::Tunnel,
            host: edge_proxy.clone(),
            port: config.edge_proxy_port.unwrap_or(port),
        },
        (_, false) => RouteDecision {
            mode: RouteMode::Tunnel,
            host: classification.resolved.clone(),
            port,
        },
    }
}

//! Local SOCKS5 front end.
//!
//! Accepts SOCKS5 clients, classifies each destination and either connects
//! straight to it or carries the session through the relay tunnel.
//!
//! ```text
//! client ──SOCKS5──▶ socks5 ──▶ classify ──▶ route ──┬─▶ TCP (direct)
//!                                                    └─▶ tunnel (TLS WebSocket)
//!                          relay::bridge splices the chosen upstream
//! ```

pub mod relay;
pub mod route;
pub mod socks5;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::classify::{AddressKind, CidrTable, Classifier, DohResolver, Resolver};
use crate::config::ProxyConfig;
use crate::error::Result;

pub use relay::{bridge, BridgeStats};
pub use route::{route, RouteDecision, RouteMode};
pub use socks5::{ConnectRequest, SessionState};
pub use tunnel::{ControlMessage, TunnelClient, TunnelStream};

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// State shared by every session of one proxy.
pub(crate) struct Shared<R> {
    pub(crate) config: ProxyConfig,
    pub(crate) classifier: Classifier<R>,
    pub(crate) tunnel: TunnelClient,
}

/// SOCKS5 proxy instance.
pub struct Proxy<R> {
    shared: Arc<Shared<R>>,
}

impl Proxy<DohResolver> {
    /// Create a proxy resolving domains over the configured DoH endpoint.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let resolver = DohResolver::new(config.doh_endpoint.clone())?;
        Self::with_resolver(config, resolver)
    }
}

impl<R: Resolver + 'static> Proxy<R> {
    /// Create a proxy with a custom resolver.
    pub fn with_resolver(config: ProxyConfig, resolver: R) -> Result<Self> {
        config.validate()?;

        let classifier = Classifier::new(CidrTable::edge()?, resolver)
            .with_edge_hostnames(config.edge_hostnames.iter().cloned());
        let tunnel = TunnelClient::new(&config)?;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                classifier,
                tunnel,
            }),
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &ProxyConfig {
        &self.shared.config
    }

    /// Destination classifier.
    pub fn classifier(&self) -> &Classifier<R> {
        &self.shared.classifier
    }

    /// Classify and route `host:port` without connecting.
    pub async fn plan(&self, host: &str, port: u16) -> RouteDecision {
        let classification = self
            .shared
            .classifier
            .classify(host, AddressKind::of(host))
            .await;
        route(&classification, port, &self.shared.config)
    }

    /// Bind the configured listen address and serve forever.
    pub async fn run(&self) -> Result<()> {
        let addr = self.shared.config.listen_socket();
        let listener = TcpListener::bind(&addr).await?;

        tracing::info!("SOCKS5 proxy listening on {}", addr);
        tracing::info!(
            "relay: {} ({})",
            self.shared.tunnel.url(),
            if self.shared.config.insecure {
                "certificate checks disabled"
            } else {
                "verified"
            }
        );

        self.serve(listener).await
    }

    /// Accept clients from `listener`, one task per connection.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    tracing::debug!("SOCKS5 connection from {}", peer_addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("set_nodelay for {} failed: {}", peer_addr, e);
                    }

                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        let state =
                            socks5::handle_client(stream, peer_addr.to_string(), shared).await;
                        tracing::debug!("session from {} ended in {:?}", peer_addr, state);
                    });
                }
                Err(e) => {
                    tracing::warn!("Accept error: {}", e);
                    // EMFILE and friends fail again immediately
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Serve a single already-accepted client stream to completion.
    pub async fn handle<S>(&self, stream: S, peer: impl Into<String>) -> SessionState
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        socks5::handle_client(stream, peer, Arc::clone(&self.shared)).await
    }
}

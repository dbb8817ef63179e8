//! Shared fixtures for proxy tests.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;

use crate::classify::Resolver;
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::proxy::{Proxy, Shared};

/// Resolver with a fixed answer that counts queries.
pub(crate) struct CountingResolver {
    answer: Option<Ipv4Addr>,
    pub(crate) calls: AtomicUsize,
}

impl CountingResolver {
    pub(crate) fn new(answer: Option<Ipv4Addr>) -> Self {
        Self {
            answer,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Resolver for CountingResolver {
    async fn resolve_ipv4(&self, host: &str) -> Result<Ipv4Addr> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer
            .ok_or_else(|| Error::resolve(format!("no answer for {}", host)))
    }
}

/// Session state for `config` with a counting resolver.
pub(crate) fn shared(
    config: ProxyConfig,
    answer: Option<Ipv4Addr>,
) -> Arc<Shared<Arc<CountingResolver>>> {
    let resolver = Arc::new(CountingResolver::new(answer));
    Proxy::with_resolver(config, resolver).unwrap().shared
}

/// Local TCP echo server; returns its address.
pub(crate) async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// A local port with nothing listening on it.
pub(crate) fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Local TLS WebSocket relay serving one session with a self-signed
/// certificate for `relay.example.com`.
///
/// The first frame of the session is handed back on the returned channel;
/// binary frames after it are echoed.
pub(crate) async fn tls_ws_relay() -> (u16, oneshot::Receiver<Message>) {
    let cert = rcgen::generate_simple_self_signed(vec!["relay.example.com".to_string()]).unwrap();
    let cert_der = CertificateDer::from(cert.serialize_der().unwrap());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let server_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (first_tx, first_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let tls = acceptor.accept(tcp).await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tls).await.unwrap();

        if let Some(Ok(first)) = ws.next().await {
            let _ = first_tx.send(first);
        }
        // Ends once the close handshake completes or the peer goes away
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Binary(data) = msg {
                if ws.send(Message::Binary(data)).await.is_err() {
                    break;
                }
            }
        }
    });

    (port, first_rx)
}

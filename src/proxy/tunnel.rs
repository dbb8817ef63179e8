//! Relay tunnel client.
//!
//! A tunnel is a TLS WebSocket session to the relay. The first frame is a
//! JSON control message naming the real destination; after that the
//! session is an opaque byte pipe, exposed as [`TunnelStream`] which
//! implements `AsyncRead`/`AsyncWrite` over binary frames.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{SinkExt, StreamExt};
use rand::seq::SliceRandom;
use rustls::pki_types::ServerName;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, USER_AGENT};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async, WebSocketStream};

use crate::config::ProxyConfig;
use crate::error::{Error, Result};

/// Browser user agents presented to the relay, one picked per session.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.1.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.101 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 14_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.0 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (iPad; CPU OS 14_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) CriOS/91.0.4472.80 Mobile/15E148 Safari/604.1",
];

/// First payload of every tunnel session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlMessage {
    /// Destination host the relay should connect to
    pub hostname: String,
    /// Destination port
    pub port: u16,
    /// Relay credential
    #[serde(rename = "psw")]
    pub credential: String,
}

impl ControlMessage {
    /// Serialize to the JSON text frame payload.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Opens tunnel sessions to the configured relay.
pub struct TunnelClient {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    url: String,
    dial_host: String,
    dial_port: u16,
    credential: String,
}

impl TunnelClient {
    /// Create a client from the proxy configuration.
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let server_name = ServerName::try_from(config.relay_host().to_string())
            .map_err(|e| Error::config(format!("invalid relay host {}: {}", config.relay_host(), e)))?;
        let (dial_host, dial_port) = config.relay_dial_target();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(tls_config(config.insecure)?)),
            server_name,
            url: format!("wss://{}{}", config.relay_authority(), config.relay_path()),
            dial_host: dial_host.to_string(),
            dial_port,
            credential: config.credential.clone(),
        })
    }

    /// WebSocket URL requested from the relay.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open a tunnel to `hostname:port` through the relay.
    ///
    /// Suspends until the TLS and WebSocket handshakes complete and the
    /// control message has been sent.
    pub async fn open(&self, hostname: &str, port: u16) -> Result<TunnelStream> {
        let tcp = TcpStream::connect((self.dial_host.as_str(), self.dial_port))
            .await
            .map_err(|e| {
                Error::tunnel(format!(
                    "connect to relay {}:{} failed: {}",
                    self.dial_host, self.dial_port, e
                ))
            })?;
        tcp.set_nodelay(true)?;

        let tls = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| Error::Tls(format!("handshake with relay failed: {}", e)))?;

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::tunnel(format!("invalid relay URL {}: {}", self.url, e)))?;
        request
            .headers_mut()
            .insert(USER_AGENT, HeaderValue::from_static(random_user_agent()));

        let (mut ws, _response) = client_async(request, tls)
            .await
            .map_err(|e| Error::tunnel(format!("WebSocket upgrade rejected: {}", e)))?;

        let control = ControlMessage {
            hostname: hostname.to_string(),
            port,
            credential: self.credential.clone(),
        };
        ws.send(Message::Text(control.to_json()?.into()))
            .await
            .map_err(|e| Error::tunnel(format!("sending control message failed: {}", e)))?;

        tracing::debug!("tunnel to {}:{} open via {}", hostname, port, self.url);
        Ok(TunnelStream::new(ws))
    }
}

fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

fn tls_config(insecure: bool) -> Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?;

    let config = if insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerify))
            .with_no_client_auth()
    } else {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(config)
}

/// WebSocket session viewed as a byte stream.
pub type TunnelStream = WsByteStream<TlsStream<TcpStream>>;

/// Byte-stream adapter over a WebSocket.
///
/// Writes become binary frames. Binary and text frames are read as data;
/// a close frame or the end of the stream reads as EOF.
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    pending: Vec<u8>,
    offset: usize,
}

impl<S> WsByteStream<S> {
    /// Wrap an established WebSocket.
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            offset: 0,
        }
    }

    fn drain_pending(&mut self, buf: &mut ReadBuf<'_>) {
        let remaining = &self.pending[self.offset..];
        let n = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..n]);
        self.offset += n;
        if self.offset >= self.pending.len() {
            self.pending.clear();
            self.offset = 0;
        }
    }
}

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, format!("WebSocket error: {}", e))
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        if !this.pending.is_empty() {
            this.drain_pending(buf);
            return Poll::Ready(Ok(()));
        }

        loop {
            let msg = match this.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(msg))) => msg,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(ws_error(e))),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            };
            let data: Vec<u8> = match msg {
                Message::Binary(data) => data.into(),
                Message::Text(text) => text.as_bytes().to_vec(),
                Message::Close(_) => return Poll::Ready(Ok(())),
                // Control frames are answered by tungstenite itself
                _ => continue,
            };
            if data.is_empty() {
                continue;
            }
            this.pending = data;
            this.offset = 0;
            this.drain_pending(buf);
            return Poll::Ready(Ok(()));
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let inner = &mut self.inner;
        match inner.poll_ready_unpin(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(ws_error(e))),
            Poll::Pending => return Poll::Pending,
        }
        match inner.start_send_unpin(Message::Binary(buf.to_vec().into())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => Poll::Ready(Err(ws_error(e))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner.poll_flush_unpin(cx).map_err(ws_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner.poll_close_unpin(cx).map_err(ws_error)
    }
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts any relay certificate; only used with `insecure: true`.
    #[derive(Debug)]
    pub(super) struct NoVerify;

    impl ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

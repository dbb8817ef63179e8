//! Client-facing SOCKS5 session handler.
//!
//! Implements the no-authentication, CONNECT-only subset of RFC 1928.
//! A session moves through
//! `AwaitingGreeting → AwaitingRequest → Connected → Relaying → Closed`.
//! Rejected method sets and unsupported requests do not close the socket:
//! the session stalls in its current state and discards client bytes until
//! the client hangs up.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::classify::{AddressKind, Resolver};
use crate::error::{Error, Result};
use crate::proxy::relay::bridge;
use crate::proxy::route::{route, RouteDecision, RouteMode};
use crate::proxy::tunnel::TunnelStream;
use crate::proxy::Shared;

// SOCKS5 Protocol Constants
/// Protocol version byte
pub const SOCKS5_VERSION: u8 = 0x05;

// Authentication Methods
/// No authentication required
pub const AUTH_NONE: u8 = 0x00;
/// No acceptable method
pub const AUTH_NO_ACCEPT: u8 = 0xFF;

// Commands
/// CONNECT command
pub const CMD_CONNECT: u8 = 0x01;

// Address Types
/// IPv4 address
pub const ADDR_TYPE_IPV4: u8 = 0x01;
/// Length-prefixed domain name
pub const ADDR_TYPE_DOMAIN: u8 = 0x03;
/// IPv6 address
pub const ADDR_TYPE_IPV6: u8 = 0x04;

// Reply Codes
/// Succeeded
pub const REP_SUCCESS: u8 = 0x00;
/// Upstream connect failed
pub const REP_FAILURE: u8 = 0x03;

/// Where a session is in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the method-selection greeting
    AwaitingGreeting,
    /// No-auth accepted, waiting for the CONNECT request
    AwaitingRequest,
    /// Upstream established, success reply pending
    Connected,
    /// Bytes are being bridged
    Relaying,
    /// Terminal
    Closed,
}

/// A parsed CONNECT request.
///
/// Keeps the wire form of the address so the reply can echo it verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Reserved byte as sent by the client
    pub reserved: u8,
    /// Address type (`ADDR_TYPE_*`)
    pub address_type: u8,
    /// Address bytes as on the wire (domain includes its length byte)
    pub raw_address: Vec<u8>,
    /// Decoded destination host
    pub host: String,
    /// Destination port
    pub port: u16,
}

impl ConnectRequest {
    /// How the destination was spelled.
    pub fn kind(&self) -> AddressKind {
        match self.address_type {
            ADDR_TYPE_IPV4 => AddressKind::Ipv4,
            ADDR_TYPE_IPV6 => AddressKind::Ipv6,
            _ => AddressKind::Domain,
        }
    }

    /// Encode the reply for this request.
    ///
    /// The reply mirrors the request with the command byte replaced by
    /// `status`; it does not carry a real bound address.
    pub fn reply(&self, status: u8) -> Vec<u8> {
        let mut buf = Vec::with_capacity(6 + self.raw_address.len());
        buf.push(SOCKS5_VERSION);
        buf.push(status);
        buf.push(self.reserved);
        buf.push(self.address_type);
        buf.extend_from_slice(&self.raw_address);
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf
    }
}

/// Decode a wire address into its textual host form.
///
/// IPv4 becomes dotted-quad, IPv6 eight lowercase hex groups without
/// zero compression, domains their bytes as text (after the length byte).
pub fn decode_host(address_type: u8, raw: &[u8]) -> Option<String> {
    match address_type {
        ADDR_TYPE_IPV4 if raw.len() == 4 => {
            Some(format!("{}.{}.{}.{}", raw[0], raw[1], raw[2], raw[3]))
        }
        ADDR_TYPE_IPV6 if raw.len() == 16 => Some(
            raw.chunks_exact(2)
                .map(|g| format!("{:x}", u16::from_be_bytes([g[0], g[1]])))
                .collect::<Vec<_>>()
                .join(":"),
        ),
        ADDR_TYPE_DOMAIN if !raw.is_empty() => {
            Some(String::from_utf8_lossy(&raw[1..]).into_owned())
        }
        _ => None,
    }
}

/// Read the greeting and return the offered methods.
///
/// Fails with a protocol violation if the version is not 5.
pub async fn read_greeting<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let version = stream.read_u8().await?;
    if version != SOCKS5_VERSION {
        return Err(Error::protocol(format!("unsupported version {}", version)));
    }

    let count = stream.read_u8().await?;
    let mut methods = vec![0u8; count as usize];
    stream.read_exact(&mut methods).await?;
    Ok(methods)
}

/// Read a CONNECT request.
///
/// Wrong version, non-CONNECT commands and unknown address types are
/// protocol violations; the caller decides how to react.
pub async fn read_request<S>(stream: &mut S) -> Result<ConnectRequest>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let [version, command, reserved, address_type] = head;

    if version != SOCKS5_VERSION {
        return Err(Error::protocol(format!("unsupported version {}", version)));
    }
    if command != CMD_CONNECT {
        return Err(Error::protocol(format!("unsupported command {}", command)));
    }

    let raw_address = match address_type {
        ADDR_TYPE_IPV4 => {
            let mut addr = vec![0u8; 4];
            stream.read_exact(&mut addr).await?;
            addr
        }
        ADDR_TYPE_IPV6 => {
            let mut addr = vec![0u8; 16];
            stream.read_exact(&mut addr).await?;
            addr
        }
        ADDR_TYPE_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut addr = vec![0u8; 1 + len as usize];
            addr[0] = len;
            stream.read_exact(&mut addr[1..]).await?;
            addr
        }
        other => {
            return Err(Error::protocol(format!("unsupported address type {}", other)));
        }
    };
    let port = stream.read_u16().await?;

    let host = decode_host(address_type, &raw_address)
        .ok_or_else(|| Error::protocol("undecodable address"))?;

    Ok(ConnectRequest {
        reserved,
        address_type,
        raw_address,
        host,
        port,
    })
}

/// Discard client bytes until the client closes.
async fn stall<S>(stream: &mut S)
where
    S: AsyncRead + Unpin,
{
    let _ = tokio::io::copy(stream, &mut tokio::io::sink()).await;
}

/// Established upstream of a session.
enum Upstream {
    Direct(TcpStream),
    Tunnel(TunnelStream),
}

async fn connect<R>(shared: &Shared<R>, decision: &RouteDecision) -> Result<Upstream> {
    match decision.mode {
        RouteMode::Direct => {
            let stream = TcpStream::connect((decision.host.as_str(), decision.port)).await?;
            stream.set_nodelay(true)?;
            Ok(Upstream::Direct(stream))
        }
        RouteMode::Tunnel => {
            let stream = shared.tunnel.open(&decision.host, decision.port).await?;
            Ok(Upstream::Tunnel(stream))
        }
    }
}

/// One client connection.
struct Session<S> {
    stream: S,
    peer: String,
    state: SessionState,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn advance(&mut self, next: SessionState) {
        tracing::trace!("{}: {:?} -> {:?}", self.peer, self.state, next);
        self.state = next;
    }

    async fn run<R: Resolver>(mut self, shared: Arc<Shared<R>>) -> SessionState {
        // === Greeting ===
        let methods = match read_greeting(&mut self.stream).await {
            Ok(methods) => methods,
            Err(e) if e.is_protocol_violation() => {
                tracing::debug!("{}: closing at greeting: {}", self.peer, e);
                // Send FIN now, then consume whatever the client still sends
                // so the final close is not turned into a reset
                let _ = self.stream.shutdown().await;
                stall(&mut self.stream).await;
                return SessionState::Closed;
            }
            Err(e) => {
                tracing::debug!("{}: closing at greeting: {}", self.peer, e);
                return SessionState::Closed;
            }
        };

        if !methods.contains(&AUTH_NONE) {
            tracing::debug!("{}: no acceptable auth method in {:?}", self.peer, methods);
            if self
                .stream
                .write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPT])
                .await
                .is_err()
            {
                return SessionState::Closed;
            }
            // No further request is accepted on this connection
            stall(&mut self.stream).await;
            return self.state;
        }

        if self.stream.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await.is_err() {
            return SessionState::Closed;
        }
        self.advance(SessionState::AwaitingRequest);

        // === CONNECT request ===
        let request = match read_request(&mut self.stream).await {
            Ok(request) => request,
            Err(e) if e.is_protocol_violation() => {
                tracing::debug!("{}: ignoring request: {}", self.peer, e);
                stall(&mut self.stream).await;
                return self.state;
            }
            Err(e) => {
                tracing::debug!("{}: closing at request: {}", self.peer, e);
                return SessionState::Closed;
            }
        };

        let classification = shared
            .classifier
            .classify(&request.host, request.kind())
            .await;
        let decision = route(&classification, request.port, &shared.config);

        let upstream = match connect(&shared, &decision).await {
            Ok(upstream) => upstream,
            Err(e) => {
                if e.is_connect_failure() {
                    tracing::warn!(
                        "{}: {} connect to {}:{} failed: {}",
                        self.peer, decision.mode, decision.host, decision.port, e
                    );
                } else {
                    tracing::error!("{}: {} connect error: {}", self.peer, decision.mode, e);
                }
                let _ = self.stream.write_all(&request.reply(REP_FAILURE)).await;
                let _ = self.stream.shutdown().await;
                self.advance(SessionState::Closed);
                return self.state;
            }
        };
        self.advance(SessionState::Connected);

        if self.stream.write_all(&request.reply(REP_SUCCESS)).await.is_err() {
            return SessionState::Closed;
        }
        tracing::info!(
            "conn: {}:{} {} (edge: {})",
            request.host,
            request.port,
            decision.mode,
            classification.on_edge
        );

        // === Relay ===
        self.advance(SessionState::Relaying);
        let peer = self.peer;
        let stats = match upstream {
            Upstream::Direct(upstream) => bridge(self.stream, upstream).await,
            Upstream::Tunnel(upstream) => bridge(self.stream, upstream).await,
        };
        tracing::debug!(
            "{}: closed {}:{} (sent {} bytes, received {} bytes)",
            peer,
            request.host,
            request.port,
            stats.sent,
            stats.received
        );

        SessionState::Closed
    }
}

/// Serve one SOCKS5 client connection to completion.
///
/// Returns the state the session ended in: `Closed` for sessions that ran
/// to completion or were rejected with a close, otherwise the state it
/// stalled in.
pub(crate) async fn handle_client<S, R>(
    stream: S,
    peer: impl Into<String>,
    shared: Arc<Shared<R>>,
) -> SessionState
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    R: Resolver + 'static,
{
    let session = Session {
        stream,
        peer: peer.into(),
        state: SessionState::AwaitingGreeting,
    };
    session.run(shared).await
}

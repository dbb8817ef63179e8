//! # edgesocks
//!
//! Local SOCKS5 proxy that splits traffic between direct connections and a
//! relay tunnel.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │          SOCKS5 front end (greeting, CONNECT)           │
//! ├─────────────────────────────────────────────────────────┤
//! │  Classifier (allow-list, edge CIDR table, DoH, cache)   │
//! ├─────────────────────────────────────────────────────────┤
//! │  Router (direct vs. tunnel, host/port overrides)        │
//! ├────────────────────────────┬────────────────────────────┤
//! │  Direct TCP                │  TLS WebSocket tunnel      │
//! ├────────────────────────────┴────────────────────────────┤
//! │  Bridge (two independent copy directions)               │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Destinations served by the edge network (by address range, by explicit
//! host name, or by the first DNS A record of a domain) are reached
//! directly. Everything else is carried to a relay inside a WebSocket
//! session whose first frame names the destination.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod classify;
pub mod config;
pub mod error;
pub mod proxy;

pub use config::ProxyConfig;
pub use error::{Error, Result};
pub use proxy::Proxy;

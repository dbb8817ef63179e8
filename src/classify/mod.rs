//! Destination classification.
//!
//! Decides whether a requested destination is served by the edge network:
//!
//! 1. Host names on the explicit allow-list are always on the edge network.
//! 2. Literal IPv4/IPv6 destinations are tested against the [`CidrTable`].
//! 3. Domain names are resolved over DNS-over-HTTPS and the first A record
//!    is tested against the table. Resolution failures classify the
//!    destination as off the edge network so it is tunnelled.
//!
//! Results are cached per requested destination string for the lifetime of
//! the process. Concurrent first lookups for the same host may both query
//! DNS; the cache only guarantees that the map itself stays consistent.

mod cidr;
mod resolver;

pub use cidr::{CidrTable, Ipv4Range, Ipv6Range, EDGE_IPV4_RANGES, EDGE_IPV6_RANGES};
pub use resolver::{DnsJsonAnswer, DnsJsonResponse, DohResolver, Resolver};

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use parking_lot::RwLock;

/// How the client spelled the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    /// Dotted-quad literal
    Ipv4,
    /// Colon-hex literal
    Ipv6,
    /// Host name requiring resolution
    Domain,
}

impl AddressKind {
    /// Infer the kind from a host string.
    pub fn of(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => AddressKind::Ipv4,
            Ok(IpAddr::V6(_)) => AddressKind::Ipv6,
            Err(_) => AddressKind::Domain,
        }
    }
}

/// Outcome of classifying one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Destination is served by the edge network
    pub on_edge: bool,
    /// Address to connect to: the resolved IP for domains that resolved,
    /// the requested destination otherwise
    pub resolved: String,
}

impl Classification {
    /// Create a classification result.
    pub fn new(on_edge: bool, resolved: impl Into<String>) -> Self {
        Self {
            on_edge,
            resolved: resolved.into(),
        }
    }
}

/// Address classifier with allow-list and process-lifetime cache.
pub struct Classifier<R> {
    table: CidrTable,
    allow_list: HashSet<String>,
    cache: RwLock<HashMap<String, Classification>>,
    resolver: R,
}

impl<R: Resolver> Classifier<R> {
    /// Create a classifier over `table`, resolving domains with `resolver`.
    pub fn new(table: CidrTable, resolver: R) -> Self {
        Self {
            table,
            allow_list: HashSet::new(),
            cache: RwLock::new(HashMap::new()),
            resolver,
        }
    }

    /// Add host names that are always classified as on the edge network.
    pub fn with_edge_hostnames<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_list.extend(hosts.into_iter().map(Into::into));
        self
    }

    /// Classify `destination` as requested by the client.
    pub async fn classify(&self, destination: &str, kind: AddressKind) -> Classification {
        if self.allow_list.contains(destination) {
            return Classification::new(true, destination);
        }

        if let Some(hit) = self.cached(destination) {
            tracing::debug!("classification cache hit for {}", destination);
            return hit;
        }

        let result = match kind {
            AddressKind::Ipv4 | AddressKind::Ipv6 => {
                Classification::new(self.table.contains_str(destination), destination)
            }
            AddressKind::Domain => match self.resolver.resolve_ipv4(destination).await {
                Ok(ip) => Classification::new(self.table.contains(ip.into()), ip.to_string()),
                Err(e) => {
                    tracing::warn!("DNS lookup for {} failed: {}", destination, e);
                    Classification::new(false, destination)
                }
            },
        };

        self.cache
            .write()
            .insert(destination.to_string(), result.clone());
        result
    }

    /// Cached classification for `destination`, if any.
    pub fn cached(&self, destination: &str) -> Option<Classification> {
        self.cache.read().get(destination).cloned()
    }

    /// Number of cached destinations.
    pub fn cache_len(&self) -> usize {
        self.cache.read().len()
    }

    /// The CIDR table in use.
    pub fn table(&self) -> &CidrTable {
        &self.table
    }

    /// The resolver used for domain names.
    pub fn resolver(&self) -> &R {
        &self.resolver
    }
}

//! CIDR containment table for the edge network's address space.
//!
//! Built once at startup from fixed range lists. IPv4 ranges are kept as
//! `u32` network/mask pairs, IPv6 ranges as `u128` pairs; containment
//! compares the high `prefix` bits of the candidate with the network.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::{Error, Result};

/// IPv4 ranges announced by the edge network.
pub const EDGE_IPV4_RANGES: &[&str] = &[
    "173.245.48.0/20",
    "103.21.244.0/22",
    "103.22.200.0/22",
    "103.31.4.0/22",
    "141.101.64.0/18",
    "108.162.192.0/18",
    "190.93.240.0/20",
    "188.114.96.0/20",
    "197.234.240.0/22",
    "198.41.128.0/17",
    "162.158.0.0/15",
    "104.16.0.0/13",
    "104.24.0.0/14",
    "172.64.0.0/13",
    "131.0.72.0/22",
];

/// IPv6 ranges announced by the edge network.
pub const EDGE_IPV6_RANGES: &[&str] = &[
    "2400:cb00::/32",
    "2606:4700::/32",
    "2803:f800::/32",
    "2405:b500::/32",
    "2405:8100::/32",
    "2a06:98c0::/29",
    "2c0f:f248::/32",
];

/// An IPv4 network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Range {
    network: u32,
    prefix: u8,
}

impl Ipv4Range {
    /// Create a range; `prefix` must be at most 32.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(Error::config(format!("IPv4 prefix /{} out of range", prefix)));
        }
        Ok(Self {
            network: u32::from(addr),
            prefix,
        })
    }

    /// Netmask with the high `prefix` bits set.
    pub fn mask(&self) -> u32 {
        match self.prefix {
            0 => 0,
            p => u32::MAX << (32 - p),
        }
    }

    /// Prefix length.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Whether `addr` lies inside this range.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = self.mask();
        (u32::from(addr) & mask) == (self.network & mask)
    }
}

impl FromStr for Ipv4Range {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = split_cidr(s)?;
        let addr = addr
            .parse::<Ipv4Addr>()
            .map_err(|e| Error::config(format!("invalid IPv4 network in {}: {}", s, e)))?;
        Self::new(addr, prefix)
    }
}

/// An IPv6 network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Range {
    network: u128,
    prefix: u8,
}

impl Ipv6Range {
    /// Create a range; `prefix` must be at most 128.
    pub fn new(addr: Ipv6Addr, prefix: u8) -> Result<Self> {
        if prefix > 128 {
            return Err(Error::config(format!("IPv6 prefix /{} out of range", prefix)));
        }
        Ok(Self {
            network: u128::from(addr),
            prefix,
        })
    }

    /// Netmask with the high `prefix` bits set.
    pub fn mask(&self) -> u128 {
        match self.prefix {
            0 => 0,
            p => u128::MAX << (128 - p),
        }
    }

    /// Prefix length.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Whether `addr` lies inside this range.
    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        let mask = self.mask();
        (u128::from(addr) & mask) == (self.network & mask)
    }
}

impl FromStr for Ipv6Range {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = split_cidr(s)?;
        let addr = addr
            .parse::<Ipv6Addr>()
            .map_err(|e| Error::config(format!("invalid IPv6 network in {}: {}", s, e)))?;
        Self::new(addr, prefix)
    }
}

fn split_cidr(s: &str) -> Result<(&str, u8)> {
    let (addr, prefix) = s
        .split_once('/')
        .ok_or_else(|| Error::config(format!("missing prefix length in {}", s)))?;
    let prefix = prefix
        .parse::<u8>()
        .map_err(|e| Error::config(format!("invalid prefix length in {}: {}", s, e)))?;
    Ok((addr, prefix))
}

/// Immutable set of IPv4 and IPv6 ranges.
#[derive(Debug, Clone, Default)]
pub struct CidrTable {
    v4: Vec<Ipv4Range>,
    v6: Vec<Ipv6Range>,
}

impl CidrTable {
    /// Build a table from textual CIDR lists.
    ///
    /// Any malformed entry fails the whole build.
    pub fn from_strs(v4: &[&str], v6: &[&str]) -> Result<Self> {
        Ok(Self {
            v4: v4.iter().map(|s| s.parse()).collect::<Result<_>>()?,
            v6: v6.iter().map(|s| s.parse()).collect::<Result<_>>()?,
        })
    }

    /// The edge network's published ranges.
    pub fn edge() -> Result<Self> {
        Self::from_strs(EDGE_IPV4_RANGES, EDGE_IPV6_RANGES)
    }

    /// Whether `addr` falls inside any range of its family.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => self.v4.iter().any(|r| r.contains(v4)),
            IpAddr::V6(v6) => self.v6.iter().any(|r| r.contains(v6)),
        }
    }

    /// Parse `addr` as a literal and test containment; non-literals are outside.
    pub fn contains_str(&self, addr: &str) -> bool {
        addr.parse::<IpAddr>().map_or(false, |ip| self.contains(ip))
    }

    /// Number of IPv4 and IPv6 ranges.
    pub fn len(&self) -> (usize, usize) {
        (self.v4.len(), self.v6.len())
    }

    /// Whether the table holds no ranges at all.
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CidrTable {
        CidrTable::edge().unwrap()
    }

    #[test]
    fn test_edge_table_builds() {
        assert_eq!(table().len(), (EDGE_IPV4_RANGES.len(), EDGE_IPV6_RANGES.len()));
    }

    #[test]
    fn test_ipv4_boundaries() {
        let t = table();
        // 104.16.0.0/13 spans 104.16.0.0 - 104.23.255.255
        assert!(t.contains_str("104.16.0.0"));
        assert!(t.contains_str("104.23.255.255"));
        assert!(!t.contains_str("104.15.255.255"));
        // 104.24.0.0/14 directly follows, so probe past it instead
        assert!(t.contains_str("104.27.255.255"));
        assert!(!t.contains_str("104.28.0.0"));
        assert!(t.contains_str("104.16.1.1"));
    }

    #[test]
    fn test_ipv4_every_range() {
        let t = table();
        for cidr in EDGE_IPV4_RANGES {
            let range: Ipv4Range = cidr.parse().unwrap();
            let first = Ipv4Addr::from(range.network & range.mask());
            let last = Ipv4Addr::from(range.network | !range.mask());
            assert!(t.contains(first.into()), "{} first", cidr);
            assert!(t.contains(last.into()), "{} last", cidr);
            assert!(range.contains(first) && range.contains(last));
            let after = Ipv4Addr::from(u32::from(last).wrapping_add(1));
            assert!(!range.contains(after), "{} after", cidr);
            let before = Ipv4Addr::from(u32::from(first).wrapping_sub(1));
            assert!(!range.contains(before), "{} before", cidr);
        }
    }

    #[test]
    fn test_ipv6_boundaries() {
        let t = table();
        assert!(t.contains_str("2606:4700::"));
        assert!(t.contains_str("2606:4700:ffff:ffff:ffff:ffff:ffff:ffff"));
        assert!(!t.contains_str("2606:4701::"));
        assert!(!t.contains_str("2606:46ff:ffff:ffff:ffff:ffff:ffff:ffff"));
        // /29 keeps the low three bits of the second hextet free
        assert!(t.contains_str("2a06:98c7:1::1"));
        assert!(!t.contains_str("2a06:98c8::"));
        assert!(!t.contains_str("2001:db8::1"));
    }

    #[test]
    fn test_family_and_non_literals() {
        let t = table();
        // IPv4-mapped IPv6 is an IPv6 literal and is not looked up in the v4 list
        assert!(!t.contains_str("::ffff:104.16.1.1"));
        assert!(!t.contains_str("example.com"));
        assert!(!t.contains_str(""));
    }

    #[test]
    fn test_prefix_edges() {
        let all = Ipv4Range::new(Ipv4Addr::new(10, 0, 0, 0), 0).unwrap();
        assert_eq!(all.mask(), 0);
        assert!(all.contains(Ipv4Addr::new(255, 255, 255, 255)));

        let host = Ipv4Range::new(Ipv4Addr::new(10, 0, 0, 1), 32).unwrap();
        assert!(host.contains(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!host.contains(Ipv4Addr::new(10, 0, 0, 2)));

        let host6: Ipv6Range = "2001:db8::1/128".parse().unwrap();
        assert!(host6.contains("2001:db8::1".parse().unwrap()));
        assert!(!host6.contains("2001:db8::2".parse().unwrap()));

        assert!(Ipv4Range::new(Ipv4Addr::UNSPECIFIED, 33).is_err());
        assert!("::/129".parse::<Ipv6Range>().is_err());
    }

    #[test]
    fn test_malformed_table_is_fatal() {
        assert!(CidrTable::from_strs(&["104.16.0.0"], &[]).is_err());
        assert!(CidrTable::from_strs(&["104.16.0/13"], &[]).is_err());
        assert!(CidrTable::from_strs(&[], &["2606:4700::/x"]).is_err());
        assert!(CidrTable::from_strs(&[], &[]).unwrap().is_empty());
    }
}

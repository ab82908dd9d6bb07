//! Route table and destination cache.

use std::collections::HashMap;
use std::fmt;

use crate::iface::IfaceId;
use crate::trie::BitTrie;
use crate::wire::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    NoRoute,
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::NoRoute => write!(f, "no route to destination"),
        }
    }
}

impl std::error::Error for RouteError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub iface: IfaceId,
    /// Gateway; the destination itself when absent (on-link).
    pub next_hop: Option<IpAddr>,
    /// Preferred source for packets resolved via this route.
    pub source_ip: Option<IpAddr>,
}

/// Longest-prefix-match routing with per-destination memoization. Mutating
/// the table flushes the cache so stale resolutions cannot survive.
#[derive(Default)]
pub struct Router {
    table: BitTrie<Route>,
    dst_cache: HashMap<IpAddr, Route>,
}

impl Router {
    pub fn new() -> Self {
        Router::default()
    }

    /// Install a route. `prefix_len` is in address-family bits; embedded
    /// IPv4 prefixes are normalized internally.
    pub fn add_route(
        &mut self,
        prefix: IpAddr,
        prefix_len: u8,
        iface: IfaceId,
        next_hop: Option<IpAddr>,
        source_ip: Option<IpAddr>,
    ) {
        let len = prefix.normalized_prefix_len(prefix_len);
        self.table.insert(prefix, len, Route { iface, next_hop, source_ip });
        self.dst_cache.clear();
    }

    pub fn remove_route(&mut self, prefix: IpAddr, prefix_len: u8) -> Option<Route> {
        let len = prefix.normalized_prefix_len(prefix_len);
        let removed = self.table.remove(&prefix, len);
        if removed.is_some() {
            self.dst_cache.clear();
        }
        removed
    }

    /// The zero-length prefix, if installed.
    pub fn default_route(&self) -> Option<&Route> {
        self.table.get(&IpAddr::UNSPECIFIED, 0)
    }

    /// Resolve `dst` through the table, memoizing the choice.
    pub fn lookup(&mut self, dst: IpAddr) -> Result<Route, RouteError> {
        if let Some(rt) = self.dst_cache.get(&dst) {
            return Ok(*rt);
        }
        let (_, _, rt) = self.table.match_longest(&dst, 128).ok_or(RouteError::NoRoute)?;
        let rt = *rt;
        self.dst_cache.insert(dst, rt);
        Ok(rt)
    }

    pub fn cached_destinations(&self) -> usize {
        self.dst_cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn next_hop_and_source_seed() {
        let mut r = Router::new();
        r.add_route(ip("10.0.1.0"), 24, 1, None, None);
        r.add_route(ip("0.0.0.0"), 0, 0, Some(ip("10.0.0.1")), Some(ip("10.0.0.2")));

        let rt = r.lookup(ip("10.0.1.5")).unwrap();
        assert_eq!(rt.iface, 1);
        assert_eq!(rt.next_hop, None);

        let rt = r.lookup(ip("192.0.2.1")).unwrap();
        assert_eq!(rt.iface, 0);
        assert_eq!(rt.next_hop, Some(ip("10.0.0.1")));
        assert_eq!(rt.source_ip, Some(ip("10.0.0.2")));
    }

    #[test]
    fn no_route_without_default() {
        let mut r = Router::new();
        r.add_route(ip("10.0.1.0"), 24, 1, None, None);
        assert_eq!(r.lookup(ip("192.0.2.1")).unwrap_err(), RouteError::NoRoute);
    }

    #[test]
    fn cache_is_flushed_on_table_change() {
        let mut r = Router::new();
        r.add_route(ip("10.0.0.0"), 8, 0, None, None);
        assert_eq!(r.lookup(ip("10.1.2.3")).unwrap().iface, 0);
        assert_eq!(r.cached_destinations(), 1);

        r.add_route(ip("10.1.0.0"), 16, 1, None, None);
        assert_eq!(r.cached_destinations(), 0);
        assert_eq!(r.lookup(ip("10.1.2.3")).unwrap().iface, 1);

        r.remove_route(ip("10.1.0.0"), 16);
        assert_eq!(r.lookup(ip("10.1.2.3")).unwrap().iface, 0);
    }

    #[test]
    fn v6_default_route_at_root() {
        let mut r = Router::new();
        r.add_route(ip("::"), 0, 2, Some(ip("fe80::1")), None);
        assert!(r.default_route().is_some());
        let rt = r.lookup(ip("2001:db8::5")).unwrap();
        assert_eq!(rt.iface, 2);
        assert_eq!(rt.next_hop, Some(ip("fe80::1")));
    }
}

//! Neighbor resolution cache.
//!
//! One cache per interface, mapping next-hop IPs to link addresses through
//! the INCOMPLETE / REACHABLE / STALE / DELAY / PROBE machine. Packets for
//! unresolved neighbors are queued on the entry. The cache never sends
//! anything itself: solicitations and unreachability are returned as
//! [`NeighborAction`]s for the caller to execute, which lets the same
//! machine serve ARP and NDP.
//!
//! The cache is generic over the queued packet type to keep the state
//! machine testable in isolation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::wire::{HwAddr, IpAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborState {
    Incomplete,
    Reachable,
    Stale,
    Delay,
    Probe,
}

/// Timings and retry budget, in the shape of the stack config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NeighborConfig {
    pub reachable_ms: u64,
    pub delay_ms: u64,
    pub retrans_ms: u64,
    pub max_retries: u8,
}

impl Default for NeighborConfig {
    fn default() -> Self {
        NeighborConfig { reachable_ms: 5000, delay_ms: 3000, retrans_ms: 1000, max_retries: 3 }
    }
}

impl NeighborConfig {
    fn reachable(&self) -> Duration {
        Duration::from_millis(self.reachable_ms)
    }

    fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    fn retrans(&self) -> Duration {
        Duration::from_millis(self.retrans_ms)
    }
}

/// What a deadline means when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    None,
    Retrans,
    Reachable,
    Delay,
}

pub struct Neighbor<P> {
    pub haddr: HwAddr,
    pub state: NeighborState,
    pub is_router: bool,
    queue: Vec<P>,
    deadline: Option<Instant>,
    pending: Pending,
    retries: u8,
    /// Source hint remembered from the packet that started resolution,
    /// reused for retransmitted solicitations.
    src_hint: Option<IpAddr>,
}

impl<P> Neighbor<P> {
    fn new() -> Self {
        Neighbor {
            haddr: HwAddr::ZERO,
            state: NeighborState::Incomplete,
            is_router: false,
            queue: Vec::new(),
            deadline: None,
            pending: Pending::None,
            retries: 0,
            src_hint: None,
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

/// Flags carried by a received advertisement (or solicitation, with
/// `is_advert` false).
#[derive(Debug, Clone, Copy, Default)]
pub struct AdvertFlags {
    pub is_advert: bool,
    pub router: bool,
    pub solicited: bool,
    pub override_addr: bool,
}

/// Side effects for the caller to perform.
pub enum NeighborAction<P> {
    /// Send an ARP request or Neighbor Solicitation for `target`.
    Solicit {
        target: IpAddr,
        src_hint: Option<IpAddr>,
        haddr_hint: Option<HwAddr>,
    },
    /// Resolution gave up; the queued packets are handed back.
    Unreachable { target: IpAddr, queued: Vec<P> },
}

pub struct NeighborCache<P> {
    entries: HashMap<IpAddr, Neighbor<P>>,
    pub config: NeighborConfig,
}

impl<P> Default for NeighborCache<P> {
    fn default() -> Self {
        NeighborCache::new(NeighborConfig::default())
    }
}

impl<P> NeighborCache<P> {
    pub fn new(config: NeighborConfig) -> Self {
        NeighborCache { entries: HashMap::new(), config }
    }

    pub fn get(&self, addr: &IpAddr) -> Option<&Neighbor<P>> {
        self.entries.get(addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Attach the link address for `target` to the caller's packet, or queue
    /// it and start solicitation. Returns the packet when it may be sent.
    pub fn resolve(
        &mut self,
        target: IpAddr,
        src_hint: Option<IpAddr>,
        packet: P,
        now: Instant,
        actions: &mut Vec<NeighborAction<P>>,
    ) -> Option<(P, HwAddr)> {
        let config = self.config.clone();
        let entry = self.entries.entry(target).or_insert_with(Neighbor::new);
        match entry.state {
            NeighborState::Incomplete => {
                entry.src_hint = src_hint;
                entry.retries = 0;
                entry.pending = Pending::Retrans;
                entry.deadline = Some(now + config.retrans());
                entry.queue.push(packet);
                actions.push(NeighborAction::Solicit { target, src_hint, haddr_hint: None });
                None
            }
            NeighborState::Stale => {
                entry.state = NeighborState::Delay;
                entry.pending = Pending::Delay;
                entry.deadline = Some(now + config.delay());
                entry.src_hint = src_hint;
                Some((packet, entry.haddr))
            }
            NeighborState::Delay | NeighborState::Probe | NeighborState::Reachable => {
                Some((packet, entry.haddr))
            }
        }
    }

    /// Upper-layer evidence that `target` is alive.
    pub fn confirm_reachable(&mut self, target: &IpAddr, now: Instant) {
        let reachable = self.config.reachable();
        if let Some(entry) = self.entries.get_mut(target) {
            Self::enter_reachable(entry, reachable, now);
        }
    }

    fn enter_reachable(entry: &mut Neighbor<P>, reachable: Duration, now: Instant) {
        entry.state = NeighborState::Reachable;
        entry.pending = Pending::Reachable;
        entry.deadline = Some(now + reachable);
    }

    /// Apply a received advertisement (ARP reply, Neighbor Advertisement) or
    /// the address gleaned from a solicitation. Returns queued packets that
    /// became sendable, paired with the resolved link address.
    pub fn process_advert(
        &mut self,
        target: IpAddr,
        haddr: Option<HwAddr>,
        flags: AdvertFlags,
        now: Instant,
    ) -> Option<(Vec<P>, HwAddr)> {
        let reachable = self.config.reachable();
        if !flags.is_advert {
            // Gleaned from a solicitation: create or refresh a STALE mapping.
            let haddr = haddr?;
            let entry = self.entries.entry(target).or_insert_with(Neighbor::new);
            if entry.state == NeighborState::Incomplete || entry.haddr != haddr {
                entry.haddr = haddr;
                entry.state = NeighborState::Stale;
                entry.pending = Pending::None;
                entry.deadline = None;
                let queue = std::mem::take(&mut entry.queue);
                if !queue.is_empty() {
                    return Some((queue, haddr));
                }
            }
            return None;
        }

        let entry = self.entries.get_mut(&target)?;
        if entry.state == NeighborState::Incomplete {
            entry.is_router = flags.router;
            let haddr = haddr?;
            entry.haddr = haddr;
            if flags.solicited {
                Self::enter_reachable(entry, reachable, now);
            } else {
                entry.state = NeighborState::Stale;
                entry.pending = Pending::None;
                entry.deadline = None;
            }
            return Some((std::mem::take(&mut entry.queue), haddr));
        }

        let differs = haddr.map(|h| h != entry.haddr).unwrap_or(false);
        if !flags.override_addr && differs {
            // conflicting unauthoritative advertisement
            if entry.state == NeighborState::Reachable {
                entry.state = NeighborState::Stale;
                entry.pending = Pending::None;
                entry.deadline = None;
            }
        } else {
            if let Some(h) = haddr.filter(|_| differs) {
                entry.haddr = h;
                entry.state = NeighborState::Stale;
                entry.pending = Pending::None;
                entry.deadline = None;
            }
            if flags.solicited {
                Self::enter_reachable(entry, reachable, now);
            }
            entry.is_router = flags.router;
        }
        None
    }

    /// Drive per-entry deadlines. Expired REACHABLE entries go STALE, DELAY
    /// entries start probing, and exhausted probes remove the entry and
    /// report it unreachable.
    pub fn poll(&mut self, now: Instant, actions: &mut Vec<NeighborAction<P>>) {
        let config = self.config.clone();
        let due: Vec<IpAddr> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline.map(|d| d <= now).unwrap_or(false))
            .map(|(a, _)| *a)
            .collect();

        for target in due {
            let Some(entry) = self.entries.get_mut(&target) else { continue };
            match entry.pending {
                Pending::None => {}
                Pending::Reachable => {
                    entry.state = NeighborState::Stale;
                    entry.pending = Pending::None;
                    entry.deadline = None;
                }
                Pending::Delay => {
                    entry.state = NeighborState::Probe;
                    entry.retries = 0;
                    entry.pending = Pending::Retrans;
                    entry.deadline = Some(now + config.retrans());
                    actions.push(NeighborAction::Solicit {
                        target,
                        src_hint: entry.src_hint,
                        haddr_hint: Some(entry.haddr),
                    });
                }
                Pending::Retrans => {
                    entry.retries += 1;
                    if entry.retries >= config.max_retries {
                        let Some(entry) = self.entries.remove(&target) else { continue };
                        actions.push(NeighborAction::Unreachable { target, queued: entry.queue });
                    } else if entry.state != NeighborState::Reachable {
                        let haddr_hint = match entry.state {
                            NeighborState::Incomplete => None,
                            _ => Some(entry.haddr),
                        };
                        entry.deadline = Some(now + config.retrans());
                        actions.push(NeighborAction::Solicit {
                            target,
                            src_hint: entry.src_hint,
                            haddr_hint,
                        });
                    } else {
                        entry.pending = Pending::None;
                        entry.deadline = None;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    const MAC_A: HwAddr = HwAddr([2, 0, 0, 0, 0, 0xaa]);
    const MAC_B: HwAddr = HwAddr([2, 0, 0, 0, 0, 0xbb]);

    fn advert(solicited: bool, override_addr: bool) -> AdvertFlags {
        AdvertFlags { is_advert: true, router: false, solicited, override_addr }
    }

    fn cache() -> (NeighborCache<u32>, Instant) {
        (NeighborCache::default(), Instant::now())
    }

    #[test]
    fn first_resolve_queues_and_solicits() {
        let (mut c, t0) = cache();
        let mut actions = Vec::new();
        let out = c.resolve(ip("10.0.0.1"), Some(ip("10.0.0.2")), 1, t0, &mut actions);
        assert!(out.is_none());
        assert_eq!(c.get(&ip("10.0.0.1")).unwrap().state, NeighborState::Incomplete);
        assert_eq!(c.get(&ip("10.0.0.1")).unwrap().queued(), 1);
        assert!(matches!(actions[..], [NeighborAction::Solicit { .. }]));
    }

    #[test]
    fn solicited_advert_resolves_and_drains_in_order() {
        let (mut c, t0) = cache();
        let mut actions = Vec::new();
        c.resolve(ip("10.0.0.1"), None, 1, t0, &mut actions);
        let (queue, haddr) = c
            .process_advert(ip("10.0.0.1"), Some(MAC_A), advert(true, false), t0)
            .unwrap();
        assert_eq!(queue, vec![1]);
        assert_eq!(haddr, MAC_A);
        assert_eq!(c.get(&ip("10.0.0.1")).unwrap().state, NeighborState::Reachable);
    }

    #[test]
    fn unsolicited_advert_resolves_to_stale() {
        let (mut c, t0) = cache();
        let mut actions = Vec::new();
        c.resolve(ip("10.0.0.1"), None, 7, t0, &mut actions);
        let (queue, _) = c
            .process_advert(ip("10.0.0.1"), Some(MAC_A), advert(false, false), t0)
            .unwrap();
        assert_eq!(queue, vec![7]);
        assert_eq!(c.get(&ip("10.0.0.1")).unwrap().state, NeighborState::Stale);
    }

    #[test]
    fn advert_without_address_keeps_incomplete_and_records_router() {
        let (mut c, t0) = cache();
        let mut actions = Vec::new();
        c.resolve(ip("10.0.0.1"), None, 7, t0, &mut actions);
        let flags = AdvertFlags { is_advert: true, router: true, solicited: true, override_addr: false };
        assert!(c.process_advert(ip("10.0.0.1"), None, flags, t0).is_none());
        let e = c.get(&ip("10.0.0.1")).unwrap();
        assert_eq!(e.state, NeighborState::Incomplete);
        assert!(e.is_router);
    }

    #[test]
    fn advert_for_unknown_target_is_ignored() {
        let (mut c, t0) = cache();
        assert!(c
            .process_advert(ip("10.0.0.9"), Some(MAC_A), advert(true, true), t0)
            .is_none());
        assert!(c.is_empty());
    }

    #[test]
    fn reachable_expires_to_stale_then_delay_then_probe() {
        let (mut c, t0) = cache();
        let mut actions = Vec::new();
        c.resolve(ip("10.0.0.1"), None, 1, t0, &mut actions);
        c.process_advert(ip("10.0.0.1"), Some(MAC_A), advert(true, false), t0);

        // reachable timer expires
        let t1 = t0 + Duration::from_millis(c.config.reachable_ms + 1);
        actions.clear();
        c.poll(t1, &mut actions);
        assert!(actions.is_empty());
        assert_eq!(c.get(&ip("10.0.0.1")).unwrap().state, NeighborState::Stale);

        // next outbound packet enters DELAY and is sent with the stale address
        let (pkt, haddr) = c.resolve(ip("10.0.0.1"), None, 2, t1, &mut actions).unwrap();
        assert_eq!((pkt, haddr), (2, MAC_A));
        assert_eq!(c.get(&ip("10.0.0.1")).unwrap().state, NeighborState::Delay);

        // delay timer expires into PROBE with a solicitation
        let t2 = t1 + Duration::from_millis(c.config.delay_ms + 1);
        c.poll(t2, &mut actions);
        assert_eq!(c.get(&ip("10.0.0.1")).unwrap().state, NeighborState::Probe);
        assert!(matches!(
            actions[..],
            [NeighborAction::Solicit { haddr_hint: Some(MAC_A), .. }]
        ));
    }

    #[test]
    fn probe_exhaustion_removes_entry() {
        let (mut c, t0) = cache();
        let mut actions = Vec::new();
        c.resolve(ip("10.0.0.1"), None, 1, t0, &mut actions);

        let mut now = t0;
        for _ in 0..c.config.max_retries {
            now += Duration::from_millis(c.config.retrans_ms + 1);
            c.poll(now, &mut actions);
        }
        let unreachable = actions
            .iter()
            .find_map(|a| match a {
                NeighborAction::Unreachable { queued, .. } => Some(queued.clone()),
                _ => None,
            })
            .expect("unreachable action");
        assert_eq!(unreachable, vec![1]);
        assert!(c.get(&ip("10.0.0.1")).is_none());
    }

    #[test]
    fn override_matrix() {
        let (mut c, t0) = cache();
        let mut actions = Vec::new();
        c.resolve(ip("10.0.0.1"), None, 1, t0, &mut actions);
        c.process_advert(ip("10.0.0.1"), Some(MAC_A), advert(true, false), t0);
        assert_eq!(c.get(&ip("10.0.0.1")).unwrap().state, NeighborState::Reachable);

        // reachable + unauthoritative different address: STALE, keep old
        c.process_advert(ip("10.0.0.1"), Some(MAC_B), advert(false, false), t0);
        let e = c.get(&ip("10.0.0.1")).unwrap();
        assert_eq!(e.state, NeighborState::Stale);
        assert_eq!(e.haddr, MAC_A);

        // stale + unauthoritative different address: unchanged
        c.process_advert(ip("10.0.0.1"), Some(MAC_B), advert(false, false), t0);
        assert_eq!(c.get(&ip("10.0.0.1")).unwrap().haddr, MAC_A);

        // override with a new address: accept it, STALE
        c.process_advert(ip("10.0.0.1"), Some(MAC_B), advert(false, true), t0);
        let e = c.get(&ip("10.0.0.1")).unwrap();
        assert_eq!(e.haddr, MAC_B);
        assert_eq!(e.state, NeighborState::Stale);

        // solicited override: REACHABLE
        c.process_advert(ip("10.0.0.1"), Some(MAC_B), advert(true, true), t0);
        assert_eq!(c.get(&ip("10.0.0.1")).unwrap().state, NeighborState::Reachable);

        // unsolicited, same address, no override: unchanged
        c.process_advert(ip("10.0.0.1"), Some(MAC_B), advert(false, false), t0);
        assert_eq!(c.get(&ip("10.0.0.1")).unwrap().state, NeighborState::Reachable);
    }

    #[test]
    fn upper_layer_confirmation_restores_reachable() {
        let (mut c, t0) = cache();
        let mut actions = Vec::new();
        c.resolve(ip("10.0.0.1"), None, 1, t0, &mut actions);
        c.process_advert(ip("10.0.0.1"), Some(MAC_A), advert(false, false), t0);
        assert_eq!(c.get(&ip("10.0.0.1")).unwrap().state, NeighborState::Stale);
        c.confirm_reachable(&ip("10.0.0.1"), t0);
        assert_eq!(c.get(&ip("10.0.0.1")).unwrap().state, NeighborState::Reachable);
    }
}

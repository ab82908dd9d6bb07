//! The IP layer: local address table, source selection, multicast
//! membership, reassembly state and the socket table, orchestrated around
//! the [`Stack`](crate::stack::Stack).

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::Rng;

use crate::config::StackConfig;
use crate::iface::IfaceId;
use crate::packet::Packet;
use crate::route::Router;
use crate::sock::{SocketTable, UdpSocket};
use crate::stack::Stack;
use crate::timer::Timer;
use crate::trie::BitTrie;
use crate::wire::IpAddr;

mod group;
mod input;
mod ndp;
mod output;
mod reass;

pub use reass::ReassKey;

/// State of one locally assigned address.
pub struct AddrState {
    /// Normalized prefix length (+96 for embedded v4).
    pub prefix_len: u8,
    pub iface: IfaceId,
    /// Set while duplicate address detection runs; tentative addresses are
    /// not used as sources and are removed on a duplicate hit.
    pub tentative: bool,
    pub(crate) dad_timer: Option<Timer<Stack>>,
}

pub(crate) struct Reassembly {
    pub packet: Packet,
    #[allow(dead_code)] // held for its cancel-on-drop effect
    pub timer: Timer<Stack>,
}

/// IP-layer state owned by the stack.
pub struct IpStack {
    pub router: Router,
    pub config: StackConfig,
    pub(crate) addrs: BitTrie<AddrState>,
    pub(crate) reass: HashMap<ReassKey, Reassembly>,
    pub(crate) mcast_groups: HashSet<(IfaceId, IpAddr)>,
    pub(crate) mcast_pending: HashMap<(IfaceId, IpAddr), Timer<Stack>>,
    pub(crate) socks: SocketTable,
    pub(crate) rng: StdRng,
}

impl IpStack {
    pub(crate) fn new(config: StackConfig, rng: StdRng) -> Self {
        IpStack {
            router: Router::new(),
            socks: SocketTable::new(config.port_min, config.port_max),
            config,
            addrs: BitTrie::new(),
            reass: HashMap::new(),
            mcast_groups: HashSet::new(),
            mcast_pending: HashMap::new(),
            rng,
        }
    }

    /// Fresh random fragment identification. The low 16 bits are never
    /// zero, so fresh v4 headers (ident 0) stay distinguishable from
    /// assigned ones in either family.
    pub(crate) fn next_ident(&mut self) -> u32 {
        loop {
            let ident: u32 = self.rng.gen();
            if ident as u16 != 0 {
                return ident;
            }
        }
    }

    /// State of a locally assigned address, by exact match.
    pub fn addr_state(&self, addr: &IpAddr) -> Option<&AddrState> {
        self.addrs.get(addr, 128)
    }

    pub fn is_local(&self, addr: &IpAddr) -> bool {
        self.addrs.contains(addr, 128)
    }

    /// Directed broadcast under any assigned prefix: the destination shares
    /// an entry's prefix and every host bit is one.
    pub fn is_directed_broadcast(&self, dst: &IpAddr) -> bool {
        if !dst.is_v4() {
            return false;
        }
        self.addrs.iter().any(|(addr, _, state)| {
            addr.common_prefix_len(dst) >= state.prefix_len
                && dst.host_bits_all_ones(state.prefix_len)
        })
    }

    /// True when `(iface, group)` has been joined.
    pub fn is_member(&self, iface: IfaceId, group: &IpAddr) -> bool {
        self.mcast_groups.contains(&(iface, *group))
    }

    pub(crate) fn socks_and_rng(&mut self) -> (&mut SocketTable, &mut StdRng) {
        (&mut self.socks, &mut self.rng)
    }
}

impl Stack {
    /// Assign an address to an interface. IPv6 addresses start out
    /// tentative: a duplicate-address probe goes out immediately and the
    /// address becomes usable when the DAD timer expires unanswered.
    pub fn assign_ip(&mut self, iface: IfaceId, addr: IpAddr, prefix_len: u8) {
        let norm = addr.normalized_prefix_len(prefix_len);
        let v6 = !addr.is_v4();
        log::debug!("assign {}/{} on iface {}", addr, prefix_len, iface);
        self.ip.addrs.insert(
            addr,
            128,
            AddrState { prefix_len: norm, iface, tentative: v6, dad_timer: None },
        );
        // the covered prefix becomes an on-link route
        self.ip
            .router
            .add_route(addr.masked(norm), prefix_len, iface, None, Some(addr));
        if v6 {
            self.send_neighbor_solicit(iface, addr, IpAddr::UNSPECIFIED, None);
            let timer = self.timers().create_at(
                self.now(),
                self.ip.config.dad_timeout(),
                move |stack: &mut Stack| stack.dad_complete(iface, addr),
            );
            if let Some(state) = self.ip.addrs.get_mut(&addr, 128) {
                state.dad_timer = Some(timer);
            }
        }
    }

    /// Drop an assigned address, cancelling any DAD in flight. The on-link
    /// route goes with it unless another address still covers the prefix.
    pub fn remove_ip(&mut self, addr: IpAddr) -> bool {
        let Some(state) = self.ip.addrs.remove(&addr, 128) else {
            return false;
        };
        let prefix = addr.masked(state.prefix_len);
        let still_covered = self.ip.addrs.iter().any(|(a, _, s)| {
            s.prefix_len == state.prefix_len && a.masked(s.prefix_len) == prefix
        });
        if !still_covered {
            let family_len = if addr.is_v4() { state.prefix_len - 96 } else { state.prefix_len };
            self.ip.router.remove_route(prefix, family_len);
        }
        true
    }

    pub(crate) fn dad_complete(&mut self, iface: IfaceId, addr: IpAddr) {
        let Some(state) = self.ip.addrs.get_mut(&addr, 128) else {
            return;
        };
        state.tentative = false;
        state.dad_timer = None;
        log::debug!("DAD complete for {}", addr);
        self.mcast_join(iface, IpAddr::ALL_NODES);
        self.mcast_join(iface, addr.solicited_node());
    }

    /// A fresh, unbound UDP socket.
    pub fn udp_socket(&mut self) -> UdpSocket {
        UdpSocket::new()
    }

    /// Pick a source address for `dst_hint`, preferring (in order) the
    /// destination itself, addresses on the chosen interface, and the
    /// longest common prefix with the destination. Tentative addresses
    /// never win.
    pub fn select_src_addr(
        &mut self,
        dst_hint: Option<IpAddr>,
        iface: Option<IfaceId>,
    ) -> Option<IpAddr> {
        let iface = iface.or_else(|| {
            dst_hint
                .and_then(|d| self.ip.router.lookup(d).ok().map(|r| r.iface))
                .or_else(|| self.ip.router.default_route().map(|r| r.iface))
        });

        let mut best: Option<(IpAddr, (bool, bool, u8))> = None;
        for (addr, _, state) in self.ip.addrs.iter() {
            if state.tentative {
                continue;
            }
            let score = (
                dst_hint.map(|d| d == addr).unwrap_or(false),
                iface.map(|i| state.iface == i).unwrap_or(false),
                dst_hint.map(|d| addr.common_prefix_len(&d)).unwrap_or(0),
            );
            if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                best = Some((addr, score));
            }
        }
        best.map(|(a, _)| a)
    }
}

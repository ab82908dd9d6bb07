//! Multicast group membership: IGMPv2 for IPv4, MLD for IPv6.
//!
//! Pending query responses are keyed by `(interface, group)`, so a
//! re-entrant query can never double-fire a timer.

use std::time::Duration;

use rand::Rng;

use crate::iface::IfaceId;
use crate::packet::Packet;
use crate::stack::Stack;
use crate::wire::checksum::checksum_buf;
use crate::wire::icmp::IcmpBuild;
use crate::wire::igmp::{IgmpHdr, IgmpType};
use crate::wire::{IpAddr, IpProto, IpVersion};

impl Stack {
    /// Join `group` on `iface` and announce the membership. The always-on
    /// groups (all-systems, all-nodes) are tracked but never reported.
    pub fn mcast_join(&mut self, iface: IfaceId, group: IpAddr) {
        if !self.ip.mcast_groups.insert((iface, group)) {
            return;
        }
        log::debug!("join {} on iface {}", group, iface);
        if Self::report_suppressed(&group) {
            return;
        }
        if group.is_v4() {
            self.igmp_send_report(IgmpType::V2MembershipReport, iface, group);
        } else {
            self.mld_send_report(iface, group, false);
        }
    }

    /// Leave `group` and tell the routers.
    pub fn mcast_leave(&mut self, iface: IfaceId, group: IpAddr) {
        if !self.ip.mcast_groups.remove(&(iface, group)) {
            return;
        }
        self.ip.mcast_pending.remove(&(iface, group));
        log::debug!("leave {} on iface {}", group, iface);
        if Self::report_suppressed(&group) {
            return;
        }
        if group.is_v4() {
            self.igmp_send_report(IgmpType::LeaveGroup, iface, group);
        } else {
            self.mld_send_report(iface, group, true);
        }
    }

    fn report_suppressed(group: &IpAddr) -> bool {
        *group == IpAddr::ALL_NODES || *group == IpAddr::all_systems_v4()
    }

    pub(crate) fn igmp_deliver(&mut self, mut packet: Packet) {
        if packet.read_igmp().is_err() {
            return;
        }

        // IGMP checksums the bare message
        let hdr_size = IgmpHdr::<&[u8]>::SIZE;
        packet.buf_mut().unmask(hdr_size);
        let ok = checksum_buf(packet.buf(), 0) == 0;
        packet.buf_mut().mask(hdr_size);
        if !ok {
            return;
        }

        let (typ, max_resp_ms, group) = {
            let igmp = packet.igmp().expect("igmp header recorded");
            (igmp.typ(), igmp.max_resp_ms(), igmp.group())
        };
        if !packet.dst_addr().is_multicast() {
            return;
        }
        if typ == IgmpType::MembershipQuery {
            self.group_query_input(&packet, group, max_resp_ms);
        }
    }

    /// Common query handling for IGMP and MLD: schedule a jittered report
    /// for our groups the query covers.
    pub(crate) fn group_query_input(&mut self, packet: &Packet, group: IpAddr, max_resp_ms: u16) {
        let Some(iface) = packet.iface else { return };
        let dst = packet.dst_addr();
        let v6 = !dst.is_v4();

        if group.is_unspecified() {
            // general query
            let all = if v6 { IpAddr::ALL_NODES } else { IpAddr::all_systems_v4() };
            if dst != all {
                return;
            }
            let groups: Vec<IpAddr> = self
                .ip
                .mcast_groups
                .iter()
                .filter(|(i, g)| *i == iface && g.is_v4() != v6 && !Self::report_suppressed(g))
                .map(|(_, g)| *g)
                .collect();
            for g in groups {
                self.schedule_group_report(iface, g, max_resp_ms);
            }
        } else if self.ip.is_member(iface, &group) {
            self.schedule_group_report(iface, group, max_resp_ms);
        }
    }

    fn schedule_group_report(&mut self, iface: IfaceId, group: IpAddr, max_resp_ms: u16) {
        let key = (iface, group);
        if self.ip.mcast_pending.contains_key(&key) {
            // an earlier query already armed the timer; let it fire
            return;
        }
        let delay = Duration::from_millis(self.ip.rng.gen_range(0..=u64::from(max_resp_ms)));
        let timer = self.timers().create_at(self.now(), delay, move |stack: &mut Stack| {
            stack.group_report_fire(iface, group)
        });
        self.ip.mcast_pending.insert(key, timer);
    }

    pub(crate) fn group_report_fire(&mut self, iface: IfaceId, group: IpAddr) {
        if self.ip.mcast_pending.remove(&(iface, group)).is_none() {
            return;
        }
        if self.ip.is_member(iface, &group) {
            self.send_group_report(iface, group);
        }
    }

    fn send_group_report(&mut self, iface: IfaceId, group: IpAddr) {
        if group.is_v4() {
            self.igmp_send_report(IgmpType::V2MembershipReport, iface, group);
        } else {
            self.mld_send_report(iface, group, false);
        }
    }

    /// Emit an IGMP message: Router Alert option, TTL 1, destination per
    /// message type.
    fn igmp_send_report(&mut self, typ: IgmpType, iface: IfaceId, group: IpAddr) {
        let mut p = Packet::new();
        p.reserve_headers();
        p.iface = Some(iface);
        if p.construct_igmp().is_err() {
            return;
        }
        {
            let mut igmp = p.igmp_mut().expect("igmp header recorded");
            igmp.set_typ(typ);
            igmp.set_group(group);
        }
        p.buf_mut().unmask(IgmpHdr::<&[u8]>::SIZE);
        let sum = checksum_buf(p.buf(), 0);
        p.igmp_mut().expect("igmp header recorded").set_checksum(sum);

        if p.construct_ip(IpVersion::V4, IpProto::Igmp, true).is_err() {
            return;
        }
        let dst = match typ {
            IgmpType::LeaveGroup => IpAddr::all_routers_v4(),
            _ => group,
        };
        p.set_dst_addr(dst);
        if let Some(src) = self.select_src_addr(Some(group), Some(iface)) {
            p.set_src_addr(src);
            p.force_source_ip = true;
        }
        p.set_ttl(1);
        if let Err(e) = self.output(p) {
            log::debug!("IGMP report failed: {}", e);
        }
    }

    /// Emit an MLD Report or Done: hop-by-hop Router Alert, hop limit 1,
    /// link-local source when one is usable, else unspecified.
    fn mld_send_report(&mut self, iface: IfaceId, group: IpAddr, done: bool) {
        let build = if done { IcmpBuild::MldDone { group } } else { IcmpBuild::MldReport { group } };
        let dst = if done { IpAddr::ALL_ROUTERS_V6 } else { group };

        let src = self
            .ip
            .addrs
            .iter()
            .find(|(a, _, s)| s.iface == iface && !s.tentative && a.is_link_local())
            .map(|(a, _, _)| a)
            .unwrap_or(IpAddr::UNSPECIFIED);

        let mut p = Packet::new();
        p.reserve_headers();
        p.iface = Some(iface);
        if p.construct_icmp(IpVersion::V6, &build).is_err() {
            return;
        }
        let icmp_size = p.icmp_size();
        p.buf_mut().unmask(icmp_size);
        if p.construct_ip(IpVersion::V6, IpProto::Icmpv6, true).is_err() {
            return;
        }
        p.set_dst_addr(dst);
        p.set_src_addr(src);
        p.force_source_ip = true;
        p.set_ttl(1);
        if let Err(e) = self.output(p) {
            log::debug!("MLD report failed: {}", e);
        }
    }
}

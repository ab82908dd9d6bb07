//! Neighbor Discovery: solicitations, advertisements, router discovery,
//! SLAAC and the duplicate-address rules.
//!
//! All NDP packets travel with hop limit 255; a Router Advertisement that
//! arrives with any other hop limit is ignored.

use crate::iface::IfaceId;
use crate::ip::input::SlaacPrefix;
use crate::neigh::AdvertFlags;
use crate::packet::Packet;
use crate::stack::Stack;
use crate::wire::icmp::IcmpBuild;
use crate::wire::{HwAddr, IpAddr};

impl Stack {
    /// Send a Neighbor Solicitation for `target`. With a known link address
    /// (reachability probe) the solicitation is unicast; otherwise it goes
    /// to the solicited-node group. An unspecified source (DAD) carries no
    /// source link-layer option.
    pub(crate) fn send_neighbor_solicit(
        &mut self,
        iface: IfaceId,
        target: IpAddr,
        src: IpAddr,
        haddr_hint: Option<HwAddr>,
    ) {
        let source_ll = if src.is_unspecified() { None } else { Some(self.iface(iface).addr()) };
        let dst = if haddr_hint.is_some() { target } else { target.solicited_node() };

        let build = IcmpBuild::NeighborSolicit { target, source_ll };
        let Ok(mut p) = Packet::icmp_for(dst, &build, None, Some(src)) else {
            return;
        };
        p.iface = Some(iface);
        p.nh_haddr = haddr_hint;
        p.force_source_ip = true;
        p.set_ttl(255);
        if let Err(e) = self.output(p) {
            log::debug!("neighbor solicitation failed: {}", e);
        }
    }

    /// Advertise our presence on `iface`, asking routers to identify
    /// themselves.
    pub fn send_router_solicit(&mut self, iface: IfaceId) {
        let src = self
            .ip
            .addrs
            .iter()
            .find(|(a, _, s)| s.iface == iface && !s.tentative && a.is_link_local())
            .map(|(a, _, _)| a)
            .unwrap_or(IpAddr::UNSPECIFIED);
        let source_ll = if src.is_unspecified() { None } else { Some(self.iface(iface).addr()) };

        let build = IcmpBuild::RouterSolicit { source_ll };
        let Ok(mut p) = Packet::icmp_for(IpAddr::ALL_ROUTERS_V6, &build, None, Some(src)) else {
            return;
        };
        p.iface = Some(iface);
        p.force_source_ip = true;
        p.set_ttl(255);
        if let Err(e) = self.output(p) {
            log::debug!("router solicitation failed: {}", e);
        }
    }

    /// Neighbor Solicitation input: learn the solicitor, and answer when
    /// the target is one of our usable addresses.
    pub(crate) fn ndp_ns_input(
        &mut self,
        packet: &Packet,
        target: IpAddr,
        source_ll: Option<HwAddr>,
    ) {
        let Some(iface) = packet.iface else { return };
        let src = packet.src_addr();

        // glean the solicitor's mapping
        if !src.is_unspecified() {
            let now = self.now();
            let released = self.iface_mut(iface).neighbors.process_advert(
                src,
                source_ll,
                AdvertFlags { is_advert: false, ..Default::default() },
                now,
            );
            if let Some((queue, _)) = released {
                for queued in queue {
                    let _ = self.output(queued);
                }
            }
        }

        let Some(state) = self.ip.addr_state(&target) else { return };
        if state.tentative || state.iface != iface {
            return;
        }

        let solicited = !src.is_unspecified();
        let dst = if solicited { src } else { IpAddr::ALL_NODES };
        let target_ll = Some(self.iface(iface).addr());
        let build = IcmpBuild::NeighborAdvert {
            target,
            router: false,
            solicited,
            override_flag: true,
            target_ll,
        };
        let Ok(mut reply) = Packet::icmp_for(dst, &build, None, Some(target)) else {
            return;
        };
        reply.iface = Some(iface);
        reply.force_source_ip = true;
        reply.set_ttl(255);
        if let Err(e) = self.output(reply) {
            log::debug!("neighbor advertisement failed: {}", e);
        }
    }

    /// Neighbor Advertisement input: a hit on a tentative address is a
    /// duplicate and removes it; otherwise the neighbor cache decides.
    pub(crate) fn ndp_na_input(
        &mut self,
        packet: &Packet,
        target: IpAddr,
        target_ll: Option<HwAddr>,
        flags: AdvertFlags,
    ) {
        let Some(iface) = packet.iface else { return };

        if let Some(state) = self.ip.addr_state(&target) {
            if state.tentative {
                log::warn!("duplicate address {} detected, releasing it", target);
                self.remove_ip(target);
                return;
            }
        }

        let now = self.now();
        let released = self
            .iface_mut(iface)
            .neighbors
            .process_advert(target, target_ll, flags, now);
        if let Some((queue, _)) = released {
            for queued in queue {
                if let Err(e) = self.output(queued) {
                    log::debug!("releasing queued packet failed: {}", e);
                }
            }
        }
    }

    /// Router Advertisement input: adopt the advertised hop limit and form
    /// SLAAC addresses from autonomous prefixes.
    pub(crate) fn ndp_ra_input(
        &mut self,
        packet: &Packet,
        cur_hop_limit: u8,
        source_ll: Option<HwAddr>,
        prefixes: Vec<SlaacPrefix>,
    ) {
        let Some(iface) = packet.iface else { return };
        if packet.ttl() != 255 {
            log::trace!("router advertisement with hop limit {} ignored", packet.ttl());
            return;
        }

        if cur_hop_limit != 0 {
            self.iface_mut(iface).hop_limit = cur_hop_limit;
        }

        let src = packet.src_addr();
        if !src.is_unspecified() {
            let now = self.now();
            let released = self.iface_mut(iface).neighbors.process_advert(
                src,
                source_ll,
                AdvertFlags { is_advert: false, router: true, ..Default::default() },
                now,
            );
            if let Some((queue, _)) = released {
                for queued in queue {
                    let _ = self.output(queued);
                }
            }
        }

        let ident = self.iface(iface).ident();
        for pi in prefixes {
            if !pi.autonomous || pi.preferred_lifetime > pi.valid_lifetime {
                continue;
            }
            let addr = IpAddr::from_prefix(pi.prefix, pi.prefix_len, ident);
            if self.ip.is_local(&addr) {
                continue;
            }
            log::debug!("SLAAC: adopting {}/{}", addr, pi.prefix_len);
            self.assign_ip(iface, addr, pi.prefix_len);
        }
    }
}

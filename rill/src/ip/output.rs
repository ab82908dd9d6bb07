//! Egress: route resolution, neighbor handling, fragmentation and
//! finalization.

use crate::iface::IfaceId;
use crate::neigh::NeighborAction;
use crate::packet::{FragInfo, Packet};
use crate::stack::{OutputError, Stack};
use crate::wire::arp::{ArpHdr, ArpOp};
use crate::wire::checksum::{checksum_buf, pseudo_sum};
use crate::wire::icmp::{IcmpBuild, UnreachableReason};
use crate::wire::ipv6::Ipv6Hdr;
use crate::wire::{EtherType, HwAddr, IpAddr, IpProto, IpVersion};

impl Stack {
    /// Send a packet the stack (or an application path) has built. ARP goes
    /// straight to L2; IP runs the resolve → fragment → finalize pipeline.
    pub fn output(&mut self, packet: Packet) -> Result<(), OutputError> {
        if packet.is_arp() {
            self.arp_output(packet)
        } else if packet.is_ip() {
            self.ip_output_resolve(packet)
        } else {
            Err(OutputError::NotIp)
        }
    }

    fn arp_output(&mut self, mut packet: Packet) -> Result<(), OutputError> {
        let (sender_hw, target_hw) = {
            let arp = packet.arp().ok_or(OutputError::NotIp)?;
            (arp.sender_hw(), arp.target_hw())
        };
        packet.construct_eth()?;
        {
            let mut eth = packet.eth_mut().expect("link header recorded");
            eth.set_src(sender_hw);
            eth.set_dst(if target_hw.is_zero() { HwAddr::BROADCAST } else { target_hw });
            eth.set_ethertype(EtherType::Arp);
        }
        self.l2_output(packet)
    }

    fn ip_output_resolve(&mut self, mut packet: Packet) -> Result<(), OutputError> {
        let dst = packet.dst_addr();

        if let Some(state) = self.ip.addr_state(&dst) {
            // one of our own addresses: loop back through the owner
            packet.nh_ip = Some(dst);
            packet.iface = Some(state.iface);
            packet.local = true;
        } else if dst.is_loopback() {
            packet.nh_ip = Some(dst);
            packet.local = true;
        } else if dst.is_broadcast() || dst.is_multicast() || self.ip.is_directed_broadcast(&dst) {
            packet.nh_ip = Some(dst);
            if packet.iface.is_none() {
                packet.iface = self.ip.router.default_route().map(|r| r.iface);
            }
        } else {
            let rt = self.ip.router.lookup(dst).map_err(|_| OutputError::NoRoute)?;
            packet.nh_ip = Some(rt.next_hop.unwrap_or(dst));
            packet.iface = Some(rt.iface);
            if let Some(src) = rt.source_ip {
                if !packet.forwarded && !packet.force_source_ip && packet.src_addr().is_unspecified()
                {
                    packet.set_src_addr(src);
                }
            }
        }

        if !packet.local && packet.nh_haddr.is_none() {
            let nh = packet.nh_ip.expect("next hop chosen above");
            if nh.is_broadcast() || self.ip.is_directed_broadcast(&nh) {
                packet.nh_haddr = Some(HwAddr::BROADCAST);
            } else if nh.is_multicast() {
                packet.nh_haddr = Some(nh.multicast_hw());
            } else {
                let iface_id = packet.iface.ok_or(OutputError::NoInterface)?;
                let src_hint = Some(packet.src_addr()).filter(|s| !s.is_unspecified());
                let now = self.now();
                let mut actions = Vec::new();
                let resolved = self
                    .iface_mut(iface_id)
                    .neighbors
                    .resolve(nh, src_hint, packet, now, &mut actions);
                self.run_neigh_actions(iface_id, actions);
                match resolved {
                    Some((p, haddr)) => {
                        packet = p;
                        packet.nh_haddr = Some(haddr);
                    }
                    // suspended on the neighbor entry until resolution
                    None => return Ok(()),
                }
            }
        }

        if !packet.force_source_ip && packet.src_addr().is_unspecified() {
            if let Some(src) = self.select_src_addr(Some(dst), packet.iface) {
                packet.set_src_addr(src);
            }
        }

        if !packet.local {
            if let Some(iface_id) = packet.iface {
                let mtu = usize::from(self.iface(iface_id).mtu());
                let frame_payload = packet.len() + packet.ip_hdr_len();
                if frame_payload > mtu {
                    let ver = packet.ip_version().expect("IP packet");
                    let dont_frag = packet.ipv4().map(|h| h.dont_frag()).unwrap_or(false);
                    if (ver == IpVersion::V4 && dont_frag)
                        || (ver == IpVersion::V6 && packet.forwarded)
                    {
                        log::debug!("{} byte packet exceeds MTU {}", frame_payload, mtu);
                        self.icmp_notify_unreachable(
                            &packet,
                            UnreachableReason::PacketTooBig,
                            Some(mtu as u32),
                        );
                        return Ok(());
                    }
                    return self.ip_output_fragment(packet, mtu);
                }
            }
        }

        self.ip_output_final(packet)
    }

    /// Split into fragments of at most `mtu` bytes, each carrying a copy of
    /// the IP header. One identification covers every fragment of the
    /// packet; forwarded fragments keep the original.
    fn ip_output_fragment(&mut self, mut packet: Packet, mtu: usize) -> Result<(), OutputError> {
        // the transport checksum must cover the unfragmented datagram
        self.finalize_transport(&mut packet);

        let ver = packet.ip_version().expect("IP packet");
        let base = packet.frag_info();
        let ident = match (ver, base) {
            (_, Some(f)) if f.ident != 0 => f.ident,
            _ => self.ip.next_ident(),
        };
        let base_offset = base.map(|f| f.offset).unwrap_or(0);
        let base_more = base.map(|f| f.more).unwrap_or(false);

        let mut offset = 0usize;
        while packet.len() > 0 {
            let mut frag = Packet::new();
            frag.iface = packet.iface;
            frag.nh_ip = packet.nh_ip;
            frag.nh_haddr = packet.nh_haddr;
            frag.forwarded = packet.forwarded;
            frag.reserve_headers();
            frag.construct_ip_from(&packet, true)?;

            let hdr_len = frag.ip_hdr_len();
            let mut payload = mtu.saturating_sub(hdr_len) & !7;
            if payload == 0 {
                return Err(OutputError::Hdr(crate::wire::HdrError::OutOfBounds));
            }
            let more;
            if packet.len() > payload {
                more = true;
            } else {
                payload = packet.len();
                more = base_more;
            }
            frag.set_frag_fields(FragInfo {
                ident,
                offset: base_offset + offset as u16,
                more,
            });

            frag.insert(&packet, 0, payload)
                .map_err(|_| OutputError::Hdr(crate::wire::HdrError::OutOfBounds))?;
            packet.buf_mut().mask(payload);
            offset += payload;

            self.ip_output_final(frag)?;
        }
        Ok(())
    }

    /// Lengths, checksums and TTL; then loopback or Ethernet encapsulation.
    fn ip_output_final(&mut self, mut packet: Packet) -> Result<(), OutputError> {
        let ver = packet.ip_version().ok_or(OutputError::NotIp)?;

        match ver {
            IpVersion::V4 => {
                let total = (packet.len() + packet.ip_hdr_len()) as u16;
                packet.ipv4_mut().expect("v4 header").set_total_len(total);
            }
            IpVersion::V6 => {
                let ext = packet.ip_hdr_len() - Ipv6Hdr::<&[u8]>::SIZE;
                let payload = (packet.len() + ext) as u16;
                packet.ipv6_mut().expect("v6 header").set_payload_len(payload);
            }
        }

        self.finalize_transport(&mut packet);

        let ttl = packet.ttl();
        if ttl == 0 {
            let fresh = match ver {
                IpVersion::V4 => self.ip.config.default_ttl,
                IpVersion::V6 => packet
                    .iface
                    .map(|i| self.iface(i).hop_limit)
                    .unwrap_or(64),
            };
            packet.set_ttl(fresh);
        } else if packet.forwarded {
            packet.set_ttl(ttl - 1);
        }

        let hdr_len = packet.ip_hdr_len();
        packet.buf_mut().unmask(hdr_len);
        if ver == IpVersion::V4 {
            // header checksum goes last
            packet.ipv4_mut().expect("v4 header").fill_checksum();
        }

        if packet.local {
            packet.buf_mut().mask(hdr_len);
            self.ip_input(packet, ver);
            return Ok(());
        }

        packet.construct_eth()?;
        let nh_haddr = packet.nh_haddr.expect("next hop resolved before finalize");
        {
            let mut eth = packet.eth_mut().expect("link header recorded");
            eth.set_dst(nh_haddr);
            eth.set_ethertype(match ver {
                IpVersion::V4 => EtherType::Ipv4,
                IpVersion::V6 => EtherType::Ipv6,
            });
        }
        self.l2_output(packet)
    }

    /// Transport checksum over the unmasked datagram, using the family's
    /// pseudo-header where required.
    fn finalize_transport(&mut self, packet: &mut Packet) {
        if packet.is_udp() {
            let init = pseudo_sum(
                packet.src_addr(),
                packet.dst_addr(),
                IpProto::Udp.to_u8(),
                packet.len() as u16,
            );
            packet.udp_mut().expect("udp header").set_checksum(0);
            let mut sum = checksum_buf(packet.buf(), init);
            if sum == 0 {
                sum = 0xffff; // transmitted zero means "no checksum"
            }
            packet.udp_mut().expect("udp header").set_checksum(sum);
        } else if packet.is_icmp() {
            let init = match packet.ip_version() {
                Some(IpVersion::V6) => pseudo_sum(
                    packet.src_addr(),
                    packet.dst_addr(),
                    IpProto::Icmpv6.to_u8(),
                    packet.len() as u16,
                ),
                _ => 0,
            };
            packet.icmp_mut().expect("icmp header").set_checksum(0);
            let sum = checksum_buf(packet.buf(), init);
            packet.icmp_mut().expect("icmp header").set_checksum(sum);
        }
    }

    /// ICMP error on behalf of a dropped packet. Never answers an
    /// ICMP-carrying packet, so errors cannot chain.
    pub(crate) fn icmp_notify_unreachable(
        &mut self,
        packet: &Packet,
        reason: UnreachableReason,
        mtu: Option<u32>,
    ) {
        if !packet.is_ip() || packet.carries_icmp() {
            return;
        }
        let build = match reason {
            UnreachableReason::PacketTooBig => IcmpBuild::PacketTooBig { mtu: mtu.unwrap_or(0) },
            other => IcmpBuild::Unreachable(other),
        };
        if let Ok(reply) = Packet::icmp_for(packet.src_addr(), &build, Some(packet.buf()), None) {
            let _ = self.output(reply);
        }
    }

    /// Execute the side effects a neighbor cache asked for.
    pub(crate) fn run_neigh_actions(
        &mut self,
        iface: IfaceId,
        actions: Vec<NeighborAction<Packet>>,
    ) {
        for action in actions {
            match action {
                NeighborAction::Solicit { target, src_hint, haddr_hint } => {
                    self.solicit_haddr(iface, target, haddr_hint, src_hint);
                }
                NeighborAction::Unreachable { target, queued } => {
                    log::debug!("neighbor {} unreachable, {} packets dropped", target, queued.len());
                    for packet in queued {
                        self.icmp_notify_unreachable(&packet, UnreachableReason::Host, None);
                    }
                }
            }
        }
    }

    /// Ask the link who owns `target`: ARP request for v4, Neighbor
    /// Solicitation for v6.
    pub(crate) fn solicit_haddr(
        &mut self,
        iface: IfaceId,
        target: IpAddr,
        haddr_hint: Option<HwAddr>,
        src_hint: Option<IpAddr>,
    ) {
        let src = match src_hint.filter(|s| self.ip.is_local(s)) {
            Some(s) => s,
            None => self
                .select_src_addr(Some(target), Some(iface))
                .unwrap_or(IpAddr::UNSPECIFIED),
        };

        if target.is_v4() {
            let our_hw = self.iface(iface).addr();
            let mut req = Packet::new();
            req.reserve_headers();
            req.iface = Some(iface);
            if req.construct_arp().is_err() {
                return;
            }
            {
                let mut arp = req.arp_mut().expect("arp header recorded");
                arp.set_op(ArpOp::Request);
                arp.set_sender_hw(our_hw);
                arp.set_sender_ip(src.v4());
                arp.set_target_hw(haddr_hint.unwrap_or(HwAddr::ZERO));
                arp.set_target_ip(target.v4());
            }
            req.buf_mut().unmask(ArpHdr::<&[u8]>::SIZE);
            if let Err(e) = self.output(req) {
                log::debug!("ARP solicitation failed: {}", e);
            }
        } else {
            self.send_neighbor_solicit(iface, target, src, haddr_hint);
        }
    }
}

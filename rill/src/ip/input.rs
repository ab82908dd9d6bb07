//! Ingress: classification, forwarding, upper-layer dispatch and the ICMP
//! responder.

use crate::neigh::AdvertFlags;
use crate::packet::Packet;
use crate::stack::Stack;
use crate::wire::arp::ArpOp;
use crate::wire::checksum::{checksum_buf, pseudo_sum};
use crate::wire::icmp::{IcmpBuild, IcmpMsg, TimeExceededKind, UnreachableReason};
use crate::wire::ipv6::{ExtHdr, ExtWalk, HbhOption, Ipv6Hdr};
use crate::wire::udp::UdpHdr;
use crate::wire::{HwAddr, IpAddr, IpProto, IpVersion};

/// Owned digest of a received ICMP message, extracted before dispatch so
/// the packet can move on.
enum IcmpEvent {
    EchoRequest { ident: u16, seq: u16 },
    MldQuery { group: IpAddr, max_resp_ms: u16 },
    NeighborSolicit { target: IpAddr, source_ll: Option<HwAddr> },
    NeighborAdvert {
        target: IpAddr,
        target_ll: Option<HwAddr>,
        router: bool,
        solicited: bool,
        override_flag: bool,
    },
    RouterAdvert {
        cur_hop_limit: u8,
        source_ll: Option<HwAddr>,
        prefixes: Vec<SlaacPrefix>,
    },
    Ignored,
}

pub(crate) struct SlaacPrefix {
    pub prefix: IpAddr,
    pub prefix_len: u8,
    pub autonomous: bool,
    pub valid_lifetime: u32,
    pub preferred_lifetime: u32,
}

impl Stack {
    /// Classify an IP packet: local delivery, forwarding, or reassembly.
    pub(crate) fn ip_input(&mut self, mut packet: Packet, ver: IpVersion) {
        if !packet.is_ip() {
            if packet.read_ip(ver).is_err() {
                log::trace!("malformed IP header dropped");
                return;
            }
            // trim link padding to the declared length
            match packet.upper_layer_len() {
                Some(declared) if declared <= packet.len() => packet.buf_mut().truncate(declared),
                _ => {
                    log::trace!("IP packet shorter than declared length dropped");
                    return;
                }
            }
        }

        let dst = packet.dst_addr();
        let exact = self.ip.is_local(&dst);
        if !exact {
            let broadcast = dst.is_broadcast() || self.ip.is_directed_broadcast(&dst);
            if !broadcast && !dst.is_multicast() && !dst.is_unspecified() {
                return self.ip_forward(packet);
            }
        }

        match ver {
            IpVersion::V4 => self.ip_input_v4(packet),
            IpVersion::V6 => self.ip_input_v6(packet),
        }
    }

    fn ip_forward(&mut self, mut packet: Packet) {
        packet.forwarded = true;
        let src = packet.src_addr();
        let answerable = !packet.carries_icmp();
        if packet.ttl() == 0 {
            log::debug!("TTL exhausted forwarding to {}", packet.dst_addr());
            if !answerable {
                return;
            }
            if let Ok(reply) = Packet::icmp_for(
                src,
                &IcmpBuild::TimeExceeded(TimeExceededKind::HopLimit),
                Some(packet.buf()),
                None,
            ) {
                let _ = self.output(reply);
            }
            return;
        }

        // keep enough of the packet around to answer a routing failure
        let offending = packet.buf().clone();
        if let Err(e) = self.output(packet) {
            log::debug!("forwarding failed: {}", e);
            if !answerable {
                return;
            }
            if let Ok(reply) = Packet::icmp_for(
                src,
                &IcmpBuild::Unreachable(UnreachableReason::Network),
                Some(&offending),
                None,
            ) {
                let _ = self.output(reply);
            }
        }
    }

    fn ip_input_v4(&mut self, mut packet: Packet) {
        let (frag, proto, router_alert) = {
            let Some(hdr) = packet.ipv4() else { return };
            let frag = if hdr.is_fragment() { packet.frag_info() } else { None };
            let mut router_alert = false;
            for opt in hdr.options() {
                match opt {
                    Ok(crate::wire::ipv4::Ipv4Option::RouterAlert(_)) => router_alert = true,
                    Ok(_) => {}
                    Err(_) => return,
                }
            }
            (frag, hdr.proto(), router_alert)
        };
        packet.router_alert |= router_alert;
        if let Some(frag) = frag {
            return self.reassemble(packet, frag);
        }
        self.ip_deliver(packet, proto);
    }

    fn ip_input_v6(&mut self, mut packet: Packet) {
        let (frag, proto, router_alert) = {
            let Some(bytes) = packet.ip_hdr_bytes() else { return };
            let mut walk = ExtWalk::new(&bytes[Ipv6Hdr::<&[u8]>::SIZE..], bytes[6]);
            let mut router_alert = false;
            let mut frag = None;
            loop {
                match walk.next_ext() {
                    Err(_) => return,
                    Ok(None) => break,
                    Ok(Some(ExtHdr::HopByHop(opts))) => {
                        for opt in opts {
                            match opt {
                                Ok(HbhOption::RouterAlert(_)) => router_alert = true,
                                Ok(HbhOption::Pad) => {}
                                Ok(HbhOption::Other { typ })
                                    if HbhOption::must_discard_unknown(typ) =>
                                {
                                    log::trace!("unknown hop-by-hop option {:#x} dropped", typ);
                                    return;
                                }
                                Ok(HbhOption::Other { .. }) => {}
                                Err(_) => return,
                            }
                        }
                    }
                    Ok(Some(ExtHdr::Fragment(f))) => {
                        frag = Some(crate::packet::FragInfo {
                            ident: f.ident(),
                            offset: f.frag_offset(),
                            more: f.more_frags(),
                        });
                    }
                }
            }
            (frag, walk.upper_proto(), router_alert)
        };
        packet.router_alert |= router_alert;
        if let Some(frag) = frag {
            return self.reassemble(packet, frag);
        }
        self.ip_deliver(packet, IpProto::from_u8(proto));
    }

    pub(crate) fn ip_deliver(&mut self, packet: Packet, proto: IpProto) {
        let ver = packet.ip_version();
        match (proto, ver) {
            (IpProto::Icmp, Some(IpVersion::V4)) => self.icmp_input(packet, IpVersion::V4),
            (IpProto::Icmpv6, Some(IpVersion::V6)) => self.icmp_input(packet, IpVersion::V6),
            (IpProto::Udp, _) => self.udp_deliver(packet),
            (IpProto::Igmp, Some(IpVersion::V4)) => self.igmp_deliver(packet),
            _ => log::trace!("protocol {:?} not deliverable", proto),
        }
    }

    fn icmp_input(&mut self, mut packet: Packet, ver: IpVersion) {
        if packet.read_icmp(ver).is_err() {
            return;
        }

        // checksum covers the whole message including any trailing payload
        let icmp_len = packet.icmp_size();
        packet.buf_mut().unmask(icmp_len);
        let init = match ver {
            IpVersion::V4 => 0,
            IpVersion::V6 => pseudo_sum(
                packet.src_addr(),
                packet.dst_addr(),
                IpProto::Icmpv6.to_u8(),
                packet.len() as u16,
            ),
        };
        let ok = checksum_buf(packet.buf(), init) == 0;
        packet.buf_mut().mask(icmp_len);
        if !ok {
            log::trace!("ICMP checksum mismatch dropped");
            return;
        }

        let event = {
            let Some(hdr) = packet.icmp() else { return };
            let Ok(msg) = hdr.msg() else { return };
            match msg {
                IcmpMsg::EchoRequest { ident, seq } => IcmpEvent::EchoRequest { ident, seq },
                IcmpMsg::MldQuery { group, max_resp_ms } => {
                    IcmpEvent::MldQuery { group, max_resp_ms }
                }
                IcmpMsg::NeighborSolicit { target, options } => IcmpEvent::NeighborSolicit {
                    target,
                    source_ll: options.source_ll(),
                },
                IcmpMsg::NeighborAdvert(na) => IcmpEvent::NeighborAdvert {
                    target: na.target(),
                    target_ll: na.options().target_ll(),
                    router: na.router(),
                    solicited: na.solicited(),
                    override_flag: na.override_flag(),
                },
                IcmpMsg::RouterAdvert(ra) => IcmpEvent::RouterAdvert {
                    cur_hop_limit: ra.cur_hop_limit(),
                    source_ll: ra.options().source_ll(),
                    prefixes: ra
                        .options()
                        .filter_map(|o| match o {
                            crate::wire::ndp::NdpOption::PrefixInfo(pi) => Some(SlaacPrefix {
                                prefix: pi.prefix(),
                                prefix_len: pi.prefix_len(),
                                autonomous: pi.autonomous(),
                                valid_lifetime: pi.valid_lifetime(),
                                preferred_lifetime: pi.preferred_lifetime(),
                            }),
                            _ => None,
                        })
                        .collect(),
                },
                _ => IcmpEvent::Ignored,
            }
        };

        match event {
            IcmpEvent::EchoRequest { ident, seq } => {
                let reply = Packet::icmp_for(
                    packet.src_addr(),
                    &IcmpBuild::EchoReply { ident, seq },
                    Some(packet.buf()),
                    Some(packet.dst_addr()),
                );
                if let Ok(reply) = reply {
                    let _ = self.output(reply);
                }
            }
            IcmpEvent::MldQuery { group, max_resp_ms } => {
                self.group_query_input(&packet, group, max_resp_ms)
            }
            IcmpEvent::NeighborSolicit { target, source_ll } => {
                self.ndp_ns_input(&packet, target, source_ll)
            }
            IcmpEvent::NeighborAdvert { target, target_ll, router, solicited, override_flag } => {
                self.ndp_na_input(&packet, target, target_ll, AdvertFlags {
                    is_advert: true,
                    router,
                    solicited,
                    override_addr: override_flag,
                })
            }
            IcmpEvent::RouterAdvert { cur_hop_limit, source_ll, prefixes } => {
                self.ndp_ra_input(&packet, cur_hop_limit, source_ll, prefixes)
            }
            IcmpEvent::Ignored => {}
        }
    }

    fn udp_deliver(&mut self, mut packet: Packet) {
        if packet.read_udp().is_err() {
            return;
        }
        let (src_port, dst_port, udp_len, csum) = {
            let udp = packet.udp().expect("udp header recorded");
            (udp.src_port(), udp.dst_port(), udp.length(), udp.checksum_field())
        };
        let payload_len = match (udp_len as usize).checked_sub(UdpHdr::<&[u8]>::SIZE) {
            Some(l) if l <= packet.len() => l,
            _ => return,
        };
        packet.buf_mut().truncate(payload_len);

        if csum != 0 {
            packet.buf_mut().unmask(UdpHdr::<&[u8]>::SIZE);
            let init = pseudo_sum(
                packet.src_addr(),
                packet.dst_addr(),
                IpProto::Udp.to_u8(),
                packet.len() as u16,
            );
            let ok = checksum_buf(packet.buf(), init) == 0;
            packet.buf_mut().mask(UdpHdr::<&[u8]>::SIZE);
            if !ok {
                log::trace!("UDP checksum mismatch dropped");
                return;
            }
        }

        let src = packet.src_addr();
        let dst = packet.dst_addr();
        let Some((sock, connected)) =
            self.ip.socks.lookup(IpProto::Udp, dst, dst_port, src, src_port)
        else {
            log::trace!("no socket for {}:{}", dst, dst_port);
            return;
        };

        if connected {
            // a datagram from the connected peer confirms its neighbor
            if let Some(iface) = packet.iface {
                let now = self.now();
                self.iface_mut(iface).neighbors.confirm_reachable(&src, now);
            }
        }

        let cb = sock.borrow_mut().on_data.take();
        if let Some(mut cb) = cb {
            let handle = crate::sock::UdpSocket::from_ref(sock.clone());
            cb(self, &handle, packet.buf(), src, src_port);
            let mut state = sock.borrow_mut();
            if state.on_data.is_none() {
                state.on_data = Some(cb);
            }
        }
    }

    pub(crate) fn arp_input(&mut self, mut packet: Packet) {
        if packet.read_arp().is_err() {
            return;
        }
        let (op, sender_hw, sender_ip, target_ip) = {
            let arp = packet.arp().expect("arp header recorded");
            (arp.op(), arp.sender_hw(), arp.sender_ip(), arp.target_ip())
        };

        match op {
            ArpOp::Request => {
                let target = IpAddr::from_v4(target_ip);
                let Some(state) = self.ip.addr_state(&target) else { return };
                if state.tentative || packet.iface != Some(state.iface) {
                    return;
                }
                let iface = state.iface;
                let our_hw = self.iface(iface).addr();

                // a request for us carries a fresh sender mapping
                let now = self.now();
                let released = self.iface_mut(iface).neighbors.process_advert(
                    IpAddr::from_v4(sender_ip),
                    Some(sender_hw),
                    AdvertFlags { is_advert: false, ..Default::default() },
                    now,
                );
                if let Some((queue, _)) = released {
                    for queued in queue {
                        let _ = self.output(queued);
                    }
                }

                let mut reply = Packet::new();
                reply.reserve_headers();
                reply.iface = Some(iface);
                if reply.construct_arp().is_err() {
                    return;
                }
                {
                    let mut arp = reply.arp_mut().expect("arp header recorded");
                    arp.set_op(ArpOp::Reply);
                    arp.set_sender_hw(our_hw);
                    arp.set_sender_ip(target_ip);
                    arp.set_target_hw(sender_hw);
                    arp.set_target_ip(sender_ip);
                }
                reply.buf_mut().unmask(crate::wire::arp::ArpHdr::<&[u8]>::SIZE);
                let _ = self.output(reply);
            }
            ArpOp::Reply => {
                let Some(iface) = packet.iface else { return };
                let now = self.now();
                let released = self.iface_mut(iface).neighbors.process_advert(
                    IpAddr::from_v4(sender_ip),
                    Some(sender_hw),
                    AdvertFlags { is_advert: true, router: false, solicited: true, override_addr: false },
                    now,
                );
                if let Some((queue, _)) = released {
                    for queued in queue {
                        if let Err(e) = self.output(queued) {
                            log::debug!("releasing queued packet failed: {}", e);
                        }
                    }
                }
            }
            ArpOp::Unknown(_) => {}
        }
    }
}

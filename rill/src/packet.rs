//! A packet in flight: a chunked buffer plus routing metadata and the
//! positions of the headers parsed out of (or constructed into) it.
//!
//! Header records hold absolute buffer offsets, which stay valid across
//! mask movement. Reading a header validates at the mask point and advances
//! the mask only on success; constructing one reserves space immediately
//! above the mask point, so headers stack up in front of the payload in
//! construction order.

use crate::buf::Buf;
use crate::iface::IfaceId;
use crate::wire::arp::ArpHdr;
use crate::wire::eth::EthHdr;
use crate::wire::icmp::{IcmpBuild, IcmpHdr};
use crate::wire::igmp::IgmpHdr;
use crate::wire::ipv4::Ipv4Hdr;
use crate::wire::ipv6::{ExtHdr, ExtWalk, FragHdr, Ipv6Hdr};
use crate::wire::udp::UdpHdr;
use crate::wire::{HdrError, HwAddr, IpAddr, IpProto, IpVersion};

/// Headroom reserved in front of payloads for the header stack.
pub const HEADROOM: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkRec {
    None,
    Eth { off: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NetRec {
    None,
    Arp { off: usize },
    Ip { off: usize, len: usize, ver: IpVersion },
    Igmp { off: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TsptRec {
    None,
    Icmp { off: usize, len: usize, ver: IpVersion },
    Udp { off: usize },
}

/// Fragment-related fields of either IP family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragInfo {
    pub ident: u32,
    /// Offset of this fragment's payload in bytes.
    pub offset: u16,
    pub more: bool,
}

pub struct Packet {
    buf: Buf,
    pub iface: Option<IfaceId>,
    /// Next-hop IP chosen by routing.
    pub nh_ip: Option<IpAddr>,
    /// Next-hop link address once resolved.
    pub nh_haddr: Option<HwAddr>,

    /// Destined to this host; finalize loops it back into ingress.
    pub local: bool,
    pub forwarded: bool,
    pub has_last_fragment: bool,
    pub router_alert: bool,
    /// Keep the source address exactly as set (bound sockets, DAD probes).
    pub force_source_ip: bool,

    link: LinkRec,
    net: NetRec,
    tspt: TsptRec,
}

impl Default for Packet {
    fn default() -> Self {
        Packet::new()
    }
}

impl Packet {
    pub fn new() -> Self {
        Packet::from_buf(Buf::new())
    }

    pub fn from_buf(buf: Buf) -> Self {
        Packet {
            buf,
            iface: None,
            nh_ip: None,
            nh_haddr: None,
            local: false,
            forwarded: false,
            has_last_fragment: false,
            router_alert: false,
            force_source_ip: false,
            link: LinkRec::None,
            net: NetRec::None,
            tspt: TsptRec::None,
        }
    }

    /// A zeroed payload area of `n` bytes with headroom already masked off.
    pub fn with_payload_size(n: usize) -> Self {
        let mut buf = Buf::alloc(n + HEADROOM);
        buf.mask(HEADROOM);
        Packet::from_buf(buf)
    }

    /// Wrap an existing payload buffer and reserve header headroom.
    pub fn from_payload(buf: Buf) -> Self {
        let mut p = Packet::from_buf(buf);
        p.reserve_headers();
        p
    }

    /// Wrap a received frame; no headroom, parsing starts at byte 0.
    pub fn from_frame(frame: Buf) -> Self {
        Packet::from_buf(frame)
    }

    pub fn buf(&self) -> &Buf {
        &self.buf
    }

    pub fn buf_mut(&mut self) -> &mut Buf {
        &mut self.buf
    }

    pub fn into_buf(self) -> Buf {
        self.buf
    }

    /// Raw bytes of the recorded network header (v6: extensions included).
    pub fn ip_hdr_bytes(&self) -> Option<&[u8]> {
        match self.net {
            NetRec::Ip { off, len, .. } => self.buf.span(off, len),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn reserve_headers(&mut self) {
        debug_assert!(
            self.link == LinkRec::None && self.net == NetRec::None && self.tspt == TsptRec::None,
            "headroom must be reserved before headers are recorded"
        );
        self.buf.reserve_before(HEADROOM);
    }

    /// Share the unmasked chunks of `other` into this packet at `offset`.
    pub fn insert(&mut self, other: &Packet, offset: usize, limit: usize) -> Result<(), crate::buf::InsertError> {
        self.buf.insert(&other.buf, offset, limit)
    }

    /// Expose `hint` masked bytes just above the mask point, zeroed, for a
    /// new header. Returns its absolute offset.
    fn construct_region(&mut self, hint: usize) -> Result<usize, HdrError> {
        if self.buf.mask_off() < hint {
            return Err(HdrError::OutOfBounds);
        }
        self.buf.unmask(hint);
        let off = self.buf.mask_off();
        match self.buf.span_mut(off, hint) {
            Some(region) => region.fill(0),
            None => {
                self.buf.mask(hint);
                return Err(HdrError::OutOfBounds);
            }
        }
        self.buf.mask(hint);
        Ok(off)
    }

    // ---------------- link layer ----------------

    pub fn read_eth(&mut self) -> Result<(), HdrError> {
        let off = self.buf.mask_off();
        EthHdr::parse(self.buf.tail_at_mask())?;
        self.link = LinkRec::Eth { off };
        self.buf.mask(EthHdr::<&[u8]>::SIZE);
        Ok(())
    }

    pub fn construct_eth(&mut self) -> Result<(), HdrError> {
        let off = self.construct_region(EthHdr::<&[u8]>::SIZE)?;
        self.link = LinkRec::Eth { off };
        Ok(())
    }

    pub fn eth(&self) -> Option<EthHdr<&[u8]>> {
        match self.link {
            LinkRec::Eth { off } => EthHdr::parse(self.buf.span(off, EthHdr::<&[u8]>::SIZE)?).ok(),
            LinkRec::None => None,
        }
    }

    pub fn eth_mut(&mut self) -> Option<EthHdr<&mut [u8]>> {
        match self.link {
            LinkRec::Eth { off } => {
                EthHdr::parse(self.buf.span_mut(off, EthHdr::<&[u8]>::SIZE)?).ok()
            }
            LinkRec::None => None,
        }
    }

    pub fn eth_size(&self) -> usize {
        EthHdr::<&[u8]>::SIZE
    }

    // ---------------- network layer ----------------

    /// Parse an IP header (and, for v6, its extension chain) at the mask.
    pub fn read_ip(&mut self, ver: IpVersion) -> Result<(), HdrError> {
        let off = self.buf.mask_off();
        let len = {
            let tail = self.buf.tail_at_mask();
            match ver {
                IpVersion::V4 => Ipv4Hdr::parse(tail)?.header_len(),
                IpVersion::V6 => {
                    let hdr = Ipv6Hdr::parse(tail)?;
                    let mut walk = ExtWalk::new(&tail[Ipv6Hdr::<&[u8]>::SIZE..], hdr.next_header());
                    while walk.next_ext()?.is_some() {}
                    Ipv6Hdr::<&[u8]>::SIZE + walk.consumed()
                }
            }
        };
        self.net = NetRec::Ip { off, len, ver };
        self.buf.mask(len);
        Ok(())
    }

    /// Fresh IP header for `proto`, optionally carrying Router Alert.
    pub fn construct_ip(
        &mut self,
        ver: IpVersion,
        proto: IpProto,
        router_alert: bool,
    ) -> Result<(), HdrError> {
        match ver {
            IpVersion::V4 => {
                let hint = Ipv4Hdr::<&[u8]>::size_hint(if router_alert { 4 } else { 0 });
                let off = self.construct_region(hint)?;
                let span = self.buf.span_mut(off, hint).ok_or(HdrError::OutOfBounds)?;
                let mut hdr = Ipv4Hdr::construct(span, if router_alert { 4 } else { 0 })?;
                hdr.set_proto(proto);
                if router_alert {
                    hdr.write_router_alert();
                }
                self.net = NetRec::Ip { off, len: hint, ver };
            }
            IpVersion::V6 => {
                let hint = Ipv6Hdr::<&[u8]>::size_hint(if router_alert { 8 } else { 0 });
                let off = self.construct_region(hint)?;
                let span = self.buf.span_mut(off, hint).ok_or(HdrError::OutOfBounds)?;
                Ipv6Hdr::construct_proto(span, proto.to_u8(), router_alert)?;
                self.net = NetRec::Ip { off, len: hint, ver };
            }
        }
        Ok(())
    }

    /// Copy `base`'s IP header (options and extensions collapsed); with
    /// `frag_ext`, v6 headers gain a Fragment extension chained in front of
    /// the upper-layer protocol.
    pub fn construct_ip_from(&mut self, base: &Packet, frag_ext: bool) -> Result<(), HdrError> {
        let ver = base.ip_version().ok_or(HdrError::BadVersion)?;
        match ver {
            IpVersion::V4 => {
                let hint = Ipv4Hdr::<&[u8]>::MIN_SIZE;
                let off = self.construct_region(hint)?;
                let base_hdr = base.ipv4().ok_or(HdrError::BadVersion)?;
                let span = self.buf.span_mut(off, hint).ok_or(HdrError::OutOfBounds)?;
                let mut hdr = Ipv4Hdr::construct_from(span, &base_hdr)?;
                if !frag_ext {
                    // reassembled and copied headers start unfragmented
                    hdr.set_ident(0);
                    hdr.set_frag_offset(0);
                    hdr.set_more_frags(false);
                    hdr.set_dont_frag(false);
                }
                self.net = NetRec::Ip { off, len: hint, ver };
            }
            IpVersion::V6 => {
                let hint = Ipv6Hdr::<&[u8]>::SIZE
                    + if frag_ext { FragHdr::<&[u8]>::SIZE } else { 0 };
                let off = self.construct_region(hint)?;
                let base_hdr = base.ipv6().ok_or(HdrError::BadVersion)?;
                let terminal = base.ipv6_upper_proto().ok_or(HdrError::OutOfBounds)?;
                let span = self.buf.span_mut(off, hint).ok_or(HdrError::OutOfBounds)?;
                Ipv6Hdr::construct_from(span, &base_hdr, terminal, frag_ext)?;
                self.net = NetRec::Ip { off, len: hint, ver };
            }
        }
        Ok(())
    }

    pub fn read_arp(&mut self) -> Result<(), HdrError> {
        let off = self.buf.mask_off();
        ArpHdr::parse(self.buf.tail_at_mask())?;
        self.net = NetRec::Arp { off };
        self.buf.mask(ArpHdr::<&[u8]>::SIZE);
        Ok(())
    }

    pub fn construct_arp(&mut self) -> Result<(), HdrError> {
        let off = self.construct_region(ArpHdr::<&[u8]>::SIZE)?;
        let span = self
            .buf
            .span_mut(off, ArpHdr::<&[u8]>::SIZE)
            .ok_or(HdrError::OutOfBounds)?;
        ArpHdr::construct(span)?;
        self.net = NetRec::Arp { off };
        Ok(())
    }

    pub fn read_igmp(&mut self) -> Result<(), HdrError> {
        let off = self.buf.mask_off();
        IgmpHdr::parse(self.buf.tail_at_mask())?;
        self.net = NetRec::Igmp { off };
        self.buf.mask(IgmpHdr::<&[u8]>::SIZE);
        Ok(())
    }

    pub fn construct_igmp(&mut self) -> Result<(), HdrError> {
        let off = self.construct_region(IgmpHdr::<&[u8]>::SIZE)?;
        let span = self
            .buf
            .span_mut(off, IgmpHdr::<&[u8]>::SIZE)
            .ok_or(HdrError::OutOfBounds)?;
        IgmpHdr::construct(span)?;
        self.net = NetRec::Igmp { off };
        Ok(())
    }

    pub fn is_ip(&self) -> bool {
        matches!(self.net, NetRec::Ip { .. })
    }

    pub fn is_arp(&self) -> bool {
        matches!(self.net, NetRec::Arp { .. })
    }

    pub fn is_igmp(&self) -> bool {
        matches!(self.net, NetRec::Igmp { .. })
    }

    pub fn is_icmp(&self) -> bool {
        matches!(self.tspt, TsptRec::Icmp { .. })
    }

    pub fn is_udp(&self) -> bool {
        matches!(self.tspt, TsptRec::Udp { .. })
    }

    pub fn ip_version(&self) -> Option<IpVersion> {
        match self.net {
            NetRec::Ip { ver, .. } => Some(ver),
            _ => None,
        }
    }

    pub fn ipv4(&self) -> Option<Ipv4Hdr<&[u8]>> {
        match self.net {
            NetRec::Ip { off, len, ver: IpVersion::V4 } => {
                Some(Ipv4Hdr::new_unchecked(self.buf.span(off, len)?))
            }
            _ => None,
        }
    }

    pub fn ipv4_mut(&mut self) -> Option<Ipv4Hdr<&mut [u8]>> {
        match self.net {
            NetRec::Ip { off, len, ver: IpVersion::V4 } => {
                Some(Ipv4Hdr::new_unchecked(self.buf.span_mut(off, len)?))
            }
            _ => None,
        }
    }

    pub fn ipv6(&self) -> Option<Ipv6Hdr<&[u8]>> {
        match self.net {
            NetRec::Ip { off, len, ver: IpVersion::V6 } => {
                Ipv6Hdr::parse(self.buf.span(off, len)?).ok()
            }
            _ => None,
        }
    }

    pub fn ipv6_mut(&mut self) -> Option<Ipv6Hdr<&mut [u8]>> {
        match self.net {
            NetRec::Ip { off, len, ver: IpVersion::V6 } => {
                Ipv6Hdr::parse(self.buf.span_mut(off, len)?).ok()
            }
            _ => None,
        }
    }

    pub fn arp(&self) -> Option<ArpHdr<&[u8]>> {
        match self.net {
            NetRec::Arp { off } => ArpHdr::parse(self.buf.span(off, ArpHdr::<&[u8]>::SIZE)?).ok(),
            _ => None,
        }
    }

    pub fn arp_mut(&mut self) -> Option<ArpHdr<&mut [u8]>> {
        match self.net {
            NetRec::Arp { off } => {
                ArpHdr::parse(self.buf.span_mut(off, ArpHdr::<&[u8]>::SIZE)?).ok()
            }
            _ => None,
        }
    }

    pub fn igmp(&self) -> Option<IgmpHdr<&[u8]>> {
        match self.net {
            NetRec::Igmp { off } => {
                IgmpHdr::parse(self.buf.span(off, IgmpHdr::<&[u8]>::SIZE)?).ok()
            }
            _ => None,
        }
    }

    pub fn igmp_mut(&mut self) -> Option<IgmpHdr<&mut [u8]>> {
        match self.net {
            NetRec::Igmp { off } => {
                IgmpHdr::parse(self.buf.span_mut(off, IgmpHdr::<&[u8]>::SIZE)?).ok()
            }
            _ => None,
        }
    }

    // ---------------- joint IP field access ----------------

    pub fn src_addr(&self) -> IpAddr {
        match self.net {
            NetRec::Ip { ver: IpVersion::V4, .. } => self.ipv4().map(|h| h.src()),
            NetRec::Ip { ver: IpVersion::V6, .. } => self.ipv6().map(|h| h.src()),
            _ => None,
        }
        .unwrap_or_else(|| panic!("source address of a packet with no IP header"))
    }

    pub fn dst_addr(&self) -> IpAddr {
        match self.net {
            NetRec::Ip { ver: IpVersion::V4, .. } => self.ipv4().map(|h| h.dst()),
            NetRec::Ip { ver: IpVersion::V6, .. } => self.ipv6().map(|h| h.dst()),
            _ => None,
        }
        .unwrap_or_else(|| panic!("destination address of a packet with no IP header"))
    }

    pub fn set_src_addr(&mut self, a: IpAddr) {
        if let Some(mut h) = self.ipv4_mut() {
            h.set_src(a);
        } else if let Some(mut h) = self.ipv6_mut() {
            h.set_src(a);
        }
    }

    pub fn set_dst_addr(&mut self, a: IpAddr) {
        if let Some(mut h) = self.ipv4_mut() {
            h.set_dst(a);
        } else if let Some(mut h) = self.ipv6_mut() {
            h.set_dst(a);
        }
    }

    pub fn ttl(&self) -> u8 {
        self.ipv4()
            .map(|h| h.ttl())
            .or_else(|| self.ipv6().map(|h| h.hop_limit()))
            .unwrap_or(0)
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        if let Some(mut h) = self.ipv4_mut() {
            h.set_ttl(ttl);
        } else if let Some(mut h) = self.ipv6_mut() {
            h.set_hop_limit(ttl);
        }
    }

    /// Recorded size of the network header (v6: extensions included).
    pub fn ip_hdr_len(&self) -> usize {
        match self.net {
            NetRec::Ip { len, .. } => len,
            _ => 0,
        }
    }

    /// Length of the upper-layer data according to the header fields.
    pub fn upper_layer_len(&self) -> Option<usize> {
        match self.net {
            NetRec::Ip { len, ver: IpVersion::V4, .. } => {
                let h = self.ipv4()?;
                (h.total_len() as usize).checked_sub(len)
            }
            NetRec::Ip { len, ver: IpVersion::V6, .. } => {
                let h = self.ipv6()?;
                let ext = len - Ipv6Hdr::<&[u8]>::SIZE;
                (h.payload_len() as usize).checked_sub(ext)
            }
            _ => None,
        }
    }

    /// Upper-layer protocol according to the network header, without
    /// needing the transport header parsed.
    pub fn ip_proto(&self) -> Option<IpProto> {
        match self.net {
            NetRec::Ip { ver: IpVersion::V4, .. } => self.ipv4().map(|h| h.proto()),
            NetRec::Ip { ver: IpVersion::V6, .. } => {
                self.ipv6_upper_proto().map(IpProto::from_u8)
            }
            _ => None,
        }
    }

    /// True when this packet carries (or claims to carry) an ICMP message;
    /// ICMP errors are never generated in response to these.
    pub fn carries_icmp(&self) -> bool {
        self.is_icmp()
            || matches!(self.ip_proto(), Some(IpProto::Icmp) | Some(IpProto::Icmpv6))
    }

    /// Terminal next-header value after the recorded v6 extension chain.
    pub fn ipv6_upper_proto(&self) -> Option<u8> {
        let NetRec::Ip { off, len, ver: IpVersion::V6 } = self.net else {
            return None;
        };
        let span = self.buf.span(off, len)?;
        let mut walk = ExtWalk::new(&span[Ipv6Hdr::<&[u8]>::SIZE..], span[6]);
        while let Ok(Some(_)) = walk.next_ext() {}
        Some(walk.upper_proto())
    }

    /// Fragment fields of either family, when present.
    pub fn frag_info(&self) -> Option<FragInfo> {
        match self.net {
            NetRec::Ip { ver: IpVersion::V4, .. } => {
                let h = self.ipv4()?;
                Some(FragInfo {
                    ident: u32::from(h.ident()),
                    offset: h.frag_offset(),
                    more: h.more_frags(),
                })
            }
            NetRec::Ip { off, len, ver: IpVersion::V6 } => {
                let span = self.buf.span(off, len)?;
                let mut walk = ExtWalk::new(&span[Ipv6Hdr::<&[u8]>::SIZE..], span[6]);
                while let Ok(Some(ext)) = walk.next_ext() {
                    if let ExtHdr::Fragment(frag) = ext {
                        return Some(FragInfo {
                            ident: frag.ident(),
                            offset: frag.frag_offset(),
                            more: frag.more_frags(),
                        });
                    }
                }
                None
            }
            _ => None,
        }
    }

    /// Overwrite the fragment fields of a header built with
    /// [`Packet::construct_ip_from`].
    pub fn set_frag_fields(&mut self, info: FragInfo) {
        match self.net {
            NetRec::Ip { ver: IpVersion::V4, .. } => {
                if let Some(mut h) = self.ipv4_mut() {
                    h.set_ident(info.ident as u16);
                    h.set_frag_offset(info.offset);
                    h.set_more_frags(info.more);
                }
            }
            NetRec::Ip { off, len, ver: IpVersion::V6 } => {
                let base = Ipv6Hdr::<&[u8]>::SIZE;
                if len < base + FragHdr::<&[u8]>::SIZE {
                    return;
                }
                if let Some(span) = self.buf.span_mut(off + base, FragHdr::<&[u8]>::SIZE) {
                    if let Ok(mut frag) = FragHdr::parse(span) {
                        frag.set_ident(info.ident);
                        frag.set_frag_offset(info.offset);
                        frag.set_more_frags(info.more);
                    }
                }
            }
            _ => {}
        }
    }

    // ---------------- transport layer ----------------

    pub fn read_icmp(&mut self, ver: IpVersion) -> Result<(), HdrError> {
        let off = self.buf.mask_off();
        let len = {
            let hdr = IcmpHdr::parse(self.buf.tail_at_mask(), ver)?;
            hdr.check_len()?;
            hdr.size()
        };
        self.tspt = TsptRec::Icmp { off, len, ver };
        self.buf.mask(len);
        Ok(())
    }

    pub fn construct_icmp(&mut self, ver: IpVersion, build: &IcmpBuild) -> Result<(), HdrError> {
        let size = build.size_hint();
        let off = self.construct_region(size)?;
        let (typ, code) = build.type_code(ver);
        let span = self.buf.span_mut(off, size).ok_or(HdrError::OutOfBounds)?;
        let mut hdr = IcmpHdr::construct(span, ver, typ, code, size)?;
        build.write_body(hdr.body_mut());
        self.tspt = TsptRec::Icmp { off, len: size, ver };
        Ok(())
    }

    pub fn icmp(&self) -> Option<IcmpHdr<&[u8]>> {
        match self.tspt {
            TsptRec::Icmp { off, len, ver } => IcmpHdr::parse(self.buf.span(off, len)?, ver).ok(),
            _ => None,
        }
    }

    pub fn icmp_mut(&mut self) -> Option<IcmpHdr<&mut [u8]>> {
        match self.tspt {
            TsptRec::Icmp { off, len, ver } => {
                IcmpHdr::parse(self.buf.span_mut(off, len)?, ver).ok()
            }
            _ => None,
        }
    }

    pub fn icmp_size(&self) -> usize {
        match self.tspt {
            TsptRec::Icmp { len, .. } => len,
            _ => 0,
        }
    }

    pub fn read_udp(&mut self) -> Result<(), HdrError> {
        let off = self.buf.mask_off();
        UdpHdr::parse(self.buf.tail_at_mask())?;
        self.tspt = TsptRec::Udp { off };
        self.buf.mask(UdpHdr::<&[u8]>::SIZE);
        Ok(())
    }

    pub fn construct_udp(&mut self) -> Result<(), HdrError> {
        let off = self.construct_region(UdpHdr::<&[u8]>::SIZE)?;
        let span = self
            .buf
            .span_mut(off, UdpHdr::<&[u8]>::SIZE)
            .ok_or(HdrError::OutOfBounds)?;
        UdpHdr::construct(span)?;
        self.tspt = TsptRec::Udp { off };
        Ok(())
    }

    pub fn udp(&self) -> Option<UdpHdr<&[u8]>> {
        match self.tspt {
            TsptRec::Udp { off } => UdpHdr::parse(self.buf.span(off, UdpHdr::<&[u8]>::SIZE)?).ok(),
            _ => None,
        }
    }

    pub fn udp_mut(&mut self) -> Option<UdpHdr<&mut [u8]>> {
        match self.tspt {
            TsptRec::Udp { off } => {
                UdpHdr::parse(self.buf.span_mut(off, UdpHdr::<&[u8]>::SIZE)?).ok()
            }
            _ => None,
        }
    }

    /// Drop the transport record (fragments carry raw payload).
    pub fn clear_tspt(&mut self) {
        self.tspt = TsptRec::None;
    }

    // ---------------- builders ----------------

    /// An ICMP packet addressed to `dst`, embedding `payload` (typically the
    /// offending datagram) after the message. The source is left for
    /// selection unless given.
    pub fn icmp_for(
        dst: IpAddr,
        build: &IcmpBuild,
        payload: Option<&Buf>,
        src: Option<IpAddr>,
    ) -> Result<Packet, HdrError> {
        let mut p = Packet::new();
        p.reserve_headers();
        if let Some(payload) = payload {
            // chunks are shared, not copied
            p.buf
                .insert(payload, 0, usize::MAX)
                .map_err(|_| HdrError::OutOfBounds)?;
        }
        let ver = dst.version();
        p.construct_icmp(ver, build)?;
        p.buf.unmask(p.icmp_size());
        let proto = match ver {
            IpVersion::V4 => IpProto::Icmp,
            IpVersion::V6 => IpProto::Icmpv6,
        };
        p.construct_ip(ver, proto, false)?;
        p.set_dst_addr(dst);
        if let Some(src) = src {
            p.set_src_addr(src);
        }
        Ok(p)
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("iface", &self.iface)
            .field("link", &self.link)
            .field("net", &self.net)
            .field("tspt", &self.tspt)
            .field("local", &self.local)
            .field("forwarded", &self.forwarded)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construct_then_read_round_trip() {
        let mut p = Packet::with_payload_size(4);
        p.buf_mut().fill(0xab);
        p.construct_udp().unwrap();
        {
            let mut udp = p.udp_mut().unwrap();
            udp.set_src_port(5000);
            udp.set_dst_port(7);
        }
        p.buf_mut().unmask(UdpHdr::<&[u8]>::SIZE);
        let mut udp = p.udp_mut().unwrap();
        udp.set_length(12);

        p.construct_ip(IpVersion::V4, IpProto::Udp, false).unwrap();
        p.set_src_addr("10.0.0.2".parse().unwrap());
        p.set_dst_addr("10.0.0.3".parse().unwrap());
        assert_eq!(p.len(), 12);
        assert_eq!(p.ip_hdr_len(), 20);

        // expose the IP header and re-read it like ingress would
        {
            let mut v4 = p.ipv4_mut().unwrap();
            v4.set_total_len(32);
            v4.set_ttl(64);
            v4.fill_checksum();
        }
        let ip_hdr_len = p.ip_hdr_len();
        p.buf_mut().unmask(ip_hdr_len);

        let mut q = Packet::from_frame(p.buf().to_contiguous());
        q.read_ip(IpVersion::V4).unwrap();
        assert_eq!(q.src_addr(), "10.0.0.2".parse().unwrap());
        assert_eq!(q.dst_addr(), "10.0.0.3".parse().unwrap());
        assert_eq!(q.upper_layer_len(), Some(12));
        q.read_udp().unwrap();
        assert_eq!(q.udp().unwrap().dst_port(), 7);
        assert_eq!(q.buf().to_vec(), vec![0xab; 4]);
    }

    #[test]
    fn failed_read_does_not_advance_mask() {
        let mut p = Packet::from_frame(Buf::copy_from(&[0u8; 6]));
        let before = p.buf().mask_off();
        assert!(p.read_eth().is_err());
        assert_eq!(p.buf().mask_off(), before);
        assert!(p.eth().is_none());
    }

    #[test]
    fn icmp_for_embeds_payload() {
        use crate::wire::icmp::{IcmpBuild, TimeExceededKind};
        let payload = Buf::copy_from(&[1, 2, 3, 4]);
        let p = Packet::icmp_for(
            "10.0.0.3".parse().unwrap(),
            &IcmpBuild::TimeExceeded(TimeExceededKind::Reassembly),
            Some(&payload),
            Some("10.0.0.2".parse().unwrap()),
        )
        .unwrap();
        assert!(p.is_ip());
        assert!(p.is_icmp());
        assert_eq!(p.dst_addr(), "10.0.0.3".parse().unwrap());
        assert_eq!(p.src_addr(), "10.0.0.2".parse().unwrap());
        // unmasked: ICMP head+body plus the embedded bytes
        assert_eq!(p.len(), 8 + 4);
    }

    #[test]
    fn frag_fields_v6() {
        let mut base = Packet::with_payload_size(0);
        base.construct_ip(IpVersion::V6, IpProto::Udp, false).unwrap();
        let mut frag = Packet::with_payload_size(0);
        frag.construct_ip_from(&base, true).unwrap();
        frag.set_frag_fields(FragInfo { ident: 0xdead_beef, offset: 1280, more: true });
        let info = frag.frag_info().unwrap();
        assert_eq!(info, FragInfo { ident: 0xdead_beef, offset: 1280, more: true });
        assert_eq!(frag.ipv6_upper_proto(), Some(17));
    }
}

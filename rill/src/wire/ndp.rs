//! Neighbor Discovery message bodies and option TLVs (ICMPv6 types 133-136).
//!
//! Offsets here are relative to the message body, i.e. after the 4-byte
//! ICMP head. Options are 8-byte-unit TLVs; iteration stops at the first
//! zero-length or truncated option.

use crate::buf::cursor::{get_array, get_flag, get_u16, get_u32, get_u8, put_array, put_flag, put_u8};
use crate::wire::addr::{HwAddr, IpAddr};

pub const OPT_SOURCE_LL: u8 = 1;
pub const OPT_TARGET_LL: u8 = 2;
pub const OPT_PREFIX_INFO: u8 = 3;
pub const OPT_MTU: u8 = 5;

/// Target address of a Neighbor Solicitation/Advertisement body.
pub fn target(body: &[u8]) -> IpAddr {
    IpAddr(get_array(body, 4))
}

/// Total length of the valid option TLVs at the head of `bytes`.
pub fn options_len(bytes: &[u8]) -> usize {
    let mut used = 0;
    while bytes.len() - used >= 2 {
        let len = usize::from(bytes[used + 1]) * 8;
        if len == 0 || used + len > bytes.len() {
            break;
        }
        used += len;
    }
    used
}

/// A parsed NDP option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NdpOption<'a> {
    SourceLinkAddr(HwAddr),
    TargetLinkAddr(HwAddr),
    PrefixInfo(PrefixInfo<'a>),
    Mtu(u32),
    Unknown { typ: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixInfo<'a> {
    bytes: &'a [u8],
}

impl<'a> PrefixInfo<'a> {
    pub fn prefix_len(&self) -> u8 {
        get_u8(self.bytes, 2)
    }

    pub fn on_link(&self) -> bool {
        get_flag(self.bytes, 24)
    }

    pub fn autonomous(&self) -> bool {
        get_flag(self.bytes, 25)
    }

    pub fn valid_lifetime(&self) -> u32 {
        get_u32(self.bytes, 4)
    }

    pub fn preferred_lifetime(&self) -> u32 {
        get_u32(self.bytes, 8)
    }

    pub fn prefix(&self) -> IpAddr {
        IpAddr(get_array(self.bytes, 16))
    }
}

#[derive(Clone)]
pub struct NdpOptionsIter<'a> {
    bytes: &'a [u8],
}

impl<'a> NdpOptionsIter<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        NdpOptionsIter { bytes }
    }

    /// First source link-layer address option, if any.
    pub fn source_ll(self) -> Option<HwAddr> {
        self.filter_map(|o| match o {
            NdpOption::SourceLinkAddr(a) => Some(a),
            _ => None,
        })
        .next()
    }

    /// First target link-layer address option, if any.
    pub fn target_ll(self) -> Option<HwAddr> {
        self.filter_map(|o| match o {
            NdpOption::TargetLinkAddr(a) => Some(a),
            _ => None,
        })
        .next()
    }
}

impl<'a> Iterator for NdpOptionsIter<'a> {
    type Item = NdpOption<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.bytes.len() < 2 {
            return None;
        }
        let typ = self.bytes[0];
        let len = usize::from(self.bytes[1]) * 8;
        if len == 0 || len > self.bytes.len() {
            self.bytes = &[];
            return None;
        }
        let opt_bytes = &self.bytes[..len];
        self.bytes = &self.bytes[len..];
        Some(match typ {
            OPT_SOURCE_LL if len == 8 => NdpOption::SourceLinkAddr(HwAddr(get_array(opt_bytes, 2))),
            OPT_TARGET_LL if len == 8 => NdpOption::TargetLinkAddr(HwAddr(get_array(opt_bytes, 2))),
            OPT_PREFIX_INFO if len == 32 => NdpOption::PrefixInfo(PrefixInfo { bytes: opt_bytes }),
            OPT_MTU if len == 8 => NdpOption::Mtu(get_u32(opt_bytes, 4)),
            _ => NdpOption::Unknown { typ },
        })
    }
}

/// Router Advertisement body view.
pub struct RouterAdvert<'a> {
    body: &'a [u8],
}

impl<'a> RouterAdvert<'a> {
    pub const FIXED_SIZE: usize = 12;

    pub fn new(body: &'a [u8]) -> Self {
        RouterAdvert { body }
    }

    pub fn cur_hop_limit(&self) -> u8 {
        get_u8(self.body, 0)
    }

    pub fn managed(&self) -> bool {
        get_flag(self.body, 8)
    }

    pub fn other_conf(&self) -> bool {
        get_flag(self.body, 9)
    }

    pub fn router_lifetime(&self) -> u16 {
        get_u16(self.body, 2)
    }

    pub fn reachable_time_ms(&self) -> u32 {
        get_u32(self.body, 4)
    }

    pub fn retrans_timer_ms(&self) -> u32 {
        get_u32(self.body, 8)
    }

    pub fn options(&self) -> NdpOptionsIter<'a> {
        NdpOptionsIter::new(&self.body[Self::FIXED_SIZE.min(self.body.len())..])
    }
}

/// Neighbor Advertisement body view.
pub struct NeighborAdvert<'a> {
    body: &'a [u8],
}

impl<'a> NeighborAdvert<'a> {
    pub const FIXED_SIZE: usize = 20;

    pub fn new(body: &'a [u8]) -> Self {
        NeighborAdvert { body }
    }

    pub fn router(&self) -> bool {
        get_flag(self.body, 0)
    }

    pub fn solicited(&self) -> bool {
        get_flag(self.body, 1)
    }

    pub fn override_flag(&self) -> bool {
        get_flag(self.body, 2)
    }

    pub fn target(&self) -> IpAddr {
        target(self.body)
    }

    pub fn options(&self) -> NdpOptionsIter<'a> {
        NdpOptionsIter::new(&self.body[Self::FIXED_SIZE.min(self.body.len())..])
    }
}

// ------------------------------------------------------------------
// body writers, used when the stack builds NDP messages
// ------------------------------------------------------------------

/// Body size of an NS/NA with an optional link-layer address option.
pub fn neighbor_body_size(with_ll: bool) -> usize {
    20 + if with_ll { 8 } else { 0 }
}

/// Body size of a Router Solicitation with an optional source option.
pub fn router_solicit_body_size(with_ll: bool) -> usize {
    4 + if with_ll { 8 } else { 0 }
}

pub fn write_neighbor_solicit(body: &mut [u8], target: IpAddr, source_ll: Option<HwAddr>) {
    put_array(body, 4, target.octets());
    if let Some(ll) = source_ll {
        write_ll_option(&mut body[20..], OPT_SOURCE_LL, ll);
    }
}

pub fn write_neighbor_advert(
    body: &mut [u8],
    target: IpAddr,
    router: bool,
    solicited: bool,
    override_flag: bool,
    target_ll: Option<HwAddr>,
) {
    put_flag(body, 0, router);
    put_flag(body, 1, solicited);
    put_flag(body, 2, override_flag);
    put_array(body, 4, target.octets());
    if let Some(ll) = target_ll {
        write_ll_option(&mut body[20..], OPT_TARGET_LL, ll);
    }
}

pub fn write_router_solicit(body: &mut [u8], source_ll: Option<HwAddr>) {
    if let Some(ll) = source_ll {
        write_ll_option(&mut body[4..], OPT_SOURCE_LL, ll);
    }
}

fn write_ll_option(bytes: &mut [u8], typ: u8, addr: HwAddr) {
    put_u8(bytes, 0, typ);
    put_u8(bytes, 1, 1);
    put_array(bytes, 2, addr.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbor_solicit_round_trip() {
        let target: IpAddr = "fe80::a0:4ff:fed3:11".parse().unwrap();
        let ll = HwAddr([2, 0xaa, 0, 0, 0, 1]);
        let mut body = vec![0u8; neighbor_body_size(true)];
        write_neighbor_solicit(&mut body, target, Some(ll));

        assert_eq!(super::target(&body), target);
        assert_eq!(options_len(&body[20..]), 8);
        assert_eq!(NdpOptionsIter::new(&body[20..]).source_ll(), Some(ll));
    }

    #[test]
    fn advert_flags() {
        let target: IpAddr = "fe80::1".parse().unwrap();
        let mut body = vec![0u8; neighbor_body_size(false)];
        write_neighbor_advert(&mut body, target, false, true, true, None);
        let na = NeighborAdvert::new(&body);
        assert!(!na.router());
        assert!(na.solicited());
        assert!(na.override_flag());
        assert_eq!(na.target(), target);
        assert_eq!(na.options().count(), 0);
    }

    #[test]
    fn options_stop_at_zero_length() {
        let bytes = [OPT_SOURCE_LL, 1, 1, 2, 3, 4, 5, 6, OPT_MTU, 0, 0, 0];
        assert_eq!(options_len(&bytes), 8);
        let opts: Vec<_> = NdpOptionsIter::new(&bytes).collect();
        assert_eq!(opts.len(), 1);
    }

    #[test]
    fn prefix_info_layout() {
        let mut opt = [0u8; 32];
        opt[0] = OPT_PREFIX_INFO;
        opt[1] = 4;
        opt[2] = 64; // prefix length
        opt[3] = 0x40; // autonomous
        opt[4..8].copy_from_slice(&2_592_000u32.to_be_bytes());
        opt[8..12].copy_from_slice(&604_800u32.to_be_bytes());
        opt[16] = 0x20;
        opt[17] = 0x01;

        let Some(NdpOption::PrefixInfo(pi)) = NdpOptionsIter::new(&opt).next() else {
            panic!("expected prefix info");
        };
        assert_eq!(pi.prefix_len(), 64);
        assert!(pi.autonomous());
        assert!(!pi.on_link());
        assert_eq!(pi.valid_lifetime(), 2_592_000);
        assert_eq!(pi.preferred_lifetime(), 604_800);
        assert_eq!(pi.prefix().octets()[..2], [0x20, 0x01]);
    }
}

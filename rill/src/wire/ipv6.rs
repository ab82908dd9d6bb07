//! IPv6 header, Hop-by-Hop options and the Fragment extension.

use crate::buf::cursor::{
    get_array, get_bits, get_flag, get_u16, get_u32, get_u8, put_array, put_bits, put_flag,
    put_u16, put_u32, put_u8,
};
use crate::wire::addr::IpAddr;
use crate::wire::HdrError;

pub const NH_HOP_BY_HOP: u8 = 0;
pub const NH_FRAGMENT: u8 = 44;
pub const HBH_OPT_PAD1: u8 = 0;
pub const HBH_OPT_PADN: u8 = 1;
pub const HBH_OPT_ROUTER_ALERT: u8 = 5;

/// IPv6 base header (40 bytes). Extension headers follow and are visited
/// with [`ExtWalk`].
#[derive(Debug)]
pub struct Ipv6Hdr<T: AsRef<[u8]>> {
    buf: T,
}

impl<T: AsRef<[u8]>> Ipv6Hdr<T> {
    pub const SIZE: usize = 40;

    pub fn size_hint(ext_len: usize) -> usize {
        Self::SIZE + ext_len
    }

    pub fn parse(buf: T) -> Result<Self, HdrError> {
        if buf.as_ref().len() < Self::SIZE {
            return Err(HdrError::OutOfBounds);
        }
        let hdr = Ipv6Hdr { buf };
        if hdr.version() != 6 {
            return Err(HdrError::BadVersion);
        }
        Ok(hdr)
    }

    pub fn version(&self) -> u8 {
        get_bits(self.buf.as_ref(), 0, 4) as u8
    }

    pub fn traffic_class(&self) -> u8 {
        get_bits(self.buf.as_ref(), 4, 8) as u8
    }

    pub fn flow_label(&self) -> u32 {
        get_bits(self.buf.as_ref(), 12, 20)
    }

    pub fn payload_len(&self) -> u16 {
        get_u16(self.buf.as_ref(), 4)
    }

    pub fn next_header(&self) -> u8 {
        get_u8(self.buf.as_ref(), 6)
    }

    pub fn hop_limit(&self) -> u8 {
        get_u8(self.buf.as_ref(), 7)
    }

    pub fn src(&self) -> IpAddr {
        IpAddr(get_array(self.buf.as_ref(), 8))
    }

    pub fn dst(&self) -> IpAddr {
        IpAddr(get_array(self.buf.as_ref(), 24))
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Ipv6Hdr<T> {
    pub fn construct(mut buf: T, ext_len: usize) -> Result<Self, HdrError> {
        if buf.as_mut().len() < Self::SIZE + ext_len {
            return Err(HdrError::OutOfBounds);
        }
        let b = buf.as_mut();
        b[..Self::SIZE + ext_len].fill(0);
        put_bits(b, 0, 4, 6);
        Ok(Ipv6Hdr { buf })
    }

    /// Copy `base`'s fixed header, collapsing its extension chain: the new
    /// header's next-header is the terminal upper-layer protocol of `base`.
    /// With `frag_ext`, a Fragment extension is appended instead and chained
    /// in front of that protocol.
    pub fn construct_from(
        mut buf: T,
        base: &Ipv6Hdr<&[u8]>,
        terminal_nh: u8,
        frag_ext: bool,
    ) -> Result<Self, HdrError> {
        let total = Self::SIZE + if frag_ext { FragHdr::<&[u8]>::SIZE } else { 0 };
        if buf.as_mut().len() < total {
            return Err(HdrError::OutOfBounds);
        }
        let b = buf.as_mut();
        b[..Self::SIZE].copy_from_slice(&base.buf.as_ref()[..Self::SIZE]);
        put_u16(b, 4, 0);
        put_u8(b, 6, terminal_nh);
        if frag_ext {
            put_u8(b, 6, NH_FRAGMENT);
            b[Self::SIZE..total].fill(0);
            put_u8(b, Self::SIZE, terminal_nh);
        }
        Ok(Ipv6Hdr { buf })
    }

    /// Fresh header for `proto`, optionally preceded by a Hop-by-Hop block
    /// carrying the Router Alert option.
    pub fn construct_proto(buf: T, proto: u8, router_alert: bool) -> Result<Self, HdrError> {
        let ext = if router_alert { 8 } else { 0 };
        let mut hdr = Self::construct(buf, ext)?;
        let b = hdr.buf.as_mut();
        if router_alert {
            put_u8(b, 6, NH_HOP_BY_HOP);
            put_u8(b, Self::SIZE, proto);
            put_u8(b, Self::SIZE + 1, 0); // 8 bytes of options total
            put_u8(b, Self::SIZE + 2, HBH_OPT_ROUTER_ALERT);
            put_u8(b, Self::SIZE + 3, 2);
            put_u16(b, Self::SIZE + 4, 0);
            put_u8(b, Self::SIZE + 6, HBH_OPT_PADN);
            put_u8(b, Self::SIZE + 7, 0);
        } else {
            put_u8(b, 6, proto);
        }
        Ok(hdr)
    }

    pub fn set_payload_len(&mut self, v: u16) {
        put_u16(self.buf.as_mut(), 4, v);
    }

    pub fn set_next_header(&mut self, v: u8) {
        put_u8(self.buf.as_mut(), 6, v);
    }

    pub fn set_hop_limit(&mut self, v: u8) {
        put_u8(self.buf.as_mut(), 7, v);
    }

    pub fn set_traffic_class(&mut self, v: u8) {
        put_bits(self.buf.as_mut(), 4, 8, v.into());
    }

    pub fn set_src(&mut self, a: IpAddr) {
        put_array(self.buf.as_mut(), 8, a.octets());
    }

    pub fn set_dst(&mut self, a: IpAddr) {
        put_array(self.buf.as_mut(), 24, a.octets());
    }
}

/// Fragment extension header (8 bytes).
pub struct FragHdr<T: AsRef<[u8]>> {
    buf: T,
}

impl<T: AsRef<[u8]>> FragHdr<T> {
    pub const SIZE: usize = 8;

    pub fn parse(buf: T) -> Result<Self, HdrError> {
        if buf.as_ref().len() < Self::SIZE {
            return Err(HdrError::OutOfBounds);
        }
        Ok(FragHdr { buf })
    }

    pub fn next_header(&self) -> u8 {
        get_u8(self.buf.as_ref(), 0)
    }

    /// Fragment offset in bytes (stored in 8-byte units).
    pub fn frag_offset(&self) -> u16 {
        (get_bits(self.buf.as_ref(), 16, 13) * 8) as u16
    }

    pub fn more_frags(&self) -> bool {
        get_flag(self.buf.as_ref(), 31)
    }

    pub fn ident(&self) -> u32 {
        get_u32(self.buf.as_ref(), 4)
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> FragHdr<T> {
    pub fn set_frag_offset(&mut self, bytes: u16) {
        debug_assert!(bytes % 8 == 0);
        put_bits(self.buf.as_mut(), 16, 13, u32::from(bytes) / 8);
    }

    pub fn set_more_frags(&mut self, v: bool) {
        put_flag(self.buf.as_mut(), 31, v);
    }

    pub fn set_ident(&mut self, v: u32) {
        put_u32(self.buf.as_mut(), 4, v);
    }
}

/// One recognized extension header.
pub enum ExtHdr<'a> {
    HopByHop(HbhOptionsIter<'a>),
    Fragment(FragHdr<&'a [u8]>),
}

/// Walks the extension chain that follows a base header. Stops at the first
/// next-header value that is not a recognized extension; that value is the
/// upper-layer protocol.
pub struct ExtWalk<'a> {
    bytes: &'a [u8],
    next_header: u8,
    consumed: usize,
}

impl<'a> ExtWalk<'a> {
    /// `bytes` is everything following the 40-byte base header.
    pub fn new(bytes: &'a [u8], first_nh: u8) -> Self {
        ExtWalk { bytes, next_header: first_nh, consumed: 0 }
    }

    pub fn upper_proto(&self) -> u8 {
        self.next_header
    }

    /// Bytes of extension headers consumed so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn next_ext(&mut self) -> Result<Option<ExtHdr<'a>>, HdrError> {
        match self.next_header {
            NH_HOP_BY_HOP => {
                let rest = &self.bytes[self.consumed..];
                if rest.len() < 8 {
                    return Err(HdrError::OutOfBounds);
                }
                let len = 8 + usize::from(rest[1]) * 8;
                if rest.len() < len {
                    return Err(HdrError::OutOfBounds);
                }
                self.next_header = rest[0];
                self.consumed += len;
                Ok(Some(ExtHdr::HopByHop(HbhOptionsIter { bytes: &rest[2..len] })))
            }
            NH_FRAGMENT => {
                let rest = &self.bytes[self.consumed..];
                let frag = FragHdr::parse(rest.get(..FragHdr::<&[u8]>::SIZE).ok_or(HdrError::OutOfBounds)?)?;
                self.next_header = frag.next_header();
                self.consumed += FragHdr::<&[u8]>::SIZE;
                Ok(Some(ExtHdr::Fragment(frag)))
            }
            _ => Ok(None),
        }
    }
}

/// A scanned Hop-by-Hop option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HbhOption {
    Pad,
    RouterAlert(u16),
    Other { typ: u8 },
}

impl HbhOption {
    /// Top two bits of the option type: nonzero means the packet must be
    /// discarded when the option is unknown.
    pub fn must_discard_unknown(typ: u8) -> bool {
        typ >> 6 != 0
    }
}

pub struct HbhOptionsIter<'a> {
    bytes: &'a [u8],
}

impl<'a> Iterator for HbhOptionsIter<'a> {
    type Item = Result<HbhOption, HdrError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (&typ, rest) = self.bytes.split_first()?;
        if typ == HBH_OPT_PAD1 {
            self.bytes = rest;
            return Some(Ok(HbhOption::Pad));
        }
        let Some(&dlen) = rest.first() else {
            self.bytes = &[];
            return Some(Err(HdrError::OutOfBounds));
        };
        let total = 2 + usize::from(dlen);
        if total > self.bytes.len() {
            self.bytes = &[];
            return Some(Err(HdrError::OutOfBounds));
        }
        let opt = match typ {
            HBH_OPT_PADN => HbhOption::Pad,
            HBH_OPT_ROUTER_ALERT if dlen == 2 => HbhOption::RouterAlert(get_u16(self.bytes, 2)),
            _ => HbhOption::Other { typ },
        };
        self.bytes = &self.bytes[total..];
        Some(Ok(opt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_round_trip() {
        let mut raw = [0u8; 40];
        let mut hdr = Ipv6Hdr::construct(&mut raw[..], 0).unwrap();
        hdr.set_payload_len(128);
        hdr.set_next_header(17);
        hdr.set_hop_limit(64);
        hdr.set_src("fe80::1".parse().unwrap());
        hdr.set_dst("ff02::1".parse().unwrap());
        assert_eq!(raw[0], 0x60);

        let hdr = Ipv6Hdr::parse(&raw[..]).unwrap();
        assert_eq!(hdr.payload_len(), 128);
        assert_eq!(hdr.next_header(), 17);
        assert_eq!(hdr.hop_limit(), 64);
        assert_eq!(hdr.src(), "fe80::1".parse().unwrap());
    }

    #[test]
    fn bad_version_rejected() {
        let raw = [0x45u8; 40];
        assert_eq!(Ipv6Hdr::parse(&raw[..]).unwrap_err(), HdrError::BadVersion);
    }

    #[test]
    fn router_alert_block() {
        let mut raw = [0u8; 48];
        Ipv6Hdr::construct_proto(&mut raw[..], 58, true).unwrap();
        let hdr = Ipv6Hdr::parse(&raw[..]).unwrap();
        assert_eq!(hdr.next_header(), NH_HOP_BY_HOP);

        let mut walk = ExtWalk::new(&raw[40..], hdr.next_header());
        let Some(ExtHdr::HopByHop(opts)) = walk.next_ext().unwrap() else {
            panic!("expected hop-by-hop block");
        };
        let opts: Vec<_> = opts.collect::<Result<_, _>>().unwrap();
        assert!(opts.contains(&HbhOption::RouterAlert(0)));
        assert!(walk.next_ext().unwrap().is_none());
        assert_eq!(walk.upper_proto(), 58);
        assert_eq!(walk.consumed(), 8);
    }

    #[test]
    fn fragment_chain() {
        let mut raw = [0u8; 48];
        let base = {
            let mut tmp = [0u8; 40];
            let mut h = Ipv6Hdr::construct(&mut tmp[..], 0).unwrap();
            h.set_next_header(17);
            h.set_hop_limit(64);
            tmp
        };
        let base_hdr = Ipv6Hdr::parse(&base[..]).unwrap();
        Ipv6Hdr::construct_from(&mut raw[..], &base_hdr, 17, true).unwrap();
        {
            let mut frag = FragHdr::parse(&mut raw[40..48]).unwrap();
            frag.set_frag_offset(1280);
            frag.set_more_frags(true);
            frag.set_ident(0xabcd);
        }

        let hdr = Ipv6Hdr::parse(&raw[..]).unwrap();
        assert_eq!(hdr.next_header(), NH_FRAGMENT);
        let mut walk = ExtWalk::new(&raw[40..], hdr.next_header());
        let Some(ExtHdr::Fragment(frag)) = walk.next_ext().unwrap() else {
            panic!("expected fragment header");
        };
        assert_eq!(frag.frag_offset(), 1280);
        assert!(frag.more_frags());
        assert_eq!(frag.ident(), 0xabcd);
        assert_eq!(walk.upper_proto(), 17);
    }
}

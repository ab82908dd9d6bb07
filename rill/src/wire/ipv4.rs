//! IPv4 header, fragment fields and options.

use crate::buf::cursor::{
    get_array, get_bits, get_flag, get_u16, get_u8, put_array, put_bits, put_flag, put_u16, put_u8,
};
use crate::wire::addr::IpAddr;
use crate::wire::checksum::checksum;
use crate::wire::{HdrError, IpProto};

pub const ROUTER_ALERT_TYPE: u8 = 0x94; // copied | control | number 20

/// IPv4 header view; options run from byte 20 to `header_len()`.
#[derive(Debug)]
pub struct Ipv4Hdr<T: AsRef<[u8]>> {
    buf: T,
}

impl<T: AsRef<[u8]>> Ipv4Hdr<T> {
    pub const MIN_SIZE: usize = 20;

    pub fn size_hint(opts_len: usize) -> usize {
        Self::MIN_SIZE + opts_len
    }

    /// View over bytes already known to hold a v4 header, e.g. one the
    /// stack constructed itself and is still editing (checksum not yet
    /// valid).
    pub fn new_unchecked(buf: T) -> Self {
        Ipv4Hdr { buf }
    }

    /// Validate bounds, version, header length and checksum.
    pub fn parse(buf: T) -> Result<Self, HdrError> {
        let b = buf.as_ref();
        if b.len() < Self::MIN_SIZE {
            return Err(HdrError::OutOfBounds);
        }
        let hdr = Ipv4Hdr { buf };
        if hdr.version() != 4 {
            return Err(HdrError::BadVersion);
        }
        let hlen = hdr.header_len();
        if hlen < Self::MIN_SIZE || hlen > hdr.buf.as_ref().len() {
            return Err(HdrError::OutOfBounds);
        }
        if checksum(&hdr.buf.as_ref()[..hlen]) != 0 {
            return Err(HdrError::ChecksumError);
        }
        Ok(hdr)
    }

    pub fn version(&self) -> u8 {
        get_bits(self.buf.as_ref(), 0, 4) as u8
    }

    pub fn header_len(&self) -> usize {
        get_bits(self.buf.as_ref(), 4, 4) as usize * 4
    }

    pub fn dscp(&self) -> u8 {
        get_bits(self.buf.as_ref(), 8, 6) as u8
    }

    pub fn ecn(&self) -> u8 {
        get_bits(self.buf.as_ref(), 14, 2) as u8
    }

    pub fn total_len(&self) -> u16 {
        get_u16(self.buf.as_ref(), 2)
    }

    pub fn ident(&self) -> u16 {
        get_u16(self.buf.as_ref(), 4)
    }

    pub fn dont_frag(&self) -> bool {
        get_flag(self.buf.as_ref(), 17)
    }

    pub fn more_frags(&self) -> bool {
        get_flag(self.buf.as_ref(), 18)
    }

    /// Fragment offset in bytes (stored in 8-byte units).
    pub fn frag_offset(&self) -> u16 {
        (get_bits(self.buf.as_ref(), 19, 13) * 8) as u16
    }

    pub fn is_fragment(&self) -> bool {
        self.more_frags() || self.frag_offset() > 0
    }

    pub fn ttl(&self) -> u8 {
        get_u8(self.buf.as_ref(), 8)
    }

    pub fn proto(&self) -> IpProto {
        IpProto::from_u8(get_u8(self.buf.as_ref(), 9))
    }

    pub fn checksum_field(&self) -> u16 {
        get_u16(self.buf.as_ref(), 10)
    }

    pub fn src(&self) -> IpAddr {
        IpAddr::from_v4(get_array(self.buf.as_ref(), 12))
    }

    pub fn dst(&self) -> IpAddr {
        IpAddr::from_v4(get_array(self.buf.as_ref(), 16))
    }

    pub fn options(&self) -> Ipv4OptionsIter<'_> {
        Ipv4OptionsIter {
            bytes: &self.buf.as_ref()[Self::MIN_SIZE..self.header_len()],
        }
    }

    /// True when an option other than Router Alert carries the copied flag.
    /// Such options would have to be replicated into every fragment, which
    /// this stack does not do.
    pub fn has_copied_options(&self) -> bool {
        self.options().any(|o| match o {
            Ok(Ipv4Option::Other { typ, .. }) => typ & 0x80 != 0,
            _ => false,
        })
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Ipv4Hdr<T> {
    /// Zero the region and write version and header length for
    /// `opts_len` bytes of options.
    pub fn construct(mut buf: T, opts_len: usize) -> Result<Self, HdrError> {
        let total = Self::size_hint(opts_len);
        if buf.as_mut().len() < total || total / 4 > 15 {
            return Err(HdrError::OutOfBounds);
        }
        let b = buf.as_mut();
        b[..total].fill(0);
        put_bits(b, 0, 4, 4);
        put_bits(b, 4, 4, (total / 4) as u32);
        Ok(Ipv4Hdr { buf })
    }

    /// Start from a copy of `base`'s fixed header. Options are not copied;
    /// a base carrying copy-mandatory options is refused.
    pub fn construct_from(mut buf: T, base: &Ipv4Hdr<&[u8]>) -> Result<Self, HdrError> {
        if buf.as_mut().len() < Self::MIN_SIZE {
            return Err(HdrError::OutOfBounds);
        }
        if base.has_copied_options() {
            return Err(HdrError::CannotCopyOption);
        }
        let b = buf.as_mut();
        b[..Self::MIN_SIZE].copy_from_slice(&base.buf.as_ref()[..Self::MIN_SIZE]);
        put_bits(b, 4, 4, (Self::MIN_SIZE / 4) as u32);
        put_u16(b, 10, 0);
        Ok(Ipv4Hdr { buf })
    }

    pub fn set_dscp(&mut self, v: u8) {
        put_bits(self.buf.as_mut(), 8, 6, v.into());
    }

    pub fn set_ecn(&mut self, v: u8) {
        put_bits(self.buf.as_mut(), 14, 2, v.into());
    }

    pub fn set_total_len(&mut self, v: u16) {
        put_u16(self.buf.as_mut(), 2, v);
    }

    pub fn set_ident(&mut self, v: u16) {
        put_u16(self.buf.as_mut(), 4, v);
    }

    pub fn set_dont_frag(&mut self, v: bool) {
        put_flag(self.buf.as_mut(), 17, v);
    }

    pub fn set_more_frags(&mut self, v: bool) {
        put_flag(self.buf.as_mut(), 18, v);
    }

    pub fn set_frag_offset(&mut self, bytes: u16) {
        debug_assert!(bytes % 8 == 0);
        put_bits(self.buf.as_mut(), 19, 13, u32::from(bytes) / 8);
    }

    pub fn set_ttl(&mut self, v: u8) {
        put_u8(self.buf.as_mut(), 8, v);
    }

    pub fn set_proto(&mut self, p: IpProto) {
        put_u8(self.buf.as_mut(), 9, p.to_u8());
    }

    pub fn set_src(&mut self, a: IpAddr) {
        put_array(self.buf.as_mut(), 12, a.v4());
    }

    pub fn set_dst(&mut self, a: IpAddr) {
        put_array(self.buf.as_mut(), 16, a.v4());
    }

    /// Write the Router Alert option into the first four option bytes.
    pub fn write_router_alert(&mut self) {
        debug_assert!(self.header_len() >= Self::MIN_SIZE + 4);
        let b = self.buf.as_mut();
        put_u8(b, 20, ROUTER_ALERT_TYPE);
        put_u8(b, 21, 4);
        put_u16(b, 22, 0);
    }

    /// Recompute the header checksum; done last when finalizing.
    pub fn fill_checksum(&mut self) {
        let hlen = self.header_len();
        put_u16(self.buf.as_mut(), 10, 0);
        let sum = checksum(&self.buf.as_ref()[..hlen]);
        put_u16(self.buf.as_mut(), 10, sum);
    }
}

/// A scanned IPv4 option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4Option {
    Nop,
    RouterAlert(u16),
    Other { typ: u8, len: u8 },
}

pub struct Ipv4OptionsIter<'a> {
    bytes: &'a [u8],
}

impl<'a> Iterator for Ipv4OptionsIter<'a> {
    type Item = Result<Ipv4Option, HdrError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (&typ, rest) = self.bytes.split_first()?;
        match typ {
            0 => None, // end of options
            1 => {
                self.bytes = rest;
                Some(Ok(Ipv4Option::Nop))
            }
            _ => {
                let Some(&len) = rest.first() else {
                    self.bytes = &[];
                    return Some(Err(HdrError::OutOfBounds));
                };
                if usize::from(len) < 2 || usize::from(len) > self.bytes.len() {
                    self.bytes = &[];
                    return Some(Err(HdrError::OutOfBounds));
                }
                let opt = if typ == ROUTER_ALERT_TYPE && len == 4 {
                    Ipv4Option::RouterAlert(get_u16(self.bytes, 2))
                } else {
                    Ipv4Option::Other { typ, len }
                };
                self.bytes = &self.bytes[usize::from(len)..];
                Some(Ok(opt))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_matches_wire_format() {
        let mut raw = [0u8; 20];
        let mut hdr = Ipv4Hdr::construct(&mut raw[..], 0).unwrap();
        hdr.set_dscp(4);
        hdr.set_ecn(1);
        hdr.set_total_len(20);
        hdr.set_ident(0x33cb);
        hdr.set_more_frags(true);
        hdr.set_frag_offset(1480);
        hdr.set_ttl(128);
        hdr.set_proto(IpProto::Udp);
        hdr.set_src("192.168.1.10".parse().unwrap());
        hdr.set_dst("192.168.1.1".parse().unwrap());
        hdr.fill_checksum();

        assert_eq!(
            raw,
            [
                0x45, 0x11, 0x00, 0x14, 0x33, 0xcb, 0x20, 0xb9, 0x80, 0x11, 0x62, 0xe8, 0xc0,
                0xa8, 0x01, 0x0a, 0xc0, 0xa8, 0x01, 0x01
            ]
        );

        let hdr = Ipv4Hdr::parse(&raw[..]).unwrap();
        assert_eq!(hdr.dscp(), 4);
        assert_eq!(hdr.ecn(), 1);
        assert_eq!(hdr.ident(), 0x33cb);
        assert!(!hdr.dont_frag());
        assert!(hdr.more_frags());
        assert_eq!(hdr.frag_offset(), 1480);
        assert_eq!(hdr.ttl(), 128);
        assert_eq!(hdr.proto(), IpProto::Udp);
        assert_eq!(hdr.src(), "192.168.1.10".parse().unwrap());
        assert_eq!(hdr.dst(), "192.168.1.1".parse().unwrap());
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut raw = [0u8; 20];
        let mut hdr = Ipv4Hdr::construct(&mut raw[..], 0).unwrap();
        hdr.set_ttl(64);
        hdr.fill_checksum();
        raw[8] = 63;
        assert_eq!(Ipv4Hdr::parse(&raw[..]).unwrap_err(), HdrError::ChecksumError);
    }

    #[test]
    fn router_alert_option_scan() {
        let mut raw = [0u8; 24];
        let mut hdr = Ipv4Hdr::construct(&mut raw[..], 4).unwrap();
        hdr.write_router_alert();
        hdr.fill_checksum();
        let hdr = Ipv4Hdr::parse(&raw[..]).unwrap();
        assert_eq!(hdr.header_len(), 24);
        let opts: Vec<_> = hdr.options().collect::<Result<_, _>>().unwrap();
        assert_eq!(opts, vec![Ipv4Option::RouterAlert(0)]);
    }

    #[test]
    fn truncated_option_errors() {
        let mut raw = [0u8; 24];
        let mut hdr = Ipv4Hdr::construct(&mut raw[..], 4).unwrap();
        hdr.fill_checksum();
        raw[20] = 0x07; // record route, but no length byte fits a valid value
        raw[21] = 0x09; // longer than the options region
        raw[10] = 0;
        raw[11] = 0;
        let mut patched = Ipv4Hdr { buf: &mut raw[..] };
        patched.fill_checksum();
        let hdr = Ipv4Hdr::parse(&raw[..]).unwrap();
        assert!(hdr.options().any(|o| o.is_err()));
    }
}

//! Ethernet II framing.

use crate::buf::cursor::{get_array, get_u16, put_array, put_u16};
use crate::wire::{HdrError, HwAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtherType {
    Ipv4,
    Arp,
    Ipv6,
}

impl EtherType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0800 => Some(EtherType::Ipv4),
            0x0806 => Some(EtherType::Arp),
            0x86dd => Some(EtherType::Ipv6),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            EtherType::Ipv4 => 0x0800,
            EtherType::Arp => 0x0806,
            EtherType::Ipv6 => 0x86dd,
        }
    }
}

/// dst | src | ethertype
#[derive(Debug)]
pub struct EthHdr<T: AsRef<[u8]>> {
    buf: T,
}

impl<T: AsRef<[u8]>> EthHdr<T> {
    pub const SIZE: usize = 14;

    pub fn parse(buf: T) -> Result<Self, HdrError> {
        if buf.as_ref().len() < Self::SIZE {
            return Err(HdrError::OutOfBounds);
        }
        Ok(EthHdr { buf })
    }

    pub fn dst(&self) -> HwAddr {
        HwAddr(get_array(self.buf.as_ref(), 0))
    }

    pub fn src(&self) -> HwAddr {
        HwAddr(get_array(self.buf.as_ref(), 6))
    }

    pub fn ethertype_raw(&self) -> u16 {
        get_u16(self.buf.as_ref(), 12)
    }

    pub fn ethertype(&self) -> Option<EtherType> {
        EtherType::from_u16(self.ethertype_raw())
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> EthHdr<T> {
    pub fn construct(mut buf: T) -> Result<Self, HdrError> {
        if buf.as_mut().len() < Self::SIZE {
            return Err(HdrError::OutOfBounds);
        }
        buf.as_mut()[..Self::SIZE].fill(0);
        Ok(EthHdr { buf })
    }

    pub fn set_dst(&mut self, a: HwAddr) {
        put_array(self.buf.as_mut(), 0, a.0);
    }

    pub fn set_src(&mut self, a: HwAddr) {
        put_array(self.buf.as_mut(), 6, a.0);
    }

    pub fn set_ethertype(&mut self, t: EtherType) {
        put_u16(self.buf.as_mut(), 12, t.to_u16());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut raw = [0u8; 14];
        let mut hdr = EthHdr::construct(&mut raw[..]).unwrap();
        hdr.set_dst(HwAddr([1, 2, 3, 4, 5, 6]));
        hdr.set_src(HwAddr([7, 8, 9, 10, 11, 12]));
        hdr.set_ethertype(EtherType::Arp);
        assert_eq!(raw[12..14], [0x08, 0x06]);

        let hdr = EthHdr::parse(&raw[..]).unwrap();
        assert_eq!(hdr.dst(), HwAddr([1, 2, 3, 4, 5, 6]));
        assert_eq!(hdr.src(), HwAddr([7, 8, 9, 10, 11, 12]));
        assert_eq!(hdr.ethertype(), Some(EtherType::Arp));
    }

    #[test]
    fn short_frame_rejected() {
        assert_eq!(EthHdr::parse(&[0u8; 13][..]).unwrap_err(), HdrError::OutOfBounds);
    }
}

//! ARP for IPv4 over Ethernet.

use crate::buf::cursor::{get_array, get_u16, put_array, put_u16, put_u8};
use crate::wire::{HdrError, HwAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOp {
    Request,
    Reply,
    Unknown(u16),
}

impl ArpOp {
    fn from_u16(v: u16) -> Self {
        match v {
            1 => ArpOp::Request,
            2 => ArpOp::Reply,
            other => ArpOp::Unknown(other),
        }
    }

    fn to_u16(self) -> u16 {
        match self {
            ArpOp::Request => 1,
            ArpOp::Reply => 2,
            ArpOp::Unknown(v) => v,
        }
    }
}

/// Fixed-size Ethernet/IPv4 ARP packet.
pub struct ArpHdr<T: AsRef<[u8]>> {
    buf: T,
}

impl<T: AsRef<[u8]>> ArpHdr<T> {
    pub const SIZE: usize = 28;

    pub fn parse(buf: T) -> Result<Self, HdrError> {
        if buf.as_ref().len() < Self::SIZE {
            return Err(HdrError::OutOfBounds);
        }
        Ok(ArpHdr { buf })
    }

    pub fn op(&self) -> ArpOp {
        ArpOp::from_u16(get_u16(self.buf.as_ref(), 6))
    }

    pub fn sender_hw(&self) -> HwAddr {
        HwAddr(get_array(self.buf.as_ref(), 8))
    }

    pub fn sender_ip(&self) -> [u8; 4] {
        get_array(self.buf.as_ref(), 14)
    }

    pub fn target_hw(&self) -> HwAddr {
        HwAddr(get_array(self.buf.as_ref(), 18))
    }

    pub fn target_ip(&self) -> [u8; 4] {
        get_array(self.buf.as_ref(), 24)
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> ArpHdr<T> {
    /// Zero the packet and fill the Ethernet/IPv4 address-space preamble.
    pub fn construct(mut buf: T) -> Result<Self, HdrError> {
        if buf.as_mut().len() < Self::SIZE {
            return Err(HdrError::OutOfBounds);
        }
        let b = buf.as_mut();
        b[..Self::SIZE].fill(0);
        put_u16(b, 0, 1); // hardware space: Ethernet
        put_u16(b, 2, 0x0800); // protocol space: IPv4
        put_u8(b, 4, 6);
        put_u8(b, 5, 4);
        Ok(ArpHdr { buf })
    }

    pub fn set_op(&mut self, op: ArpOp) {
        put_u16(self.buf.as_mut(), 6, op.to_u16());
    }

    pub fn set_sender_hw(&mut self, a: HwAddr) {
        put_array(self.buf.as_mut(), 8, a.0);
    }

    pub fn set_sender_ip(&mut self, a: [u8; 4]) {
        put_array(self.buf.as_mut(), 14, a);
    }

    pub fn set_target_hw(&mut self, a: HwAddr) {
        put_array(self.buf.as_mut(), 18, a.0);
    }

    pub fn set_target_ip(&mut self, a: [u8; 4]) {
        put_array(self.buf.as_mut(), 24, a);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let mut raw = [0u8; 28];
        let mut arp = ArpHdr::construct(&mut raw[..]).unwrap();
        arp.set_op(ArpOp::Request);
        arp.set_sender_hw(HwAddr([2, 0xaa, 0, 0, 0, 1]));
        arp.set_sender_ip([10, 0, 0, 2]);
        arp.set_target_ip([10, 0, 0, 3]);

        assert_eq!(&raw[..8], &[0, 1, 8, 0, 6, 4, 0, 1]);
        let arp = ArpHdr::parse(&raw[..]).unwrap();
        assert_eq!(arp.op(), ArpOp::Request);
        assert_eq!(arp.sender_ip(), [10, 0, 0, 2]);
        assert_eq!(arp.target_hw(), HwAddr::ZERO);
        assert_eq!(arp.target_ip(), [10, 0, 0, 3]);
    }
}

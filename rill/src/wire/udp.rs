//! UDP header.

use crate::buf::cursor::{get_u16, put_u16};
use crate::wire::HdrError;

pub struct UdpHdr<T: AsRef<[u8]>> {
    buf: T,
}

impl<T: AsRef<[u8]>> UdpHdr<T> {
    pub const SIZE: usize = 8;

    pub fn parse(buf: T) -> Result<Self, HdrError> {
        if buf.as_ref().len() < Self::SIZE {
            return Err(HdrError::OutOfBounds);
        }
        Ok(UdpHdr { buf })
    }

    pub fn src_port(&self) -> u16 {
        get_u16(self.buf.as_ref(), 0)
    }

    pub fn dst_port(&self) -> u16 {
        get_u16(self.buf.as_ref(), 2)
    }

    /// Datagram length including this header.
    pub fn length(&self) -> u16 {
        get_u16(self.buf.as_ref(), 4)
    }

    pub fn checksum_field(&self) -> u16 {
        get_u16(self.buf.as_ref(), 6)
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> UdpHdr<T> {
    pub fn construct(mut buf: T) -> Result<Self, HdrError> {
        if buf.as_mut().len() < Self::SIZE {
            return Err(HdrError::OutOfBounds);
        }
        buf.as_mut()[..Self::SIZE].fill(0);
        Ok(UdpHdr { buf })
    }

    pub fn set_src_port(&mut self, v: u16) {
        put_u16(self.buf.as_mut(), 0, v);
    }

    pub fn set_dst_port(&mut self, v: u16) {
        put_u16(self.buf.as_mut(), 2, v);
    }

    pub fn set_length(&mut self, v: u16) {
        put_u16(self.buf.as_mut(), 4, v);
    }

    pub fn set_checksum(&mut self, v: u16) {
        put_u16(self.buf.as_mut(), 6, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut raw = [0u8; 8];
        let mut hdr = UdpHdr::construct(&mut raw[..]).unwrap();
        hdr.set_src_port(5000);
        hdr.set_dst_port(12345);
        hdr.set_length(12);
        let hdr = UdpHdr::parse(&raw[..]).unwrap();
        assert_eq!(hdr.src_port(), 5000);
        assert_eq!(hdr.dst_port(), 12345);
        assert_eq!(hdr.length(), 12);
        assert_eq!(hdr.checksum_field(), 0);
    }
}

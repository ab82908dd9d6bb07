//! IGMPv2 message framing.

use crate::buf::cursor::{get_array, get_u16, get_u8, put_array, put_u16, put_u8};
use crate::wire::addr::IpAddr;
use crate::wire::HdrError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgmpType {
    MembershipQuery,
    V1MembershipReport,
    V2MembershipReport,
    LeaveGroup,
    Unknown(u8),
}

impl IgmpType {
    fn from_u8(v: u8) -> Self {
        match v {
            0x11 => IgmpType::MembershipQuery,
            0x12 => IgmpType::V1MembershipReport,
            0x16 => IgmpType::V2MembershipReport,
            0x17 => IgmpType::LeaveGroup,
            other => IgmpType::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            IgmpType::MembershipQuery => 0x11,
            IgmpType::V1MembershipReport => 0x12,
            IgmpType::V2MembershipReport => 0x16,
            IgmpType::LeaveGroup => 0x17,
            IgmpType::Unknown(v) => v,
        }
    }
}

/// type | max resp (units of 100 ms) | checksum | group
pub struct IgmpHdr<T: AsRef<[u8]>> {
    buf: T,
}

impl<T: AsRef<[u8]>> IgmpHdr<T> {
    pub const SIZE: usize = 8;

    pub fn parse(buf: T) -> Result<Self, HdrError> {
        if buf.as_ref().len() < Self::SIZE {
            return Err(HdrError::OutOfBounds);
        }
        Ok(IgmpHdr { buf })
    }

    pub fn typ(&self) -> IgmpType {
        IgmpType::from_u8(get_u8(self.buf.as_ref(), 0))
    }

    pub fn max_resp_ms(&self) -> u16 {
        u16::from(get_u8(self.buf.as_ref(), 1)) * 100
    }

    pub fn checksum_field(&self) -> u16 {
        get_u16(self.buf.as_ref(), 2)
    }

    pub fn group(&self) -> IpAddr {
        IpAddr::from_v4(get_array(self.buf.as_ref(), 4))
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> IgmpHdr<T> {
    pub fn construct(mut buf: T) -> Result<Self, HdrError> {
        if buf.as_mut().len() < Self::SIZE {
            return Err(HdrError::OutOfBounds);
        }
        buf.as_mut()[..Self::SIZE].fill(0);
        Ok(IgmpHdr { buf })
    }

    pub fn set_typ(&mut self, t: IgmpType) {
        put_u8(self.buf.as_mut(), 0, t.to_u8());
    }

    pub fn set_group(&mut self, g: IpAddr) {
        put_array(self.buf.as_mut(), 4, g.v4());
    }

    pub fn set_checksum(&mut self, v: u16) {
        put_u16(self.buf.as_mut(), 2, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_round_trip() {
        let mut raw = [0u8; 8];
        let mut hdr = IgmpHdr::construct(&mut raw[..]).unwrap();
        hdr.set_typ(IgmpType::V2MembershipReport);
        hdr.set_group("224.0.1.60".parse().unwrap());
        assert_eq!(raw, [0x16, 0, 0, 0, 224, 0, 1, 60]);

        let hdr = IgmpHdr::parse(&raw[..]).unwrap();
        assert_eq!(hdr.typ(), IgmpType::V2MembershipReport);
        assert_eq!(hdr.group(), "224.0.1.60".parse().unwrap());
    }
}

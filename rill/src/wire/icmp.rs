//! ICMPv4 and ICMPv6 message framing.
//!
//! The common head is 4 bytes (type, code, checksum); the typed message body
//! follows. Dispatch is by explicit match on the type byte per family.

use crate::buf::cursor::{get_u16, get_u32, get_u8, put_u16, put_u8};
use crate::wire::addr::{HwAddr, IpAddr, IpVersion};
use crate::wire::mld;
use crate::wire::ndp::{self, NdpOptionsIter, RouterAdvert};
use crate::wire::HdrError;

pub const V4_ECHO_REPLY: u8 = 0;
pub const V4_UNREACHABLE: u8 = 3;
pub const V4_ECHO_REQUEST: u8 = 8;
pub const V4_TIME_EXCEEDED: u8 = 11;

pub const V6_UNREACHABLE: u8 = 1;
pub const V6_PACKET_TOO_BIG: u8 = 2;
pub const V6_TIME_EXCEEDED: u8 = 3;
pub const V6_ECHO_REQUEST: u8 = 128;
pub const V6_ECHO_REPLY: u8 = 129;
pub const V6_MLD_QUERY: u8 = 130;
pub const V6_MLD_REPORT: u8 = 131;
pub const V6_MLD_DONE: u8 = 132;
pub const V6_ROUTER_SOLICIT: u8 = 133;
pub const V6_ROUTER_ADVERT: u8 = 134;
pub const V6_NEIGHBOR_SOLICIT: u8 = 135;
pub const V6_NEIGHBOR_ADVERT: u8 = 136;

/// Reasons the stack reports as Destination Unreachable / Packet Too Big.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreachableReason {
    Network,
    Host,
    Port,
    PacketTooBig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeExceededKind {
    HopLimit,
    Reassembly,
}

/// IANA type/code for an unreachable reason. For IPv6, Packet Too Big is a
/// message type of its own.
pub fn unreachable_type_code(ver: IpVersion, reason: UnreachableReason) -> (u8, u8) {
    match ver {
        IpVersion::V4 => {
            let code = match reason {
                UnreachableReason::Network => 0,
                UnreachableReason::Host => 1,
                UnreachableReason::Port => 3,
                UnreachableReason::PacketTooBig => 4,
            };
            (V4_UNREACHABLE, code)
        }
        IpVersion::V6 => match reason {
            UnreachableReason::Network => (V6_UNREACHABLE, 0),
            UnreachableReason::Host => (V6_UNREACHABLE, 3),
            UnreachableReason::Port => (V6_UNREACHABLE, 4),
            UnreachableReason::PacketTooBig => (V6_PACKET_TOO_BIG, 0),
        },
    }
}

pub fn time_exceeded_type_code(ver: IpVersion, kind: TimeExceededKind) -> (u8, u8) {
    let typ = match ver {
        IpVersion::V4 => V4_TIME_EXCEEDED,
        IpVersion::V6 => V6_TIME_EXCEEDED,
    };
    let code = match kind {
        TimeExceededKind::HopLimit => 0,
        TimeExceededKind::Reassembly => 1,
    };
    (typ, code)
}

/// A parsed ICMP message; views borrow the header bytes.
pub enum IcmpMsg<'a> {
    EchoRequest { ident: u16, seq: u16 },
    EchoReply { ident: u16, seq: u16 },
    DestUnreachable { code: u8 },
    TimeExceeded { code: u8 },
    PacketTooBig { mtu: u32 },
    MldQuery { max_resp_ms: u16, group: IpAddr },
    MldReport { group: IpAddr },
    MldDone { group: IpAddr },
    RouterSolicit { options: NdpOptionsIter<'a> },
    RouterAdvert(RouterAdvert<'a>),
    NeighborSolicit { target: IpAddr, options: NdpOptionsIter<'a> },
    NeighborAdvert(ndp::NeighborAdvert<'a>),
    Unknown { typ: u8 },
}

/// ICMP header view over head + typed body. The instance size excludes any
/// trailing payload (echo data, embedded datagram).
pub struct IcmpHdr<T: AsRef<[u8]>> {
    buf: T,
    ver: IpVersion,
}

impl<T: AsRef<[u8]>> IcmpHdr<T> {
    pub const HEAD_SIZE: usize = 4;

    pub fn parse(buf: T, ver: IpVersion) -> Result<Self, HdrError> {
        if buf.as_ref().len() < Self::HEAD_SIZE {
            return Err(HdrError::OutOfBounds);
        }
        Ok(IcmpHdr { buf, ver })
    }

    pub fn typ(&self) -> u8 {
        get_u8(self.buf.as_ref(), 0)
    }

    pub fn code(&self) -> u8 {
        get_u8(self.buf.as_ref(), 1)
    }

    pub fn checksum_field(&self) -> u16 {
        get_u16(self.buf.as_ref(), 2)
    }

    pub fn version(&self) -> IpVersion {
        self.ver
    }

    fn body(&self) -> &[u8] {
        &self.buf.as_ref()[Self::HEAD_SIZE..]
    }

    /// Size of head plus the typed message body (options included, trailing
    /// payload excluded).
    pub fn size(&self) -> usize {
        let body = self.body();
        let body_size = match (self.ver, self.typ()) {
            (IpVersion::V4, V4_ECHO_REQUEST | V4_ECHO_REPLY) => 4,
            (IpVersion::V4, V4_UNREACHABLE | V4_TIME_EXCEEDED) => 4,
            (IpVersion::V6, V6_ECHO_REQUEST | V6_ECHO_REPLY) => 4,
            (IpVersion::V6, V6_UNREACHABLE | V6_PACKET_TOO_BIG | V6_TIME_EXCEEDED) => 4,
            (IpVersion::V6, V6_MLD_QUERY | V6_MLD_REPORT | V6_MLD_DONE) => mld::BODY_SIZE,
            (IpVersion::V6, V6_ROUTER_SOLICIT) => 4 + ndp::options_len(body.get(4..).unwrap_or(&[])),
            (IpVersion::V6, V6_ROUTER_ADVERT) => 12 + ndp::options_len(body.get(12..).unwrap_or(&[])),
            (IpVersion::V6, V6_NEIGHBOR_SOLICIT | V6_NEIGHBOR_ADVERT) => {
                20 + ndp::options_len(body.get(20..).unwrap_or(&[]))
            }
            _ => 0,
        };
        Self::HEAD_SIZE + body_size
    }

    /// Structural validity: the typed body must fit the buffer.
    pub fn check_len(&self) -> Result<(), HdrError> {
        if self.size() > self.buf.as_ref().len() {
            Err(HdrError::OutOfBounds)
        } else {
            Ok(())
        }
    }

    pub fn msg(&self) -> Result<IcmpMsg<'_>, HdrError> {
        self.check_len()?;
        let body = self.body();
        let msg = match (self.ver, self.typ()) {
            (IpVersion::V4, V4_ECHO_REQUEST) | (IpVersion::V6, V6_ECHO_REQUEST) => {
                IcmpMsg::EchoRequest { ident: get_u16(body, 0), seq: get_u16(body, 2) }
            }
            (IpVersion::V4, V4_ECHO_REPLY) | (IpVersion::V6, V6_ECHO_REPLY) => {
                IcmpMsg::EchoReply { ident: get_u16(body, 0), seq: get_u16(body, 2) }
            }
            (IpVersion::V4, V4_UNREACHABLE) | (IpVersion::V6, V6_UNREACHABLE) => {
                IcmpMsg::DestUnreachable { code: self.code() }
            }
            (IpVersion::V4, V4_TIME_EXCEEDED) | (IpVersion::V6, V6_TIME_EXCEEDED) => {
                IcmpMsg::TimeExceeded { code: self.code() }
            }
            (IpVersion::V6, V6_PACKET_TOO_BIG) => IcmpMsg::PacketTooBig { mtu: get_u32(body, 0) },
            (IpVersion::V6, V6_MLD_QUERY) => IcmpMsg::MldQuery {
                max_resp_ms: get_u16(body, 0),
                group: mld::group(body),
            },
            (IpVersion::V6, V6_MLD_REPORT) => IcmpMsg::MldReport { group: mld::group(body) },
            (IpVersion::V6, V6_MLD_DONE) => IcmpMsg::MldDone { group: mld::group(body) },
            (IpVersion::V6, V6_ROUTER_SOLICIT) => IcmpMsg::RouterSolicit {
                options: NdpOptionsIter::new(&body[4..self.size() - Self::HEAD_SIZE]),
            },
            (IpVersion::V6, V6_ROUTER_ADVERT) => {
                IcmpMsg::RouterAdvert(RouterAdvert::new(&body[..self.size() - Self::HEAD_SIZE]))
            }
            (IpVersion::V6, V6_NEIGHBOR_SOLICIT) => IcmpMsg::NeighborSolicit {
                target: ndp::target(body),
                options: NdpOptionsIter::new(&body[20..self.size() - Self::HEAD_SIZE]),
            },
            (IpVersion::V6, V6_NEIGHBOR_ADVERT) => IcmpMsg::NeighborAdvert(ndp::NeighborAdvert::new(
                &body[..self.size() - Self::HEAD_SIZE],
            )),
            (_, typ) => IcmpMsg::Unknown { typ },
        };
        Ok(msg)
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> IcmpHdr<T> {
    /// Zero `size` bytes and write type and code. Body fields are written by
    /// the message-specific helpers.
    pub fn construct(mut buf: T, ver: IpVersion, typ: u8, code: u8, size: usize) -> Result<Self, HdrError> {
        if buf.as_mut().len() < size || size < Self::HEAD_SIZE {
            return Err(HdrError::OutOfBounds);
        }
        let b = buf.as_mut();
        b[..size].fill(0);
        put_u8(b, 0, typ);
        put_u8(b, 1, code);
        Ok(IcmpHdr { buf, ver })
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.buf.as_mut()[Self::HEAD_SIZE..]
    }

    pub fn set_checksum(&mut self, v: u16) {
        put_u16(self.buf.as_mut(), 2, v);
    }

    pub fn set_echo(&mut self, ident: u16, seq: u16) {
        let b = self.body_mut();
        put_u16(b, 0, ident);
        put_u16(b, 2, seq);
    }

    pub fn set_mtu(&mut self, mtu: u32) {
        let b = self.body_mut();
        b[..4].copy_from_slice(&mtu.to_be_bytes());
    }
}

/// Recipe for an outbound ICMP message: what to write after the 4-byte
/// head. The version decides type numbers at construction time.
pub enum IcmpBuild {
    EchoRequest { ident: u16, seq: u16 },
    EchoReply { ident: u16, seq: u16 },
    TimeExceeded(TimeExceededKind),
    Unreachable(UnreachableReason),
    PacketTooBig { mtu: u32 },
    MldQuery { group: IpAddr, max_resp_ms: u16 },
    MldReport { group: IpAddr },
    MldDone { group: IpAddr },
    RouterSolicit { source_ll: Option<HwAddr> },
    NeighborSolicit { target: IpAddr, source_ll: Option<HwAddr> },
    NeighborAdvert {
        target: IpAddr,
        router: bool,
        solicited: bool,
        override_flag: bool,
        target_ll: Option<HwAddr>,
    },
}

impl IcmpBuild {
    /// Bytes to reserve: head plus typed body.
    pub fn size_hint(&self) -> usize {
        let body = match self {
            IcmpBuild::EchoRequest { .. } | IcmpBuild::EchoReply { .. } => 4,
            IcmpBuild::TimeExceeded(_) | IcmpBuild::Unreachable(_) => 4,
            IcmpBuild::PacketTooBig { .. } => 4,
            IcmpBuild::MldQuery { .. } | IcmpBuild::MldReport { .. } | IcmpBuild::MldDone { .. } => {
                mld::BODY_SIZE
            }
            IcmpBuild::RouterSolicit { source_ll } => {
                ndp::router_solicit_body_size(source_ll.is_some())
            }
            IcmpBuild::NeighborSolicit { source_ll, .. } => {
                ndp::neighbor_body_size(source_ll.is_some())
            }
            IcmpBuild::NeighborAdvert { target_ll, .. } => {
                ndp::neighbor_body_size(target_ll.is_some())
            }
        };
        IcmpHdr::<&[u8]>::HEAD_SIZE + body
    }

    pub fn type_code(&self, ver: IpVersion) -> (u8, u8) {
        let v4 = matches!(ver, IpVersion::V4);
        match self {
            IcmpBuild::EchoRequest { .. } => (if v4 { V4_ECHO_REQUEST } else { V6_ECHO_REQUEST }, 0),
            IcmpBuild::EchoReply { .. } => (if v4 { V4_ECHO_REPLY } else { V6_ECHO_REPLY }, 0),
            IcmpBuild::TimeExceeded(kind) => time_exceeded_type_code(ver, *kind),
            IcmpBuild::Unreachable(reason) => unreachable_type_code(ver, *reason),
            IcmpBuild::PacketTooBig { .. } => {
                unreachable_type_code(ver, UnreachableReason::PacketTooBig)
            }
            IcmpBuild::MldQuery { .. } => (V6_MLD_QUERY, 0),
            IcmpBuild::MldReport { .. } => (V6_MLD_REPORT, 0),
            IcmpBuild::MldDone { .. } => (V6_MLD_DONE, 0),
            IcmpBuild::RouterSolicit { .. } => (V6_ROUTER_SOLICIT, 0),
            IcmpBuild::NeighborSolicit { .. } => (V6_NEIGHBOR_SOLICIT, 0),
            IcmpBuild::NeighborAdvert { .. } => (V6_NEIGHBOR_ADVERT, 0),
        }
    }

    /// Fill the zeroed body region.
    pub fn write_body(&self, body: &mut [u8]) {
        match self {
            IcmpBuild::EchoRequest { ident, seq } | IcmpBuild::EchoReply { ident, seq } => {
                put_u16(body, 0, *ident);
                put_u16(body, 2, *seq);
            }
            IcmpBuild::TimeExceeded(_) | IcmpBuild::Unreachable(_) => {}
            IcmpBuild::PacketTooBig { mtu } => body[..4].copy_from_slice(&mtu.to_be_bytes()),
            IcmpBuild::MldQuery { group, max_resp_ms } => mld::write_body(body, *max_resp_ms, *group),
            IcmpBuild::MldReport { group } | IcmpBuild::MldDone { group } => {
                mld::write_body(body, 0, *group)
            }
            IcmpBuild::RouterSolicit { source_ll } => ndp::write_router_solicit(body, *source_ll),
            IcmpBuild::NeighborSolicit { target, source_ll } => {
                ndp::write_neighbor_solicit(body, *target, *source_ll)
            }
            IcmpBuild::NeighborAdvert { target, router, solicited, override_flag, target_ll } => {
                ndp::write_neighbor_advert(body, *target, *router, *solicited, *override_flag, *target_ll)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_request_round_trip() {
        let mut raw = [0u8; 8];
        let mut hdr = IcmpHdr::construct(&mut raw[..], IpVersion::V4, V4_ECHO_REQUEST, 0, 8).unwrap();
        hdr.set_echo(0x1234, 1);
        let hdr = IcmpHdr::parse(&raw[..], IpVersion::V4).unwrap();
        assert_eq!(hdr.size(), 8);
        match hdr.msg().unwrap() {
            IcmpMsg::EchoRequest { ident, seq } => {
                assert_eq!(ident, 0x1234);
                assert_eq!(seq, 1);
            }
            _ => panic!("wrong message"),
        }
    }

    #[test]
    fn packet_too_big_is_its_own_type() {
        let (typ, code) = unreachable_type_code(IpVersion::V6, UnreachableReason::PacketTooBig);
        assert_eq!((typ, code), (2, 0));
        let (typ, code) = unreachable_type_code(IpVersion::V4, UnreachableReason::PacketTooBig);
        assert_eq!((typ, code), (3, 4));
    }

    #[test]
    fn truncated_mld_body_rejected() {
        let raw = [V6_MLD_QUERY, 0, 0, 0, 0, 0];
        let hdr = IcmpHdr::parse(&raw[..], IpVersion::V6).unwrap();
        assert!(hdr.msg().is_err());
    }
}

//! Multicast Listener Discovery message bodies (ICMPv6 types 130-132).
//!
//! Body layout after the 4-byte ICMP head: maximum response delay (ms),
//! reserved, then the 16-byte multicast address.

use crate::buf::cursor::{get_array, put_array, put_u16};
use crate::wire::addr::IpAddr;

pub const BODY_SIZE: usize = 20;

pub fn group(body: &[u8]) -> IpAddr {
    IpAddr(get_array(body, 4))
}

pub fn write_body(body: &mut [u8], max_resp_ms: u16, group: IpAddr) {
    put_u16(body, 0, max_resp_ms);
    put_array(body, 4, group.octets());
}

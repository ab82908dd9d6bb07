//! Fuzz target for frame and header parsing.
//!
//! Random bytes go through the same entry points the stack uses on
//! ingress; parsing must reject garbage without panicking and must never
//! advance the read position on failure.

#![no_main]

use libfuzzer_sys::fuzz_target;
use rill::buf::Buf;
use rill::packet::Packet;
use rill::wire::IpVersion;

fuzz_target!(|data: &[u8]| {
    // raw ethernet dispatch path
    let mut p = Packet::from_frame(Buf::copy_from(data));
    if p.read_eth().is_ok() {
        let _ = p.eth().map(|e| (e.dst(), e.src(), e.ethertype()));
    }

    // both IP parsers over the same bytes
    for ver in [IpVersion::V4, IpVersion::V6] {
        let mut p = Packet::from_frame(Buf::copy_from(data));
        let before = p.buf().mask_off();
        match p.read_ip(ver) {
            Ok(()) => {
                let _ = p.src_addr();
                let _ = p.dst_addr();
                let _ = p.upper_layer_len();
                let _ = p.frag_info();
            }
            Err(_) => assert_eq!(p.buf().mask_off(), before, "failed read moved the mask"),
        }
    }

    // ICMP message walk, including NDP option TLVs
    for ver in [IpVersion::V4, IpVersion::V6] {
        let mut p = Packet::from_frame(Buf::copy_from(data));
        if p.read_icmp(ver).is_ok() {
            if let Some(hdr) = p.icmp() {
                if let Ok(msg) = hdr.msg() {
                    use rill::wire::icmp::IcmpMsg;
                    match msg {
                        IcmpMsg::NeighborSolicit { options, .. } => {
                            let _ = options.count();
                        }
                        IcmpMsg::RouterAdvert(ra) => {
                            let _ = ra.options().count();
                        }
                        IcmpMsg::NeighborAdvert(na) => {
                            let _ = na.options().count();
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    // UDP and ARP are fixed-size but must still bounds check
    let mut p = Packet::from_frame(Buf::copy_from(data));
    if p.read_udp().is_ok() {
        let _ = p.udp().map(|u| (u.src_port(), u.dst_port(), u.length()));
    }
    let mut p = Packet::from_frame(Buf::copy_from(data));
    if p.read_arp().is_ok() {
        let _ = p.arp().map(|a| (a.op(), a.sender_hw(), a.target_ip()));
    }
});

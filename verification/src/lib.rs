//! Verification of rill's core invariants.
//!
//! Property-based testing for the pieces where a wrong answer is silent:
//! the chunked buffer, the wire codecs, the prefix trie, the neighbor
//! state machine and the fragmentation pipeline.
//!
//! ## Layers:
//! 1. **Compile-time assertions** - wire-format sizes that must never drift
//! 2. **Property-based testing** - random input testing with invariants
//! 3. **Fuzzing** - see `fuzz/` for the coverage-guided targets

// ============================================================
// INVARIANTS (properties that must always hold)
// ============================================================

/// Minimum legal IPv4 header, in bytes.
pub const IPV4_MIN_HEADER: usize = 20;

/// Fixed IPv6 base header, in bytes.
pub const IPV6_HEADER: usize = 40;

/// Fragment offsets are stored in units of this many bytes.
pub const FRAG_UNIT: usize = 8;

const _: () = {
    assert!(rill::wire::eth::EthHdr::<&[u8]>::SIZE == 14);
    assert!(rill::wire::arp::ArpHdr::<&[u8]>::SIZE == 28);
    assert!(rill::wire::ipv4::Ipv4Hdr::<&[u8]>::MIN_SIZE == IPV4_MIN_HEADER);
    assert!(rill::wire::ipv6::Ipv6Hdr::<&[u8]>::SIZE == IPV6_HEADER);
    assert!(rill::wire::ipv6::FragHdr::<&[u8]>::SIZE == 8);
    assert!(rill::wire::udp::UdpHdr::<&[u8]>::SIZE == 8);
    assert!(rill::wire::igmp::IgmpHdr::<&[u8]>::SIZE == 8);
};

// ============================================================
// PROPERTY-BASED TESTS (proptest)
// ============================================================

#[cfg(test)]
mod property_tests {
    use proptest::prelude::*;
    use rill::buf::Buf;
    use rill::wire::IpAddr;

    fn addr(bytes: [u8; 16]) -> IpAddr {
        IpAddr(bytes)
    }

    proptest! {
        /// Property 1: any insertion schedule that fills all holes renders
        /// to the concatenation of the segments in position order.
        #[test]
        fn prop_buffer_round_trip(
            segments in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..8),
            seed in any::<u64>(),
        ) {
            // positions of each segment in the final buffer
            let mut offsets = Vec::new();
            let mut total = 0usize;
            for s in &segments {
                offsets.push(total);
                total += s.len();
            }

            // a deterministic shuffle of the insertion order
            let mut order: Vec<usize> = (0..segments.len()).collect();
            let mut state = seed;
            for i in (1..order.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                order.swap(i, (state as usize) % (i + 1));
            }

            let mut buf = Buf::new();
            for &i in &order {
                let seg = Buf::copy_from(&segments[i]);
                buf.insert(&seg, offsets[i], usize::MAX).unwrap();
            }

            prop_assert!(buf.is_complete());
            let expect: Vec<u8> = segments.concat();
            prop_assert_eq!(buf.to_vec(), expect);
        }

        /// Property 2: the unmasked size always equals total minus the mask
        /// offset, across any legal interleaving of operations.
        #[test]
        fn prop_mask_invariance(ops in prop::collection::vec(0u8..5, 1..40)) {
            let mut buf = Buf::alloc(32);
            let mut total = 32usize;
            let mut mask = 0usize;
            for op in ops {
                match op {
                    0 => {
                        let n = (total - mask).min(3);
                        buf.mask(n);
                        mask += n;
                    }
                    1 => {
                        let n = mask.min(2);
                        buf.unmask(n);
                        mask -= n;
                    }
                    2 => {
                        // reserve keeps the unmasked size but may change the
                        // masked prefix
                        let unmasked = total - mask;
                        buf.reserve_before(8);
                        prop_assert_eq!(buf.len(), unmasked);
                        total = buf.len() + buf.mask_off();
                        mask = buf.mask_off();
                    }
                    3 => {
                        let new_len = (total - mask) / 2;
                        buf.truncate(new_len);
                        total = mask + new_len;
                    }
                    _ => {
                        buf.insert_chunk(rill::buf::Chunk::alloc(4), total - mask + 2).unwrap();
                        total += 2 + 4;
                    }
                }
                prop_assert_eq!(buf.len(), total - mask);
                prop_assert_eq!(buf.mask_off(), mask);
            }
        }

        /// Property 3: IPv4 header construct/read round-trips every field.
        #[test]
        fn prop_ipv4_round_trip(
            dscp in 0u8..64,
            ecn in 0u8..4,
            ident: u16,
            df: bool,
            mf: bool,
            frag_off in (0u16..8191).prop_map(|o| o * 8),
            ttl: u8,
            src: [u8; 4],
            dst: [u8; 4],
        ) {
            use rill::wire::ipv4::Ipv4Hdr;
            use rill::wire::IpProto;

            let mut raw = [0u8; 20];
            {
                let mut hdr = Ipv4Hdr::construct(&mut raw[..], 0).unwrap();
                hdr.set_dscp(dscp);
                hdr.set_ecn(ecn);
                hdr.set_total_len(20);
                hdr.set_ident(ident);
                hdr.set_dont_frag(df);
                hdr.set_more_frags(mf);
                hdr.set_frag_offset(frag_off);
                hdr.set_ttl(ttl);
                hdr.set_proto(IpProto::Udp);
                hdr.set_src(IpAddr::from_v4(src));
                hdr.set_dst(IpAddr::from_v4(dst));
                hdr.fill_checksum();
            }
            let hdr = Ipv4Hdr::parse(&raw[..]).unwrap();
            prop_assert_eq!(hdr.dscp(), dscp);
            prop_assert_eq!(hdr.ecn(), ecn);
            prop_assert_eq!(hdr.ident(), ident);
            prop_assert_eq!(hdr.dont_frag(), df);
            prop_assert_eq!(hdr.more_frags(), mf);
            prop_assert_eq!(hdr.frag_offset(), frag_off);
            prop_assert_eq!(hdr.ttl(), ttl);
            prop_assert_eq!(hdr.src(), IpAddr::from_v4(src));
            prop_assert_eq!(hdr.dst(), IpAddr::from_v4(dst));
        }

        /// Property 4: network byte order on the wire regardless of host
        /// endianness.
        #[test]
        fn prop_byte_order(v16: u16, v32: u32) {
            use rill::buf::cursor::{get_u16, get_u32, put_u16, put_u32};
            let mut b = [0u8; 6];
            put_u16(&mut b, 0, v16);
            put_u32(&mut b, 2, v32);
            prop_assert_eq!(&b[..2], &v16.to_be_bytes());
            prop_assert_eq!(&b[2..], &v32.to_be_bytes());
            prop_assert_eq!(get_u16(&b, 0), v16);
            prop_assert_eq!(get_u32(&b, 2), v32);
        }

        /// Property 5: match_longest returns the longest stored prefix, and
        /// erasure removes exactly that prefix.
        #[test]
        fn prop_trie_longest_prefix(
            prefixes in prop::collection::vec((any::<[u8; 16]>(), 0u8..=128), 1..12),
            probe: [u8; 16],
            erase_idx in any::<prop::sample::Index>(),
        ) {
            use rill::trie::BitTrie;

            // deduplicate equal (masked prefix, len) keys, last value wins
            let mut trie = BitTrie::new();
            let mut model: Vec<(IpAddr, u8, usize)> = Vec::new();
            for (i, (bytes, len)) in prefixes.iter().enumerate() {
                let key = addr(*bytes).masked(*len);
                trie.insert(key, *len, i);
                model.retain(|(k, l, _)| !(k == &key && l == len));
                model.push((key, *len, i));
            }

            let probe = addr(probe);
            let best = model
                .iter()
                .filter(|(k, l, _)| probe.common_prefix_len(k) >= *l)
                .max_by_key(|(_, l, _)| *l);
            let got = trie.match_longest(&probe, 128);
            match (best, got) {
                (None, None) => {}
                (Some((_, l, v)), Some((_, gl, gv))) => {
                    prop_assert_eq!(*l, gl);
                    prop_assert_eq!(*v, *gv);
                }
                (a, b) => prop_assert!(false, "model {:?} vs trie {:?}", a, b.map(|(_, l, v)| (l, *v))),
            }

            // erase one stored prefix: it stops matching exactly, the rest
            // keep resolving
            if !model.is_empty() {
                let (key, len, _) = model[erase_idx.index(model.len())];
                prop_assert!(trie.remove(&key, len).is_some());
                prop_assert!(trie.get(&key, len).is_none());
                for (k, l, v) in model.iter().filter(|(k, l, _)| !(*k == key && *l == len)) {
                    prop_assert_eq!(trie.get(k, *l), Some(v));
                }
            }
        }

        /// Property 9: source selection is a pure function of the address
        /// set and the hints.
        #[test]
        fn prop_source_selection_deterministic(
            addrs in prop::collection::vec((any::<[u8; 16]>(), 1u8..32), 1..6),
            dst: [u8; 16],
        ) {
            use rill::iface::QueueDevice;
            use rill::stack::Stack;
            use rill::wire::HwAddr;

            let build = || {
                let mut stack = Stack::with_seed(Default::default(), 7);
                let id = stack
                    .add_interface(Box::new(QueueDevice::new(HwAddr([2, 0, 0, 0, 0, 1]), 1500)));
                for (bytes, plen) in &addrs {
                    let a = addr(*bytes);
                    if a.is_unspecified() || a.is_multicast() {
                        continue;
                    }
                    stack.assign_ip(id, a, *plen);
                }
                stack
            };
            let mut s1 = build();
            let mut s2 = build();
            let dst = addr(dst);
            let pick1 = s1.select_src_addr(Some(dst), None);
            let pick2 = s2.select_src_addr(Some(dst), None);
            prop_assert_eq!(pick1, pick2);
            // and repeatable under the same state
            prop_assert_eq!(s1.select_src_addr(Some(dst), None), pick1);
        }
    }
}

// ============================================================
// NEIGHBOR STATE MACHINE (property 6)
// ============================================================

#[cfg(test)]
mod neighbor_properties {
    use proptest::prelude::*;
    use rill::neigh::{AdvertFlags, NeighborCache, NeighborState};
    use rill::wire::{HwAddr, IpAddr};
    use std::time::Instant;

    fn target() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    const KNOWN: HwAddr = HwAddr([2, 0, 0, 0, 0, 1]);
    const OTHER: HwAddr = HwAddr([2, 0, 0, 0, 0, 2]);

    proptest! {
        /// From INCOMPLETE or REACHABLE, any advertisement moves the entry
        /// exactly where the transition table says.
        #[test]
        fn prop_advert_matrix(
            start_resolved: bool,
            solicited: bool,
            override_addr: bool,
            same_addr: bool,
            with_addr: bool,
        ) {
            let mut cache: NeighborCache<u32> = NeighborCache::default();
            let now = Instant::now();
            let mut actions = Vec::new();
            cache.resolve(target(), None, 0, now, &mut actions);
            if start_resolved {
                cache.process_advert(
                    target(),
                    Some(KNOWN),
                    AdvertFlags { is_advert: true, solicited: true, ..Default::default() },
                    now,
                );
            }

            let advert_addr = if with_addr {
                Some(if same_addr { KNOWN } else { OTHER })
            } else {
                None
            };
            cache.process_advert(
                target(),
                advert_addr,
                AdvertFlags { is_advert: true, solicited, override_addr, ..Default::default() },
                now,
            );
            let entry = cache.get(&target()).unwrap();

            if !start_resolved {
                match advert_addr {
                    None => prop_assert_eq!(entry.state, NeighborState::Incomplete),
                    Some(a) => {
                        prop_assert_eq!(entry.haddr, a);
                        let want =
                            if solicited { NeighborState::Reachable } else { NeighborState::Stale };
                        prop_assert_eq!(entry.state, want);
                    }
                }
            } else {
                let differs = with_addr && !same_addr;
                if !override_addr && differs {
                    // conflicting unauthoritative advertisement
                    prop_assert_eq!(entry.state, NeighborState::Stale);
                    prop_assert_eq!(entry.haddr, KNOWN);
                } else {
                    prop_assert_eq!(entry.haddr, if differs { OTHER } else { KNOWN });
                    if solicited {
                        prop_assert_eq!(entry.state, NeighborState::Reachable);
                    } else if differs {
                        prop_assert_eq!(entry.state, NeighborState::Stale);
                    } else {
                        prop_assert_eq!(entry.state, NeighborState::Reachable);
                    }
                }
            }
        }
    }
}

// ============================================================
// FRAGMENTATION PIPELINE (properties 7 and 10)
// ============================================================

#[cfg(test)]
mod fragmentation_properties {
    use proptest::prelude::*;
    use rill::buf::Buf;
    use rill::iface::{Device, IfaceId, QueueDevice};
    use rill::stack::Stack;
    use rill::wire::arp::{ArpHdr, ArpOp};
    use rill::wire::eth::{EthHdr, EtherType};
    use rill::wire::ipv4::Ipv4Hdr;
    use rill::wire::{HwAddr, IpAddr};
    use std::cell::RefCell;
    use std::rc::Rc;

    const MAC_A: HwAddr = HwAddr([2, 0xaa, 0, 0, 0, 1]);
    const MAC_B: HwAddr = HwAddr([2, 0xbb, 0, 0, 0, 2]);

    #[derive(Clone)]
    struct SharedDevice(Rc<RefCell<QueueDevice>>);

    impl Device for SharedDevice {
        fn enqueue(&mut self, frame: Buf) {
            self.0.borrow_mut().enqueue(frame)
        }
        fn poll_rx(&mut self) -> Option<Buf> {
            self.0.borrow_mut().poll_rx()
        }
        fn address(&self) -> HwAddr {
            self.0.borrow().addr
        }
        fn mtu(&self) -> u16 {
            self.0.borrow().mtu
        }
    }

    fn host(mac: HwAddr, addr: &str, mtu: u16) -> (Stack, SharedDevice, IfaceId) {
        let dev = SharedDevice(Rc::new(RefCell::new(QueueDevice::new(mac, mtu))));
        let mut stack = Stack::with_seed(Default::default(), 99);
        let id = stack.add_interface(Box::new(dev.clone()));
        stack.assign_ip(id, addr.parse().unwrap(), 24);
        (stack, dev, id)
    }

    fn prime_neighbor(stack: &mut Stack, iface: IfaceId, peer_mac: HwAddr, peer_ip: &str, our_ip: &str) {
        let mut arp = vec![0u8; ArpHdr::<&[u8]>::SIZE];
        {
            let mut hdr = ArpHdr::construct(&mut arp[..]).unwrap();
            hdr.set_op(ArpOp::Request);
            hdr.set_sender_hw(peer_mac);
            hdr.set_sender_ip(peer_ip.parse::<IpAddr>().unwrap().v4());
            hdr.set_target_ip(our_ip.parse::<IpAddr>().unwrap().v4());
        }
        let mut frame = vec![0u8; 14 + arp.len()];
        {
            let mut eth = EthHdr::construct(&mut frame[..]).unwrap();
            eth.set_dst(HwAddr::BROADCAST);
            eth.set_src(peer_mac);
            eth.set_ethertype(EtherType::Arp);
        }
        frame[14..].copy_from_slice(&arp);
        stack.input(iface, Buf::copy_from(&frame));
    }

    fn send_udp(stack: &mut Stack, payload: &[u8]) {
        let sock = stack.udp_socket();
        sock.connect(stack, "10.0.0.3".parse().unwrap(), 9999, None, 0).unwrap();
        sock.send(stack, payload, None, 0).unwrap();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// Property 7: fragment + reassemble is the identity on the payload,
        /// independent of fragment arrival order.
        #[test]
        fn prop_fragmentation_round_trip(
            payload in prop::collection::vec(any::<u8>(), 200..1600),
            mtu in 68u16..600,
            reverse: bool,
        ) {
            let (mut tx_stack, tx_dev, a) = host(MAC_A, "10.0.0.2", mtu);
            prime_neighbor(&mut tx_stack, a, MAC_B, "10.0.0.3", "10.0.0.2");
            tx_dev.0.borrow_mut().tx.clear();

            send_udp(&mut tx_stack, &payload);
            let mut frames: Vec<Vec<u8>> =
                tx_dev.0.borrow_mut().tx.drain(..).map(|b| b.to_vec()).collect();
            prop_assert!(!frames.is_empty());
            for f in &frames {
                prop_assert!(f.len() - 14 <= usize::from(mtu), "fragment within MTU");
            }
            if reverse {
                frames.reverse();
            }

            let (mut rx_stack, _rx_dev, b) = host(MAC_B, "10.0.0.3", 1500);
            let got: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
            let sink = rx_stack.udp_socket();
            sink.listen(&mut rx_stack, None, 9999).unwrap();
            let log = got.clone();
            sink.on_data(move |_, _, data, _, _| log.borrow_mut().push(data.to_vec()));

            for frame in &frames {
                rx_stack.input(b, Buf::copy_from(frame));
            }
            prop_assert_eq!(&got.borrow()[..], std::slice::from_ref(&payload));
        }

        /// Property 10 adjunct: two fragmented sends never share an
        /// identification.
        #[test]
        fn prop_distinct_fragment_idents(_seed in any::<u64>()) {
            let (mut stack, dev, a) = host(MAC_A, "10.0.0.2", 128);
            prime_neighbor(&mut stack, a, MAC_B, "10.0.0.3", "10.0.0.2");
            dev.0.borrow_mut().tx.clear();

            send_udp(&mut stack, &[0xa5; 400]);
            send_udp(&mut stack, &[0x5a; 400]);
            let frames: Vec<Vec<u8>> =
                dev.0.borrow_mut().tx.drain(..).map(|b| b.to_vec()).collect();

            let mut idents: Vec<u16> = frames
                .iter()
                .map(|f| Ipv4Hdr::parse(&f[14..]).unwrap().ident())
                .collect();
            idents.dedup();
            prop_assert_eq!(idents.len(), 2, "one identification per datagram");
        }
    }
}

// ============================================================
// DETERMINISTIC UNIT TESTS (property 8 and edge cases)
// ============================================================

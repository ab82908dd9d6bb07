//! Fuzz target for longest-prefix-match lookups.
//!
//! Inserts random prefixes and checks every lookup against a linear-scan
//! model.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use rill::trie::BitTrie;
use rill::wire::IpAddr;

#[derive(Debug, Arbitrary)]
struct Input {
    prefixes: Vec<([u8; 16], u8)>,
    probes: Vec<[u8; 16]>,
    erase: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let mut trie = BitTrie::new();
    let mut model: Vec<(IpAddr, u8, u32)> = Vec::new();

    for (i, (bytes, len)) in input.prefixes.iter().take(64).enumerate() {
        let len = len % 129;
        let key = IpAddr(*bytes).masked(len);
        trie.insert(key, len, i as u32);
        model.retain(|(k, l, _)| !(*k == key && *l == len));
        model.push((key, len, i as u32));
    }

    for idx in input.erase.iter().take(16) {
        if model.is_empty() {
            break;
        }
        let (key, len, _) = model.remove(usize::from(*idx) % model.len());
        assert!(trie.remove(&key, len).is_some());
    }

    for probe in input.probes.iter().take(64) {
        let probe = IpAddr(*probe);
        let expect = model
            .iter()
            .filter(|(k, l, _)| probe.common_prefix_len(k) >= *l)
            .max_by_key(|(_, l, _)| *l)
            .map(|(_, l, v)| (*l, *v));
        let got = trie.match_longest(&probe, 128).map(|(_, l, v)| (l, *v));
        assert_eq!(expect, got);
    }
});

//! Fuzz target for hole insertion in the chunked buffer.
//!
//! Drives a random schedule of inserts, masks and truncations and checks
//! the size/hole bookkeeping after every step.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use rill::buf::{Buf, Chunk};

#[derive(Debug, Arbitrary)]
enum Op {
    Insert { len: u8, offset: u16 },
    Mask { n: u8 },
    Unmask { n: u8 },
    Reserve { n: u8 },
    Truncate { len: u16 },
}

fuzz_target!(|ops: Vec<Op>| {
    let mut buf = Buf::new();
    for op in ops {
        let before_unmasked = buf.len();
        match op {
            Op::Insert { len, offset } => {
                if len == 0 {
                    continue;
                }
                let _ = buf.insert_chunk(Chunk::alloc(usize::from(len)), usize::from(offset));
            }
            Op::Mask { n } => {
                let n = usize::from(n).min(buf.len());
                buf.mask(n);
                assert_eq!(buf.len(), before_unmasked - n);
            }
            Op::Unmask { n } => {
                let n = usize::from(n).min(buf.mask_off());
                buf.unmask(n);
                assert_eq!(buf.len(), before_unmasked + n);
            }
            Op::Reserve { n } => {
                buf.reserve_before(usize::from(n));
                assert_eq!(buf.len(), before_unmasked);
                assert!(buf.mask_off() >= usize::from(n));
            }
            Op::Truncate { len } => {
                buf.truncate(usize::from(len));
                assert!(buf.len() <= before_unmasked.max(usize::from(len)));
            }
        }
        // rendering must agree with the reported size
        assert_eq!(buf.to_vec().len(), buf.len());
        if buf.is_complete() {
            let mut streamed = 0;
            buf.for_each_slice(|s| streamed += s.len());
            assert_eq!(streamed, buf.len());
        }
    }
});

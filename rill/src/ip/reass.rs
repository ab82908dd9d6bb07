//! Fragment reassembly.
//!
//! Reassemblies are keyed by (source, destination, identification). The
//! held packet starts as a copy of the first-seen fragment's IP header and
//! grows by zero-copy insertion of fragment payloads into holes; it is
//! complete when no holes remain and the last fragment has been seen.

use crate::ip::Reassembly;
use crate::packet::{FragInfo, Packet};
use crate::stack::Stack;
use crate::wire::icmp::{IcmpBuild, TimeExceededKind};
use crate::wire::IpAddr;

pub type ReassKey = (IpAddr, IpAddr, u32);

impl Stack {
    pub(crate) fn reassemble(&mut self, packet: Packet, frag: FragInfo) {
        let ver = packet.ip_version().expect("fragment carries an IP header");
        let key: ReassKey = (packet.src_addr(), packet.dst_addr(), frag.ident);

        if !self.ip.reass.contains_key(&key) {
            let mut held = Packet::new();
            held.reserve_headers();
            held.iface = packet.iface;
            if held.construct_ip_from(&packet, false).is_err() {
                return;
            }
            let timer = self.timers().create_at(
                self.now(),
                self.ip.config.reassembly_timeout(),
                move |stack: &mut Stack| stack.reassemble_timeout(key),
            );
            self.ip.reass.insert(key, Reassembly { packet: held, timer });
            log::trace!("reassembly {:?} started", key);
        }

        let mut drop_entry = false;
        let mut complete = false;
        {
            let entry = self.ip.reass.get_mut(&key).expect("entry just ensured");
            if !frag.more {
                if entry.packet.has_last_fragment {
                    // duplicate last fragment kills the whole reassembly
                    drop_entry = true;
                } else {
                    entry.packet.has_last_fragment = true;
                }
            }
            if !drop_entry {
                if entry
                    .packet
                    .insert(&packet, usize::from(frag.offset), usize::MAX)
                    .is_err()
                {
                    log::debug!("overlapping fragment, reassembly {:?} dropped", key);
                    drop_entry = true;
                } else {
                    complete = entry.packet.buf().is_complete() && entry.packet.has_last_fragment;
                }
            }
        }

        if drop_entry {
            self.ip.reass.remove(&key);
            return;
        }
        if complete {
            let done = self.ip.reass.remove(&key).expect("entry present").packet;
            log::trace!("reassembly {:?} complete ({} bytes)", key, done.len());
            self.ip_input(done, ver);
        }
    }

    /// The reassembly window closed with fragments missing: report Time
    /// Exceeded (reassembly) to the source, quoting the held header.
    pub(crate) fn reassemble_timeout(&mut self, key: ReassKey) {
        let Some(mut entry) = self.ip.reass.remove(&key) else {
            return;
        };
        let (src, dst, _) = key;
        log::debug!("reassembly {:?} timed out", key);
        if entry.packet.carries_icmp() {
            return;
        }

        let hdr_len = entry.packet.ip_hdr_len();
        entry.packet.buf_mut().unmask(hdr_len);
        entry.packet.buf_mut().truncate(hdr_len);

        if let Ok(reply) = Packet::icmp_for(
            src,
            &IcmpBuild::TimeExceeded(TimeExceededKind::Reassembly),
            Some(entry.packet.buf()),
            Some(dst),
        ) {
            let _ = self.output(reply);
        }
    }
}

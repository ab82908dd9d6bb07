//! rill — a userspace Ethernet/IP stack.
//!
//! The stack processes Ethernet frames carrying IPv4, IPv6 and ARP,
//! including ICMPv4/ICMPv6, IGMPv2, MLD, NDP and UDP. It classifies
//! ingress, delivers datagrams to sockets, forwards what is not locally
//! destined and emits outbound frames through the same [`iface::Device`]
//! endpoints it reads from — tap devices, DPDK-style ports or simulators.
//!
//! Everything runs single-threaded and cooperatively: a host driver feeds
//! frames via [`stack::Stack::input`] and pumps [`stack::Stack::poll`];
//! nothing blocks, and packet handlers may re-enter the stack.
//!
//! ```no_run
//! use rill::iface::QueueDevice;
//! use rill::stack::Stack;
//! use rill::wire::HwAddr;
//!
//! let mut stack = Stack::new();
//! let dev = QueueDevice::new(HwAddr([0x02, 0xaa, 0, 0, 0, 1]), 1500);
//! let eth0 = stack.add_interface(Box::new(dev));
//! stack.assign_ip(eth0, "10.0.0.2".parse().unwrap(), 24);
//!
//! let sock = stack.udp_socket();
//! sock.listen(&mut stack, None, 12345).unwrap();
//! sock.on_data(|stack, sock, data, src, src_port| {
//!     let bytes = data.to_vec();
//!     let _ = sock.send(stack, &bytes, Some(src), src_port);
//! });
//!
//! loop {
//!     stack.poll();
//! }
//! ```

pub mod buf;
pub mod config;
pub mod iface;
pub mod ip;
pub mod neigh;
pub mod packet;
pub mod route;
pub mod sock;
pub mod stack;
pub mod timer;
pub mod trie;
pub mod wire;

pub use buf::{Buf, Chunk};
pub use config::StackConfig;
pub use iface::{Device, IfaceId, Interface, QueueDevice};
pub use packet::Packet;
pub use sock::{SockError, UdpSocket};
pub use stack::{OutputError, Stack};
pub use wire::{HwAddr, IpAddr, IpVersion};

//! The stack entry points: interface registry, L2 dispatch and the poll
//! pump.

use std::fmt;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::buf::Buf;
use crate::config::StackConfig;
use crate::iface::{Device, IfaceId, Interface};
use crate::ip::IpStack;
use crate::packet::Packet;
use crate::timer::TimerQueue;
use crate::wire::{EtherType, HdrError, IpVersion};

/// Failures surfaced to callers of the output path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputError {
    /// The packet has no interface and none could be chosen.
    NoInterface,
    NoRoute,
    /// Output of a packet that carries neither an IP nor an ARP header.
    NotIp,
    Hdr(HdrError),
}

impl fmt::Display for OutputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputError::NoInterface => write!(f, "packet has no output interface"),
            OutputError::NoRoute => write!(f, "no route to destination"),
            OutputError::NotIp => write!(f, "not an IP or ARP packet"),
            OutputError::Hdr(e) => write!(f, "header construction failed: {}", e),
        }
    }
}

impl std::error::Error for OutputError {}

impl From<HdrError> for OutputError {
    fn from(e: HdrError) -> Self {
        OutputError::Hdr(e)
    }
}

/// A single-threaded cooperative network stack. Drivers feed frames in via
/// [`Stack::input`]; [`Stack::poll`] pumps devices, timers and neighbor
/// deadlines. Nothing blocks, and packet handlers may re-enter the stack.
pub struct Stack {
    ifaces: Vec<Interface>,
    pub ip: IpStack,
    timers: TimerQueue<Stack>,
    clock: Instant,
}

impl Default for Stack {
    fn default() -> Self {
        Stack::new()
    }
}

impl Stack {
    pub fn new() -> Self {
        Stack::with_config(StackConfig::default())
    }

    pub fn with_config(config: StackConfig) -> Self {
        Stack::with_parts(config, StdRng::from_entropy())
    }

    /// Deterministic variant for tests and simulations.
    pub fn with_seed(config: StackConfig, seed: u64) -> Self {
        Stack::with_parts(config, StdRng::seed_from_u64(seed))
    }

    fn with_parts(config: StackConfig, rng: StdRng) -> Self {
        Stack {
            ifaces: Vec::new(),
            ip: IpStack::new(config, rng),
            timers: TimerQueue::new(),
            clock: Instant::now(),
        }
    }

    /// Attach a device; the returned id names the interface from here on.
    pub fn add_interface(&mut self, device: Box<dyn Device>) -> IfaceId {
        let mut iface = Interface::new(device);
        iface.neighbors.config = self.ip.config.neighbor.clone();
        self.ifaces.push(iface);
        self.ifaces.len() - 1
    }

    pub fn iface(&self, id: IfaceId) -> &Interface {
        &self.ifaces[id]
    }

    pub fn iface_mut(&mut self, id: IfaceId) -> &mut Interface {
        &mut self.ifaces[id]
    }

    pub fn iface_count(&self) -> usize {
        self.ifaces.len()
    }

    pub(crate) fn timers(&self) -> TimerQueue<Stack> {
        self.timers.clone()
    }

    /// The stack's notion of now: the latest poll instant.
    pub(crate) fn now(&self) -> Instant {
        self.clock
    }

    /// Accept one frame from a driver.
    pub fn input(&mut self, iface: IfaceId, frame: Buf) {
        let mut packet = Packet::from_frame(frame);
        packet.iface = Some(iface);
        if packet.read_eth().is_err() {
            log::trace!("iface {}: runt frame dropped", iface);
            return;
        }
        let ethertype = packet.eth().and_then(|e| e.ethertype());
        match ethertype {
            Some(EtherType::Arp) => self.arp_input(packet),
            Some(EtherType::Ipv4) => self.ip_input(packet, IpVersion::V4),
            Some(EtherType::Ipv6) => self.ip_input(packet, IpVersion::V6),
            None => log::trace!("iface {}: unknown ethertype dropped", iface),
        }
    }

    /// Advance timers, drain device receive queues and drive neighbor
    /// deadlines, all against the given instant.
    pub fn poll_at(&mut self, now: Instant) {
        if now > self.clock {
            self.clock = now;
        }
        let timers = self.timers();
        timers.poll_at(self.clock, self);

        for id in 0..self.ifaces.len() {
            while let Some(frame) = self.ifaces[id].device.poll_rx() {
                self.input(id, frame);
            }
            self.ifaces[id].device.poll_tx();

            let mut actions = Vec::new();
            self.ifaces[id].neighbors.poll(self.clock, &mut actions);
            self.run_neigh_actions(id, actions);
        }
    }

    pub fn poll(&mut self) {
        self.poll_at(Instant::now());
    }

    /// Set the source MAC and hand the finished frame to the driver.
    pub(crate) fn l2_output(&mut self, mut packet: Packet) -> Result<(), OutputError> {
        let iface_id = packet.iface.ok_or(OutputError::NoInterface)?;
        if iface_id >= self.ifaces.len() {
            return Err(OutputError::NoInterface);
        }
        let src = self.ifaces[iface_id].addr();
        {
            let mut eth = packet.eth_mut().ok_or(OutputError::NotIp)?;
            eth.set_src(src);
        }
        let eth_size = packet.eth_size();
        packet.buf_mut().unmask(eth_size);
        self.ifaces[iface_id].device.enqueue(packet.into_buf());
        Ok(())
    }
}

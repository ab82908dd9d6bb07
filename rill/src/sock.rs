//! Datagram sockets and the five-tuple lookup table.
//!
//! Socket handles are reference-counted; the table holds weak entries and
//! prunes them lazily, so dropping the last handle unbinds the socket.
//! Delivery prefers a connected match, then a listener on the exact local
//! address, then a listener on the unspecified address.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use rand::Rng;

use crate::buf::Buf;
use crate::packet::Packet;
use crate::stack::{OutputError, Stack};
use crate::wire::udp::UdpHdr;
use crate::wire::{IpAddr, IpProto};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockError {
    AddrInUse,
    NoFreePorts,
    /// Send without a destination on an unconnected socket.
    NotConnected,
    Output(OutputError),
}

impl fmt::Display for SockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SockError::AddrInUse => write!(f, "address already in use"),
            SockError::NoFreePorts => write!(f, "no free ephemeral ports"),
            SockError::NotConnected => write!(f, "socket has no remote address"),
            SockError::Output(e) => write!(f, "send failed: {}", e),
        }
    }
}

impl std::error::Error for SockError {}

impl From<OutputError> for SockError {
    fn from(e: OutputError) -> Self {
        SockError::Output(e)
    }
}

/// Datagram receive hook. Runs with the stack borrowed mutably so the
/// handler can answer immediately.
pub type OnData = dyn FnMut(&mut Stack, &UdpSocket, &Buf, IpAddr, u16);

pub(crate) struct SockState {
    pub proto: IpProto,
    pub local: Option<IpAddr>,
    pub local_port: u16,
    pub remote: Option<IpAddr>,
    pub remote_port: u16,
    pub listening: bool,
    pub connected: bool,
    pub on_data: Option<Box<OnData>>,
}

impl SockState {
    fn new(proto: IpProto) -> Self {
        SockState {
            proto,
            local: None,
            local_port: 0,
            remote: None,
            remote_port: 0,
            listening: false,
            connected: false,
            on_data: None,
        }
    }
}

pub(crate) type SockRef = Rc<RefCell<SockState>>;

type ListenKey = (u8, IpAddr, u16);
type ConnKey = (u8, IpAddr, u16, IpAddr, u16);

/// Listening and connected indexes plus ephemeral port policy.
pub struct SocketTable {
    listening: HashMap<ListenKey, Weak<RefCell<SockState>>>,
    connected: HashMap<ConnKey, Weak<RefCell<SockState>>>,
    pub port_min: u16,
    pub port_max: u16,
}

impl SocketTable {
    pub fn new(port_min: u16, port_max: u16) -> Self {
        SocketTable { listening: HashMap::new(), connected: HashMap::new(), port_min, port_max }
    }

    fn listen_live(&mut self, key: &ListenKey) -> Option<SockRef> {
        match self.listening.get(key).and_then(Weak::upgrade) {
            Some(s) => Some(s),
            None => {
                self.listening.remove(key);
                None
            }
        }
    }

    fn conn_live(&mut self, key: &ConnKey) -> Option<SockRef> {
        match self.connected.get(key).and_then(Weak::upgrade) {
            Some(s) => Some(s),
            None => {
                self.connected.remove(key);
                None
            }
        }
    }

    /// Pick a free port uniformly at random, with one try per port in the
    /// configured range as the retry budget.
    fn pick_port(
        &mut self,
        proto: u8,
        local: IpAddr,
        remote: Option<(IpAddr, u16)>,
        rng: &mut impl Rng,
    ) -> Result<u16, SockError> {
        let budget = u32::from(self.port_max - self.port_min) + 1;
        for _ in 0..budget {
            let port = rng.gen_range(self.port_min..=self.port_max);
            let free = match remote {
                Some((raddr, rport)) => self.conn_live(&(proto, local, port, raddr, rport)).is_none(),
                None => self.listen_live(&(proto, local, port)).is_none(),
            };
            if free {
                return Ok(port);
            }
        }
        Err(SockError::NoFreePorts)
    }

    pub(crate) fn bind_listen(
        &mut self,
        sock: &SockRef,
        local: Option<IpAddr>,
        port: u16,
        rng: &mut impl Rng,
    ) -> Result<(), SockError> {
        let local = local.unwrap_or(IpAddr::UNSPECIFIED);
        let proto = sock.borrow().proto.to_u8();
        let port = if port == 0 { self.pick_port(proto, local, None, rng)? } else { port };
        let key = (proto, local, port);
        if self.listen_live(&key).is_some() {
            return Err(SockError::AddrInUse);
        }
        self.listening.insert(key, Rc::downgrade(sock));
        let mut state = sock.borrow_mut();
        state.local = Some(local);
        state.local_port = port;
        state.listening = true;
        Ok(())
    }

    pub(crate) fn bind_connect(
        &mut self,
        sock: &SockRef,
        remote: IpAddr,
        remote_port: u16,
        local: IpAddr,
        local_port: u16,
        rng: &mut impl Rng,
    ) -> Result<(), SockError> {
        let proto = sock.borrow().proto.to_u8();
        let local_port = if local_port == 0 {
            self.pick_port(proto, local, Some((remote, remote_port)), rng)?
        } else {
            local_port
        };
        let key = (proto, local, local_port, remote, remote_port);
        if self.conn_live(&key).is_some() {
            return Err(SockError::AddrInUse);
        }
        // a listening socket that connects moves indexes
        {
            let state = sock.borrow();
            if state.listening {
                if let (Some(l), p) = (state.local, state.local_port) {
                    self.listening.remove(&(proto, l, p));
                }
            }
        }
        self.connected.insert(key, Rc::downgrade(sock));
        let mut state = sock.borrow_mut();
        state.local = Some(local);
        state.local_port = local_port;
        state.remote = Some(remote);
        state.remote_port = remote_port;
        state.listening = false;
        state.connected = true;
        Ok(())
    }

    /// Find the socket an incoming datagram belongs to. The second value is
    /// true for a connected-index hit.
    pub(crate) fn lookup(
        &mut self,
        proto: IpProto,
        local: IpAddr,
        local_port: u16,
        remote: IpAddr,
        remote_port: u16,
    ) -> Option<(SockRef, bool)> {
        let proto = proto.to_u8();
        if let Some(s) = self.conn_live(&(proto, local, local_port, remote, remote_port)) {
            return Some((s, true));
        }
        if let Some(s) = self.listen_live(&(proto, local, local_port)) {
            return Some((s, false));
        }
        if let Some(s) = self.listen_live(&(proto, IpAddr::UNSPECIFIED, local_port)) {
            return Some((s, false));
        }
        None
    }
}

/// A UDP socket handle. All operations go through the owning stack.
#[derive(Clone)]
pub struct UdpSocket(pub(crate) SockRef);

impl UdpSocket {
    pub(crate) fn new() -> Self {
        UdpSocket(Rc::new(RefCell::new(SockState::new(IpProto::Udp))))
    }

    pub(crate) fn from_ref(r: SockRef) -> Self {
        UdpSocket(r)
    }

    pub fn local_addr(&self) -> Option<IpAddr> {
        self.0.borrow().local
    }

    pub fn local_port(&self) -> u16 {
        self.0.borrow().local_port
    }

    pub fn remote_addr(&self) -> Option<IpAddr> {
        self.0.borrow().remote
    }

    pub fn remote_port(&self) -> u16 {
        self.0.borrow().remote_port
    }

    /// Receive datagrams addressed to `port` on `local` (any local address
    /// when `None`). Port zero picks a free ephemeral port.
    pub fn listen(
        &self,
        stack: &mut Stack,
        local: Option<IpAddr>,
        port: u16,
    ) -> Result<(), SockError> {
        let (socks, rng) = stack.ip.socks_and_rng();
        socks.bind_listen(&self.0, local, port, rng)
    }

    /// Fix the remote endpoint; the local half is selected when not given.
    pub fn connect(
        &self,
        stack: &mut Stack,
        remote: IpAddr,
        remote_port: u16,
        local: Option<IpAddr>,
        local_port: u16,
    ) -> Result<(), SockError> {
        let local = match local {
            Some(l) => l,
            None => stack
                .select_src_addr(Some(remote), None)
                .unwrap_or(IpAddr::UNSPECIFIED),
        };
        let (socks, rng) = stack.ip.socks_and_rng();
        socks.bind_connect(&self.0, remote, remote_port, local, local_port, rng)
    }

    /// Install the receive callback.
    pub fn on_data(&self, cb: impl FnMut(&mut Stack, &UdpSocket, &Buf, IpAddr, u16) + 'static) {
        self.0.borrow_mut().on_data = Some(Box::new(cb));
    }

    /// Send a datagram. Destination defaults to the connected remote.
    pub fn send(
        &self,
        stack: &mut Stack,
        payload: &[u8],
        dst: Option<IpAddr>,
        dst_port: u16,
    ) -> Result<(), SockError> {
        self.send_buf(stack, Buf::copy_from(payload), dst, dst_port)
    }

    /// Like [`UdpSocket::send`], but takes an already chunked buffer.
    pub fn send_buf(
        &self,
        stack: &mut Stack,
        payload: Buf,
        dst: Option<IpAddr>,
        dst_port: u16,
    ) -> Result<(), SockError> {
        let (dst, dst_port, src, src_port) = {
            let state = self.0.borrow();
            let dst = match dst.or(state.remote) {
                Some(d) => d,
                None => return Err(SockError::NotConnected),
            };
            let dst_port = if dst_port != 0 {
                dst_port
            } else if state.remote_port != 0 {
                state.remote_port
            } else {
                return Err(SockError::NotConnected);
            };
            (dst, dst_port, state.local, state.local_port)
        };

        let mut p = Packet::from_payload(payload);
        p.construct_udp()
            .map_err(|e| SockError::Output(OutputError::Hdr(e)))?;
        p.buf_mut().unmask(UdpHdr::<&[u8]>::SIZE);
        let len = p.len() as u16;
        {
            let mut udp = p.udp_mut().expect("udp header recorded");
            udp.set_src_port(src_port);
            udp.set_dst_port(dst_port);
            udp.set_length(len);
        }
        let ver = dst.version();
        p.construct_ip(ver, IpProto::Udp, false)
            .map_err(|e| SockError::Output(OutputError::Hdr(e)))?;
        p.set_dst_addr(dst);
        if let Some(src) = src.filter(|s| !s.is_unspecified()) {
            if src.version() == ver {
                p.set_src_addr(src);
                p.force_source_ip = true;
            }
        }
        stack.output(p).map_err(SockError::Output)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn sock() -> SockRef {
        Rc::new(RefCell::new(SockState::new(IpProto::Udp)))
    }

    #[test]
    fn listen_conflicts_detected() {
        let mut t = SocketTable::new(49152, 65535);
        let mut rng = StdRng::seed_from_u64(7);
        let a = sock();
        let b = sock();
        t.bind_listen(&a, None, 9000, &mut rng).unwrap();
        assert_eq!(t.bind_listen(&b, None, 9000, &mut rng).unwrap_err(), SockError::AddrInUse);
        // the port frees up when the socket is dropped
        drop(a);
        t.bind_listen(&b, None, 9000, &mut rng).unwrap();
    }

    #[test]
    fn lookup_prefers_connected_then_exact_then_any() {
        let mut t = SocketTable::new(49152, 65535);
        let mut rng = StdRng::seed_from_u64(7);
        let any = sock();
        let exact = sock();
        let conn = sock();
        t.bind_listen(&any, None, 53, &mut rng).unwrap();
        t.bind_listen(&exact, Some(ip("10.0.0.2")), 53, &mut rng).unwrap();
        t.bind_connect(&conn, ip("10.0.0.3"), 5000, ip("10.0.0.2"), 53, &mut rng)
            .unwrap();

        let (hit, connected) = t
            .lookup(IpProto::Udp, ip("10.0.0.2"), 53, ip("10.0.0.3"), 5000)
            .unwrap();
        assert!(connected);
        assert!(Rc::ptr_eq(&hit, &conn));

        let (hit, connected) = t
            .lookup(IpProto::Udp, ip("10.0.0.2"), 53, ip("10.0.0.9"), 1234)
            .unwrap();
        assert!(!connected);
        assert!(Rc::ptr_eq(&hit, &exact));

        let (hit, _) = t
            .lookup(IpProto::Udp, ip("10.0.0.7"), 53, ip("10.0.0.9"), 1234)
            .unwrap();
        assert!(Rc::ptr_eq(&hit, &any));
    }

    #[test]
    fn ephemeral_ports_come_from_the_range(){
        let mut t = SocketTable::new(60000, 60003);
        let mut rng = StdRng::seed_from_u64(1);
        let a = sock();
        t.bind_listen(&a, None, 0, &mut rng).unwrap();
        let port = a.borrow().local_port;
        assert!((60000..=60003).contains(&port));
    }

    #[test]
    fn port_exhaustion_reports_no_free_ports() {
        let mut t = SocketTable::new(60000, 60000);
        let mut rng = StdRng::seed_from_u64(1);
        let a = sock();
        let b = sock();
        t.bind_listen(&a, None, 0, &mut rng).unwrap();
        assert_eq!(t.bind_listen(&b, None, 0, &mut rng).unwrap_err(), SockError::NoFreePorts);
    }
}

//! UDP socket collaborator.
//!
//! The responder core performs no network I/O itself. Everything it sends
//! goes through the [`Transport`] trait, and everything it receives is fed to
//! it as an [`RxFrame`] by the embedding application (usually from a thread
//! blocked on [`MulticastSocket::recv_frame`]).

use std::{
    collections::HashMap,
    fmt, io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    sync::{Arc, Mutex},
};

use socket2::{Domain, Protocol, Socket, Type};

use crate::{MAX_PACKET_SIZE, MDNS_PORT};

/// The mDNS IPv4 multicast group.
pub const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// The mDNS IPv6 link-local multicast group.
pub const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

/// Identifies a network interface in the responder's interface table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct IfaceId(pub u8);

impl fmt::Display for IfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if{}", self.0)
    }
}

/// The address family of a socket, packet or protocol control block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Returns the canonical mDNS multicast destination for this family.
    pub fn multicast_dst(&self) -> SocketAddr {
        match self {
            IpFamily::V4 => SocketAddr::new(IpAddr::V4(MDNS_GROUP_V4), MDNS_PORT),
            IpFamily::V6 => SocketAddr::new(IpAddr::V6(MDNS_GROUP_V6), MDNS_PORT),
        }
    }

    /// Returns the family `addr` belongs to.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IpFamily::V4 => "v4",
            IpFamily::V6 => "v6",
        })
    }
}

/// A received UDP datagram, together with where it came from.
#[derive(Debug)]
pub struct RxFrame {
    /// Interface the datagram arrived on.
    pub iface: IfaceId,
    /// Address family of the receiving socket.
    pub family: IpFamily,
    /// Source address of the datagram.
    pub src: IpAddr,
    /// Source port of the datagram.
    pub src_port: u16,
    /// Whether the datagram was addressed to the multicast group.
    pub multicast: bool,
    /// The raw datagram payload.
    pub payload: Vec<u8>,
}

/// The socket layer consumed by the responder core.
///
/// One socket exists per (interface, address family); `open` joins the
/// multicast group and `close` leaves it.
pub trait Transport: Send {
    /// Opens the socket for `(iface, family)` and joins the multicast group
    /// on the interface that owns `addr`.
    fn open(&mut self, iface: IfaceId, family: IpFamily, addr: IpAddr) -> io::Result<()>;

    /// Sends a datagram out of the socket belonging to `(iface, family)`.
    fn send(
        &mut self,
        iface: IfaceId,
        family: IpFamily,
        dst: SocketAddr,
        payload: &[u8],
    ) -> io::Result<()>;

    /// Closes the socket for `(iface, family)`, leaving the multicast group.
    fn close(&mut self, iface: IfaceId, family: IpFamily);
}

/// The default [`Transport`]: one UDP socket per (interface, family), bound
/// to port 5353 with address reuse, joined to the mDNS multicast group.
#[derive(Default)]
pub struct MulticastSocket {
    socks: HashMap<(IfaceId, IpFamily), UdpSocket>,
}

impl MulticastSocket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the socket opened for `(iface, family)`, if any.
    ///
    /// The application's receive loop reads from this (usually via
    /// [`MulticastSocket::recv_frame`]) and feeds the frames to the
    /// responder.
    pub fn socket(&self, iface: IfaceId, family: IpFamily) -> Option<&UdpSocket> {
        self.socks.get(&(iface, family))
    }

    /// Receives a single datagram from `sock` and packages it as an
    /// [`RxFrame`].
    pub fn recv_frame(sock: &UdpSocket, iface: IfaceId, family: IpFamily) -> io::Result<RxFrame> {
        let mut buf = [0; MAX_PACKET_SIZE];
        let (len, src) = sock.recv_from(&mut buf)?;
        Ok(RxFrame {
            iface,
            family,
            src: src.ip(),
            src_port: src.port(),
            // The sockets here are bound to the wildcard address and joined
            // to the group, so everything that arrives on port 5353 is
            // treated as group traffic.
            multicast: true,
            payload: buf[..len].to_vec(),
        })
    }

    fn open_socket(family: IpFamily, addr: IpAddr) -> io::Result<UdpSocket> {
        match (family, addr) {
            (IpFamily::V4, IpAddr::V4(local)) => {
                let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
                sock.set_reuse_address(true)?;
                sock.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, MDNS_PORT)).into())?;

                let sock = UdpSocket::from(sock);
                sock.join_multicast_v4(&MDNS_GROUP_V4, &local)?;
                sock.set_multicast_loop_v4(false)?;
                Ok(sock)
            }
            (IpFamily::V6, IpAddr::V6(_)) => {
                let sock = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
                sock.set_reuse_address(true)?;
                sock.set_only_v6(true)?;
                sock.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, MDNS_PORT)).into())?;

                let sock = UdpSocket::from(sock);
                sock.join_multicast_v6(&MDNS_GROUP_V6, 0)?;
                sock.set_multicast_loop_v6(false)?;
                Ok(sock)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interface address does not match socket family",
            )),
        }
    }
}

impl Transport for MulticastSocket {
    fn open(&mut self, iface: IfaceId, family: IpFamily, addr: IpAddr) -> io::Result<()> {
        if self.socks.contains_key(&(iface, family)) {
            return Ok(());
        }
        let sock = Self::open_socket(family, addr)?;
        log::debug!("{}/{}: joined mDNS group", iface, family);
        self.socks.insert((iface, family), sock);
        Ok(())
    }

    fn send(
        &mut self,
        iface: IfaceId,
        family: IpFamily,
        dst: SocketAddr,
        payload: &[u8],
    ) -> io::Result<()> {
        let sock = self
            .socks
            .get(&(iface, family))
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        sock.send_to(payload, dst)?;
        Ok(())
    }

    fn close(&mut self, iface: IfaceId, family: IpFamily) {
        if self.socks.remove(&(iface, family)).is_some() {
            log::debug!("{}/{}: left mDNS group", iface, family);
        }
    }
}

/// A [`Transport`] that records every sent datagram instead of touching the
/// network. Used to test the protocol core.
#[derive(Default, Clone)]
pub struct Capture {
    sent: Arc<Mutex<Vec<SentFrame>>>,
}

/// A datagram recorded by [`Capture`].
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub iface: IfaceId,
    pub family: IpFamily,
    pub dst: SocketAddr,
    pub payload: Vec<u8>,
}

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes all frames recorded so far.
    pub fn take(&self) -> Vec<SentFrame> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }
}

impl Transport for Capture {
    fn open(&mut self, _iface: IfaceId, _family: IpFamily, _addr: IpAddr) -> io::Result<()> {
        Ok(())
    }

    fn send(
        &mut self,
        iface: IfaceId,
        family: IpFamily,
        dst: SocketAddr,
        payload: &[u8],
    ) -> io::Result<()> {
        self.sent.lock().unwrap().push(SentFrame {
            iface,
            family,
            dst,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn close(&mut self, _iface: IfaceId, _family: IpFamily) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multicast_destinations() {
        assert_eq!(
            IpFamily::V4.multicast_dst().to_string(),
            "224.0.0.251:5353"
        );
        assert_eq!(
            IpFamily::V6.multicast_dst().to_string(),
            "[ff02::fb]:5353"
        );
    }

    #[test]
    fn capture_records_sends() {
        let cap = Capture::new();
        let mut t = cap.clone();
        t.send(
            IfaceId(0),
            IpFamily::V4,
            IpFamily::V4.multicast_dst(),
            &[1, 2, 3],
        )
        .unwrap();
        let sent = cap.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, vec![1, 2, 3]);
        assert!(cap.take().is_empty());
    }
}

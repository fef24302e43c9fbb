use super::traits::SomeIpTransport;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::Result;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn new(bind_addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)?;
        Ok(UdpTransport { socket })
    }

    /// Bind a socket that can share its port with other processes on the
    /// host, as every SD participant listens on the same multicast port.
    pub fn new_multicast(bind_addr: SocketAddr) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(bind_addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.bind(&bind_addr.into())?;
        Ok(UdpTransport { socket: socket.into() })
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(UdpTransport { socket: self.socket.try_clone()? })
    }

    pub fn join_multicast_v4(&self, multiaddr: &Ipv4Addr, interface: &Ipv4Addr) -> Result<()> {
        self.socket.join_multicast_v4(multiaddr, interface)
    }

    pub fn set_multicast_if_v4(&self, interface: &Ipv4Addr) -> Result<()> {
        socket2::SockRef::from(&self.socket).set_multicast_if_v4(interface)
    }

    pub fn set_multicast_loop_v4(&self, enabled: bool) -> Result<()> {
        self.socket.set_multicast_loop_v4(enabled)
    }
}

impl SomeIpTransport for UdpTransport {
    fn send(&self, data: &[u8], destination: SocketAddr) -> Result<usize> {
        self.socket.send_to(data, destination)
    }

    fn receive(&self, buffer: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.socket.recv_from(buffer)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn set_receive_timeout(&self, timeout: Duration) -> Result<()> {
        self.socket.set_read_timeout(Some(timeout))
    }
}

//! In-process datagram network.
//!
//! Several applications in one process (or one test) talk over a shared
//! [`MemoryNetwork`] exactly as they would over UDP: unicast addresses,
//! multicast groups, silent loss for unknown destinations. Links can be
//! taken down to simulate a peer vanishing, or set to refuse traffic to
//! simulate a send failure.

use super::traits::SomeIpTransport;
use std::collections::{HashMap, HashSet};
use std::io::{Error, ErrorKind, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

type Datagram = (Vec<u8>, SocketAddr);

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<SocketAddr, Sender<Datagram>>,
    groups: HashMap<SocketAddr, HashSet<SocketAddr>>,
    refused: HashSet<SocketAddr>,
    next_port: u16,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, NetworkState>> {
        self.state
            .lock()
            .map_err(|_| Error::new(ErrorKind::Other, "memory network poisoned"))
    }

    /// Attach an endpoint. Port 0 picks a free port on the given IP.
    pub fn bind(&self, addr: SocketAddr) -> Result<MemoryTransport> {
        let mut state = self.lock()?;
        let addr = if addr.port() == 0 {
            let mut candidate = addr;
            loop {
                state.next_port = state.next_port.wrapping_add(1).max(40000);
                candidate.set_port(state.next_port);
                if !state.endpoints.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            addr
        };
        if state.endpoints.contains_key(&addr) {
            return Err(Error::new(ErrorKind::AddrInUse, format!("{addr} already bound")));
        }

        let (tx, rx) = mpsc::channel();
        state.endpoints.insert(addr, tx);
        Ok(MemoryTransport {
            addr,
            network: self.clone(),
            rx: Mutex::new(rx),
            timeout: Mutex::new(Duration::from_millis(100)),
        })
    }

    /// Bind on a loopback-style address `10.0.0.<host>:<port>`.
    pub fn bind_host(&self, host: u8, port: u16) -> Result<MemoryTransport> {
        self.bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, host)), port))
    }

    pub fn join(&self, group: SocketAddr, member: SocketAddr) -> Result<()> {
        self.lock()?.groups.entry(group).or_default().insert(member);
        Ok(())
    }

    /// Drop an endpoint from the network; traffic to it is lost from now on.
    pub fn disconnect(&self, addr: SocketAddr) -> Result<()> {
        let mut state = self.lock()?;
        state.endpoints.remove(&addr);
        for members in state.groups.values_mut() {
            members.remove(&addr);
        }
        Ok(())
    }

    /// Make every send to `addr` fail with `ConnectionRefused`.
    pub fn refuse(&self, addr: SocketAddr) -> Result<()> {
        self.lock()?.refused.insert(addr);
        Ok(())
    }

    fn deliver(&self, from: SocketAddr, data: &[u8], to: SocketAddr) -> Result<usize> {
        let state = self.lock()?;
        if state.refused.contains(&to) {
            return Err(Error::new(ErrorKind::ConnectionRefused, format!("{to} refused")));
        }
        if let Some(members) = state.groups.get(&to) {
            for member in members.iter().filter(|m| **m != from) {
                if let Some(tx) = state.endpoints.get(member) {
                    let _ = tx.send((data.to_vec(), from));
                }
            }
        } else if let Some(tx) = state.endpoints.get(&to) {
            let _ = tx.send((data.to_vec(), from));
        }
        Ok(data.len())
    }
}

pub struct MemoryTransport {
    addr: SocketAddr,
    network: MemoryNetwork,
    rx: Mutex<Receiver<Datagram>>,
    timeout: Mutex<Duration>,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl SomeIpTransport for MemoryTransport {
    fn send(&self, data: &[u8], destination: SocketAddr) -> Result<usize> {
        self.network.deliver(self.addr, data, destination)
    }

    fn receive(&self, buffer: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let timeout = *self
            .timeout
            .lock()
            .map_err(|_| Error::new(ErrorKind::Other, "timeout lock poisoned"))?;
        let rx = self
            .rx
            .lock()
            .map_err(|_| Error::new(ErrorKind::Other, "receiver lock poisoned"))?;
        match rx.recv_timeout(timeout) {
            Ok((data, src)) => {
                // Datagram semantics: excess bytes are discarded
                let len = data.len().min(buffer.len());
                buffer[..len].copy_from_slice(&data[..len]);
                Ok((len, src))
            }
            Err(RecvTimeoutError::Timeout) => {
                Err(Error::new(ErrorKind::TimedOut, "receive timed out"))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::new(ErrorKind::NotConnected, format!("{} disconnected", self.addr)))
            }
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.addr)
    }

    fn set_receive_timeout(&self, timeout: Duration) -> Result<()> {
        let mut current = self
            .timeout
            .lock()
            .map_err(|_| Error::new(ErrorKind::Other, "timeout lock poisoned"))?;
        *current = timeout;
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let _ = self.network.disconnect(self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::is_timeout;

    #[test]
    fn test_unicast_delivery() {
        let net = MemoryNetwork::new();
        let a = net.bind_host(1, 0).unwrap();
        let b = net.bind_host(2, 0).unwrap();

        a.send(b"hello", b.local_addr().unwrap()).unwrap();

        let mut buf = [0u8; 16];
        let (len, src) = b.receive(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(src, a.local_addr().unwrap());
    }

    #[test]
    fn test_multicast_excludes_sender() {
        let net = MemoryNetwork::new();
        let group: SocketAddr = "224.224.224.245:30490".parse().unwrap();
        let a = net.bind_host(1, 30490).unwrap();
        let b = net.bind_host(2, 30490).unwrap();
        net.join(group, a.local_addr().unwrap()).unwrap();
        net.join(group, b.local_addr().unwrap()).unwrap();
        a.set_receive_timeout(Duration::from_millis(20)).unwrap();

        a.send(b"offer", group).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(b.receive(&mut buf).unwrap().0, 5);
        assert!(is_timeout(&a.receive(&mut buf).unwrap_err()));
    }

    #[test]
    fn test_duplicate_bind_rejected() {
        let net = MemoryNetwork::new();
        let _a = net.bind_host(1, 5000).unwrap();
        let err = net.bind_host(1, 5000).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::AddrInUse);
    }

    #[test]
    fn test_disconnected_destination_is_silent_loss() {
        let net = MemoryNetwork::new();
        let a = net.bind_host(1, 0).unwrap();
        let b = net.bind_host(2, 0).unwrap();
        let b_addr = b.local_addr().unwrap();
        drop(b);

        assert_eq!(a.send(b"gone", b_addr).unwrap(), 4);
    }

    #[test]
    fn test_refused_destination_errors() {
        let net = MemoryNetwork::new();
        let a = net.bind_host(1, 0).unwrap();
        let b = net.bind_host(2, 0).unwrap();
        net.refuse(b.local_addr().unwrap()).unwrap();

        let err = a.send(b"x", b.local_addr().unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
    }
}

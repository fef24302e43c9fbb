use std::io::Result;
use std::net::SocketAddr;
use std::time::Duration;

/// Datagram transport the runtime sends and receives through.
/// Object-safe so real sockets and in-memory links are interchangeable.
pub trait SomeIpTransport: Send + Sync {
    /// Send one datagram to `destination` (unicast endpoint or multicast group).
    fn send(&self, data: &[u8], destination: SocketAddr) -> Result<usize>;

    /// Receive one datagram. Returns the number of bytes read and the source
    /// address. Once the receive timeout elapses this fails with `WouldBlock`
    /// or `TimedOut`, which callers treat as "nothing yet".
    fn receive(&self, buffer: &mut [u8]) -> Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> Result<SocketAddr>;

    fn set_receive_timeout(&self, timeout: Duration) -> Result<()>;
}

/// `true` for the errors a timed-out `receive` produces.
pub fn is_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
}

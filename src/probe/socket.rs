use anyhow::{Result, anyhow};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// Everything the traceroute engine needs from the network.
///
/// The raw ICMP socket implements this; tests substitute scripted transports.
pub trait ProbeTransport {
    /// Set the IP TTL used for subsequent sends
    fn set_ttl(&mut self, ttl: u8) -> io::Result<()>;

    /// Send one ICMP message to `dest`
    fn send(&mut self, packet: &[u8], dest: Ipv4Addr) -> io::Result<usize>;

    /// Wait up to `timeout` for one datagram (IPv4 header included) and copy
    /// it into `buffer`. `Ok(None)` means the wait expired.
    fn recv(&mut self, buffer: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;
}

/// Check that raw ICMP sockets can be opened
pub fn check_permissions() -> Result<()> {
    if create_raw_icmp_socket().is_ok() {
        return Ok(());
    }

    let binary_path = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "netwatch".to_string());

    Err(anyhow!(
        "Insufficient permissions for raw sockets.\n\n\
         Fix options:\n\
         \u{2022} Run with sudo: sudo netwatch <interface>\n\
         \u{2022} Add capabilities: sudo setcap cap_net_raw,cap_net_admin+ep {}",
        binary_path
    ))
}

/// Create a blocking raw IPv4 ICMP socket
pub fn create_raw_icmp_socket() -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
    socket.set_nonblocking(false)?;
    Ok(socket)
}

/// Set TTL on a socket
pub fn set_ttl(socket: &Socket, ttl: u8) -> io::Result<()> {
    socket.set_ttl(ttl as u32)
}

/// Send ICMP packet to target
pub fn send_icmp(socket: &Socket, packet: &[u8], target: Ipv4Addr) -> io::Result<usize> {
    let addr = SocketAddr::V4(SocketAddrV4::new(target, 0));
    socket.send_to(packet, &SockAddr::from(addr))
}

/// Block until the socket is readable or `timeout` passes.
/// Returns false on timeout (or a signal interrupting the wait).
#[cfg(unix)]
pub fn wait_readable(socket: &Socket, timeout: Duration) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let mut fds = libc::pollfd {
        fd: socket.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    // Round up so sub-millisecond remainders still wait
    let millis = timeout.as_micros().div_ceil(1000).min(libc::c_int::MAX as u128) as libc::c_int;

    let ret = unsafe { libc::poll(&mut fds, 1, millis) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(ret > 0 && fds.revents & libc::POLLIN != 0)
}

/// Fallback readiness wait for platforms without poll(2): rely on SO_RCVTIMEO
#[cfg(not(unix))]
pub fn wait_readable(socket: &Socket, timeout: Duration) -> io::Result<bool> {
    socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
    Ok(true)
}

/// Raw ICMP socket owned by one traceroute run
#[derive(Debug)]
pub struct IcmpSocket {
    socket: Socket,
}

impl IcmpSocket {
    pub fn open() -> io::Result<Self> {
        Ok(Self {
            socket: create_raw_icmp_socket()?,
        })
    }
}

impl ProbeTransport for IcmpSocket {
    fn set_ttl(&mut self, ttl: u8) -> io::Result<()> {
        set_ttl(&self.socket, ttl)
    }

    fn send(&mut self, packet: &[u8], dest: Ipv4Addr) -> io::Result<usize> {
        send_icmp(&self.socket, packet, dest)
    }

    fn recv(&mut self, buffer: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        if !wait_readable(&self.socket, timeout)? {
            return Ok(None);
        }
        match (&self.socket).read(buffer) {
            Ok(len) => Ok(Some(len)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

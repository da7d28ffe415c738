//! Raw TCP sockets with the option sets the agent modes need.
//!
//! Socket options are applied on the raw fd before `connect`, because the
//! timestamping and buffer options must be in place before the first byte
//! moves. The fd is only wrapped into a `std::net::TcpStream` once connected.

use crate::{Error, Result};
use std::io::{self, IoSlice, Read};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn, SockaddrIn6};

#[cfg(target_os = "linux")]
use crate::hw_timestamp;
#[cfg(target_os = "linux")]
use crate::Timestamp;

/// Send/receive buffer size for the open-loop modes
pub const SOCKET_BUF_SIZE: usize = 512 * 1024;

/// Busy-poll budget in microseconds for the closed-loop latency mode
#[cfg(target_os = "linux")]
const BUSY_POLL_US: i32 = 1_000_000;

/// Per-mode socket option profile.
///
/// The latency mode runs blocking sockets with busy polling; the open-loop
/// modes run non-blocking with large kernel buffers. All profiles disable
/// Nagle and arm a zero-timeout linger so teardown sends RST instead of
/// lingering in TIME_WAIT.
#[derive(Debug, Clone, Default)]
pub struct SocketProfile {
    pub nonblocking: bool,
    pub no_delay: bool,
    pub linger_rst: bool,
    pub busy_poll: bool,
    pub large_buffers: bool,
    pub bind_device: Option<String>,
    pub hw_timestamps: bool,
    pub read_timeout: Option<Duration>,
}

impl SocketProfile {
    /// Blocking request/response measurement socket.
    pub fn latency() -> Self {
        Self {
            nonblocking: false,
            no_delay: true,
            linger_rst: true,
            busy_poll: true,
            large_buffers: false,
            bind_device: None,
            hw_timestamps: false,
            // Bounds the blocking recv so the worker can notice a stop request
            read_timeout: Some(Duration::from_millis(100)),
        }
    }

    /// Non-blocking open-loop socket (throughput and symmetric modes).
    pub fn open_loop() -> Self {
        Self {
            nonblocking: true,
            no_delay: true,
            linger_rst: true,
            busy_poll: false,
            large_buffers: true,
            bind_device: None,
            hw_timestamps: false,
            read_timeout: None,
        }
    }

    /// Open-loop socket pinned to a NIC with hardware timestamping armed.
    pub fn open_loop_nic(interface: &str) -> Self {
        Self {
            bind_device: Some(interface.to_string()),
            hw_timestamps: true,
            ..Self::open_loop()
        }
    }
}

/// Outcome of a single receive attempt on a connection socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// Bytes were appended to the buffer
    Data(usize),
    /// Peer closed the connection
    Closed,
    /// Nothing available right now
    WouldBlock,
}

/// A connected TCP socket carrying a mode profile.
#[derive(Debug)]
pub struct TcpSock {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpSock {
    /// Open a connection to `addr` with the given option profile.
    pub fn connect(addr: SocketAddr, profile: &SocketProfile) -> Result<Self> {
        let family = if addr.is_ipv4() { AddressFamily::Inet } else { AddressFamily::Inet6 };
        let fd = socket::socket(family, SockType::Stream, SockFlag::empty(), None)?;

        if profile.no_delay {
            socket::setsockopt(&fd, sockopt::TcpNoDelay, &true)?;
        }
        if profile.linger_rst {
            let linger = libc::linger { l_onoff: 1, l_linger: 0 };
            socket::setsockopt(&fd, sockopt::Linger, &linger)?;
        }
        if profile.large_buffers {
            socket::setsockopt(&fd, sockopt::SndBuf, &SOCKET_BUF_SIZE)?;
            socket::setsockopt(&fd, sockopt::RcvBuf, &SOCKET_BUF_SIZE)?;
        }
        if profile.busy_poll {
            set_busy_poll(fd.as_raw_fd())?;
        }
        if let Some(ref device) = profile.bind_device {
            bind_device(fd.as_raw_fd(), device)?;
        }

        match addr {
            SocketAddr::V4(v4) => socket::connect(fd.as_raw_fd(), &SockaddrIn::from(v4))?,
            SocketAddr::V6(v6) => socket::connect(fd.as_raw_fd(), &SockaddrIn6::from(v6))?,
        }

        if profile.hw_timestamps {
            // Must precede the first send so the OPT_ID byte counter starts
            // at zero
            enable_hw_timestamps(fd.as_raw_fd())?;
        }

        let stream = TcpStream::from(fd);
        if profile.nonblocking {
            stream.set_nonblocking(true)?;
        }
        if let Some(timeout) = profile.read_timeout {
            stream.set_read_timeout(Some(timeout))?;
        }

        Ok(Self { stream, peer: addr })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Scatter-gather send. Returns the byte count the kernel accepted.
    pub fn send_vectored(&self, segments: &[IoSlice<'_>]) -> Result<usize> {
        let n = nix::sys::uio::writev(&self.stream, segments)?;
        Ok(n)
    }

    /// Receive into `buf`, mapping would-block and peer-close to outcomes.
    pub fn recv_into(&mut self, buf: &mut [u8]) -> Result<RecvOutcome> {
        match self.stream.read(buf) {
            Ok(0) => Ok(RecvOutcome::Closed),
            Ok(n) => Ok(RecvOutcome::Data(n)),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(RecvOutcome::WouldBlock)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Receive with the RX hardware timestamp from the packet's control
    /// messages, when the socket has timestamping armed.
    #[cfg(target_os = "linux")]
    pub fn recv_with_timestamp(
        &mut self,
        buf: &mut [u8],
    ) -> Result<(RecvOutcome, Option<Timestamp>)> {
        match hw_timestamp::recvmsg_with_timestamp(self.stream.as_raw_fd(), buf) {
            Ok((0, _)) => Ok((RecvOutcome::Closed, None)),
            Ok((n, ts)) => Ok((RecvOutcome::Data(n), ts)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok((RecvOutcome::WouldBlock, None)),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Poll the socket error queue for a TX hardware timestamp.
    #[cfg(target_os = "linux")]
    pub fn poll_tx_timestamp(&self) -> Result<Option<(Timestamp, u32)>> {
        hw_timestamp::recv_tx_timestamp(self.stream.as_raw_fd()).map_err(Error::Io)
    }

    /// Release the connection. With the RST linger profile this aborts
    /// instead of draining.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

impl AsRawFd for TcpSock {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

#[cfg(target_os = "linux")]
fn set_busy_poll(fd: RawFd) -> Result<()> {
    let budget: libc::c_int = BUSY_POLL_US;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BUSY_POLL,
            &budget as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        // Needs CAP_NET_ADMIN on older kernels; degrade to interrupt-driven
        tracing::debug!("SO_BUSY_POLL unavailable: {}", io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_busy_poll(_fd: RawFd) -> Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn bind_device(fd: RawFd, device: &str) -> Result<()> {
    hw_timestamp::bind_to_device(fd, device)
}

#[cfg(not(target_os = "linux"))]
fn bind_device(_fd: RawFd, device: &str) -> Result<()> {
    Err(Error::Config(format!(
        "binding to device '{}' requires Linux",
        device
    )))
}

#[cfg(target_os = "linux")]
fn enable_hw_timestamps(fd: RawFd) -> Result<()> {
    hw_timestamp::enable_socket_timestamping(fd)
}

#[cfg(not(target_os = "linux"))]
fn enable_hw_timestamps(_fd: RawFd) -> Result<()> {
    Err(Error::Config("hardware timestamping requires Linux".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    fn spawn_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).unwrap_or(0);
                if n == 0 {
                    break;
                }
                socket.write_all(&buf[..n]).unwrap();
            }
        });

        addr
    }

    #[test]
    fn blocking_echo_roundtrip() {
        let addr = spawn_echo_server();
        thread::sleep(Duration::from_millis(10));

        let mut sock = TcpSock::connect(addr, &SocketProfile::latency()).unwrap();

        let payload = b"ping";
        let sent = sock.send_vectored(&[IoSlice::new(payload)]).unwrap();
        assert_eq!(sent, payload.len());

        let mut buf = [0u8; 64];
        match sock.recv_into(&mut buf).unwrap() {
            RecvOutcome::Data(n) => assert_eq!(&buf[..n], payload),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn nonblocking_recv_would_block() {
        let addr = spawn_echo_server();
        thread::sleep(Duration::from_millis(10));

        let mut sock = TcpSock::connect(addr, &SocketProfile::open_loop()).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(sock.recv_into(&mut buf).unwrap(), RecvOutcome::WouldBlock);
    }

    #[test]
    fn vectored_send_concatenates_segments() {
        let addr = spawn_echo_server();
        thread::sleep(Duration::from_millis(10));

        let mut sock = TcpSock::connect(addr, &SocketProfile::latency()).unwrap();
        let sent = sock
            .send_vectored(&[IoSlice::new(b"get "), IoSlice::new(b"key"), IoSlice::new(b"\r\n")])
            .unwrap();
        assert_eq!(sent, 9);

        let mut buf = [0u8; 64];
        let mut got = Vec::new();
        while got.len() < 9 {
            match sock.recv_into(&mut buf).unwrap() {
                RecvOutcome::Data(n) => got.extend_from_slice(&buf[..n]),
                RecvOutcome::WouldBlock => continue,
                RecvOutcome::Closed => break,
            }
        }
        assert_eq!(&got, b"get key\r\n");
    }

    #[test]
    fn peer_close_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            drop(socket);
        });
        thread::sleep(Duration::from_millis(10));

        let mut sock = TcpSock::connect(addr, &SocketProfile::latency()).unwrap();
        thread::sleep(Duration::from_millis(20));
        let mut buf = [0u8; 64];
        assert_eq!(sock.recv_into(&mut buf).unwrap(), RecvOutcome::Closed);
    }
}

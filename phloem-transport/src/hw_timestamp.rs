//! Linux SO_TIMESTAMPING plumbing.
//!
//! RX timestamps arrive as SCM_TIMESTAMPING control messages alongside the
//! payload. TX timestamps arrive asynchronously on the socket error queue
//! (MSG_ERRQUEUE); with SOF_TIMESTAMPING_OPT_ID armed the kernel tags each
//! one with the stream byte counter, which is how the agent correlates a
//! timestamp back to the send that produced it.
//!
//! Reference: https://docs.kernel.org/networking/timestamping.html

use crate::{Error, Result, Timestamp};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

/// SO_TIMESTAMPING request flags (linux/net_tstamp.h)
pub mod flags {
    pub const SOF_TIMESTAMPING_TX_HARDWARE: u32 = 1 << 0;
    pub const SOF_TIMESTAMPING_RX_HARDWARE: u32 = 1 << 2;
    pub const SOF_TIMESTAMPING_RAW_HARDWARE: u32 = 1 << 6;
    /// Tag TX timestamps with the stream byte counter
    pub const SOF_TIMESTAMPING_OPT_ID: u32 = 1 << 7;
    /// Deliver the timestamp without the original payload
    pub const SOF_TIMESTAMPING_OPT_TSONLY: u32 = 1 << 11;
}

/// NIC-level timestamp configuration (linux/net_tstamp.h)
mod hwtstamp {
    pub const HWTSTAMP_FILTER_NONE: i32 = 0;
    pub const HWTSTAMP_FILTER_ALL: i32 = 1;
    pub const HWTSTAMP_TX_OFF: i32 = 0;
    pub const HWTSTAMP_TX_ON: i32 = 1;
}

/// SO_TIMESTAMPING doubles as the cmsg type for the timestamp triplet
const SCM_TIMESTAMPING: i32 = libc::SO_TIMESTAMPING;

const SO_EE_ORIGIN_TIMESTAMPING: u8 = 4;

/// Control message buffer size for recvmsg ancillary data
pub const CMSG_BUFFER_SIZE: usize = 256;

/// Argument block for the SIOCSHWTSTAMP ioctl
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct HwtstampConfig {
    flags: i32,
    tx_type: i32,
    rx_filter: i32,
}

/// Timestamp triplet delivered by SCM_TIMESTAMPING.
///
/// ts[0] is the software timestamp, ts[1] a legacy slot, ts[2] the raw
/// hardware (NIC clock) timestamp.
#[repr(C)]
#[derive(Clone, Copy)]
struct ScmTimestamping {
    ts: [libc::timespec; 3],
}

impl ScmTimestamping {
    fn raw_hardware(&self) -> Option<(i64, i64)> {
        if self.ts[2].tv_sec != 0 || self.ts[2].tv_nsec != 0 {
            Some((self.ts[2].tv_sec, self.ts[2].tv_nsec))
        } else {
            None
        }
    }
}

/// Arm SO_TIMESTAMPING on a connected socket.
///
/// Requests raw hardware timestamps in both directions plus OPT_ID byte
/// tagging and timestamp-only error-queue delivery. Must run before the
/// first send so the byte counter starts at zero.
pub fn enable_socket_timestamping(fd: RawFd) -> Result<()> {
    use flags::*;

    let ts_mode: u32 = SOF_TIMESTAMPING_RX_HARDWARE
        | SOF_TIMESTAMPING_TX_HARDWARE
        | SOF_TIMESTAMPING_RAW_HARDWARE
        | SOF_TIMESTAMPING_OPT_TSONLY
        | SOF_TIMESTAMPING_OPT_ID;

    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TIMESTAMPING,
            &ts_mode as *const u32 as *const libc::c_void,
            mem::size_of::<u32>() as libc::socklen_t,
        )
    };

    if ret < 0 {
        return Err(Error::Config(format!(
            "failed to enable SO_TIMESTAMPING: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Bind a socket to a network interface (SO_BINDTODEVICE).
pub fn bind_to_device(fd: RawFd, interface: &str) -> Result<()> {
    let c_interface = std::ffi::CString::new(interface).map_err(|_| {
        Error::Config(format!("invalid interface name '{}': contains NUL byte", interface))
    })?;
    let bytes = c_interface.as_bytes_with_nul();

    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            bytes.as_ptr() as *const libc::c_void,
            bytes.len() as libc::socklen_t,
        )
    };

    if ret < 0 {
        return Err(Error::Config(format!(
            "failed to bind to device '{}': {}",
            interface,
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Turn on hardware timestamping at the NIC. Needs CAP_NET_ADMIN.
pub fn enable_nic_timestamping(interface: &str) -> Result<()> {
    configure_nic(interface, hwtstamp::HWTSTAMP_FILTER_ALL, hwtstamp::HWTSTAMP_TX_ON)
}

/// Restore the NIC to its non-timestamping state.
pub fn disable_nic_timestamping(interface: &str) -> Result<()> {
    configure_nic(interface, hwtstamp::HWTSTAMP_FILTER_NONE, hwtstamp::HWTSTAMP_TX_OFF)
}

fn configure_nic(interface: &str, rx_filter: i32, tx_type: i32) -> Result<()> {
    // The ioctl needs any socket on the right family; a throwaway UDP one
    // keeps this independent of the load connections
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, libc::IPPROTO_UDP) };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    let config = HwtstampConfig { flags: 0, tx_type, rx_filter };

    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    let if_bytes = interface.as_bytes();
    let copy_len = std::cmp::min(if_bytes.len(), ifr.ifr_name.len() - 1);
    unsafe {
        std::ptr::copy_nonoverlapping(
            if_bytes.as_ptr(),
            ifr.ifr_name.as_mut_ptr() as *mut u8,
            copy_len,
        );
    }
    ifr.ifr_ifru.ifru_data = &config as *const HwtstampConfig as *mut libc::c_char;

    const SIOCSHWTSTAMP: libc::c_ulong = 0x89b0;
    let ret = unsafe { libc::ioctl(fd, SIOCSHWTSTAMP, &ifr) };
    unsafe { libc::close(fd) };

    if ret < 0 {
        return Err(Error::Config(format!(
            "failed to configure NIC timestamping on '{}': {} (needs CAP_NET_ADMIN)",
            interface,
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Receive payload plus the RX hardware timestamp from its control messages.
pub fn recvmsg_with_timestamp(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<Timestamp>)> {
    let mut cmsg_buf = [0u8; CMSG_BUFFER_SIZE];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    hdr.msg_controllen = CMSG_BUFFER_SIZE;

    let n = unsafe { libc::recvmsg(fd, &mut hdr, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok((n as usize, extract_rx_timestamp(&hdr)))
}

/// Poll the error queue for one TX timestamp.
///
/// `Ok(None)` means no timestamp has been delivered yet. A returned pair is
/// the NIC timestamp plus the OPT_ID byte counter of the send it belongs to.
pub fn recv_tx_timestamp(fd: RawFd) -> io::Result<Option<(Timestamp, u32)>> {
    let mut cmsg_buf = [0u8; CMSG_BUFFER_SIZE];
    // OPT_TSONLY: no payload comes back, only control messages
    let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
    hdr.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    hdr.msg_controllen = CMSG_BUFFER_SIZE;

    let n = unsafe { libc::recvmsg(fd, &mut hdr, libc::MSG_ERRQUEUE) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }

    Ok(extract_tx_timestamp(&hdr))
}

fn extract_rx_timestamp(hdr: &libc::msghdr) -> Option<Timestamp> {
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(hdr) };
    while !cmsg.is_null() {
        let header = unsafe { &*cmsg };
        if header.cmsg_level == libc::SOL_SOCKET && header.cmsg_type == SCM_TIMESTAMPING {
            let scm = unsafe { &*(libc::CMSG_DATA(cmsg) as *const ScmTimestamping) };
            if let Some((tv_sec, tv_nsec)) = scm.raw_hardware() {
                return Some(Timestamp::from_hardware(tv_sec, tv_nsec));
            }
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(hdr, cmsg) };
    }
    None
}

fn extract_tx_timestamp(hdr: &libc::msghdr) -> Option<(Timestamp, u32)> {
    let mut timestamp: Option<Timestamp> = None;
    let mut opt_id: Option<u32> = None;

    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(hdr) };
    while !cmsg.is_null() {
        let header = unsafe { &*cmsg };

        if header.cmsg_level == libc::SOL_SOCKET && header.cmsg_type == SCM_TIMESTAMPING {
            let scm = unsafe { &*(libc::CMSG_DATA(cmsg) as *const ScmTimestamping) };
            if let Some((tv_sec, tv_nsec)) = scm.raw_hardware() {
                timestamp = Some(Timestamp::from_hardware(tv_sec, tv_nsec));
            }
        } else if (header.cmsg_level == libc::SOL_IP && header.cmsg_type == libc::IP_RECVERR)
            || (header.cmsg_level == libc::SOL_IPV6 && header.cmsg_type == libc::IPV6_RECVERR)
        {
            let se = unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::sock_extended_err) };
            if se.ee_errno == libc::ENOMSG as u32 && se.ee_origin == SO_EE_ORIGIN_TIMESTAMPING {
                opt_id = Some(se.ee_data);
            }
        }

        cmsg = unsafe { libc::CMSG_NXTHDR(hdr, cmsg) };
    }

    match (timestamp, opt_id) {
        (Some(ts), Some(id)) => Some((ts, id)),
        _ => None,
    }
}

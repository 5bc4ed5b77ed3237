//! `AF_PACKET` capture source for running the flow engine without the kernel program.

use std::{
    ffi::CString,
    io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use flowmon_common::Direction;
use tokio::io::{unix::AsyncFd, Interest};

use crate::monitor::Packet;

/// Bytes copied out of each frame. Enough for Ethernet, IPv6 and any L4 header.
pub const SNAP_LEN: usize = 256;

pub struct PacketSocket {
    fd: AsyncFd<OwnedFd>,
    if_index: u32,
}

impl PacketSocket {
    pub fn bind(iface: &str) -> Result<Self> {
        let protocol = (libc::ETH_P_ALL as u16).to_be();
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                protocol as libc::c_int,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error()).context("failed to create packet socket");
        }
        let owned_fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let if_index = bind_interface(owned_fd.as_raw_fd(), iface, protocol)?;
        let fd = AsyncFd::with_interest(owned_fd, Interest::READABLE)
            .context("failed to register packet socket")?;
        Ok(PacketSocket { fd, if_index })
    }

    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    /// Waits for the next frame of the bound interface.
    pub async fn next_packet(&self) -> Result<Packet> {
        loop {
            let mut guard = self
                .fd
                .readable()
                .await
                .context("failed to wait for socket readability")?;
            match guard.try_io(|fd| recv_frame(fd.as_raw_fd())) {
                Ok(result) => {
                    let (data, len, pkttype) = result.context("failed to read packet socket")?;
                    return Ok(Packet {
                        data,
                        len,
                        if_index: self.if_index,
                        direction: direction_of(pkttype),
                    });
                }
                Err(_would_block) => continue,
            }
        }
    }
}

fn recv_frame(fd: RawFd) -> io::Result<(Bytes, u64, u8)> {
    let mut buf = BytesMut::zeroed(SNAP_LEN);
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    let mut addr_len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
    // MSG_TRUNC returns the length on the wire even when the copy is cut short
    let ret = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_TRUNC,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut addr_len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    let len = ret as usize;
    buf.truncate(len.min(SNAP_LEN));
    Ok((buf.freeze(), len as u64, addr.sll_pkttype))
}

fn bind_interface(fd: RawFd, iface: &str, protocol: u16) -> Result<u32> {
    let ifname = CString::new(iface)?;
    let ifindex = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
    if ifindex == 0 {
        return Err(io::Error::last_os_error()).context("failed to lookup interface index");
    }

    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as libc::c_ushort;
    addr.sll_protocol = protocol;
    addr.sll_ifindex = ifindex as libc::c_int;

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error()).context("failed to bind packet socket");
    }

    Ok(ifindex)
}

/// Frames sent by this host are egress, everything else was received.
pub fn direction_of(pkttype: u8) -> Direction {
    if pkttype == libc::PACKET_OUTGOING {
        Direction::Egress
    } else {
        Direction::Ingress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_types_map_to_directions() {
        assert_eq!(direction_of(libc::PACKET_OUTGOING), Direction::Egress);
        for pkttype in [
            libc::PACKET_HOST,
            libc::PACKET_BROADCAST,
            libc::PACKET_MULTICAST,
            libc::PACKET_OTHERHOST,
        ] {
            assert_eq!(direction_of(pkttype), Direction::Ingress);
        }
    }

    #[test]
    fn unknown_interface_is_an_error() {
        assert!(PacketSocket::bind("flowmon-missing0").is_err());
    }
}

//! UDP socket layer for the DHCP server.
//!
//! Binds the server port on all interfaces, then drops datagrams the kernel
//! did not receive on one of the allowed interfaces (`IP_PKTINFO` ancillary
//! data). Outgoing limited broadcasts are rewritten to the subnet's
//! directed broadcast so replies egress the bridge.

use nix::sys::socket::sockopt::Ipv4PacketInfo;
use nix::sys::socket::{ControlMessageOwned, MsgFlags, SockaddrIn, recvmsg, setsockopt};
use socket2::{Domain, Protocol, Socket, Type};

use std::io::{self, IoSliceMut};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::fd::AsRawFd;
use std::time::Duration;

use super::Error;

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

// bounded reads so the serve loop observes shutdown
const READ_TIMEOUT: Duration = Duration::from_secs(1);

pub struct FilteredSocket {
    socket: UdpSocket,
    allowed: Vec<u32>,
    directed_broadcast: Ipv4Addr,
}

/// Limited broadcast destinations become the subnet's directed broadcast;
/// anything else passes through.
fn rewrite_broadcast(dest: SocketAddrV4, directed: Ipv4Addr) -> SocketAddrV4 {
    if *dest.ip() == Ipv4Addr::BROADCAST {
        SocketAddrV4::new(directed, dest.port())
    } else {
        dest
    }
}

impl FilteredSocket {
    pub fn bind(allowed: Vec<u32>, directed_broadcast: Ipv4Addr, port: u16) -> Result<Self, Error> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;

        let socket: UdpSocket = socket.into();
        setsockopt(&socket, Ipv4PacketInfo, &true)?;

        Ok(FilteredSocket {
            socket,
            allowed,
            directed_broadcast,
        })
    }

    /// Blocking bounded read. `Ok(None)` means nothing usable arrived
    /// within the timeout: either the deadline fired or the datagram came
    /// in on a foreign interface and was dropped.
    pub fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddrV4)>, Error> {
        let mut cmsg = nix::cmsg_space!(libc::in_pktinfo);
        let (bytes, ifindex, source) = {
            let mut iov = [IoSliceMut::new(buf)];
            let msg = match recvmsg::<SockaddrIn>(
                self.socket.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg),
                MsgFlags::empty(),
            ) {
                Ok(msg) => msg,
                Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let ifindex = msg.cmsgs()?.find_map(|c| match c {
                ControlMessageOwned::Ipv4PacketInfo(info) => Some(info.ipi_ifindex as u32),
                _ => None,
            });
            let source = msg
                .address
                .map(|a| SocketAddrV4::new(a.ip(), a.port()))
                .unwrap_or_else(|| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
            (msg.bytes, ifindex, source)
        };

        match ifindex {
            Some(index) if self.allowed.contains(&index) => Ok(Some((bytes, source))),
            _ => Ok(None),
        }
    }

    pub fn send_to(&self, buf: &[u8], dest: SocketAddrV4) -> Result<(), Error> {
        let dest = rewrite_broadcast(dest, self.directed_broadcast);
        self.socket.send_to(buf, dest).map(|_| ()).map_err(Error::from)
    }
}

/// Reply destination per the DHCP broadcast conventions: clients that do
/// not yet hold an address are answered on the (rewritten) limited
/// broadcast, addressed clients directly.
pub fn reply_dest(source: SocketAddrV4) -> SocketAddrV4 {
    if source.ip().is_unspecified() || *source.ip() == Ipv4Addr::BROADCAST {
        SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT)
    } else {
        source
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::IO(io::Error::from_raw_os_error(e as i32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limited_broadcast_is_rewritten() {
        let dest = SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT);
        let rewritten = rewrite_broadcast(dest, Ipv4Addr::new(10, 0, 0, 255));
        assert_eq!(rewritten, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 255), CLIENT_PORT));
    }

    #[test]
    fn unicast_destinations_pass_through() {
        let dest = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), CLIENT_PORT);
        assert_eq!(rewrite_broadcast(dest, Ipv4Addr::new(10, 0, 0, 255)), dest);
    }

    #[test]
    fn reply_dest_broadcasts_for_unaddressed_clients() {
        let from_zero = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, CLIENT_PORT);
        assert_eq!(reply_dest(from_zero), SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT));

        let addressed = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), CLIENT_PORT);
        assert_eq!(reply_dest(addressed), addressed);
    }
}

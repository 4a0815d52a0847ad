use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
};

use mio::{Interest, Registry, Token, net::UdpSocket};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SockDir {
    Recv,
    Send,
}

/// Options that decide whether two endpoints may share a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SocketKey {
    pub dir: SockDir,
    pub port: u16,
    pub mc_group: Option<Ipv4Addr>,
    pub qos: u8,
    pub ttl: u8,
}

pub(crate) struct SocketSlot {
    pub sock: UdpSocket,
    pub key: SocketKey,
    pub refs: u32,
    pub local: SocketAddr,
}

impl SocketSlot {
    /// The address incoming frames on this socket were delivered to: the
    /// joined group for multicast sockets, the bound interface otherwise.
    pub(crate) fn delivered_to(&self, own_ip: Ipv4Addr) -> Ipv4Addr {
        self.key.mc_group.unwrap_or(own_ip)
    }
}

/// Refcounted UDP sockets shared between endpoints with the same
/// transport options. The slot index doubles as the `mio::Token` for
/// readiness events; receive sockets are registered with the session
/// poll, send sockets are not (nothing to wake up for).
pub(crate) struct SocketTable {
    own_ip: Ipv4Addr,
    slots: Vec<Option<SocketSlot>>,
}

impl SocketTable {
    pub(crate) fn new(own_ip: Ipv4Addr) -> Self {
        Self { own_ip, slots: Vec::new() }
    }

    pub(crate) fn get(&self, idx: usize) -> Option<&SocketSlot> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    /// Returns a socket index for `key`, opening and registering a new
    /// socket when no compatible one exists.
    pub(crate) fn acquire(&mut self, registry: &Registry, key: SocketKey) -> io::Result<usize> {
        // Equal keys share a socket; port 0 keys collapse onto the first
        // ephemeral socket opened with the same options.
        if let Some(idx) = self
            .slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.key == key))
        {
            let slot = self.slots[idx].as_mut().expect("checked above");
            slot.refs += 1;
            return Ok(idx);
        }

        let bind_ip = match (key.dir, key.mc_group) {
            (SockDir::Recv, Some(_)) => Ipv4Addr::UNSPECIFIED,
            (SockDir::Recv, None) => self.own_ip,
            (SockDir::Send, _) => self.own_ip,
        };
        let bind_port = match key.dir {
            SockDir::Recv => key.port,
            SockDir::Send => 0,
        };
        let mut sock =
            open_udp_socket(SocketAddrV4::new(bind_ip, bind_port), key.qos, key.ttl)?;
        if let Some(group) = key.mc_group {
            sock.join_multicast_v4(&group, &self.own_ip)?;
        }

        let idx = match self.slots.iter().position(|s| s.is_none()) {
            Some(idx) => idx,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        if key.dir == SockDir::Recv {
            registry.register(&mut sock, Token(idx), Interest::READABLE)?;
        }
        let local = sock.local_addr()?;
        debug!(?local, ?key, idx, "pd socket opened");
        self.slots[idx] = Some(SocketSlot { sock, key, refs: 1, local });
        Ok(idx)
    }

    /// Drops one reference; the socket closes with the last one.
    pub(crate) fn release(&mut self, registry: &Registry, idx: usize) {
        let Some(Some(slot)) = self.slots.get_mut(idx) else {
            return;
        };
        slot.refs -= 1;
        if slot.refs == 0 {
            if slot.key.dir == SockDir::Recv {
                let _ = registry.deregister(&mut slot.sock);
            }
            debug!(local = ?slot.local, idx, "pd socket closed");
            self.slots[idx] = None;
        }
    }
}

/// Opens a nonblocking UDP socket with SO_REUSEADDR, IP_TOS (QoS class in
/// the upper three bits) and TTL applied before the bind, so several
/// sessions can share the well-known PD port.
fn open_udp_socket(addr: SocketAddrV4, qos: u8, ttl: u8) -> io::Result<UdpSocket> {
    use std::os::fd::FromRawFd;

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_NONBLOCK, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // Owns the fd from here on; closes it if anything below fails.
    let std_sock = unsafe { std::net::UdpSocket::from_raw_fd(fd) };

    set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1);
    set_opt(fd, libc::IPPROTO_IP, libc::IP_TOS, (qos as libc::c_int) << 5);
    set_opt(fd, libc::IPPROTO_IP, libc::IP_TTL, ttl as libc::c_int);
    set_opt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, ttl as libc::c_int);

    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr { s_addr: u32::from(*addr.ip()).to_be() },
        sin_zero: [0; 8],
    };
    let rc = unsafe {
        libc::bind(
            fd,
            &sin as *const libc::sockaddr_in as *const libc::sockaddr,
            core::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(UdpSocket::from_std(std_sock))
}

/// Best-effort setsockopt; option failures are not fatal for PD traffic.
fn set_opt(fd: libc::c_int, level: libc::c_int, name: libc::c_int, value: libc::c_int) {
    unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

//! Listener manager: bound and listening MPTCP sockets keyed by
//! address id.
//!
//! In-kernel path management needs a local listener on every address
//! announced with a port, so incoming `MP_JOIN` subflows have somewhere
//! to land. The manager owns the socket descriptors exclusively; an
//! entry's socket is closed exactly once, either on [`ListenerManager::close`]
//! or when the manager is dropped.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::IpAddr;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::AsRawFd;

use tracing::debug;

use crate::addr::{AddrId, Endpoint};
use crate::error::{Error, Result};

// Not yet exported by every libc version in circulation.
const IPPROTO_MPTCP: libc::c_int = 262;

/// Map of address id to owned listening MPTCP socket.
#[derive(Debug, Default)]
pub struct ListenerManager {
    listeners: HashMap<AddrId, OwnedFd>,
}

impl ListenerManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a listening MPTCP socket bound to `addr` and store it under
    /// `id`.
    ///
    /// Fails if an entry for `id` already exists. On any socket error
    /// the descriptor is closed before returning.
    pub fn listen(&mut self, id: AddrId, addr: &Endpoint) -> Result<()> {
        if self.listeners.contains_key(&id) {
            return Err(Error::InvalidArgument("listener already exists for id"));
        }

        let fd = mptcp_listen(addr)?;
        debug!(%id, %addr, "listening for MPTCP joins");
        self.listeners.insert(id, fd);
        Ok(())
    }

    /// Close and remove the listener stored under `id`.
    pub fn close(&mut self, id: AddrId) -> Result<()> {
        match self.listeners.remove(&id) {
            Some(fd) => {
                debug!(%id, "closing MPTCP listener");
                drop(fd);
                Ok(())
            }
            None => Err(Error::InvalidArgument("no listener for id")),
        }
    }

    /// Number of live listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// True when no listener is stored.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

/// Open, bind, and listen on an MPTCP stream socket for `addr`.
fn mptcp_listen(addr: &Endpoint) -> Result<OwnedFd> {
    let domain = match addr.addr() {
        IpAddr::V4(_) => libc::AF_INET,
        IpAddr::V6(_) => libc::AF_INET6,
    };

    // SAFETY: plain socket(2) call; the result is checked below.
    let raw = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            IPPROTO_MPTCP,
        )
    };
    if raw < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    // SAFETY: raw is a freshly created, owned descriptor.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    match addr.addr() {
        IpAddr::V4(v4) => {
            let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
            sa.sin_family = libc::AF_INET as libc::sa_family_t;
            sa.sin_port = addr.port().to_be();
            sa.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.octets()),
            };
            let len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            bind_and_listen(&fd, &sa as *const _ as *const libc::sockaddr, len)?;
        }
        IpAddr::V6(v6) => {
            let mut sa: libc::sockaddr_in6 = unsafe { mem::zeroed() };
            sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sa.sin6_port = addr.port().to_be();
            sa.sin6_addr = libc::in6_addr {
                s6_addr: v6.octets(),
            };
            let len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            bind_and_listen(&fd, &sa as *const _ as *const libc::sockaddr, len)?;
        }
    }

    Ok(fd)
}

fn bind_and_listen(
    fd: &OwnedFd,
    sa: *const libc::sockaddr,
    len: libc::socklen_t,
) -> Result<()> {
    // SAFETY: sa points at a fully initialised sockaddr of length len.
    if unsafe { libc::bind(fd.as_raw_fd(), sa, len) } < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    // Backlog 0: the socket exists to accept kernel-managed joins, not
    // to serve an application accept loop.
    if unsafe { libc::listen(fd.as_raw_fd(), 0) } < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

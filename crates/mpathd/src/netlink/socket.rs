//! Async netlink socket and the request/reply exchange.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::BytesMut;
use netlink_sys::{protocols, Socket, SocketAddr};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use super::codec::{self, FrameReader, NLMSG_DONE, NLMSG_ERROR, NLM_F_DUMP};
use crate::error::Result;

/// Receive allocation per datagram; the kernel caps individual
/// netlink messages well below this.
const RECV_CAPACITY: usize = 64 * 1024;

/// Netlink protocols the daemon speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// rtnetlink: interface and address monitoring, route lookups.
    Route,
    /// Generic netlink: the MPTCP path management families.
    Generic,
}

/// An async netlink socket.
pub struct NetlinkSocket {
    fd: AsyncFd<Socket>,
    seq: AtomicU32,
    port: u32,
}

impl NetlinkSocket {
    /// Open and bind a socket for `protocol`.
    pub fn new(protocol: Protocol) -> Result<Self> {
        let proto = match protocol {
            Protocol::Route => protocols::NETLINK_ROUTE,
            Protocol::Generic => protocols::NETLINK_GENERIC,
        };

        let mut socket = Socket::new(proto)?;
        socket.set_non_blocking(true)?;

        // Binding makes the kernel assign the port id that stamps
        // every request this socket emits.
        let mut local = SocketAddr::new(0, 0);
        socket.bind(&local)?;
        socket.get_address(&mut local)?;

        // Richer error reports where the kernel offers them.
        let _ = socket.set_ext_ack(true);

        Ok(Self {
            port: local.port_number(),
            fd: AsyncFd::new(socket)?,
            seq: AtomicU32::new(1),
        })
    }

    /// The kernel-assigned port id.
    pub fn port(&self) -> u32 {
        self.port
    }

    /// Join a multicast group.
    pub fn add_membership(&mut self, group: u32) -> Result<()> {
        self.fd.get_mut().add_membership(group)?;
        Ok(())
    }

    /// Leave a multicast group.
    pub fn drop_membership(&mut self, group: u32) -> Result<()> {
        self.fd.get_mut().drop_membership(group)?;
        Ok(())
    }

    /// Send one complete message.
    pub async fn send(&self, msg: &[u8]) -> Result<()> {
        loop {
            let mut guard = self.fd.ready(Interest::WRITABLE).await?;
            match guard.try_io(|sock| sock.get_ref().send(msg, 0)) {
                Ok(sent) => {
                    sent?;
                    return Ok(());
                }
                // Stale readiness; wait for the next edge.
                Err(_) => continue,
            }
        }
    }

    /// Receive one datagram's worth of frames.
    pub async fn recv(&self) -> Result<Vec<u8>> {
        loop {
            let mut guard = self.fd.ready(Interest::READABLE).await?;
            let mut buf = BytesMut::with_capacity(RECV_CAPACITY);
            match guard.try_io(|sock| sock.get_ref().recv(&mut buf, 0)) {
                Ok(received) => {
                    received?;
                    return Ok(buf.to_vec());
                }
                Err(_) => continue,
            }
        }
    }

    /// Emit a request and gather its reply payloads as
    /// `(message type, payload)` pairs.
    ///
    /// `NLM_F_REQUEST` is implied. With `NLM_F_DUMP` set the exchange
    /// runs until `NLMSG_DONE`, otherwise until the kernel's ack; a
    /// kernel failure surfaces as an error either way. Frames not
    /// answering this sequence number are discarded, so requests must
    /// stay off multicast-subscribed sockets.
    pub async fn request(
        &self,
        msg_type: u16,
        flags: u16,
        payload: &[u8],
    ) -> Result<Vec<(u16, Vec<u8>)>> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let msg = codec::message(
            msg_type,
            flags | codec::NLM_F_REQUEST,
            seq,
            self.port,
            payload,
        );
        self.send(&msg).await?;

        let until_done = flags & NLM_F_DUMP != 0;
        let mut replies = Vec::new();

        loop {
            let buf = self.recv().await?;
            for frame in FrameReader::new(&buf) {
                let frame = frame?;
                if frame.seq != seq {
                    continue;
                }
                match frame.msg_type {
                    NLMSG_ERROR => {
                        frame.ack_status()?;
                        if !until_done {
                            return Ok(replies);
                        }
                    }
                    NLMSG_DONE => return Ok(replies),
                    data_type => replies.push((data_type, frame.payload.to_vec())),
                }
            }
        }
    }
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}

/// Multicast groups for NETLINK_ROUTE consumed by the network monitor.
pub mod rtnetlink_groups {
    pub const RTNLGRP_LINK: u32 = 1;
    pub const RTNLGRP_IPV4_IFADDR: u32 = 5;
    pub const RTNLGRP_IPV6_IFADDR: u32 = 9;
}

//! Netlink transport shared by the command dialects, the event
//! decoder, and the network monitor.
//!
//! Deliberately small: a wire codec ([`codec`]) built around one-pass
//! message assembly and borrowing read cursors, an async socket whose
//! [`socket::NetlinkSocket::request`] runs a whole request/reply
//! exchange, and the generic netlink control-family operations the
//! daemon needs to find and watch the MPTCP path management family.

pub mod codec;
pub mod genl;
pub mod socket;

pub use codec::AttrWriter;
pub use socket::{NetlinkSocket, Protocol};

//! MPTCP event decoding.
//!
//! The kernel publishes connection lifecycle events on the family's
//! multicast group. Decoding happens in two passes: one walk over the
//! attribute buffer collects every known attribute into a typed field
//! set, validating each against its declared wire length; then the
//! per-event constructors pull their required fields out of the set,
//! funnelling every "missing required attribute" through the same
//! error path. Unknown attributes are ignored, mis-sized ones are
//! rejected with a warning.

use tracing::warn;

use crate::addr::{Endpoint, Token};
use crate::error::{Error, Result};
use crate::netlink::codec::Attrs;
use crate::pm::wire::{mptcp_attr, mptcp_event};

/// A decoded MPTCP event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// New connection; token assigned by the kernel.
    Created {
        token: Token,
        laddr: Endpoint,
        raddr: Endpoint,
        server_side: bool,
        /// Strategy requested by the legacy kernel, when present.
        path_manager: Option<String>,
    },
    /// Connection fully established.
    Established {
        token: Token,
        laddr: Endpoint,
        raddr: Endpoint,
        server_side: bool,
    },
    /// Connection closed.
    Closed { token: Token },
    /// Peer advertised an address.
    Announced {
        token: Token,
        rem_id: u8,
        raddr: Endpoint,
    },
    /// Peer withdrew an address.
    Removed { token: Token, rem_id: u8 },
    /// A subflow joined the connection.
    SubflowEstablished {
        token: Token,
        laddr: Endpoint,
        raddr: Endpoint,
        backup: bool,
    },
    /// A subflow left the connection.
    SubflowClosed {
        token: Token,
        laddr: Endpoint,
        raddr: Endpoint,
        backup: bool,
    },
    /// A subflow's backup priority changed.
    SubflowPriority {
        token: Token,
        laddr: Endpoint,
        raddr: Endpoint,
        backup: bool,
    },
}

impl Event {
    /// The connection token the event belongs to.
    pub fn token(&self) -> Token {
        match self {
            Event::Created { token, .. }
            | Event::Established { token, .. }
            | Event::Closed { token }
            | Event::Announced { token, .. }
            | Event::Removed { token, .. }
            | Event::SubflowEstablished { token, .. }
            | Event::SubflowClosed { token, .. }
            | Event::SubflowPriority { token, .. } => *token,
        }
    }

    /// Event name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Created { .. } => "CREATED",
            Event::Established { .. } => "ESTABLISHED",
            Event::Closed { .. } => "CLOSED",
            Event::Announced { .. } => "ANNOUNCED",
            Event::Removed { .. } => "REMOVED",
            Event::SubflowEstablished { .. } => "SUB_ESTABLISHED",
            Event::SubflowClosed { .. } => "SUB_CLOSED",
            Event::SubflowPriority { .. } => "SUB_PRIORITY",
        }
    }
}

/// Every known attribute of an event payload, collected in one pass.
#[derive(Debug, Default)]
struct Fields {
    token: Option<u32>,
    rem_id: Option<u8>,
    saddr: Option<std::net::IpAddr>,
    daddr: Option<std::net::IpAddr>,
    sport: Option<u16>,
    dport: Option<u16>,
    backup: Option<u8>,
    server_side: Option<u8>,
    path_manager: Option<String>,
}

/// Copy a fixed-size attribute payload, enforcing the declared length.
fn fixed<const N: usize>(name: &'static str, payload: &[u8]) -> Option<[u8; N]> {
    match payload.try_into() {
        Ok(bytes) => Some(bytes),
        Err(_) => {
            warn!(
                attr = name,
                expected = N,
                received = payload.len(),
                "rejecting event attribute with unexpected length"
            );
            None
        }
    }
}

impl Fields {
    fn collect(data: &[u8]) -> Self {
        let mut f = Fields::default();

        for (attr_type, payload) in Attrs::new(data) {
            match attr_type {
                mptcp_attr::TOKEN => {
                    f.token = fixed::<4>("token", payload).map(u32::from_ne_bytes);
                }
                // No event requires the family or local-id attributes;
                // they are still length-checked when present.
                mptcp_attr::FAMILY => {
                    let _ = fixed::<1>("family", payload);
                }
                mptcp_attr::LOC_ID => {
                    let _ = fixed::<1>("loc_id", payload);
                }
                mptcp_attr::REM_ID => {
                    f.rem_id = fixed::<1>("rem_id", payload).map(|b| b[0]);
                }
                mptcp_attr::SADDR4 => {
                    f.saddr = fixed::<4>("saddr4", payload).map(std::net::IpAddr::from);
                }
                mptcp_attr::SADDR6 => {
                    f.saddr = fixed::<16>("saddr6", payload).map(std::net::IpAddr::from);
                }
                mptcp_attr::DADDR4 => {
                    f.daddr = fixed::<4>("daddr4", payload).map(std::net::IpAddr::from);
                }
                mptcp_attr::DADDR6 => {
                    f.daddr = fixed::<16>("daddr6", payload).map(std::net::IpAddr::from);
                }
                mptcp_attr::SPORT => {
                    f.sport = fixed::<2>("sport", payload).map(u16::from_be_bytes);
                }
                mptcp_attr::DPORT => {
                    f.dport = fixed::<2>("dport", payload).map(u16::from_be_bytes);
                }
                mptcp_attr::BACKUP => {
                    f.backup = fixed::<1>("backup", payload).map(|b| b[0]);
                }
                mptcp_attr::SERVER_SIDE => {
                    f.server_side = fixed::<1>("server_side", payload).map(|b| b[0]);
                }
                mptcp_attr::PATH_MANAGER => match crate::netlink::codec::take::cstr(payload) {
                    Ok(s) if !s.is_empty() => f.path_manager = Some(s.to_string()),
                    Ok(_) => {}
                    Err(_) => {
                        warn!("rejecting malformed path_manager attribute");
                    }
                },
                // Unknown attributes are ignored.
                _ => {}
            }
        }

        f
    }

    fn require<T: Copy>(
        field: Option<T>,
        event: &'static str,
        attr: &'static str,
    ) -> Result<T> {
        field.ok_or(Error::MissingAttribute { event, attr })
    }

    fn token(&self, event: &'static str) -> Result<Token> {
        let raw = Self::require(self.token, event, "token")?;
        Token::new(raw).ok_or(Error::MissingAttribute {
            event,
            attr: "token",
        })
    }

    fn local(&self, event: &'static str) -> Result<Endpoint> {
        let addr = Self::require(self.saddr, event, "local address")?;
        let port = Self::require(self.sport, event, "local port")?;
        Ok(Endpoint::new(addr, port))
    }

    fn remote(&self, event: &'static str) -> Result<Endpoint> {
        let addr = Self::require(self.daddr, event, "remote address")?;
        let port = Self::require(self.dport, event, "remote port")?;
        Ok(Endpoint::new(addr, port))
    }

    /// ANNOUNCED carries a remote address whose port may be absent.
    fn remote_announced(&self, event: &'static str) -> Result<Endpoint> {
        let addr = Self::require(self.daddr, event, "remote address")?;
        Ok(Endpoint::new(addr, self.dport.unwrap_or(0)))
    }

    fn rem_id(&self, event: &'static str) -> Result<u8> {
        Self::require(self.rem_id, event, "remote id")
    }

    fn backup(&self, event: &'static str) -> Result<bool> {
        Ok(Self::require(self.backup, event, "backup")? != 0)
    }

    fn server_side(&self) -> bool {
        self.server_side.unwrap_or(0) != 0
    }
}

/// Decode an event payload (the bytes after the generic netlink header).
///
/// Returns `None` for event ids the daemon does not handle. Errors mean
/// a required attribute was missing or the token was the reserved zero;
/// the caller logs and drops the event.
pub fn decode(cmd: u8, data: &[u8]) -> Result<Option<Event>> {
    let f = Fields::collect(data);

    let event = match cmd {
        mptcp_event::CREATED => Event::Created {
            token: f.token("CREATED")?,
            laddr: f.local("CREATED")?,
            raddr: f.remote("CREATED")?,
            server_side: f.server_side(),
            path_manager: f.path_manager.clone(),
        },
        mptcp_event::ESTABLISHED => Event::Established {
            token: f.token("ESTABLISHED")?,
            laddr: f.local("ESTABLISHED")?,
            raddr: f.remote("ESTABLISHED")?,
            server_side: f.server_side(),
        },
        mptcp_event::CLOSED => Event::Closed {
            token: f.token("CLOSED")?,
        },
        mptcp_event::ANNOUNCED => Event::Announced {
            token: f.token("ANNOUNCED")?,
            rem_id: f.rem_id("ANNOUNCED")?,
            raddr: f.remote_announced("ANNOUNCED")?,
        },
        mptcp_event::REMOVED => Event::Removed {
            token: f.token("REMOVED")?,
            rem_id: f.rem_id("REMOVED")?,
        },
        mptcp_event::SUB_ESTABLISHED => Event::SubflowEstablished {
            token: f.token("SUB_ESTABLISHED")?,
            laddr: f.local("SUB_ESTABLISHED")?,
            raddr: f.remote("SUB_ESTABLISHED")?,
            backup: f.backup("SUB_ESTABLISHED")?,
        },
        mptcp_event::SUB_CLOSED => Event::SubflowClosed {
            token: f.token("SUB_CLOSED")?,
            laddr: f.local("SUB_CLOSED")?,
            raddr: f.remote("SUB_CLOSED")?,
            backup: f.backup("SUB_CLOSED")?,
        },
        mptcp_event::SUB_PRIORITY => Event::SubflowPriority {
            token: f.token("SUB_PRIORITY")?,
            laddr: f.local("SUB_PRIORITY")?,
            raddr: f.remote("SUB_PRIORITY")?,
            backup: f.backup("SUB_PRIORITY")?,
        },
        _ => return Ok(None),
    };

    Ok(Some(event))
}

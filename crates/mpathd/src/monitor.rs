//! Network interface monitor.
//!
//! Tracks the host's interfaces and their addresses from rtnetlink
//! link/address messages. The daemon feeds this table from an
//! `RTNLGRP_LINK`/`RTNLGRP_IPV4_IFADDR`/`RTNLGRP_IPV6_IFADDR`
//! subscription plus an initial dump; every change surfaces as a
//! [`MonitorEvent`] which the plugin framework fans out to all loaded
//! policies.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;

use tracing::{debug, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};
use crate::netlink::codec::{rtm, take, Attrs};

/// Interface info message (struct ifinfomsg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IfInfoMsg {
    /// Address family (AF_UNSPEC).
    pub ifi_family: u8,
    /// Padding.
    pub ifi_pad: u8,
    /// Device type (ARPHRD_*).
    pub ifi_type: u16,
    /// Interface index.
    pub ifi_index: i32,
    /// Device flags (IFF_*).
    pub ifi_flags: u32,
    /// Change mask.
    pub ifi_change: u32,
}

/// Interface address message (struct ifaddrmsg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IfAddrMsg {
    /// Address family (AF_INET, AF_INET6).
    pub ifa_family: u8,
    /// Prefix length.
    pub ifa_prefixlen: u8,
    /// Address flags (IFA_F_*).
    pub ifa_flags: u8,
    /// Address scope.
    pub ifa_scope: u8,
    /// Interface index.
    pub ifa_index: u32,
}

/// Route message header (struct rtmsg), used for route dumps.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RtMsg {
    /// Address family.
    pub rtm_family: u8,
    /// Destination prefix length.
    pub rtm_dst_len: u8,
    /// Source prefix length.
    pub rtm_src_len: u8,
    /// Type of service.
    pub rtm_tos: u8,
    /// Routing table id.
    pub rtm_table: u8,
    /// Routing protocol (RTPROT_*).
    pub rtm_protocol: u8,
    /// Route scope.
    pub rtm_scope: u8,
    /// Route type (RTN_*).
    pub rtm_type: u8,
    /// Route flags.
    pub rtm_flags: u32,
}

/// Link attributes consumed by the monitor.
mod ifla {
    pub const IFNAME: u16 = 3;
}

/// Address attributes consumed by the monitor.
mod ifa {
    pub const ADDRESS: u16 = 1;
    pub const LOCAL: u16 = 2;
}

/// A network interface snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    /// Address family the kernel reported for the link (AF_UNSPEC).
    pub family: u8,
    /// Device type (ARPHRD_*).
    pub kind: u16,
    /// Interface index.
    pub index: u32,
    /// Device flags (IFF_*).
    pub flags: u32,
    /// Interface name.
    pub name: String,
    /// Addresses currently assigned to the interface.
    pub addrs: Vec<IpAddr>,
}

impl Interface {
    /// True when the interface is a loopback device.
    pub fn is_loopback(&self) -> bool {
        self.flags & libc::IFF_LOOPBACK as u32 != 0
    }

    /// True when the interface is administratively and operationally up.
    pub fn is_up(&self) -> bool {
        self.flags & libc::IFF_UP as u32 != 0
    }
}

/// Flags controlling which network events are surfaced to policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyFlags {
    /// Replay interfaces and addresses present at startup.
    pub existing: bool,
    /// Suppress link-local addresses.
    pub skip_link_local: bool,
    /// Suppress loopback interfaces entirely.
    pub skip_loopback: bool,
    /// Only surface an address once a default route is reachable
    /// through its interface.
    pub check_route: bool,
}

impl NotifyFlags {
    /// Parse a comma-separated flag list, e.g.
    /// `"existing,skip_loopback"`.
    pub fn parse_list(list: &str) -> Result<Self> {
        let mut flags = NotifyFlags::default();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match item {
                "existing" => flags.existing = true,
                "skip_link_local" => flags.skip_link_local = true,
                "skip_loopback" => flags.skip_loopback = true,
                "check_route" => flags.check_route = true,
                _ => return Err(Error::Config(format!("unknown notify flag: {item}"))),
            }
        }
        Ok(flags)
    }
}

impl FromStr for NotifyFlags {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_list(s)
    }
}

/// A change in the host's interface or address state.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A new interface appeared.
    NewInterface(Interface),
    /// An existing interface changed (flags, name).
    UpdateInterface(Interface),
    /// An interface disappeared.
    DeleteInterface(Interface),
    /// An address was added to an interface.
    NewLocalAddress(Interface, IpAddr),
    /// An address was removed from an interface.
    DeleteLocalAddress(Interface, IpAddr),
}

/// Table of known interfaces, updated from rtnetlink messages.
#[derive(Debug)]
pub struct InterfaceTable {
    interfaces: HashMap<u32, Interface>,
    flags: NotifyFlags,
}

impl InterfaceTable {
    /// Create an empty table with the given notify flags.
    pub fn new(flags: NotifyFlags) -> Self {
        Self {
            interfaces: HashMap::new(),
            flags,
        }
    }

    /// The configured notify flags.
    pub fn notify_flags(&self) -> NotifyFlags {
        self.flags
    }

    /// Visit every known interface.
    pub fn foreach_interface(&self, mut visitor: impl FnMut(&Interface)) {
        for iface in self.interfaces.values() {
            visitor(iface);
        }
    }

    /// Look up an interface by index.
    pub fn get(&self, index: u32) -> Option<&Interface> {
        self.interfaces.get(&index)
    }

    /// Reverse lookup: the interface owning `addr`.
    pub fn find_by_addr(&self, addr: &IpAddr) -> Option<&Interface> {
        self.interfaces
            .values()
            .find(|iface| iface.addrs.contains(addr))
    }

    /// Number of tracked interfaces.
    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    /// True when no interface is tracked.
    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    /// Seed an interface directly (tests).
    #[cfg(test)]
    pub(crate) fn insert(&mut self, iface: Interface) {
        self.interfaces.insert(iface.index, iface);
    }

    /// Apply one rtnetlink message, returning the resulting events.
    ///
    /// Parse failures are logged and yield no events; the kernel's
    /// monitoring stream must never take the daemon down.
    pub fn handle_message(&mut self, msg_type: u16, payload: &[u8]) -> Vec<MonitorEvent> {
        let result = match msg_type {
            rtm::NEWLINK => self.apply_link(payload),
            rtm::DELLINK => self.remove_link(payload),
            rtm::NEWADDR => self.apply_addr(payload, true),
            rtm::DELADDR => self.apply_addr(payload, false),
            _ => Ok(Vec::new()),
        };

        match result {
            Ok(events) => events,
            Err(e) => {
                warn!(msg_type, error = %e, "dropping malformed rtnetlink message");
                Vec::new()
            }
        }
    }

    fn apply_link(&mut self, payload: &[u8]) -> Result<Vec<MonitorEvent>> {
        let (header, name) = parse_link(payload)?;
        let index = header.ifi_index as u32;

        if self.flags.skip_loopback && header.ifi_flags & libc::IFF_LOOPBACK as u32 != 0 {
            debug!(index, "ignoring loopback interface");
            return Ok(Vec::new());
        }

        match self.interfaces.get_mut(&index) {
            Some(iface) => {
                let changed = iface.flags != header.ifi_flags
                    || name.as_ref().is_some_and(|n| *n != iface.name);
                iface.flags = header.ifi_flags;
                iface.kind = header.ifi_type;
                if let Some(name) = name {
                    iface.name = name;
                }
                if changed {
                    Ok(vec![MonitorEvent::UpdateInterface(iface.clone())])
                } else {
                    Ok(Vec::new())
                }
            }
            None => {
                let iface = Interface {
                    family: header.ifi_family,
                    kind: header.ifi_type,
                    index,
                    flags: header.ifi_flags,
                    name: name.unwrap_or_default(),
                    addrs: Vec::new(),
                };
                self.interfaces.insert(index, iface.clone());
                Ok(vec![MonitorEvent::NewInterface(iface)])
            }
        }
    }

    fn remove_link(&mut self, payload: &[u8]) -> Result<Vec<MonitorEvent>> {
        let (header, _) = parse_link(payload)?;
        let index = header.ifi_index as u32;

        Ok(self
            .interfaces
            .remove(&index)
            .map(MonitorEvent::DeleteInterface)
            .into_iter()
            .collect())
    }

    fn apply_addr(&mut self, payload: &[u8], add: bool) -> Result<Vec<MonitorEvent>> {
        let (header, addr) = parse_addr(payload)?;
        let Some(addr) = addr else {
            return Ok(Vec::new());
        };

        if self.flags.skip_link_local && is_link_local(&addr) {
            debug!(%addr, "ignoring link-local address");
            return Ok(Vec::new());
        }

        let Some(iface) = self.interfaces.get_mut(&header.ifa_index) else {
            // Address for an interface the table never saw (e.g. a
            // suppressed loopback); nothing to update.
            return Ok(Vec::new());
        };

        if add {
            if iface.addrs.contains(&addr) {
                // Lifetime refresh; the address itself is not new.
                return Ok(Vec::new());
            }
            iface.addrs.push(addr);
            Ok(vec![MonitorEvent::NewLocalAddress(iface.clone(), addr)])
        } else {
            let Some(pos) = iface.addrs.iter().position(|a| *a == addr) else {
                return Ok(Vec::new());
            };
            iface.addrs.remove(pos);
            Ok(vec![MonitorEvent::DeleteLocalAddress(iface.clone(), addr)])
        }
    }
}

/// Parse an RTM_NEWLINK/RTM_DELLINK payload.
fn parse_link(payload: &[u8]) -> Result<(IfInfoMsg, Option<String>)> {
    let (header, attrs) =
        IfInfoMsg::read_from_prefix(payload).map_err(|_| Error::Truncated {
            expected: std::mem::size_of::<IfInfoMsg>(),
            actual: payload.len(),
        })?;

    let mut name = None;
    for (attr_type, attr_payload) in Attrs::new(attrs) {
        if attr_type == ifla::IFNAME {
            name = Some(take::cstr(attr_payload)?.to_string());
        }
    }

    Ok((header, name))
}

/// Parse an RTM_NEWADDR/RTM_DELADDR payload.
///
/// Prefers `IFA_LOCAL` (the actual local address on point-to-point
/// links) over `IFA_ADDRESS`.
fn parse_addr(payload: &[u8]) -> Result<(IfAddrMsg, Option<IpAddr>)> {
    let (header, attrs) =
        IfAddrMsg::read_from_prefix(payload).map_err(|_| Error::Truncated {
            expected: std::mem::size_of::<IfAddrMsg>(),
            actual: payload.len(),
        })?;

    let mut address = None;
    let mut local = None;
    for (attr_type, attr_payload) in Attrs::new(attrs) {
        match attr_type {
            ifa::ADDRESS => address = ip_from_bytes(header.ifa_family, attr_payload),
            ifa::LOCAL => local = ip_from_bytes(header.ifa_family, attr_payload),
            _ => {}
        }
    }

    Ok((header, local.or(address)))
}

fn ip_from_bytes(family: u8, payload: &[u8]) -> Option<IpAddr> {
    match family as i32 {
        libc::AF_INET => {
            let octets: [u8; 4] = payload.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        libc::AF_INET6 => {
            let octets: [u8; 16] = payload.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

/// True for IPv4 169.254.0.0/16 and IPv6 fe80::/10.
fn is_link_local(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

//! Value types crossing the path-manager command surface.

use std::str::FromStr;

use crate::addr::Endpoint;
use crate::error::{Error, Result};
use crate::pm::wire::mptcp_pm_flags;

/// MPTCP endpoint flags.
///
/// These flags control how an endpoint is used for MPTCP connections.
/// `signal` and `fullmesh` are mutually exclusive; the command surface
/// rejects the combination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddrFlags {
    /// Announce this endpoint to peers via ADD_ADDR.
    pub signal: bool,
    /// Use this endpoint for creating new subflows.
    pub subflow: bool,
    /// Mark as backup path (lower priority).
    pub backup: bool,
    /// Create subflows to all peer addresses (fullmesh).
    pub fullmesh: bool,
}

impl AddrFlags {
    /// Create flags from a raw u32 value.
    pub fn from_raw(flags: u32) -> Self {
        Self {
            signal: flags & mptcp_pm_flags::SIGNAL != 0,
            subflow: flags & mptcp_pm_flags::SUBFLOW != 0,
            backup: flags & mptcp_pm_flags::BACKUP != 0,
            fullmesh: flags & mptcp_pm_flags::FULLMESH != 0,
        }
    }

    /// Convert flags to raw u32 value.
    pub fn to_raw(self) -> u32 {
        let mut flags = 0u32;
        if self.signal {
            flags |= mptcp_pm_flags::SIGNAL;
        }
        if self.subflow {
            flags |= mptcp_pm_flags::SUBFLOW;
        }
        if self.backup {
            flags |= mptcp_pm_flags::BACKUP;
        }
        if self.fullmesh {
            flags |= mptcp_pm_flags::FULLMESH;
        }
        flags
    }

    /// Check if no flags are set.
    pub fn is_empty(&self) -> bool {
        !self.signal && !self.subflow && !self.backup && !self.fullmesh
    }

    /// Merge two flag sets.
    pub fn union(self, other: AddrFlags) -> AddrFlags {
        AddrFlags::from_raw(self.to_raw() | other.to_raw())
    }

    /// Parse a comma-separated flag list, e.g. `"subflow,signal"`.
    pub fn parse_list(list: &str) -> Result<Self> {
        let mut flags = AddrFlags::default();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match item {
                "signal" => flags.signal = true,
                "subflow" => flags.subflow = true,
                "backup" => flags.backup = true,
                "fullmesh" => flags.fullmesh = true,
                _ => return Err(Error::Config(format!("unknown address flag: {item}"))),
            }
        }
        if flags.signal && flags.fullmesh {
            return Err(Error::Config(
                "address flags signal and fullmesh are mutually exclusive".into(),
            ));
        }
        Ok(flags)
    }
}

impl FromStr for AddrFlags {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_list(s)
    }
}

/// Kinds of per-connection resource limits the kernel tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    /// Maximum ADD_ADDR advertisements accepted from the peer.
    RcvAddAddrs,
    /// Maximum additional subflows per connection.
    Subflows,
}

/// A single resource limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    /// What is being limited.
    pub kind: LimitKind,
    /// The limit value.
    pub value: u32,
}

impl Limit {
    /// Limit on accepted ADD_ADDR advertisements.
    pub fn rcv_add_addrs(value: u32) -> Self {
        Self {
            kind: LimitKind::RcvAddAddrs,
            value,
        }
    }

    /// Limit on additional subflows.
    pub fn subflows(value: u32) -> Self {
        Self {
            kind: LimitKind::Subflows,
            value,
        }
    }
}

/// A kernel endpoint record, as returned by get/dump replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressInfo {
    /// The endpoint address (port 0 when the kernel reported none).
    pub addr: Endpoint,
    /// The MPTCP address id (raw; 0 means the kernel sent none).
    pub id: u8,
    /// Endpoint flags.
    pub flags: AddrFlags,
    /// Interface index, when bound to a device.
    pub if_index: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_roundtrip() {
        let original = AddrFlags {
            signal: true,
            subflow: false,
            backup: true,
            fullmesh: false,
        };
        let restored = AddrFlags::from_raw(original.to_raw());
        assert_eq!(original, restored);
    }

    #[test]
    fn test_flags_from_raw() {
        let flags = AddrFlags::from_raw(mptcp_pm_flags::SIGNAL | mptcp_pm_flags::BACKUP);
        assert!(flags.signal);
        assert!(!flags.subflow);
        assert!(flags.backup);
        assert!(!flags.fullmesh);
    }

    #[test]
    fn test_parse_list() {
        let flags: AddrFlags = "subflow, backup".parse().unwrap();
        assert!(flags.subflow);
        assert!(flags.backup);
        assert!(!flags.signal);

        assert!(AddrFlags::parse_list("signal,fullmesh").is_err());
        assert!(AddrFlags::parse_list("bogus").is_err());
        assert!(AddrFlags::parse_list("").unwrap().is_empty());
    }

    #[test]
    fn test_union() {
        let a = AddrFlags::parse_list("subflow").unwrap();
        let b = AddrFlags::parse_list("backup").unwrap();
        let u = a.union(b);
        assert!(u.subflow && u.backup);
    }

    #[test]
    fn test_limit_constructors() {
        assert_eq!(Limit::subflows(4).kind, LimitKind::Subflows);
        assert_eq!(Limit::rcv_add_addrs(8).value, 8);
    }
}

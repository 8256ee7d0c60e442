//! MPTCP generic netlink constants.
//!
//! Two kernel lineages expose path management over generic netlink. The
//! upstream kernel registers the `mptcp_pm` family with nested
//! address attributes; the multipath-tcp.org kernel registers the
//! `mptcp` family with a flat attribute set that doubles as its event
//! catalogue. Values mirror the respective kernel uapi headers.

/// Upstream family name.
pub const MPTCP_PM_NAME: &str = "mptcp_pm";
/// Upstream family version.
pub const MPTCP_PM_VERSION: u8 = 1;
/// Upstream event multicast group.
pub const MPTCP_PM_EVENTS: &str = "mptcp_pm_events";

/// multipath-tcp.org family name.
pub const MPTCP_ORG_NAME: &str = "mptcp";
/// multipath-tcp.org family version.
pub const MPTCP_ORG_VERSION: u8 = 1;
/// multipath-tcp.org event multicast group.
pub const MPTCP_ORG_EVENTS: &str = "events";

/// Upstream in-kernel path manager commands.
pub mod mptcp_pm_cmd {
    /// Add an endpoint address.
    pub const ADD_ADDR: u8 = 1;
    /// Delete an endpoint address.
    pub const DEL_ADDR: u8 = 2;
    /// Get endpoint address(es).
    pub const GET_ADDR: u8 = 3;
    /// Flush all endpoint addresses.
    pub const FLUSH_ADDRS: u8 = 4;
    /// Set MPTCP limits.
    pub const SET_LIMITS: u8 = 5;
    /// Get MPTCP limits.
    pub const GET_LIMITS: u8 = 6;
    /// Set endpoint flags.
    pub const SET_FLAGS: u8 = 7;
}

/// Upstream path manager top-level attributes.
pub mod mptcp_pm_attr {
    /// Address entry (nested).
    pub const ADDR: u16 = 1;
    /// Max addresses to accept from peers.
    pub const RCV_ADD_ADDRS: u16 = 2;
    /// Max subflows per connection.
    pub const SUBFLOWS: u16 = 3;
}

/// Upstream path manager address attributes.
///
/// Used within the nested MPTCP_PM_ATTR_ADDR attribute.
pub mod mptcp_pm_addr_attr {
    /// Address family (u16).
    pub const FAMILY: u16 = 1;
    /// Address ID (u8).
    pub const ID: u16 = 2;
    /// IPv4 address (4 bytes, network order).
    pub const ADDR4: u16 = 3;
    /// IPv6 address (16 bytes, network order).
    pub const ADDR6: u16 = 4;
    /// Port number (u16, network byte order).
    pub const PORT: u16 = 5;
    /// Endpoint flags (u32).
    pub const FLAGS: u16 = 6;
    /// Interface index (s32).
    pub const IF_IDX: u16 = 7;
}

/// multipath-tcp.org path manager commands.
pub mod mptcp_org_cmd {
    /// Advertise an address to the peer.
    pub const ANNOUNCE: u8 = 1;
    /// Withdraw an advertised address.
    pub const REMOVE: u8 = 2;
    /// Create a subflow.
    pub const SUB_CREATE: u8 = 3;
    /// Destroy a subflow.
    pub const SUB_DESTROY: u8 = 4;
    /// Change a subflow's backup priority.
    pub const SUB_PRIORITY: u8 = 5;
}

/// Flat attribute catalogue shared by MPTCP events and the
/// multipath-tcp.org commands.
pub mod mptcp_attr {
    /// Connection token (u32, host order).
    pub const TOKEN: u16 = 1;
    /// Address family (u8).
    pub const FAMILY: u16 = 2;
    /// Local address id (u8).
    pub const LOC_ID: u16 = 3;
    /// Remote address id (u8).
    pub const REM_ID: u16 = 4;
    /// Local IPv4 address (4 bytes, network order).
    pub const SADDR4: u16 = 5;
    /// Local IPv6 address (16 bytes, network order).
    pub const SADDR6: u16 = 6;
    /// Remote IPv4 address (4 bytes, network order).
    pub const DADDR4: u16 = 7;
    /// Remote IPv6 address (16 bytes, network order).
    pub const DADDR6: u16 = 8;
    /// Local port (u16, network order).
    pub const SPORT: u16 = 9;
    /// Remote port (u16, network order).
    pub const DPORT: u16 = 10;
    /// Backup priority bit (u8).
    pub const BACKUP: u16 = 11;
    /// Error code (u8).
    pub const ERROR: u16 = 12;
    /// Flags (u32).
    pub const FLAGS: u16 = 13;
    /// Timeout (u32).
    pub const TIMEOUT: u16 = 14;
    /// Interface index (s32).
    pub const IF_IDX: u16 = 15;
    /// Listener side marker (u8).
    pub const SERVER_SIDE: u16 = 18;
    /// Requested path manager strategy (string; legacy kernels only).
    pub const PATH_MANAGER: u16 = 19;
}

/// MPTCP event identifiers published on the event multicast group.
pub mod mptcp_event {
    /// New connection, token assigned.
    pub const CREATED: u8 = 1;
    /// Three-way handshake completed.
    pub const ESTABLISHED: u8 = 2;
    /// Connection closed.
    pub const CLOSED: u8 = 3;
    /// Peer advertised an address.
    pub const ANNOUNCED: u8 = 6;
    /// Peer withdrew an address.
    pub const REMOVED: u8 = 7;
    /// Subflow established.
    pub const SUB_ESTABLISHED: u8 = 10;
    /// Subflow closed.
    pub const SUB_CLOSED: u8 = 11;
    /// Subflow priority changed.
    pub const SUB_PRIORITY: u8 = 13;
}

/// MPTCP endpoint flag bits.
pub mod mptcp_pm_flags {
    /// Announce this address to peers via ADD_ADDR.
    pub const SIGNAL: u32 = 1 << 0;
    /// Use this address for creating new subflows.
    pub const SUBFLOW: u32 = 1 << 1;
    /// Mark as backup path (lower priority).
    pub const BACKUP: u32 = 1 << 2;
    /// Create subflows to all peer addresses (fullmesh).
    pub const FULLMESH: u32 = 1 << 3;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_values() {
        assert_eq!(mptcp_pm_cmd::ADD_ADDR, 1);
        assert_eq!(mptcp_pm_cmd::SET_FLAGS, 7);
        assert_eq!(mptcp_org_cmd::ANNOUNCE, 1);
        assert_eq!(mptcp_org_cmd::SUB_PRIORITY, 5);
    }

    #[test]
    fn test_flag_values() {
        assert_eq!(mptcp_pm_flags::SIGNAL, 1);
        assert_eq!(mptcp_pm_flags::SUBFLOW, 2);
        assert_eq!(mptcp_pm_flags::BACKUP, 4);
        assert_eq!(mptcp_pm_flags::FULLMESH, 8);
    }
}

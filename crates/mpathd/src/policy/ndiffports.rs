//! ndiffports: a fixed number of port-multiplexed subflows per
//! connection.
//!
//! Keeps every connection at [`SUBFLOW_LIMIT`] subflows between the
//! same address pair, letting the kernel pick a fresh ephemeral local
//! port for each additional subflow. Only the client side requests
//! subflows; the server side merely accounts for them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::addr::{Endpoint, Token};
use crate::error::Result;
use crate::plugin::{Plugin, PluginDescriptor, Registrar};
use crate::pm::PathManager;

/// Subflows maintained per connection, the original flow included.
const SUBFLOW_LIMIT: usize = 2;

/// A subflow closing this quickly after opening counts as a peer
/// rejection.
const REJECT_WINDOW: Duration = Duration::from_secs(10);

/// Plugin descriptor; resolved by the loader.
pub static PLUGIN: PluginDescriptor = PluginDescriptor {
    name: "ndiffports",
    description: "fixed number of port-multiplexed subflows per connection",
    priority: 10,
    init,
    exit,
};

fn init(registrar: &mut Registrar<'_>) -> Result<()> {
    registrar.register_ops("ndiffports", Box::<NdiffPorts>::default());
    Ok(())
}

fn exit(_pm: &mut PathManager) {}

/// An additional subflow tracked for a connection.
#[derive(Debug, Clone)]
struct Subflow {
    local: Endpoint,
    remote: Endpoint,
    opened: Instant,
    last_change: Instant,
}

/// Per-connection state.
#[derive(Debug)]
struct Connection {
    laddr: Endpoint,
    raddr: Endpoint,
    server_side: bool,
    /// Live subflow count, the original flow included.
    active: usize,
    /// A subflow request is in flight; do not stack another.
    pending_request: bool,
    /// Consecutive subflows the peer tore down within
    /// [`REJECT_WINDOW`]. Purely observational: the counter is kept for
    /// diagnostics and nothing acts on it.
    peer_rejected_consecutive: u32,
    subflows: [Option<Subflow>; SUBFLOW_LIMIT],
}

impl Connection {
    fn new(laddr: Endpoint, raddr: Endpoint, server_side: bool) -> Self {
        Self {
            laddr,
            raddr,
            server_side,
            active: 1,
            pending_request: false,
            peer_rejected_consecutive: 0,
            subflows: Default::default(),
        }
    }
}

/// The ndiffports policy.
#[derive(Default)]
pub struct NdiffPorts {
    connections: HashMap<Token, Connection>,
}

impl NdiffPorts {
    /// Ask for one more subflow when the connection is below the limit.
    ///
    /// The local port is cleared so the kernel assigns a fresh
    /// ephemeral port, multiplexing the same address pair.
    fn request_subflow(pm: &mut PathManager, token: Token, conn: &mut Connection) {
        if conn.server_side || conn.pending_request || conn.active >= SUBFLOW_LIMIT {
            return;
        }

        let local_id = pm
            .idm()
            .get_id(conn.laddr.addr())
            .map(|id| id.get())
            .unwrap_or(0);
        let local = conn.laddr.with_port(0);

        match pm.add_subflow(token, local_id, 0, &local, &conn.raddr, false) {
            Ok(()) => conn.pending_request = true,
            Err(e) => warn!(%token, error = %e, "unable to request additional subflow"),
        }
    }
}

impl Plugin for NdiffPorts {
    fn new_connection(
        &mut self,
        _pm: &mut PathManager,
        token: Token,
        laddr: &Endpoint,
        raddr: &Endpoint,
        server_side: bool,
    ) {
        self.connections
            .insert(token, Connection::new(*laddr, *raddr, server_side));
    }

    fn connection_established(
        &mut self,
        pm: &mut PathManager,
        token: Token,
        laddr: &Endpoint,
        raddr: &Endpoint,
        server_side: bool,
    ) {
        let conn = self
            .connections
            .entry(token)
            .or_insert_with(|| Connection::new(*laddr, *raddr, server_side));
        Self::request_subflow(pm, token, conn);
    }

    fn connection_closed(&mut self, _pm: &mut PathManager, token: Token) {
        self.connections.remove(&token);
    }

    fn new_subflow(
        &mut self,
        pm: &mut PathManager,
        token: Token,
        laddr: &Endpoint,
        raddr: &Endpoint,
        _backup: bool,
    ) {
        let Some(conn) = self.connections.get_mut(&token) else {
            debug!(%token, "subflow for unknown connection ignored");
            return;
        };

        // The subflow must multiplex the connection's own address pair;
        // anything else exceeds the policy's mandate, as does a subflow
        // beyond the limit.
        let acceptable = laddr.same_host(&conn.laddr)
            && raddr.same_host(&conn.raddr)
            && conn.active < SUBFLOW_LIMIT;

        if !acceptable {
            debug!(%token, %laddr, %raddr, "removing unsolicited subflow");
            if let Err(e) = pm.remove_subflow(token, laddr, raddr) {
                warn!(%token, error = %e, "unable to remove unsolicited subflow");
            }
            return;
        }

        conn.active += 1;
        conn.pending_request = false;
        let now = Instant::now();
        if let Some(slot) = conn.subflows.iter_mut().find(|s| s.is_none()) {
            *slot = Some(Subflow {
                local: *laddr,
                remote: *raddr,
                opened: now,
                last_change: now,
            });
        }
    }

    fn subflow_closed(
        &mut self,
        pm: &mut PathManager,
        token: Token,
        laddr: &Endpoint,
        raddr: &Endpoint,
        _backup: bool,
    ) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        let Some(slot) = conn.subflows.iter_mut().find(|s| {
            s.as_ref()
                .is_some_and(|sf| sf.local == *laddr && sf.remote == *raddr)
        }) else {
            debug!(%token, %laddr, %raddr, "closed subflow was not tracked");
            return;
        };

        let (lifetime, since_change) = slot
            .as_ref()
            .map(|sf| (sf.opened.elapsed(), sf.last_change.elapsed()))
            .unwrap_or_default();
        debug!(%token, ?lifetime, ?since_change, "tracked subflow closed");
        if lifetime < REJECT_WINDOW {
            conn.peer_rejected_consecutive += 1;
        } else {
            conn.peer_rejected_consecutive = 0;
        }
        *slot = None;
        conn.active = conn.active.saturating_sub(1);

        Self::request_subflow(pm, token, conn);
    }

    fn subflow_priority(
        &mut self,
        _pm: &mut PathManager,
        token: Token,
        laddr: &Endpoint,
        raddr: &Endpoint,
        _backup: bool,
    ) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if let Some(sf) = conn
            .subflows
            .iter_mut()
            .flatten()
            .find(|sf| sf.local == *laddr && sf.remote == *raddr)
        {
            sf.last_change = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::NotifyFlags;
    use crate::netlink::codec::{take, Attrs};
    use crate::pm::dialect::GenlRequest;
    use crate::pm::mptcp_org::MptcpOrgDialect;
    use crate::pm::types::AddrFlags;
    use crate::pm::wire::{mptcp_attr, mptcp_org_cmd};
    use crate::pm::FamilyHandle;

    fn pm() -> PathManager {
        let mut pm = PathManager::with_dialect(
            Box::new(MptcpOrgDialect),
            AddrFlags::default(),
            NotifyFlags::default(),
        );
        pm.attach(FamilyHandle {
            id: 0x18,
            event_group: 2,
        });
        pm
    }

    fn v4(s: &str, port: u16) -> Endpoint {
        Endpoint::new(s.parse::<std::net::Ipv4Addr>().unwrap().into(), port)
    }

    fn token() -> Token {
        Token::new(0xfeed).unwrap()
    }

    fn attr_u32(req: &GenlRequest, attr: u16) -> Option<u32> {
        Attrs::new(&req.attrs)
            .find(|(t, _)| *t == attr)
            .map(|(_, p)| take::u32_ne(p).unwrap())
    }

    fn attr_u16_be(req: &GenlRequest, attr: u16) -> Option<u16> {
        Attrs::new(&req.attrs)
            .find(|(t, _)| *t == attr)
            .map(|(_, p)| take::u16_be(p).unwrap())
    }

    fn attr_u8(req: &GenlRequest, attr: u16) -> Option<u8> {
        Attrs::new(&req.attrs)
            .find(|(t, _)| *t == attr)
            .map(|(_, p)| take::u8(p).unwrap())
    }

    #[test]
    fn test_established_requests_one_subflow() {
        let mut pm = pm();
        let mut policy = NdiffPorts::default();
        let laddr = v4("192.0.2.1", 0x1234);
        let raddr = v4("203.0.113.1", 0x3456);

        policy.new_connection(&mut pm, token(), &laddr, &raddr, false);
        policy.connection_established(&mut pm, token(), &laddr, &raddr, false);

        let pending = pm.take_pending().unwrap();
        assert_eq!(pending.command, "add_subflow");
        assert_eq!(pending.request.cmd, mptcp_org_cmd::SUB_CREATE);
        assert_eq!(attr_u32(&pending.request, mptcp_attr::TOKEN), Some(0xfeed));
        // First id allocated from a fresh id manager.
        assert_eq!(attr_u8(&pending.request, mptcp_attr::LOC_ID), Some(1));
        assert_eq!(attr_u8(&pending.request, mptcp_attr::REM_ID), Some(0));
        // The local port is cleared so the kernel picks an ephemeral
        // one: an unspecified port is omitted from the wire format.
        assert_eq!(attr_u16_be(&pending.request, mptcp_attr::SPORT), None);
        assert_eq!(
            attr_u16_be(&pending.request, mptcp_attr::DPORT),
            Some(0x3456)
        );
        assert_eq!(attr_u8(&pending.request, mptcp_attr::BACKUP), Some(0));

        // Only one request while it is pending.
        assert!(!pm.has_pending());
        policy.connection_established(&mut pm, token(), &laddr, &raddr, false);
        assert!(!pm.has_pending());
    }

    #[test]
    fn test_server_side_requests_nothing() {
        let mut pm = pm();
        let mut policy = NdiffPorts::default();
        let laddr = v4("192.0.2.1", 80);
        let raddr = v4("203.0.113.1", 50000);

        policy.new_connection(&mut pm, token(), &laddr, &raddr, true);
        policy.connection_established(&mut pm, token(), &laddr, &raddr, true);
        assert!(!pm.has_pending());
    }

    #[test]
    fn test_matching_subflow_accepted_up_to_limit() {
        let mut pm = pm();
        let mut policy = NdiffPorts::default();
        let laddr = v4("192.0.2.1", 0x1234);
        let raddr = v4("203.0.113.1", 0x3456);

        policy.new_connection(&mut pm, token(), &laddr, &raddr, false);
        policy.connection_established(&mut pm, token(), &laddr, &raddr, false);
        let _ = pm.take_pending();

        // The kernel reports the new subflow on an ephemeral port.
        policy.new_subflow(&mut pm, token(), &v4("192.0.2.1", 49152), &raddr, false);

        let conn = policy.connections.get(&token()).unwrap();
        assert_eq!(conn.active, 2);
        assert!(!conn.pending_request);
        // At the limit: no further request was queued.
        assert!(!pm.has_pending());
    }

    #[test]
    fn test_foreign_subflow_removed() {
        let mut pm = pm();
        let mut policy = NdiffPorts::default();
        let laddr = v4("192.0.2.1", 0x1234);
        let raddr = v4("203.0.113.1", 0x3456);

        policy.new_connection(&mut pm, token(), &laddr, &raddr, false);

        // Different remote host: not this connection's pair.
        policy.new_subflow(&mut pm, token(), &laddr, &v4("198.51.100.9", 443), false);

        let pending = pm.take_pending().unwrap();
        assert_eq!(pending.command, "remove_subflow");
        assert_eq!(pending.request.cmd, mptcp_org_cmd::SUB_DESTROY);
        assert_eq!(policy.connections.get(&token()).unwrap().active, 1);
    }

    #[test]
    fn test_closed_subflow_requests_replacement() {
        let mut pm = pm();
        let mut policy = NdiffPorts::default();
        let laddr = v4("192.0.2.1", 0x1234);
        let raddr = v4("203.0.113.1", 0x3456);
        let sub_local = v4("192.0.2.1", 49152);

        policy.new_connection(&mut pm, token(), &laddr, &raddr, false);
        policy.connection_established(&mut pm, token(), &laddr, &raddr, false);
        let _ = pm.take_pending();
        policy.new_subflow(&mut pm, token(), &sub_local, &raddr, false);

        policy.subflow_closed(&mut pm, token(), &sub_local, &raddr, false);

        let conn = policy.connections.get(&token()).unwrap();
        assert_eq!(conn.active, 1);
        // Closed within the rejection window (the test runs in well
        // under ten seconds); observational counter only.
        assert_eq!(conn.peer_rejected_consecutive, 1);

        // A replacement was requested.
        let pending = pm.take_pending().unwrap();
        assert_eq!(pending.command, "add_subflow");
    }

    #[test]
    fn test_connection_closed_drops_state() {
        let mut pm = pm();
        let mut policy = NdiffPorts::default();
        let laddr = v4("192.0.2.1", 1);
        let raddr = v4("203.0.113.1", 2);

        policy.new_connection(&mut pm, token(), &laddr, &raddr, false);
        policy.connection_closed(&mut pm, token());
        assert!(policy.connections.is_empty());
    }
}

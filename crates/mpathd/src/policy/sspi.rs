//! sspi: single subflow per network interface.
//!
//! Tracks which interface every connection's subflows land on and
//! advertises the addresses of all other interfaces, so the peer can
//! join over each physical path exactly once. A second subflow arriving
//! on an interface that already carries one for the same connection is
//! torn down.

use std::collections::HashMap;
use std::net::IpAddr;

use tracing::{debug, warn};

use crate::addr::{Endpoint, Token};
use crate::error::Result;
use crate::monitor::Interface;
use crate::plugin::{Plugin, PluginDescriptor, Registrar};
use crate::pm::PathManager;

/// Plugin descriptor; resolved by the loader.
pub static PLUGIN: PluginDescriptor = PluginDescriptor {
    name: "sspi",
    description: "single subflow per network interface",
    priority: 20,
    init,
    exit,
};

fn init(registrar: &mut Registrar<'_>) -> Result<()> {
    registrar.register_ops("sspi", Box::<Sspi>::default());
    Ok(())
}

fn exit(_pm: &mut PathManager) {}

/// The sspi policy.
#[derive(Default)]
pub struct Sspi {
    /// Interface index to the tokens with a subflow on it.
    interfaces: HashMap<u32, Vec<Token>>,
}

impl Sspi {
    /// The interface owning `addr`, per the network monitor.
    fn interface_for(pm: &PathManager, addr: &IpAddr) -> Option<u32> {
        pm.interfaces().find_by_addr(addr).map(|iface| iface.index)
    }

    fn track(&mut self, index: u32, token: Token) -> bool {
        let tokens = self.interfaces.entry(index).or_default();
        if tokens.contains(&token) {
            return false;
        }
        tokens.push(token);
        true
    }
}

impl Plugin for Sspi {
    fn new_connection(
        &mut self,
        pm: &mut PathManager,
        token: Token,
        laddr: &Endpoint,
        _raddr: &Endpoint,
        _server_side: bool,
    ) {
        let Some(index) = Self::interface_for(pm, &laddr.addr()) else {
            warn!(%token, %laddr, "no interface for connection's local address");
            return;
        };
        self.track(index, token);

        // Offer the peer one path per remaining interface.
        let mut offers: Vec<IpAddr> = Vec::new();
        pm.interfaces().foreach_interface(|iface| {
            if iface.index != index {
                offers.extend(iface.addrs.iter().copied());
            }
        });

        for addr in offers {
            let Some(id) = pm.idm().get_id(addr) else {
                warn!(%addr, "address id pool exhausted; not advertising");
                continue;
            };
            if let Err(e) = pm.add_addr(&Endpoint::from(addr), id, token) {
                warn!(%token, %addr, error = %e, "unable to advertise address");
            }
        }
    }

    fn connection_closed(&mut self, _pm: &mut PathManager, token: Token) {
        for tokens in self.interfaces.values_mut() {
            tokens.retain(|t| *t != token);
        }
    }

    fn new_subflow(
        &mut self,
        pm: &mut PathManager,
        token: Token,
        laddr: &Endpoint,
        raddr: &Endpoint,
        _backup: bool,
    ) {
        let Some(index) = Self::interface_for(pm, &laddr.addr()) else {
            debug!(%token, %laddr, "subflow on unknown interface ignored");
            return;
        };

        if !self.track(index, token) {
            // One subflow per interface per connection; tear down the
            // extra one.
            debug!(%token, index, "removing second subflow on interface");
            if let Err(e) = pm.remove_subflow(token, laddr, raddr) {
                warn!(%token, error = %e, "unable to remove excess subflow");
            }
        }
    }

    fn delete_interface(&mut self, _pm: &mut PathManager, iface: &Interface) {
        self.interfaces.remove(&iface.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::NotifyFlags;
    use crate::netlink::codec::{take, Attrs};
    use crate::pm::mptcp_org::MptcpOrgDialect;
    use crate::pm::types::AddrFlags;
    use crate::pm::wire::{mptcp_attr, mptcp_org_cmd};
    use crate::pm::FamilyHandle;

    fn iface(index: u32, name: &str, addrs: &[&str]) -> Interface {
        Interface {
            family: 0,
            kind: 1,
            index,
            flags: libc::IFF_UP as u32,
            name: name.into(),
            addrs: addrs.iter().map(|a| a.parse().unwrap()).collect(),
        }
    }

    fn pm_with_interfaces() -> PathManager {
        let mut pm = PathManager::with_dialect(
            Box::new(MptcpOrgDialect),
            AddrFlags::default(),
            NotifyFlags::default(),
        );
        pm.attach(FamilyHandle {
            id: 0x18,
            event_group: 2,
        });
        pm.interfaces_mut()
            .insert(iface(2, "eth0", &["192.0.2.1"]));
        pm.interfaces_mut()
            .insert(iface(3, "eth1", &["198.51.100.1", "2001:db8::1"]));
        pm
    }

    fn v4(s: &str, port: u16) -> Endpoint {
        Endpoint::new(s.parse::<std::net::Ipv4Addr>().unwrap().into(), port)
    }

    fn token() -> Token {
        Token::new(0xbeef).unwrap()
    }

    #[test]
    fn test_new_connection_advertises_other_interfaces() {
        let mut pm = pm_with_interfaces();
        let mut policy = Sspi::default();

        // Connection lands on eth0; eth1's two addresses get announced.
        policy.new_connection(
            &mut pm,
            token(),
            &v4("192.0.2.1", 45000),
            &v4("203.0.113.1", 443),
            false,
        );

        let mut announced = Vec::new();
        while let Some(pending) = pm.take_pending() {
            assert_eq!(pending.command, "add_addr");
            assert_eq!(pending.request.cmd, mptcp_org_cmd::ANNOUNCE);
            let tok = Attrs::new(&pending.request.attrs)
                .find(|(t, _)| *t == mptcp_attr::TOKEN)
                .map(|(_, p)| take::u32_ne(p).unwrap());
            assert_eq!(tok, Some(0xbeef));
            announced.push(pending);
        }
        assert_eq!(announced.len(), 2);
        assert_eq!(policy.interfaces.get(&2).unwrap(), &vec![token()]);
    }

    #[test]
    fn test_second_subflow_on_interface_rejected() {
        let mut pm = pm_with_interfaces();
        let mut policy = Sspi::default();

        policy.new_connection(
            &mut pm,
            token(),
            &v4("192.0.2.1", 45000),
            &v4("203.0.113.1", 443),
            false,
        );
        while pm.take_pending().is_some() {}

        // First join on eth1: accepted.
        policy.new_subflow(
            &mut pm,
            token(),
            &v4("198.51.100.1", 45001),
            &v4("203.0.113.1", 443),
            false,
        );
        assert!(!pm.has_pending());

        // Second join on eth1 for the same connection: torn down.
        policy.new_subflow(
            &mut pm,
            token(),
            &v4("198.51.100.1", 45002),
            &v4("203.0.113.1", 443),
            false,
        );
        let pending = pm.take_pending().unwrap();
        assert_eq!(pending.command, "remove_subflow");
        assert_eq!(pending.request.cmd, mptcp_org_cmd::SUB_DESTROY);
    }

    #[test]
    fn test_connection_closed_clears_all_interfaces() {
        let mut pm = pm_with_interfaces();
        let mut policy = Sspi::default();

        policy.new_connection(
            &mut pm,
            token(),
            &v4("192.0.2.1", 45000),
            &v4("203.0.113.1", 443),
            false,
        );
        policy.new_subflow(
            &mut pm,
            token(),
            &v4("198.51.100.1", 45001),
            &v4("203.0.113.1", 443),
            false,
        );
        while pm.take_pending().is_some() {}

        policy.connection_closed(&mut pm, token());
        assert!(policy.interfaces.values().all(|t| t.is_empty()));
    }

    #[test]
    fn test_unknown_local_address_ignored() {
        let mut pm = pm_with_interfaces();
        let mut policy = Sspi::default();

        policy.new_connection(
            &mut pm,
            token(),
            &v4("10.9.9.9", 1),
            &v4("203.0.113.1", 443),
            false,
        );
        assert!(!pm.has_pending());
        assert!(policy.interfaces.is_empty());
    }

    #[test]
    fn test_delete_interface_drops_record() {
        let mut pm = pm_with_interfaces();
        let mut policy = Sspi::default();
        policy.new_connection(
            &mut pm,
            token(),
            &v4("192.0.2.1", 45000),
            &v4("203.0.113.1", 443),
            false,
        );
        while pm.take_pending().is_some() {}

        let gone = iface(2, "eth0", &["192.0.2.1"]);
        policy.delete_interface(&mut pm, &gone);
        assert!(!policy.interfaces.contains_key(&2));
    }
}

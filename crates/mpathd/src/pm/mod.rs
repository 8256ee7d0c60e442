//! Path manager assembly.
//!
//! Owns the address-id manager, the listener manager, the interface
//! table, and the active command dialect, and exposes the
//! dialect-neutral command surface policies program against. Commands
//! are validated synchronously (readiness, dialect support, argument
//! sanity), encoded by the dialect, and queued on an outbox; the
//! daemon's event loop drains the outbox onto the netlink socket and
//! routes replies back through the continuations attached to each
//! request.

pub mod dialect;
pub mod event;
pub mod mptcp_org;
pub mod types;
pub mod upstream;
pub mod wire;

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::addr::{AddrId, Endpoint, Token};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::idm::IdManager;
use crate::listener::ListenerManager;
use crate::monitor::{InterfaceTable, NotifyFlags};
use dialect::{Dialect, DialectKind, GenlRequest};
use types::{AddrFlags, AddressInfo, Limit};

/// Per-record continuation for endpoint get/dump replies.
pub type EndpointCallback = Box<dyn FnMut(&mut PathManager, &AddressInfo)>;
/// Completion continuation, invoked exactly once per get/dump request.
pub type DoneCallback = Box<dyn FnOnce(&mut PathManager)>;
/// Completion continuation for limits queries.
pub type LimitsCallback = Box<dyn FnOnce(&mut PathManager, &[Limit])>;

/// How the transport must treat a request's reply.
pub(crate) enum ReplyHandler {
    /// Fire-and-forget; log the kernel's ACK outcome.
    Ack,
    /// Endpoint records, one callback invocation per record.
    Endpoints {
        record: EndpointCallback,
        done: DoneCallback,
    },
    /// A limits reply.
    Limits { done: LimitsCallback },
}

/// A queued command awaiting emission.
pub(crate) struct Pending {
    /// Command name, for result logging.
    pub command: &'static str,
    /// Encoded request.
    pub request: GenlRequest,
    /// Reply treatment.
    pub reply: ReplyHandler,
}

/// Attachment state of the MPTCP generic netlink family.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FamilyHandle {
    /// Resolved family id.
    pub id: u16,
    /// Resolved event multicast group id.
    pub event_group: u32,
}

/// The path manager.
pub struct PathManager {
    idm: IdManager,
    lm: ListenerManager,
    interfaces: InterfaceTable,
    dialect: Box<dyn Dialect>,
    family: Option<FamilyHandle>,
    outbox: VecDeque<Pending>,
    addr_flags: AddrFlags,
}

impl PathManager {
    /// Create a path manager for the running kernel.
    ///
    /// Probes the MPTCP sysctls to select a dialect; fails with
    /// [`Error::NoMptcpSupport`] when the kernel offers neither
    /// variant.
    pub fn new(config: &Config) -> Result<Self> {
        let dialect = dialect::probe_system()?;
        Ok(Self::with_dialect(dialect, config.addr_flags, config.notify_flags))
    }

    /// Create a path manager with an explicit dialect.
    pub(crate) fn with_dialect(
        dialect: Box<dyn Dialect>,
        addr_flags: AddrFlags,
        notify_flags: NotifyFlags,
    ) -> Self {
        info!(
            family = dialect.family_name(),
            "path manager using {} dialect",
            match dialect.kind() {
                DialectKind::Upstream => "upstream",
                DialectKind::MptcpOrg => "multipath-tcp.org",
            }
        );
        Self {
            idm: IdManager::new(),
            lm: ListenerManager::new(),
            interfaces: InterfaceTable::new(notify_flags),
            dialect,
            family: None,
            outbox: VecDeque::new(),
            addr_flags,
        }
    }

    /// True while the kernel MPTCP family is attached.
    pub fn is_ready(&self) -> bool {
        self.family.is_some()
    }

    /// The active dialect.
    pub(crate) fn dialect(&self) -> &dyn Dialect {
        &*self.dialect
    }

    /// The address-id manager.
    pub fn idm(&mut self) -> &mut IdManager {
        &mut self.idm
    }

    /// The interface table maintained by the network monitor.
    pub fn interfaces(&self) -> &InterfaceTable {
        &self.interfaces
    }

    /// Mutable access for the monitor transport.
    pub(crate) fn interfaces_mut(&mut self) -> &mut InterfaceTable {
        &mut self.interfaces
    }

    /// Called by the daemon when the family appears.
    ///
    /// With the kernel-oriented dialect active this kicks off endpoint
    /// reconciliation: every `(address, id)` pair the kernel already
    /// holds is injected into the id manager so later allocations do
    /// not collide with pre-existing state.
    pub(crate) fn attach(&mut self, handle: FamilyHandle) {
        info!(
            family = self.dialect.family_name(),
            id = handle.id,
            "MPTCP generic netlink family attached"
        );
        self.family = Some(handle);

        if self.dialect.kind() == DialectKind::Upstream {
            let record: EndpointCallback = Box::new(|pm, info| match AddrId::new(info.id) {
                Some(id) => {
                    pm.idm.map_id(info.addr.addr(), id);
                    info!(addr = %info.addr, %id, "synced kernel endpoint id");
                }
                None => {
                    warn!(addr = %info.addr, "kernel endpoint carries no usable id; skipped");
                }
            });
            let done: DoneCallback = Box::new(|pm| {
                info!(mapped = pm.idm.len(), "kernel endpoint synchronisation complete");
            });
            if let Err(e) = self.dump_endpoints(record, done) {
                warn!(error = %e, "unable to start endpoint synchronisation");
            }
        }
    }

    /// Called by the daemon when the family vanishes.
    ///
    /// Outstanding queued commands are invalidated; callers see
    /// [`Error::NotReady`] until re-attachment.
    pub(crate) fn detach(&mut self) {
        if self.family.take().is_some() {
            info!(
                family = self.dialect.family_name(),
                "MPTCP generic netlink family vanished"
            );
        }
        if !self.outbox.is_empty() {
            warn!(
                dropped = self.outbox.len(),
                "discarding queued commands after family loss"
            );
            self.outbox.clear();
        }
    }

    /// The attached family handle, if any.
    pub(crate) fn family(&self) -> Option<FamilyHandle> {
        self.family
    }

    /// Pop the next queued command for emission.
    pub(crate) fn take_pending(&mut self) -> Option<Pending> {
        self.outbox.pop_front()
    }

    /// True when commands are queued.
    pub(crate) fn has_pending(&self) -> bool {
        !self.outbox.is_empty()
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.family.is_none() {
            return Err(Error::NotReady);
        }
        Ok(())
    }

    fn push(&mut self, command: &'static str, request: GenlRequest, reply: ReplyHandler) {
        debug!(command, cmd = request.cmd, "queueing path management command");
        self.outbox.push_back(Pending {
            command,
            request,
            reply,
        });
    }

    // --- client-oriented command surface ---

    /// Advertise `addr` with `id` on the connection named by `token`.
    pub fn add_addr(&mut self, addr: &Endpoint, id: AddrId, token: Token) -> Result<()> {
        self.ensure_ready()?;
        let request = self.dialect.add_addr(addr, id, token)?;
        self.push("add_addr", request, ReplyHandler::Ack);
        Ok(())
    }

    /// Withdraw the advertisement for `id` on `token`.
    pub fn remove_addr(&mut self, id: AddrId, token: Token) -> Result<()> {
        self.ensure_ready()?;
        let request = self.dialect.remove_addr(id, token)?;
        self.push("remove_addr", request, ReplyHandler::Ack);
        Ok(())
    }

    /// Create a subflow on `token` between `local` and `remote`.
    pub fn add_subflow(
        &mut self,
        token: Token,
        local_id: u8,
        remote_id: u8,
        local: &Endpoint,
        remote: &Endpoint,
        backup: bool,
    ) -> Result<()> {
        self.ensure_ready()?;
        let request = self
            .dialect
            .add_subflow(token, local_id, remote_id, local, remote, backup)?;
        self.push("add_subflow", request, ReplyHandler::Ack);
        Ok(())
    }

    /// Destroy the subflow on `token` between `local` and `remote`.
    pub fn remove_subflow(
        &mut self,
        token: Token,
        local: &Endpoint,
        remote: &Endpoint,
    ) -> Result<()> {
        self.ensure_ready()?;
        let request = self.dialect.remove_subflow(token, local, remote)?;
        self.push("remove_subflow", request, ReplyHandler::Ack);
        Ok(())
    }

    /// Change the backup priority of an established subflow.
    pub fn set_backup(
        &mut self,
        token: Token,
        local: &Endpoint,
        remote: &Endpoint,
        backup: bool,
    ) -> Result<()> {
        self.ensure_ready()?;
        let request = self.dialect.set_backup(token, local, remote, backup)?;
        self.push("set_backup", request, ReplyHandler::Ack);
        Ok(())
    }

    // --- kernel-oriented command surface ---

    /// Register an endpoint with the in-kernel path manager.
    ///
    /// Flags configured via `addr-flags` are merged in. When the
    /// resulting endpoint is announced (`signal`) on a concrete port, a
    /// listening MPTCP socket is opened for it so incoming joins have a
    /// target.
    pub fn add_endpoint(
        &mut self,
        addr: &Endpoint,
        id: AddrId,
        flags: AddrFlags,
        if_index: Option<i32>,
    ) -> Result<()> {
        self.ensure_ready()?;

        let flags = flags.union(self.addr_flags);
        if flags.signal && flags.fullmesh {
            return Err(Error::InvalidArgument(
                "signal and fullmesh endpoint flags are mutually exclusive",
            ));
        }

        let request = self.dialect.add_endpoint(addr, id, flags, if_index)?;

        if flags.signal && addr.port() != 0 {
            if let Err(e) = self.lm.listen(id, addr) {
                warn!(%id, %addr, error = %e, "unable to open announce listener");
            }
        }

        self.push("add_endpoint", request, ReplyHandler::Ack);
        Ok(())
    }

    /// Remove the endpoint registered under `id`.
    pub fn remove_endpoint(&mut self, id: AddrId) -> Result<()> {
        self.ensure_ready()?;
        let request = self.dialect.remove_endpoint(id)?;
        if self.lm.close(id).is_ok() {
            debug!(%id, "closed announce listener");
        }
        self.push("remove_endpoint", request, ReplyHandler::Ack);
        Ok(())
    }

    /// Fetch one endpoint record; `record` runs for the record (if the
    /// kernel returns one) and `done` runs exactly once afterwards.
    pub fn get_endpoint(
        &mut self,
        id: AddrId,
        record: EndpointCallback,
        done: DoneCallback,
    ) -> Result<()> {
        self.ensure_ready()?;
        let request = self.dialect.get_endpoint(id)?;
        self.push(
            "get_endpoint",
            request,
            ReplyHandler::Endpoints { record, done },
        );
        Ok(())
    }

    /// Dump every registered endpoint; `record` runs once per record
    /// and `done` exactly once after the last record, even when no
    /// record arrived.
    pub fn dump_endpoints(&mut self, record: EndpointCallback, done: DoneCallback) -> Result<()> {
        self.ensure_ready()?;
        let request = self.dialect.dump_endpoints()?;
        self.push(
            "dump_endpoints",
            request,
            ReplyHandler::Endpoints { record, done },
        );
        Ok(())
    }

    /// Drop every registered endpoint.
    pub fn flush_endpoints(&mut self) -> Result<()> {
        self.ensure_ready()?;
        let request = self.dialect.flush_endpoints()?;
        self.push("flush_endpoints", request, ReplyHandler::Ack);
        Ok(())
    }

    /// Set per-connection resource limits.
    pub fn set_limits(&mut self, limits: &[Limit]) -> Result<()> {
        self.ensure_ready()?;
        let request = self.dialect.set_limits(limits)?;
        self.push("set_limits", request, ReplyHandler::Ack);
        Ok(())
    }

    /// Fetch the per-connection resource limits.
    pub fn get_limits(&mut self, done: LimitsCallback) -> Result<()> {
        self.ensure_ready()?;
        let request = self.dialect.get_limits()?;
        self.push("get_limits", request, ReplyHandler::Limits { done });
        Ok(())
    }

    /// Change the flags of a registered endpoint.
    pub fn set_endpoint_flags(&mut self, addr: &Endpoint, flags: AddrFlags) -> Result<()> {
        self.ensure_ready()?;
        if flags.signal && flags.fullmesh {
            return Err(Error::InvalidArgument(
                "signal and fullmesh endpoint flags are mutually exclusive",
            ));
        }
        let request = self.dialect.set_endpoint_flags(addr, flags)?;
        self.push("set_endpoint_flags", request, ReplyHandler::Ack);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::codec::{take, Attrs};
    use crate::pm::wire::{mptcp_attr, mptcp_org_cmd, mptcp_pm_cmd};

    fn ready_pm(dialect: Box<dyn Dialect>) -> PathManager {
        let mut pm =
            PathManager::with_dialect(dialect, AddrFlags::default(), NotifyFlags::default());
        pm.attach(FamilyHandle {
            id: 0x18,
            event_group: 7,
        });
        pm
    }

    fn v4(s: &str, port: u16) -> Endpoint {
        Endpoint::new(s.parse::<std::net::Ipv4Addr>().unwrap().into(), port)
    }

    fn token(raw: u32) -> Token {
        Token::new(raw).unwrap()
    }

    fn id(raw: u8) -> AddrId {
        AddrId::new(raw).unwrap()
    }

    #[test]
    fn test_not_ready_rejected() {
        let mut pm = PathManager::with_dialect(
            Box::new(mptcp_org::MptcpOrgDialect),
            AddrFlags::default(),
            NotifyFlags::default(),
        );
        assert!(!pm.is_ready());
        assert!(matches!(
            pm.add_addr(&v4("192.0.2.1", 0), id(1), token(5)),
            Err(Error::NotReady)
        ));
        assert!(!pm.has_pending());
    }

    #[test]
    fn test_detach_invalidates_queue_and_readiness() {
        let mut pm = ready_pm(Box::new(mptcp_org::MptcpOrgDialect));
        assert!(pm.is_ready());
        pm.add_addr(&v4("192.0.2.1", 0), id(1), token(5)).unwrap();
        assert!(pm.has_pending());

        pm.detach();
        assert!(!pm.is_ready());
        assert!(!pm.has_pending());
        assert!(matches!(
            pm.remove_addr(id(1), token(5)),
            Err(Error::NotReady)
        ));
    }

    #[test]
    fn test_unsupported_on_wrong_dialect() {
        let mut pm = ready_pm(Box::new(upstream::UpstreamDialect));
        assert!(matches!(
            pm.add_subflow(token(5), 1, 0, &v4("192.0.2.1", 0), &v4("203.0.113.1", 80), false),
            Err(Error::Unsupported { .. })
        ));

        let mut pm = ready_pm(Box::new(mptcp_org::MptcpOrgDialect));
        assert!(matches!(
            pm.flush_endpoints(),
            Err(Error::Unsupported { .. })
        ));
    }

    #[test]
    fn test_client_command_queued() {
        let mut pm = ready_pm(Box::new(mptcp_org::MptcpOrgDialect));
        pm.add_subflow(token(0x42), 1, 0, &v4("192.0.2.1", 0), &v4("203.0.113.1", 80), false)
            .unwrap();

        let pending = pm.take_pending().unwrap();
        assert_eq!(pending.command, "add_subflow");
        assert_eq!(pending.request.cmd, mptcp_org_cmd::SUB_CREATE);

        let tok = Attrs::new(&pending.request.attrs)
            .find(|(t, _)| *t == mptcp_attr::TOKEN)
            .map(|(_, p)| take::u32_ne(p).unwrap());
        assert_eq!(tok, Some(0x42));
    }

    #[test]
    fn test_add_endpoint_merges_configured_flags() {
        let mut pm = PathManager::with_dialect(
            Box::new(upstream::UpstreamDialect),
            AddrFlags::parse_list("subflow").unwrap(),
            NotifyFlags::default(),
        );
        pm.attach(FamilyHandle {
            id: 0x18,
            event_group: 7,
        });
        // Drain the reconciliation dump queued by attach().
        while pm.take_pending().is_some() {}

        pm.add_endpoint(&v4("192.0.2.2", 0), id(2), AddrFlags::default(), None)
            .unwrap();
        let pending = pm.take_pending().unwrap();
        assert_eq!(pending.request.cmd, mptcp_pm_cmd::ADD_ADDR);
        // The nested ADDR attribute carries the merged subflow flag.
        let nested: Vec<_> = Attrs::new(&pending.request.attrs).collect();
        let inner: Vec<_> = Attrs::new(nested[0].1).collect();
        let flags = inner
            .iter()
            .find(|(t, _)| *t == crate::pm::wire::mptcp_pm_addr_attr::FLAGS)
            .map(|(_, p)| take::u32_ne(p).unwrap())
            .unwrap();
        assert_eq!(flags, crate::pm::wire::mptcp_pm_flags::SUBFLOW);
    }

    #[test]
    fn test_signal_fullmesh_rejected() {
        let mut pm = ready_pm(Box::new(upstream::UpstreamDialect));
        while pm.take_pending().is_some() {}

        let flags = AddrFlags {
            signal: true,
            fullmesh: true,
            ..Default::default()
        };
        assert!(matches!(
            pm.add_endpoint(&v4("192.0.2.2", 0), id(2), flags, None),
            Err(Error::InvalidArgument(_))
        ));
        assert!(!pm.has_pending());
    }

    #[test]
    fn test_attach_queues_reconciliation_for_upstream() {
        let mut pm = ready_pm(Box::new(upstream::UpstreamDialect));
        let pending = pm.take_pending().unwrap();
        assert_eq!(pending.command, "dump_endpoints");
        assert!(pending.request.dump);
        assert!(matches!(pending.reply, ReplyHandler::Endpoints { .. }));
    }

    #[test]
    fn test_attach_skips_reconciliation_for_legacy() {
        let pm = ready_pm(Box::new(mptcp_org::MptcpOrgDialect));
        assert!(!pm.has_pending());
    }
}

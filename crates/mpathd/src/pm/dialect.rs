//! Path management command dialects.
//!
//! The two kernel MPTCP lineages expose overlapping but distinct
//! command sets over generic netlink. A dialect is a capability set of
//! optional operations: each encoder defaults to
//! [`Error::Unsupported`], and a concrete dialect overrides exactly the
//! operations its kernel implements. The path manager surfaces the
//! union and reports `Unsupported` for the rest, so policies can probe
//! capabilities simply by issuing commands.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::addr::{AddrId, Endpoint, Token};
use crate::error::{Error, Result};
use crate::pm::types::{AddrFlags, AddressInfo, Limit};

/// An encoded generic netlink request, minus the family id and netlink
/// header bookkeeping the transport adds at send time.
#[derive(Debug, Clone)]
pub struct GenlRequest {
    /// Family command id.
    pub cmd: u8,
    /// Family version.
    pub version: u8,
    /// Request expects a multi-record dump reply.
    pub dump: bool,
    /// Encoded attribute buffer.
    pub attrs: Vec<u8>,
}

/// Which kernel lineage the active dialect speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialectKind {
    /// Upstream kernel: in-kernel path manager management surface.
    Upstream,
    /// multipath-tcp.org kernel: client-initiated path management.
    MptcpOrg,
}

/// A kernel path management command dialect.
///
/// Every operation encoder has a default body returning
/// [`Error::Unsupported`]; concrete dialects override what their kernel
/// offers. This keeps the two command sets asymmetric without any
/// inheritance relationship between them.
pub trait Dialect: Send {
    /// Which lineage this dialect speaks.
    fn kind(&self) -> DialectKind;

    /// Generic netlink family name to resolve and watch.
    fn family_name(&self) -> &'static str;

    /// Multicast group carrying MPTCP events.
    fn event_group(&self) -> &'static str;

    // --- client-oriented operations ---

    /// Advertise `addr` with `id` on the connection named by `token`.
    fn add_addr(&self, _addr: &Endpoint, _id: AddrId, _token: Token) -> Result<GenlRequest> {
        Err(Error::Unsupported { command: "add_addr" })
    }

    /// Withdraw the advertisement for `id` on `token`.
    fn remove_addr(&self, _id: AddrId, _token: Token) -> Result<GenlRequest> {
        Err(Error::Unsupported {
            command: "remove_addr",
        })
    }

    /// Create a subflow on `token` between `local` and `remote`.
    fn add_subflow(
        &self,
        _token: Token,
        _local_id: u8,
        _remote_id: u8,
        _local: &Endpoint,
        _remote: &Endpoint,
        _backup: bool,
    ) -> Result<GenlRequest> {
        Err(Error::Unsupported {
            command: "add_subflow",
        })
    }

    /// Destroy the subflow on `token` between `local` and `remote`.
    fn remove_subflow(
        &self,
        _token: Token,
        _local: &Endpoint,
        _remote: &Endpoint,
    ) -> Result<GenlRequest> {
        Err(Error::Unsupported {
            command: "remove_subflow",
        })
    }

    /// Change the backup priority of an established subflow.
    fn set_backup(
        &self,
        _token: Token,
        _local: &Endpoint,
        _remote: &Endpoint,
        _backup: bool,
    ) -> Result<GenlRequest> {
        Err(Error::Unsupported {
            command: "set_backup",
        })
    }

    // --- kernel-oriented operations ---

    /// Register an endpoint with the in-kernel path manager.
    fn add_endpoint(
        &self,
        _addr: &Endpoint,
        _id: AddrId,
        _flags: AddrFlags,
        _if_index: Option<i32>,
    ) -> Result<GenlRequest> {
        Err(Error::Unsupported {
            command: "add_endpoint",
        })
    }

    /// Remove the endpoint registered under `id`.
    fn remove_endpoint(&self, _id: AddrId) -> Result<GenlRequest> {
        Err(Error::Unsupported {
            command: "remove_endpoint",
        })
    }

    /// Fetch the endpoint registered under `id`.
    fn get_endpoint(&self, _id: AddrId) -> Result<GenlRequest> {
        Err(Error::Unsupported {
            command: "get_endpoint",
        })
    }

    /// Dump every registered endpoint.
    fn dump_endpoints(&self) -> Result<GenlRequest> {
        Err(Error::Unsupported {
            command: "dump_endpoints",
        })
    }

    /// Drop every registered endpoint.
    fn flush_endpoints(&self) -> Result<GenlRequest> {
        Err(Error::Unsupported {
            command: "flush_endpoints",
        })
    }

    /// Set per-connection resource limits.
    fn set_limits(&self, _limits: &[Limit]) -> Result<GenlRequest> {
        Err(Error::Unsupported {
            command: "set_limits",
        })
    }

    /// Fetch the per-connection resource limits.
    fn get_limits(&self) -> Result<GenlRequest> {
        Err(Error::Unsupported {
            command: "get_limits",
        })
    }

    /// Change the flags of a registered endpoint.
    fn set_endpoint_flags(&self, _addr: &Endpoint, _flags: AddrFlags) -> Result<GenlRequest> {
        Err(Error::Unsupported {
            command: "set_endpoint_flags",
        })
    }

    // --- reply decoding ---

    /// Decode one endpoint record from a get/dump reply payload.
    fn parse_endpoint(&self, _payload: &[u8]) -> Result<Option<AddressInfo>> {
        Err(Error::Unsupported {
            command: "parse_endpoint",
        })
    }

    /// Decode a limits reply payload.
    fn parse_limits(&self, _payload: &[u8]) -> Result<Vec<Limit>> {
        Err(Error::Unsupported {
            command: "parse_limits",
        })
    }
}

/// Upstream kernel enable sysctl, relative to the proc sysctl root.
const UPSTREAM_SYSCTL: &str = "net/mptcp/enabled";
/// multipath-tcp.org enable sysctl, relative to the proc sysctl root.
const MPTCP_ORG_SYSCTL: &str = "net/mptcp/mptcp_enabled";

/// Probe which MPTCP variant the running kernel provides.
///
/// Checks the upstream sysctl first; the multipath-tcp.org sysctl is
/// only consulted if the upstream one is absent. Returns
/// [`Error::NoMptcpSupport`] when neither variant is present and
/// enabled.
pub fn probe(sysctl_root: &Path) -> Result<Box<dyn Dialect>> {
    match read_sysctl(sysctl_root, UPSTREAM_SYSCTL) {
        Some(value) if value != 0 => {
            debug!("upstream kernel MPTCP detected");
            return Ok(Box::new(super::upstream::UpstreamDialect));
        }
        Some(_) => debug!("upstream kernel MPTCP present but disabled"),
        None => {}
    }

    match read_sysctl(sysctl_root, MPTCP_ORG_SYSCTL) {
        Some(value) if value == 1 || value == 2 => {
            debug!("multipath-tcp.org kernel MPTCP detected");
            return Ok(Box::new(super::mptcp_org::MptcpOrgDialect));
        }
        Some(_) => debug!("multipath-tcp.org kernel MPTCP present but disabled"),
        None => {}
    }

    Err(Error::NoMptcpSupport)
}

/// Probe against the live `/proc/sys` tree.
pub fn probe_system() -> Result<Box<dyn Dialect>> {
    probe(Path::new("/proc/sys"))
}

fn read_sysctl(root: &Path, name: &str) -> Option<i64> {
    let raw = fs::read_to_string(root.join(name)).ok()?;
    raw.trim().parse().ok()
}

//! multipath-tcp.org kernel dialect: client-initiated path management
//! over the legacy `mptcp` family.
//!
//! The legacy kernel leaves path decisions to user space: a policy
//! advertises addresses and creates or destroys subflows itself,
//! addressing a live connection by its token. Attributes are flat and
//! shared with the event catalogue.

use std::net::IpAddr;

use crate::addr::{AddrId, Endpoint, Token};
use crate::error::{Error, Result};
use crate::netlink::AttrWriter;
use crate::pm::dialect::{Dialect, DialectKind, GenlRequest};
use crate::pm::wire::{
    mptcp_attr, mptcp_org_cmd, MPTCP_ORG_EVENTS, MPTCP_ORG_NAME, MPTCP_ORG_VERSION,
};

/// The multipath-tcp.org (`mptcp`) command dialect.
#[derive(Debug, Clone, Copy)]
pub struct MptcpOrgDialect;

impl MptcpOrgDialect {
    fn request(cmd: u8, attrs: AttrWriter) -> GenlRequest {
        GenlRequest {
            cmd,
            version: MPTCP_ORG_VERSION,
            dump: false,
            attrs: attrs.finish(),
        }
    }
}

impl Dialect for MptcpOrgDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::MptcpOrg
    }

    fn family_name(&self) -> &'static str {
        MPTCP_ORG_NAME
    }

    fn event_group(&self) -> &'static str {
        MPTCP_ORG_EVENTS
    }

    fn add_addr(&self, addr: &Endpoint, id: AddrId, token: Token) -> Result<GenlRequest> {
        let mut w = AttrWriter::new();
        w.put_u32(mptcp_attr::TOKEN, token.get());
        w.put_u8(mptcp_attr::FAMILY, addr.family());
        w.put_u8(mptcp_attr::LOC_ID, id.get());
        append_local(&mut w, addr);
        Ok(Self::request(mptcp_org_cmd::ANNOUNCE, w))
    }

    fn remove_addr(&self, id: AddrId, token: Token) -> Result<GenlRequest> {
        let mut w = AttrWriter::new();
        w.put_u32(mptcp_attr::TOKEN, token.get());
        w.put_u8(mptcp_attr::LOC_ID, id.get());
        Ok(Self::request(mptcp_org_cmd::REMOVE, w))
    }

    fn add_subflow(
        &self,
        token: Token,
        local_id: u8,
        remote_id: u8,
        local: &Endpoint,
        remote: &Endpoint,
        backup: bool,
    ) -> Result<GenlRequest> {
        let mut w = AttrWriter::new();
        w.put_u32(mptcp_attr::TOKEN, token.get());
        append_pair(&mut w, local, remote)?;
        w.put_u8(mptcp_attr::LOC_ID, local_id);
        w.put_u8(mptcp_attr::REM_ID, remote_id);
        w.put_u8(mptcp_attr::BACKUP, backup as u8);
        Ok(Self::request(mptcp_org_cmd::SUB_CREATE, w))
    }

    fn remove_subflow(
        &self,
        token: Token,
        local: &Endpoint,
        remote: &Endpoint,
    ) -> Result<GenlRequest> {
        let mut w = AttrWriter::new();
        w.put_u32(mptcp_attr::TOKEN, token.get());
        append_pair(&mut w, local, remote)?;
        Ok(Self::request(mptcp_org_cmd::SUB_DESTROY, w))
    }

    fn set_backup(
        &self,
        token: Token,
        local: &Endpoint,
        remote: &Endpoint,
        backup: bool,
    ) -> Result<GenlRequest> {
        let mut w = AttrWriter::new();
        w.put_u32(mptcp_attr::TOKEN, token.get());
        append_pair(&mut w, local, remote)?;
        w.put_u8(mptcp_attr::BACKUP, backup as u8);
        Ok(Self::request(mptcp_org_cmd::SUB_PRIORITY, w))
    }
}

/// Append the local address and port attributes.
fn append_local(w: &mut AttrWriter, local: &Endpoint) {
    match local.addr() {
        IpAddr::V4(v4) => w.put(mptcp_attr::SADDR4, &v4.octets()),
        IpAddr::V6(v6) => w.put(mptcp_attr::SADDR6, &v6.octets()),
    }
    if local.port() != 0 {
        w.put_u16_be(mptcp_attr::SPORT, local.port());
    }
}

/// Append a subflow's local/remote pair. Both ends must share a family.
fn append_pair(w: &mut AttrWriter, local: &Endpoint, remote: &Endpoint) -> Result<()> {
    if local.family() != remote.family() {
        return Err(Error::InvalidArgument(
            "subflow endpoints must share an address family",
        ));
    }

    w.put_u8(mptcp_attr::FAMILY, local.family());
    append_local(w, local);
    match remote.addr() {
        IpAddr::V4(v4) => w.put(mptcp_attr::DADDR4, &v4.octets()),
        IpAddr::V6(v6) => w.put(mptcp_attr::DADDR6, &v6.octets()),
    }
    w.put_u16_be(mptcp_attr::DPORT, remote.port());
    Ok(())
}

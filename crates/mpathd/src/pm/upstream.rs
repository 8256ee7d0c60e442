//! Upstream kernel dialect: the `mptcp_pm` in-kernel path manager
//! management surface.
//!
//! Endpoints are registered with the kernel, which then decides when to
//! announce them and create subflows. Address parameters travel inside
//! a nested `MPTCP_PM_ATTR_ADDR` attribute.

use std::net::IpAddr;

use crate::addr::{AddrId, Endpoint};
use crate::error::{Error, Result};
use crate::netlink::codec::{take, Attrs};
use crate::netlink::genl::split_genl;
use crate::netlink::AttrWriter;
use crate::pm::dialect::{Dialect, DialectKind, GenlRequest};
use crate::pm::types::{AddrFlags, AddressInfo, Limit, LimitKind};
use crate::pm::wire::{
    mptcp_pm_addr_attr, mptcp_pm_attr, mptcp_pm_cmd, MPTCP_PM_EVENTS, MPTCP_PM_NAME,
    MPTCP_PM_VERSION,
};

/// The upstream (`mptcp_pm`) command dialect.
#[derive(Debug, Clone, Copy)]
pub struct UpstreamDialect;

impl UpstreamDialect {
    fn request(cmd: u8, dump: bool, attrs: AttrWriter) -> GenlRequest {
        GenlRequest {
            cmd,
            version: MPTCP_PM_VERSION,
            dump,
            attrs: attrs.finish(),
        }
    }
}

impl Dialect for UpstreamDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Upstream
    }

    fn family_name(&self) -> &'static str {
        MPTCP_PM_NAME
    }

    fn event_group(&self) -> &'static str {
        MPTCP_PM_EVENTS
    }

    fn add_endpoint(
        &self,
        addr: &Endpoint,
        id: AddrId,
        flags: AddrFlags,
        if_index: Option<i32>,
    ) -> Result<GenlRequest> {
        let mut w = AttrWriter::new();
        let nest = w.nest_start(mptcp_pm_attr::ADDR);
        put_addr(&mut w, addr);
        w.put_u8(mptcp_pm_addr_attr::ID, id.get());
        if addr.port() != 0 {
            w.put_u16_be(mptcp_pm_addr_attr::PORT, addr.port());
        }
        if !flags.is_empty() {
            w.put_u32(mptcp_pm_addr_attr::FLAGS, flags.to_raw());
        }
        if let Some(ifindex) = if_index {
            w.put_i32(mptcp_pm_addr_attr::IF_IDX, ifindex);
        }
        w.nest_end(nest);
        Ok(Self::request(mptcp_pm_cmd::ADD_ADDR, false, w))
    }

    fn remove_endpoint(&self, id: AddrId) -> Result<GenlRequest> {
        let mut w = AttrWriter::new();
        let nest = w.nest_start(mptcp_pm_attr::ADDR);
        w.put_u8(mptcp_pm_addr_attr::ID, id.get());
        w.nest_end(nest);
        Ok(Self::request(mptcp_pm_cmd::DEL_ADDR, false, w))
    }

    fn get_endpoint(&self, id: AddrId) -> Result<GenlRequest> {
        let mut w = AttrWriter::new();
        let nest = w.nest_start(mptcp_pm_attr::ADDR);
        w.put_u8(mptcp_pm_addr_attr::ID, id.get());
        w.nest_end(nest);
        Ok(Self::request(mptcp_pm_cmd::GET_ADDR, false, w))
    }

    fn dump_endpoints(&self) -> Result<GenlRequest> {
        Ok(Self::request(
            mptcp_pm_cmd::GET_ADDR,
            true,
            AttrWriter::new(),
        ))
    }

    fn flush_endpoints(&self) -> Result<GenlRequest> {
        Ok(Self::request(
            mptcp_pm_cmd::FLUSH_ADDRS,
            false,
            AttrWriter::new(),
        ))
    }

    fn set_limits(&self, limits: &[Limit]) -> Result<GenlRequest> {
        let mut w = AttrWriter::new();
        for limit in limits {
            let attr = match limit.kind {
                LimitKind::RcvAddAddrs => mptcp_pm_attr::RCV_ADD_ADDRS,
                LimitKind::Subflows => mptcp_pm_attr::SUBFLOWS,
            };
            w.put_u32(attr, limit.value);
        }
        Ok(Self::request(mptcp_pm_cmd::SET_LIMITS, false, w))
    }

    fn get_limits(&self) -> Result<GenlRequest> {
        Ok(Self::request(
            mptcp_pm_cmd::GET_LIMITS,
            true,
            AttrWriter::new(),
        ))
    }

    fn set_endpoint_flags(&self, addr: &Endpoint, flags: AddrFlags) -> Result<GenlRequest> {
        let mut w = AttrWriter::new();
        let nest = w.nest_start(mptcp_pm_attr::ADDR);
        put_addr(&mut w, addr);
        w.put_u32(mptcp_pm_addr_attr::FLAGS, flags.to_raw());
        w.nest_end(nest);
        Ok(Self::request(mptcp_pm_cmd::SET_FLAGS, false, w))
    }

    fn parse_endpoint(&self, payload: &[u8]) -> Result<Option<AddressInfo>> {
        let Some((_, attr_bytes)) = split_genl(payload) else {
            return Ok(None);
        };

        for (ty, body) in Attrs::new(attr_bytes) {
            if ty == mptcp_pm_attr::ADDR {
                return read_endpoint(body).map(Some);
            }
        }

        Ok(None)
    }

    fn parse_limits(&self, payload: &[u8]) -> Result<Vec<Limit>> {
        let Some((_, attr_bytes)) = split_genl(payload) else {
            return Ok(Vec::new());
        };

        let mut limits = Vec::new();
        for (ty, body) in Attrs::new(attr_bytes) {
            match ty {
                mptcp_pm_attr::RCV_ADD_ADDRS => {
                    limits.push(Limit::rcv_add_addrs(take::u32_ne(body)?));
                }
                mptcp_pm_attr::SUBFLOWS => {
                    limits.push(Limit::subflows(take::u32_ne(body)?));
                }
                _ => {}
            }
        }
        Ok(limits)
    }
}

/// Append family and address bytes for an endpoint.
fn put_addr(w: &mut AttrWriter, addr: &Endpoint) {
    match addr.addr() {
        IpAddr::V4(v4) => {
            w.put_u16(mptcp_pm_addr_attr::FAMILY, libc::AF_INET as u16);
            w.put(mptcp_pm_addr_attr::ADDR4, &v4.octets());
        }
        IpAddr::V6(v6) => {
            w.put_u16(mptcp_pm_addr_attr::FAMILY, libc::AF_INET6 as u16);
            w.put(mptcp_pm_addr_attr::ADDR6, &v6.octets());
        }
    }
}

/// Decode the nested ADDR payload of a get/dump record.
fn read_endpoint(data: &[u8]) -> Result<AddressInfo> {
    let mut addr: Option<IpAddr> = None;
    let mut port: u16 = 0;
    let mut id: u8 = 0;
    let mut flags = AddrFlags::default();
    let mut if_index: Option<i32> = None;

    for (ty, body) in Attrs::new(data) {
        match ty {
            mptcp_pm_addr_attr::ID => id = take::u8(body)?,
            mptcp_pm_addr_attr::ADDR4 => addr = Some(IpAddr::from(take::array::<4>(body)?)),
            mptcp_pm_addr_attr::ADDR6 => addr = Some(IpAddr::from(take::array::<16>(body)?)),
            mptcp_pm_addr_attr::PORT => port = take::u16_be(body)?,
            mptcp_pm_addr_attr::FLAGS => flags = AddrFlags::from_raw(take::u32_ne(body)?),
            mptcp_pm_addr_attr::IF_IDX => {
                let raw = take::i32_ne(body)?;
                if raw != 0 {
                    if_index = Some(raw);
                }
            }
            _ => {}
        }
    }

    let addr =
        addr.ok_or_else(|| Error::InvalidAttribute("endpoint record without an address".into()))?;

    Ok(AddressInfo {
        addr: Endpoint::new(addr, port),
        id,
        flags,
        if_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Token;
    use crate::netlink::genl::genl_payload;
    use crate::pm::wire::mptcp_pm_flags;

    fn v4(s: &str, port: u16) -> Endpoint {
        Endpoint::new(s.parse::<std::net::Ipv4Addr>().unwrap().into(), port)
    }

    fn nested_addr_attrs(req: &GenlRequest) -> Vec<(u16, Vec<u8>)> {
        let attrs: Vec<_> = Attrs::new(&req.attrs).collect();
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].0, mptcp_pm_attr::ADDR);
        Attrs::new(attrs[0].1)
            .map(|(t, p)| (t, p.to_vec()))
            .collect()
    }

    fn find<'a>(attrs: &'a [(u16, Vec<u8>)], t: u16) -> Option<&'a [u8]> {
        attrs.iter().find(|(ty, _)| *ty == t).map(|(_, p)| &p[..])
    }

    #[test]
    fn test_add_endpoint_encoding() {
        let d = UpstreamDialect;
        let req = d
            .add_endpoint(
                &v4("192.0.2.1", 4500),
                AddrId::new(3).unwrap(),
                AddrFlags::from_raw(mptcp_pm_flags::SIGNAL | mptcp_pm_flags::SUBFLOW),
                Some(2),
            )
            .unwrap();

        assert_eq!(req.cmd, mptcp_pm_cmd::ADD_ADDR);
        assert!(!req.dump);

        let attrs = nested_addr_attrs(&req);
        assert_eq!(
            take::u16_ne(find(&attrs, mptcp_pm_addr_attr::FAMILY).unwrap()).unwrap(),
            libc::AF_INET as u16
        );
        assert_eq!(
            find(&attrs, mptcp_pm_addr_attr::ADDR4).unwrap(),
            &[192, 0, 2, 1]
        );
        assert_eq!(
            take::u8(find(&attrs, mptcp_pm_addr_attr::ID).unwrap()).unwrap(),
            3
        );
        assert_eq!(
            take::u16_be(find(&attrs, mptcp_pm_addr_attr::PORT).unwrap()).unwrap(),
            4500
        );
        assert_eq!(
            take::u32_ne(find(&attrs, mptcp_pm_addr_attr::FLAGS).unwrap()).unwrap(),
            mptcp_pm_flags::SIGNAL | mptcp_pm_flags::SUBFLOW
        );
        assert_eq!(
            take::i32_ne(find(&attrs, mptcp_pm_addr_attr::IF_IDX).unwrap()).unwrap(),
            2
        );
    }

    #[test]
    fn test_add_endpoint_omits_unset_fields() {
        let d = UpstreamDialect;
        let req = d
            .add_endpoint(
                &v4("10.0.0.1", 0),
                AddrId::new(1).unwrap(),
                AddrFlags::default(),
                None,
            )
            .unwrap();

        let attrs = nested_addr_attrs(&req);
        assert!(find(&attrs, mptcp_pm_addr_attr::PORT).is_none());
        assert!(find(&attrs, mptcp_pm_addr_attr::FLAGS).is_none());
        assert!(find(&attrs, mptcp_pm_addr_attr::IF_IDX).is_none());
    }

    #[test]
    fn test_dump_and_flush() {
        let d = UpstreamDialect;
        let dump = d.dump_endpoints().unwrap();
        assert_eq!(dump.cmd, mptcp_pm_cmd::GET_ADDR);
        assert!(dump.dump);
        assert!(dump.attrs.is_empty());

        let flush = d.flush_endpoints().unwrap();
        assert_eq!(flush.cmd, mptcp_pm_cmd::FLUSH_ADDRS);
        assert!(!flush.dump);
    }

    #[test]
    fn test_set_limits_encoding() {
        let d = UpstreamDialect;
        let req = d
            .set_limits(&[Limit::rcv_add_addrs(8), Limit::subflows(4)])
            .unwrap();
        assert_eq!(req.cmd, mptcp_pm_cmd::SET_LIMITS);

        let attrs: Vec<_> = Attrs::new(&req.attrs).collect();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].0, mptcp_pm_attr::RCV_ADD_ADDRS);
        assert_eq!(take::u32_ne(attrs[0].1).unwrap(), 8);
        assert_eq!(attrs[1].0, mptcp_pm_attr::SUBFLOWS);
        assert_eq!(take::u32_ne(attrs[1].1).unwrap(), 4);
    }

    #[test]
    fn test_client_commands_unsupported() {
        let d = UpstreamDialect;
        let token = Token::new(99).unwrap();
        assert!(matches!(
            d.add_addr(&v4("192.0.2.1", 0), AddrId::new(1).unwrap(), token),
            Err(Error::Unsupported { command: "add_addr" })
        ));
        assert!(matches!(
            d.remove_subflow(token, &v4("192.0.2.1", 1), &v4("192.0.2.2", 2)),
            Err(Error::Unsupported { .. })
        ));
    }

    #[test]
    fn test_parse_endpoint_roundtrip() {
        let d = UpstreamDialect;
        let req = d
            .add_endpoint(
                &v4("198.51.100.7", 8080),
                AddrId::new(9).unwrap(),
                AddrFlags::from_raw(mptcp_pm_flags::BACKUP),
                Some(4),
            )
            .unwrap();

        // A reply payload has the same shape the request carries: a
        // generic netlink header and the nested ADDR attribute.
        let payload = genl_payload(mptcp_pm_cmd::GET_ADDR, MPTCP_PM_VERSION, &req.attrs);

        let info = d.parse_endpoint(&payload).unwrap().unwrap();
        assert_eq!(info.addr, v4("198.51.100.7", 8080));
        assert_eq!(info.id, 9);
        assert!(info.flags.backup);
        assert_eq!(info.if_index, Some(4));
    }

    #[test]
    fn test_parse_limits() {
        let d = UpstreamDialect;
        let req = d
            .set_limits(&[Limit::subflows(2), Limit::rcv_add_addrs(3)])
            .unwrap();
        let payload = genl_payload(mptcp_pm_cmd::GET_LIMITS, MPTCP_PM_VERSION, &req.attrs);

        let limits = d.parse_limits(&payload).unwrap();
        assert_eq!(limits.len(), 2);
        assert!(limits.contains(&Limit::subflows(2)));
        assert!(limits.contains(&Limit::rcv_add_addrs(3)));
    }

    #[test]
    fn test_parse_empty_payload() {
        let d = UpstreamDialect;
        assert!(d.parse_endpoint(&[]).unwrap().is_none());
        assert!(d.parse_limits(&[]).unwrap().is_empty());
    }
}

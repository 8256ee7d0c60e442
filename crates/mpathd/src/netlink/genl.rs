//! Generic netlink control plane.
//!
//! The MPTCP path management families are generic netlink families:
//! their numeric ids are assigned at registration time and looked up
//! by name through the fixed `nlctrl` control family, which also
//! multicasts every registration and removal. The daemon uses both
//! paths — one lookup at startup, then notifications to track the
//! family as it comes and goes.

use std::collections::HashMap;

use super::codec::{take, AttrWriter, Attrs, NLM_F_ACK};
use super::socket::NetlinkSocket;
use crate::error::{Error, Result};

/// Byte length of `struct genlmsghdr` (cmd, version, reserved).
pub const GENL_HDR_LEN: usize = 4;

/// Fixed id of the control family.
pub const GENL_ID_CTRL: u16 = 0x10;

/// Control family commands.
pub mod ctrl_cmd {
    pub const NEW_FAMILY: u8 = 1;
    pub const DEL_FAMILY: u8 = 2;
    pub const GET_FAMILY: u8 = 3;
}

/// Control family attributes.
pub mod ctrl_attr {
    pub const FAMILY_ID: u16 = 1;
    pub const FAMILY_NAME: u16 = 2;
    pub const VERSION: u16 = 3;
    pub const MCAST_GROUPS: u16 = 7;
}

/// Nested multicast-group attributes.
pub mod ctrl_attr_mcast_grp {
    pub const NAME: u16 = 1;
    pub const ID: u16 = 2;
}

/// Prefix attribute bytes with a generic netlink header.
pub fn genl_payload(cmd: u8, version: u8, attrs: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(GENL_HDR_LEN + attrs.len());
    payload.extend_from_slice(&[cmd, version, 0, 0]);
    payload.extend_from_slice(attrs);
    payload
}

/// Split a generic netlink payload into its command and attribute
/// bytes. `None` when the payload cannot hold the header.
pub fn split_genl(payload: &[u8]) -> Option<(u8, &[u8])> {
    let attrs = payload.get(GENL_HDR_LEN..)?;
    Some((payload[0], attrs))
}

/// A resolved generic netlink family.
#[derive(Debug, Clone)]
pub struct FamilyInfo {
    /// Dynamically assigned family id (used as the message type).
    pub id: u16,
    /// Family version.
    pub version: u8,
    /// Multicast groups: name to group id.
    pub mcast_groups: HashMap<String, u32>,
}

impl FamilyInfo {
    /// Look up a multicast group id by name.
    pub fn mcast_group(&self, name: &str) -> Option<u32> {
        self.mcast_groups.get(name).copied()
    }
}

/// A family registration change broadcast by the control family.
#[derive(Debug, Clone)]
pub enum FamilyNotification {
    /// A family was registered with the kernel.
    New {
        /// Family name.
        name: String,
        /// Resolved family information.
        info: FamilyInfo,
    },
    /// A family was unregistered.
    Del {
        /// Family name.
        name: String,
    },
}

/// Resolve a generic netlink family by name.
///
/// Returns [`Error::FamilyNotFound`] when the kernel does not know
/// the family.
pub async fn resolve_family(socket: &NetlinkSocket, name: &str) -> Result<FamilyInfo> {
    let mut attrs = AttrWriter::new();
    attrs.put_cstr(ctrl_attr::FAMILY_NAME, name);
    let payload = genl_payload(ctrl_cmd::GET_FAMILY, 1, &attrs.finish());

    let replies = socket
        .request(GENL_ID_CTRL, NLM_F_ACK, &payload)
        .await
        .map_err(|e| {
            // The control family answers ENOENT for names it has
            // never seen.
            if e.errno() == Some(libc::ENOENT) {
                Error::FamilyNotFound {
                    name: name.to_string(),
                }
            } else {
                e
            }
        })?;

    for (_, reply) in &replies {
        if let Some((_, attr_bytes)) = split_genl(reply) {
            let (_, info) = read_family(attr_bytes)?;
            if info.id != 0 {
                return Ok(info);
            }
        }
    }

    Err(Error::FamilyNotFound {
        name: name.to_string(),
    })
}

/// Decode a control-family frame payload into a notification.
///
/// Returns `None` for control commands the daemon does not track.
pub fn parse_notification(payload: &[u8]) -> Result<Option<FamilyNotification>> {
    let Some((cmd, attr_bytes)) = split_genl(payload) else {
        return Err(Error::InvalidMessage(
            "control frame shorter than its header".into(),
        ));
    };

    match cmd {
        ctrl_cmd::NEW_FAMILY => {
            let (name, info) = read_family(attr_bytes)?;
            if info.id == 0 {
                return Err(Error::InvalidMessage(
                    "family registration without an id".into(),
                ));
            }
            Ok(Some(FamilyNotification::New { name, info }))
        }
        ctrl_cmd::DEL_FAMILY => {
            // Removal notifications may carry nothing but the name.
            let (name, _) = read_family(attr_bytes)?;
            Ok(Some(FamilyNotification::Del { name }))
        }
        _ => Ok(None),
    }
}

/// Pull the name, id, version and multicast groups out of a
/// control-family attribute run. Only the name is mandatory.
fn read_family(data: &[u8]) -> Result<(String, FamilyInfo)> {
    let mut name = None;
    let mut info = FamilyInfo {
        id: 0,
        version: 0,
        mcast_groups: HashMap::new(),
    };

    for (ty, body) in Attrs::new(data) {
        match ty {
            ctrl_attr::FAMILY_NAME => name = Some(take::cstr(body)?.to_string()),
            ctrl_attr::FAMILY_ID => info.id = take::u16_ne(body)?,
            ctrl_attr::VERSION => info.version = take::u32_ne(body)? as u8,
            ctrl_attr::MCAST_GROUPS => {
                // One nested entry per group, each holding its own
                // name/id pair.
                for (_, entry) in Attrs::new(body) {
                    if let Some((group, id)) = read_mcast_group(entry) {
                        info.mcast_groups.insert(group, id);
                    }
                }
            }
            _ => {}
        }
    }

    match name {
        Some(name) => Ok((name, info)),
        None => Err(Error::InvalidMessage(
            "family attributes carry no name".into(),
        )),
    }
}

fn read_mcast_group(entry: &[u8]) -> Option<(String, u32)> {
    let mut name = None;
    let mut id = None;
    for (ty, body) in Attrs::new(entry) {
        match ty {
            ctrl_attr_mcast_grp::NAME => name = Some(take::cstr(body).ok()?.to_string()),
            ctrl_attr_mcast_grp::ID => id = take::u32_ne(body).ok(),
            _ => {}
        }
    }
    Some((name?, id?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family_payload(cmd: u8, name: &str, id: u16, group: Option<(&str, u32)>) -> Vec<u8> {
        let mut w = AttrWriter::new();
        w.put_cstr(ctrl_attr::FAMILY_NAME, name);
        if id != 0 {
            w.put_u16(ctrl_attr::FAMILY_ID, id);
        }
        if let Some((gname, gid)) = group {
            let groups = w.nest_start(ctrl_attr::MCAST_GROUPS);
            let entry = w.nest_start(1);
            w.put_cstr(ctrl_attr_mcast_grp::NAME, gname);
            w.put_u32(ctrl_attr_mcast_grp::ID, gid);
            w.nest_end(entry);
            w.nest_end(groups);
        }
        genl_payload(cmd, 2, &w.finish())
    }

    #[test]
    fn test_split_genl() {
        let payload = genl_payload(3, 1, &[]);
        let (cmd, attrs) = split_genl(&payload).unwrap();
        assert_eq!(cmd, 3);
        assert!(attrs.is_empty());

        assert!(split_genl(&[1, 2, 3]).is_none());
    }

    #[test]
    fn test_new_family_notification() {
        let payload = family_payload(
            ctrl_cmd::NEW_FAMILY,
            "mptcp_pm",
            0x1c,
            Some(("mptcp_pm_events", 5)),
        );
        let notif = parse_notification(&payload).unwrap().unwrap();
        match notif {
            FamilyNotification::New { name, info } => {
                assert_eq!(name, "mptcp_pm");
                assert_eq!(info.id, 0x1c);
                assert_eq!(info.mcast_group("mptcp_pm_events"), Some(5));
            }
            other => panic!("unexpected notification: {:?}", other),
        }
    }

    #[test]
    fn test_del_family_notification() {
        let payload = family_payload(ctrl_cmd::DEL_FAMILY, "mptcp_pm", 0, None);
        let notif = parse_notification(&payload).unwrap().unwrap();
        match notif {
            FamilyNotification::Del { name } => assert_eq!(name, "mptcp_pm"),
            other => panic!("unexpected notification: {:?}", other),
        }
    }

    #[test]
    fn test_registration_without_id_rejected() {
        let payload = family_payload(ctrl_cmd::NEW_FAMILY, "mptcp_pm", 0, None);
        assert!(parse_notification(&payload).is_err());
    }

    #[test]
    fn test_irrelevant_ctrl_command_ignored() {
        let payload = family_payload(ctrl_cmd::GET_FAMILY, "nlctrl", 0x10, None);
        assert!(parse_notification(&payload).unwrap().is_none());
    }

    #[test]
    fn test_nameless_family_rejected() {
        let mut w = AttrWriter::new();
        w.put_u16(ctrl_attr::FAMILY_ID, 9);
        let payload = genl_payload(ctrl_cmd::NEW_FAMILY, 2, &w.finish());
        assert!(parse_notification(&payload).is_err());
    }
}

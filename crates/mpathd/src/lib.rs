//! User-space MPTCP path management.
//!
//! The kernel owns the MPTCP protocol engine; this library provides the
//! user-space side of path management. It watches the kernel's MPTCP
//! generic netlink family, decodes connection lifecycle events, and
//! lets pluggable policies drive which subflows to establish, tear
//! down, prioritise, and which local addresses to advertise.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Daemon (event loop, transport sockets)       │
//! ├──────────────┬───────────────────────────────┤
//! │ Registry     │ PathManager                   │
//! │ (plugins,    │ (IdManager, ListenerManager,  │
//! │  bindings)   │  InterfaceTable, Dialect)     │
//! ├──────────────┴───────────────────────────────┤
//! │ netlink (sockets, framing, generic netlink)  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Kernel events flow in over the family's multicast group, are
//! decoded into typed [`pm::event::Event`] values, and are dispatched
//! to the policy bound to the connection's token. Policies call back
//! into the [`pm::PathManager`] command surface, which encodes requests
//! through the active kernel dialect (upstream `mptcp_pm` or the
//! multipath-tcp.org `mptcp` family) and emits them asynchronously.
//!
//! Everything runs on one thread: plugin callbacks must not block.
//!
//! # Example
//!
//! ```ignore
//! use mpathd::{Config, Daemon};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> mpathd::Result<()> {
//!     let config = Config::default();
//!     let mut daemon = Daemon::new(config).await?;
//!     daemon.run().await
//! }
//! ```

pub mod addr;
pub mod config;
pub mod daemon;
mod error;
pub mod idm;
pub mod listener;
pub mod monitor;
pub mod netlink;
pub mod plugin;
pub mod pm;
pub mod policy;

pub use addr::{AddrId, Endpoint, Token};
pub use config::{Config, LogTarget};
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use idm::IdManager;
pub use listener::ListenerManager;
pub use monitor::{Interface, InterfaceTable, MonitorEvent, NotifyFlags};
pub use plugin::{Plugin, PluginDescriptor, Registrar, Registry};
pub use pm::types::{AddrFlags, AddressInfo, Limit, LimitKind};
pub use pm::PathManager;

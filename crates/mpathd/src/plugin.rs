//! Policy plugin framework.
//!
//! A plugin bundles a handler set ([`Plugin`]) behind a
//! [`PluginDescriptor`]. Built-in policies compile into the daemon and
//! register through the same descriptor type as external shared
//! objects, which are discovered in the configured plugin directory and
//! resolved through the well-known [`DESCRIPTOR_SYMBOL`]. Descriptors
//! are initialised in priority order (lower value first, ties in load
//! order) and finalised in reverse.
//!
//! The registry also owns the connection bindings: the first `CREATED`
//! event for a token picks a plugin (by requested strategy name, else
//! the default), and every later event for that token is delivered to
//! that plugin alone until `CLOSED` clears the binding.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use libloading::Library;
use tracing::{debug, info, warn};

use crate::addr::{Endpoint, Token};
use crate::error::{Error, Result};
use crate::monitor::{Interface, MonitorEvent};
use crate::pm::event::Event;
use crate::pm::PathManager;

/// Symbol every plugin shared object must export: a
/// `&'static PluginDescriptor`.
pub const DESCRIPTOR_SYMBOL: &[u8] = b"mpathd_plugin\0";

/// Descriptor exported by every policy plugin.
#[derive(Debug, Clone, Copy)]
pub struct PluginDescriptor {
    /// Unique plugin name.
    pub name: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// Initialisation order; lower values initialise first.
    pub priority: i32,
    /// Called once at load time; registers the plugin's handler set.
    pub init: fn(&mut Registrar<'_>) -> Result<()>,
    /// Called once at unload time, in reverse initialisation order.
    pub exit: fn(&mut PathManager),
}

/// Handler set a policy implements.
///
/// Every handler has a no-op default, so a policy implements exactly
/// the events it cares about. Handlers must not block: they run on the
/// daemon's only thread.
#[allow(unused_variables)]
pub trait Plugin {
    /// A new connection was created.
    fn new_connection(
        &mut self,
        pm: &mut PathManager,
        token: Token,
        laddr: &Endpoint,
        raddr: &Endpoint,
        server_side: bool,
    ) {
    }

    /// A connection completed its handshake.
    fn connection_established(
        &mut self,
        pm: &mut PathManager,
        token: Token,
        laddr: &Endpoint,
        raddr: &Endpoint,
        server_side: bool,
    ) {
    }

    /// A connection closed.
    fn connection_closed(&mut self, pm: &mut PathManager, token: Token) {}

    /// The peer advertised an address.
    fn new_address(&mut self, pm: &mut PathManager, token: Token, rem_id: u8, raddr: &Endpoint) {}

    /// The peer withdrew an address.
    fn address_removed(&mut self, pm: &mut PathManager, token: Token, rem_id: u8) {}

    /// A subflow joined the connection.
    fn new_subflow(
        &mut self,
        pm: &mut PathManager,
        token: Token,
        laddr: &Endpoint,
        raddr: &Endpoint,
        backup: bool,
    ) {
    }

    /// A subflow left the connection.
    fn subflow_closed(
        &mut self,
        pm: &mut PathManager,
        token: Token,
        laddr: &Endpoint,
        raddr: &Endpoint,
        backup: bool,
    ) {
    }

    /// A subflow's backup priority changed.
    fn subflow_priority(
        &mut self,
        pm: &mut PathManager,
        token: Token,
        laddr: &Endpoint,
        raddr: &Endpoint,
        backup: bool,
    ) {
    }

    /// A network interface appeared.
    fn new_interface(&mut self, pm: &mut PathManager, iface: &Interface) {}

    /// A network interface changed.
    fn update_interface(&mut self, pm: &mut PathManager, iface: &Interface) {}

    /// A network interface disappeared.
    fn delete_interface(&mut self, pm: &mut PathManager, iface: &Interface) {}

    /// A local address was added to an interface.
    fn new_local_address(
        &mut self,
        pm: &mut PathManager,
        iface: &Interface,
        addr: &std::net::IpAddr,
    ) {
    }

    /// A local address was removed from an interface.
    fn delete_local_address(
        &mut self,
        pm: &mut PathManager,
        iface: &Interface,
        addr: &std::net::IpAddr,
    ) {
    }
}

/// A registered handler set.
struct Registered {
    name: String,
    ops: Box<dyn Plugin>,
}

/// Handle passed to plugin `init` functions for handler registration.
pub struct Registrar<'a> {
    ops: &'a mut Vec<Registered>,
}

impl Registrar<'_> {
    /// Register a handler set under `name`.
    ///
    /// Registering a name twice replaces the earlier handler set; that
    /// is tolerated but reported, since it almost always means two
    /// plugins collide on a name.
    pub fn register_ops(&mut self, name: &str, ops: Box<dyn Plugin>) {
        if let Some(existing) = self.ops.iter_mut().find(|r| r.name == name) {
            warn!(name, "duplicate plugin registration replaces earlier handler set");
            existing.ops = ops;
            return;
        }
        debug!(name, "registered path management strategy");
        self.ops.push(Registered {
            name: name.to_string(),
            ops,
        });
    }
}

/// A plugin whose `init` ran successfully.
struct LoadedPlugin {
    name: String,
    priority: i32,
    exit: fn(&mut PathManager),
}

/// Candidate descriptor gathered before the priority sort.
struct Candidate {
    name: String,
    priority: i32,
    init: fn(&mut Registrar<'_>) -> Result<()>,
    exit: fn(&mut PathManager),
}

/// The plugin registry.
pub struct Registry {
    /// Successfully initialised plugins, in initialisation order.
    loaded: Vec<LoadedPlugin>,
    /// Registered handler sets, in registration order.
    ops: Vec<Registered>,
    /// Index into `ops` of the default strategy.
    default_ops: Option<usize>,
    /// Connection token bindings into `ops`.
    bindings: HashMap<Token, usize>,
    /// Shared object handles, kept alive until unload.
    libraries: Vec<Library>,
}

impl Registry {
    /// Load plugins and initialise them in priority order.
    ///
    /// `builtins` are compiled-in descriptors; `plugin_dir` (when set)
    /// is scanned for shared objects exporting [`DESCRIPTOR_SYMBOL`].
    /// A non-empty `load_filter` restricts loading to the named
    /// plugins. `default_name` selects the default strategy; otherwise
    /// the first registration wins.
    pub fn load(
        builtins: &[&PluginDescriptor],
        plugin_dir: Option<&Path>,
        load_filter: &[String],
        default_name: Option<&str>,
    ) -> Result<Self> {
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut libraries = Vec::new();

        let wanted =
            |name: &str| load_filter.is_empty() || load_filter.iter().any(|f| f.as_str() == name);

        for desc in builtins {
            if desc.name.is_empty() {
                warn!("rejecting builtin plugin without a name");
                continue;
            }
            if !wanted(desc.name) {
                debug!(name = desc.name, "builtin plugin not in load list; skipped");
                continue;
            }
            candidates.push(Candidate {
                name: desc.name.to_string(),
                priority: desc.priority,
                init: desc.init,
                exit: desc.exit,
            });
        }

        if let Some(dir) = plugin_dir {
            scan_plugin_dir(dir, &wanted, &mut candidates, &mut libraries)?;
        }

        // Stable sort: ties keep load order.
        candidates.sort_by_key(|c| c.priority);

        let mut registry = Registry {
            loaded: Vec::new(),
            ops: Vec::new(),
            default_ops: None,
            bindings: HashMap::new(),
            libraries,
        };

        for candidate in candidates {
            let mut registrar = Registrar {
                ops: &mut registry.ops,
            };
            match (candidate.init)(&mut registrar) {
                Ok(()) => {
                    info!(name = %candidate.name, "initialised path management plugin");
                    registry.loaded.push(LoadedPlugin {
                        name: candidate.name,
                        priority: candidate.priority,
                        exit: candidate.exit,
                    });
                }
                Err(e) => {
                    warn!(name = %candidate.name, error = %e, "plugin init failed; skipped");
                }
            }
        }

        registry.default_ops = match default_name {
            Some(name) => {
                let found = registry.ops.iter().position(|r| r.name == name);
                if found.is_none() {
                    warn!(
                        name,
                        "configured default strategy is not registered; using first registration"
                    );
                }
                found.or(if registry.ops.is_empty() { None } else { Some(0) })
            }
            None => {
                if registry.ops.is_empty() {
                    None
                } else {
                    Some(0)
                }
            }
        };

        if let Some(idx) = registry.default_ops {
            info!(name = %registry.ops[idx].name, "default path management strategy");
        } else {
            warn!("no path management strategy registered");
        }

        Ok(registry)
    }

    /// Names of successfully loaded plugins, in initialisation order.
    pub fn loaded_names(&self) -> Vec<&str> {
        self.loaded.iter().map(|p| p.name.as_str()).collect()
    }

    /// Number of registered handler sets.
    pub fn registered(&self) -> usize {
        self.ops.len()
    }

    /// Name of the default strategy, if any is registered.
    pub fn default_name(&self) -> Option<&str> {
        self.default_ops.map(|idx| self.ops[idx].name.as_str())
    }

    /// Dispatch a decoded MPTCP event to the plugin bound to its token.
    ///
    /// `CREATED` establishes the binding (strategy name if registered,
    /// else the default) before invoking the handler; `CLOSED` clears
    /// it afterwards. Events for unbound tokens are dropped: the kernel
    /// may emit them faster than bindings form, and there is no retry.
    pub fn dispatch(&mut self, pm: &mut PathManager, event: &Event) {
        match event {
            Event::Created {
                token,
                laddr,
                raddr,
                server_side,
                path_manager,
            } => {
                let idx = match path_manager
                    .as_deref()
                    .and_then(|name| self.ops.iter().position(|r| r.name == name))
                {
                    Some(idx) => Some(idx),
                    None => {
                        if let Some(name) = path_manager.as_deref() {
                            debug!(
                                strategy = name,
                                "requested strategy not registered; falling back to default"
                            );
                        }
                        self.default_ops
                    }
                };

                let Some(idx) = idx else {
                    warn!(%token, "no path management strategy for new connection");
                    return;
                };

                // Bind before the handler runs, so commands the handler
                // issues observe a bound connection.
                self.bindings.insert(*token, idx);
                self.ops[idx]
                    .ops
                    .new_connection(pm, *token, laddr, raddr, *server_side);
            }
            Event::Closed { token } => {
                let Some(idx) = self.bindings.get(token).copied() else {
                    warn!(%token, "Unable to match token to plugin");
                    return;
                };
                self.ops[idx].ops.connection_closed(pm, *token);
                self.bindings.remove(token);
            }
            _ => {
                let token = event.token();
                let Some(idx) = self.bindings.get(&token).copied() else {
                    warn!(%token, "Unable to match token to plugin");
                    return;
                };
                let ops = &mut self.ops[idx].ops;
                match event {
                    Event::Established {
                        token,
                        laddr,
                        raddr,
                        server_side,
                    } => ops.connection_established(pm, *token, laddr, raddr, *server_side),
                    Event::Announced {
                        token,
                        rem_id,
                        raddr,
                    } => ops.new_address(pm, *token, *rem_id, raddr),
                    Event::Removed { token, rem_id } => ops.address_removed(pm, *token, *rem_id),
                    Event::SubflowEstablished {
                        token,
                        laddr,
                        raddr,
                        backup,
                    } => ops.new_subflow(pm, *token, laddr, raddr, *backup),
                    Event::SubflowClosed {
                        token,
                        laddr,
                        raddr,
                        backup,
                    } => ops.subflow_closed(pm, *token, laddr, raddr, *backup),
                    Event::SubflowPriority {
                        token,
                        laddr,
                        raddr,
                        backup,
                    } => ops.subflow_priority(pm, *token, laddr, raddr, *backup),
                    Event::Created { .. } | Event::Closed { .. } => unreachable!(),
                }
            }
        }
    }

    /// Fan a network monitor event out to every registered handler set,
    /// in registration order.
    pub fn notify(&mut self, pm: &mut PathManager, event: &MonitorEvent) {
        for registered in self.ops.iter_mut() {
            match event {
                MonitorEvent::NewInterface(iface) => registered.ops.new_interface(pm, iface),
                MonitorEvent::UpdateInterface(iface) => registered.ops.update_interface(pm, iface),
                MonitorEvent::DeleteInterface(iface) => registered.ops.delete_interface(pm, iface),
                MonitorEvent::NewLocalAddress(iface, addr) => {
                    registered.ops.new_local_address(pm, iface, addr)
                }
                MonitorEvent::DeleteLocalAddress(iface, addr) => {
                    registered.ops.delete_local_address(pm, iface, addr)
                }
            }
        }
    }

    /// Finalise every plugin in reverse initialisation order and drop
    /// all registrations, bindings, and shared object handles.
    pub fn unload(&mut self, pm: &mut PathManager) {
        for plugin in self.loaded.iter().rev() {
            debug!(name = %plugin.name, priority = plugin.priority, "finalising plugin");
            (plugin.exit)(pm);
        }
        self.loaded.clear();
        self.ops.clear();
        self.bindings.clear();
        self.default_ops = None;
        // Shared objects unload last, after every exit handler ran.
        for library in self.libraries.drain(..).rev() {
            drop(library);
        }
    }

    #[cfg(test)]
    pub(crate) fn binding_of(&self, token: Token) -> Option<&str> {
        self.bindings
            .get(&token)
            .map(|idx| self.ops[*idx].name.as_str())
    }
}

/// Scan `dir` for shared objects exporting the descriptor symbol.
///
/// The directory must exist, be a directory, and must not be
/// world-writable: a world-writable plugin directory lets anyone inject
/// code into the daemon.
fn scan_plugin_dir(
    dir: &Path,
    wanted: &impl Fn(&str) -> bool,
    candidates: &mut Vec<Candidate>,
    libraries: &mut Vec<Library>,
) -> Result<()> {
    let metadata = std::fs::metadata(dir).map_err(|_| Error::UnsafePluginDir {
        dir: dir.to_path_buf(),
        reason: "directory does not exist",
    })?;

    if !metadata.is_dir() {
        return Err(Error::UnsafePluginDir {
            dir: dir.to_path_buf(),
            reason: "not a directory",
        });
    }

    if metadata.permissions().mode() & libc::S_IWOTH != 0 {
        return Err(Error::UnsafePluginDir {
            dir: dir.to_path_buf(),
            reason: "directory is world-writable",
        });
    }

    let suffix = std::env::consts::DLL_SUFFIX;
    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(suffix))
        })
        .collect();
    entries.sort();

    for path in entries {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .trim_start_matches("lib")
            .to_string();
        if !wanted(&stem) {
            debug!(plugin = %stem, "shared object not in load list; skipped");
            continue;
        }

        // SAFETY: loading a shared object runs its constructors; the
        // directory permission check above is the trust boundary.
        let library = match unsafe { Library::new(&path) } {
            Ok(lib) => lib,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unable to load plugin");
                continue;
            }
        };

        // SAFETY: the symbol is declared to be a &'static PluginDescriptor
        // by the plugin contract.
        let descriptor = match unsafe {
            library.get::<*const PluginDescriptor>(DESCRIPTOR_SYMBOL)
        } {
            Ok(symbol) => unsafe { &**symbol },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "plugin lacks descriptor symbol");
                continue;
            }
        };

        if descriptor.name.is_empty() {
            warn!(path = %path.display(), "rejecting plugin without a name");
            continue;
        }

        candidates.push(Candidate {
            name: descriptor.name.to_string(),
            priority: descriptor.priority,
            init: descriptor.init,
            exit: descriptor.exit,
        });
        libraries.push(library);
    }

    Ok(())
}

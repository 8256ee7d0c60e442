//! Built-in path management policies.
//!
//! Both policies compile into the daemon and register through the same
//! descriptor type external shared-object plugins use.

pub mod ndiffports;
pub mod sspi;

use crate::plugin::PluginDescriptor;

/// Descriptors of every built-in policy, in load order.
pub fn builtin_descriptors() -> Vec<&'static PluginDescriptor> {
    vec![&ndiffports::PLUGIN, &sspi::PLUGIN]
}

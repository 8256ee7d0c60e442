//! Daemon configuration.
//!
//! Values merge in priority order: command line over configuration file
//! over compile-time defaults. The file schema ([`FileConfig`]) keeps
//! every field optional and string-typed; [`Config::apply_file`] parses
//! and validates, so a bad file fails startup rather than silently
//! misconfiguring the daemon.

use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::monitor::NotifyFlags;
use crate::pm::types::AddrFlags;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mpathd/mpathd.yaml";

/// Where log records go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogTarget {
    /// Standard error.
    #[default]
    Stderr,
    /// The syslog daemon.
    Syslog,
    /// The systemd journal.
    Journal,
    /// Discard all log records.
    Null,
}

impl FromStr for LogTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stderr" => Ok(Self::Stderr),
            "syslog" => Ok(Self::Syslog),
            "journal" => Ok(Self::Journal),
            "null" => Ok(Self::Null),
            other => Err(Error::Config(format!("unknown log target: {other}"))),
        }
    }
}

/// Resolved daemon configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Log destination.
    pub log: LogTarget,
    /// Enable debug-level logging.
    pub debug: bool,
    /// Directory to scan for shared-object policy plugins.
    pub plugin_dir: Option<PathBuf>,
    /// Name of the default path management strategy.
    pub default_plugin: Option<String>,
    /// Flags merged into every endpoint registration.
    pub addr_flags: AddrFlags,
    /// Network monitor event flags.
    pub notify_flags: NotifyFlags,
    /// Restrict plugin loading to these names (empty: load all).
    pub load_plugins: Vec<String>,
}

/// Raw configuration file schema.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// `log`: stderr, syslog, journal, or null.
    pub log: Option<String>,
    /// `plugin-dir`: shared-object plugin directory.
    #[serde(rename = "plugin-dir")]
    pub plugin_dir: Option<PathBuf>,
    /// `path-manager`: default strategy name.
    #[serde(rename = "path-manager")]
    pub path_manager: Option<String>,
    /// `addr-flags`: comma-separated endpoint flags.
    #[serde(rename = "addr-flags")]
    pub addr_flags: Option<String>,
    /// `notify-flags`: comma-separated monitor flags.
    #[serde(rename = "notify-flags")]
    pub notify_flags: Option<String>,
    /// `load-plugins`: plugins to load, all others skipped.
    #[serde(rename = "load-plugins")]
    pub load_plugins: Option<Vec<String>>,
}

impl Config {
    /// Fold a parsed configuration file into this configuration.
    ///
    /// Call before applying command-line overrides so the file ranks
    /// below them.
    pub fn apply_file(&mut self, file: FileConfig) -> Result<()> {
        if let Some(log) = file.log {
            self.log = log.parse()?;
        }
        if let Some(dir) = file.plugin_dir {
            self.plugin_dir = Some(dir);
        }
        if let Some(name) = file.path_manager {
            self.default_plugin = Some(name);
        }
        if let Some(flags) = file.addr_flags {
            self.addr_flags = flags.parse()?;
        }
        if let Some(flags) = file.notify_flags {
            self.notify_flags = flags.parse()?;
        }
        if let Some(plugins) = file.load_plugins {
            self.load_plugins = plugins;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.log, LogTarget::Stderr);
        assert!(!config.debug);
        assert!(config.plugin_dir.is_none());
        assert!(config.load_plugins.is_empty());
        assert!(config.addr_flags.is_empty());
    }

    #[test]
    fn test_log_target_parse() {
        assert_eq!("stderr".parse::<LogTarget>().unwrap(), LogTarget::Stderr);
        assert_eq!("journal".parse::<LogTarget>().unwrap(), LogTarget::Journal);
        assert_eq!("null".parse::<LogTarget>().unwrap(), LogTarget::Null);
        assert!("file".parse::<LogTarget>().is_err());
    }

    #[test]
    fn test_apply_file() {
        let mut config = Config::default();
        config
            .apply_file(FileConfig {
                log: Some("null".into()),
                plugin_dir: Some("/usr/lib/mpathd".into()),
                path_manager: Some("sspi".into()),
                addr_flags: Some("subflow".into()),
                notify_flags: Some("existing,skip_loopback".into()),
                load_plugins: Some(vec!["sspi".into(), "ndiffports".into()]),
            })
            .unwrap();

        assert_eq!(config.log, LogTarget::Null);
        assert_eq!(config.plugin_dir.as_deref(), Some("/usr/lib/mpathd".as_ref()));
        assert_eq!(config.default_plugin.as_deref(), Some("sspi"));
        assert!(config.addr_flags.subflow);
        assert!(config.notify_flags.existing);
        assert!(config.notify_flags.skip_loopback);
        assert_eq!(config.load_plugins.len(), 2);
    }

    #[test]
    fn test_bad_values_rejected() {
        let mut config = Config::default();
        assert!(config
            .apply_file(FileConfig {
                addr_flags: Some("warp".into()),
                ..Default::default()
            })
            .is_err());

        let mut config = Config::default();
        assert!(config
            .apply_file(FileConfig {
                log: Some("blackhole".into()),
                ..Default::default()
            })
            .is_err());
    }
}

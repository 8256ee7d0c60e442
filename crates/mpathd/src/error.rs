//! Error types for path management operations.

use std::io;
use std::path::PathBuf;

/// Result type for path management operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during path management operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Kernel returned an error code.
    #[error("kernel error: {message} (errno {errno})")]
    Kernel {
        /// The errno value from the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// Message was truncated.
    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected message length.
        expected: usize,
        /// Actual bytes received.
        actual: usize,
    },

    /// Invalid message format.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Invalid attribute format.
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),

    /// A required event attribute was absent.
    #[error("{event} event is missing the {attr} attribute")]
    MissingAttribute {
        /// Event the attribute belongs to.
        event: &'static str,
        /// Name of the missing attribute.
        attr: &'static str,
    },

    /// Generic netlink family not found.
    #[error("generic netlink family not found: {name}")]
    FamilyNotFound {
        /// The family name that was not found.
        name: String,
    },

    /// Neither kernel MPTCP variant is available on this host.
    #[error("no kernel MPTCP support detected")]
    NoMptcpSupport,

    /// The kernel MPTCP family is not currently attached.
    #[error("MPTCP generic netlink family is not ready")]
    NotReady,

    /// The active dialect does not implement the requested command.
    #[error("command not supported by the active path management dialect: {command}")]
    Unsupported {
        /// Name of the unimplemented command.
        command: &'static str,
    },

    /// Caller supplied an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The plugin directory cannot be trusted.
    #[error("unsafe plugin directory {dir}: {reason}")]
    UnsafePluginDir {
        /// Directory that failed validation.
        dir: PathBuf,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A plugin failed to load or initialise.
    #[error("plugin error: {0}")]
    Plugin(String),

    /// Configuration value could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a kernel error from an errno value.
    pub fn from_errno(errno: i32) -> Self {
        let message = io::Error::from_raw_os_error(-errno).to_string();
        Self::Kernel {
            errno: -errno,
            message,
        }
    }

    /// Get the errno value if this is a kernel error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Kernel { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// Check if this is a "not found" error (ENOENT, ENODEV).
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Kernel { errno, .. } => matches!(*errno, 2 | 19),
            Self::FamilyNotFound { .. } => true,
            _ => false,
        }
    }

    /// Check if this is a permission error (EPERM, EACCES).
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Kernel { errno, .. } => matches!(*errno, 1 | 13),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_errno() {
        let err = Error::from_errno(-1); // EPERM
        assert!(err.is_permission_denied());
        assert_eq!(err.errno(), Some(1));
    }

    #[test]
    fn test_is_not_found() {
        assert!(Error::from_errno(-2).is_not_found()); // ENOENT
        assert!(Error::from_errno(-19).is_not_found()); // ENODEV
        assert!(
            Error::FamilyNotFound {
                name: "mptcp_pm".into()
            }
            .is_not_found()
        );
    }

    #[test]
    fn test_command_error_messages() {
        let err = Error::Unsupported { command: "add_addr" };
        assert!(err.to_string().contains("add_addr"));

        let err = Error::NotReady;
        assert!(err.to_string().contains("not ready"));
    }
}

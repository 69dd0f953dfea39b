//! Error types for the packet switch.

use std::io;
use thiserror::Error;

/// Errors raised while setting up or controlling the switch.
#[derive(Debug, Error)]
pub enum SwitchError {
    /// An OS control operation failed.
    #[error("{context}: {source}")]
    Syscall {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A structural precondition was violated.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Invalid interface name: {0:?}")]
    InvalidInterfaceName(String),
}

pub type Result<T> = std::result::Result<T, SwitchError>;

impl SwitchError {
    pub fn syscall(context: impl Into<String>, source: io::Error) -> Self {
        SwitchError::Syscall {
            context: context.into(),
            source,
        }
    }

    /// Build a `Syscall` error from the calling thread's errno.
    pub fn last_os_error(context: impl Into<String>) -> Self {
        Self::syscall(context, io::Error::last_os_error())
    }

    /// Underlying OS error kind, if this is a syscall failure.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            SwitchError::Syscall { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}

/// Extension for attaching an operation name to nix/io results.
pub trait OsContext<T> {
    fn os_context(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T> OsContext<T> for std::result::Result<T, io::Error> {
    fn os_context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| SwitchError::syscall(context(), e))
    }
}

impl<T> OsContext<T> for nix::Result<T> {
    fn os_context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| SwitchError::syscall(context(), io::Error::from(e)))
    }
}

/// Validate a name against the kernel's interface name rules.
pub fn check_interface_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() >= libc::IFNAMSIZ || name.contains('\0') {
        return Err(SwitchError::InvalidInterfaceName(name.to_string()));
    }
    Ok(())
}

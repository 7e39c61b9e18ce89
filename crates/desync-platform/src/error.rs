//! Platform-specific errors

use std::net::IpAddr;
use thiserror::Error;

/// Platform-specific errors
#[derive(Error, Debug)]
pub enum PlatformError {
    /// A raw socket or queue could not be opened; the worker does not start
    #[error("Fatal: {context}: {source}")]
    Fatal {
        /// What was being opened
        context: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Queue receive or verdict failure
    #[error("Queue {queue} error: {source}")]
    Queue {
        /// Queue number
        queue: u16,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Packet injection error
    #[error("Injection to {dst} failed: {source}")]
    Injection {
        /// Destination of the packet
        dst: IpAddr,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Packet could not be prepared for sending
    #[error(transparent)]
    Core(#[from] desync_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlatformError {
    /// Wrap an OS error raised while opening a resource
    pub fn fatal(context: impl Into<String>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            return Self::PermissionDenied(format!("{}: {source}", context.into()));
        }
        Self::Fatal {
            context: context.into(),
            source,
        }
    }

    /// Whether the error prevents a worker from running
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. } | Self::PermissionDenied(_))
    }
}

/// Platform result type
pub type Result<T> = std::result::Result<T, PlatformError>;

//! Error types for codec, dispatch, discovery and lifecycle operations.

use crate::codec::ServiceKey;
use std::io;
use thiserror::Error;

/// Failures while decoding bytes into a message or SD packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer bytes were available than the header or declared length requires.
    #[error("Truncated message: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// Protocol version byte is not one we speak.
    #[error("Unsupported protocol version: 0x{0:02X}")]
    UnsupportedVersion(u8),

    /// Header fields are inconsistent or carry unknown values.
    #[error("Malformed header: {0}")]
    MalformedHeader(String),
}

impl CodecError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedHeader(msg.into())
    }
}

/// Errors surfaced by the middleware core.
#[derive(Error, Debug)]
pub enum Error {
    /// No handler is registered for the (service, instance, method) triple.
    #[error("No handler for {key} method 0x{method_id:04X}")]
    NoHandler { key: ServiceKey, method_id: u16 },

    /// The dispatch queue of the selected worker is full.
    #[error("Dispatch queue full (bound {bound})")]
    QueueFull { bound: usize },

    /// The target service is not available right now.
    #[error("Service {0} is not available")]
    NotAvailable(ServiceKey),

    /// The service instance is already provided by another peer.
    #[error("Service {0} is already offered in this domain")]
    DuplicateOffer(ServiceKey),

    /// A lifecycle call was made from the wrong state.
    #[error("Invalid lifecycle transition from {from} via {operation}")]
    InvalidLifecycleTransition {
        from: &'static str,
        operation: &'static str,
    },

    /// The runtime (or the worker pool) no longer accepts work.
    #[error("Runtime is shut down")]
    ShutDown,

    /// No response arrived in time.
    #[error("Timed out waiting for response")]
    Timeout,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for middleware operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the caller may retry the same operation later.
    ///
    /// `NotAvailable` clears on the next availability event; `QueueFull` once
    /// workers catch up. Transient socket errors are retryable too.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NotAvailable(_) | Self::QueueFull { .. } | Self::Timeout => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

//! Error types for port-relay
//!
//! This module defines the error hierarchy for the relay engine. Errors are
//! categorized by subsystem and include recovery hints: control-plane errors
//! return to the caller, data-plane errors are recovered locally.

use std::io;

use thiserror::Error;

/// Top-level error type for port-relay
#[derive(Debug, Error)]
pub enum RelayError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Rule start errors (bind conflicts, duplicate starts)
    #[error("Start error: {0}")]
    Start(#[from] StartError),

    /// Per-flow forwarding errors
    #[error("Forward error: {0}")]
    Forward(#[from] ForwardError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Check if this error is recoverable (the operation can be retried)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(e) => e.is_recoverable(),
            Self::Start(e) => e.is_recoverable(),
            Self::Forward(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Errors raised when starting a relay rule
#[derive(Debug, Error)]
pub enum StartError {
    /// An instance for this rule id is already running
    #[error("Rule already running: {id}")]
    AlreadyRunning { id: String },

    /// Failed to bind a listener or datagram socket to the source endpoint
    #[error("Failed to bind {proto} listener on {addr}: {source}")]
    Bind {
        proto: &'static str,
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl StartError {
    /// Start errors require operator action (free the port, stop the rule)
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a bind error for a TCP listener
    pub fn bind_tcp(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Bind {
            proto: "tcp",
            addr: addr.into(),
            source,
        }
    }

    /// Create a bind error for a UDP socket
    pub fn bind_udp(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Bind {
            proto: "udp",
            addr: addr.into(),
            source,
        }
    }
}

/// Per-flow errors on the data path
///
/// These never escape the flow that raised them: a dial failure discards the
/// flow, a copy error finalizes it. The listener survives all of them.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Target did not accept the connection within the dial timeout
    #[error("Dial to {target} timed out after {timeout_secs}s")]
    DialTimeout { target: String, timeout_secs: u64 },

    /// Target refused or the dial failed outright
    #[error("Failed to dial {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    /// I/O error while proxying bytes
    #[error("Copy error: {0}")]
    Copy(#[from] io::Error),
}

impl ForwardError {
    /// Check if this error is recoverable (a later flow may succeed)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::DialTimeout { .. } => true,
            Self::Dial { .. } => true,
            Self::Copy(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
        }
    }

    /// Create a dial error
    pub fn dial(target: impl Into<String>, source: io::Error) -> Self {
        Self::Dial {
            target: target.into(),
            source,
        }
    }

    /// Create a dial timeout error
    pub fn dial_timeout(target: impl Into<String>, timeout_secs: u64) -> Self {
        Self::DialTimeout {
            target: target.into(),
            timeout_secs,
        }
    }
}

//! Error types for hostdev.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for hostdev operations.
pub type Result<T> = std::result::Result<T, HostdevError>;

/// Main error type for hostdev.
#[derive(Error, Debug)]
pub enum HostdevError {
    // Store errors
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("stale write rejected for {name}: expected resource version {expected}, got {actual}")]
    Conflict { name: String, expected: u64, actual: u64 },

    // Host state errors
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid PCI address: {address} (expected 0000:01:00.0)")]
    InvalidAddress { address: String },

    #[error("driver {driver} not present on this host")]
    DriverNotPresent { driver: String },

    // vGPU errors
    #[error("vGPU type {type_name} is not available for device {address}")]
    TypeNotAvailable { type_name: String, address: String },

    // Command execution errors
    #[error("command {command} failed: {reason}")]
    CommandFailed { command: String, reason: String },

    // Device plugin protocol errors
    #[error("failed to register device plugin {resource} with the kubelet: {reason}")]
    PluginRegistration { resource: String, reason: String },

    // Configuration errors
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Generic errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HostdevError {
    /// True for the benign "object vanished" condition that reconcile
    /// handlers absorb instead of propagating.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when a status write was rejected because the object moved on;
    /// handlers retry from the latest copy.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

//! Error types for the registry, proxy, and gateway.
//!
//! Each domain gets its own error enum so callers can match on the
//! failure modes that matter to them: a missing instance, an unreachable
//! one, a rejected transition, lock contention, or a corrupt snapshot.

use std::time::Duration;

/// Errors from the persisted instance registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No record exists for the given process identifier.
    #[error("unknown instance pid {pid}")]
    NotFound {
        /// Process identifier that was looked up.
        pid: u32,
    },

    /// The registry lock could not be acquired within the bounded wait.
    ///
    /// Retryable: the snapshot itself is intact, another process is just
    /// holding the lock for longer than expected.
    #[error("timed out acquiring registry lock after {waited:?}")]
    LockTimeout {
        /// How long we waited before giving up.
        waited: Duration,
    },

    /// The persisted snapshot could not be parsed.
    ///
    /// Never surfaced by the store itself: a corrupt snapshot is recovered
    /// by reinitializing an empty registry. Produced only by the parse path.
    #[error("registry snapshot unreadable: {reason}")]
    CorruptState {
        /// Why the snapshot failed to parse.
        reason: String,
    },

    /// Filesystem error touching the snapshot or lock file.
    #[error("registry io error: {0}")]
    Io(#[from] std::io::Error),

    /// The snapshot could not be serialized for writing.
    #[error("failed to serialize registry snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors from aggregator pass-through calls against a tracked instance.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// No record exists for the given process identifier.
    #[error("unknown instance pid {pid}")]
    NotFound {
        /// Process identifier that was targeted.
        pid: u32,
    },

    /// The instance is known but cannot be contacted.
    ///
    /// Returned without a network attempt when the record is already a
    /// zombie, or after a request failure (which also marks it zombie).
    #[error("instance {pid} is unreachable: {reason}")]
    Unreachable {
        /// Process identifier that was targeted.
        pid: u32,
        /// Short description of the failure.
        reason: String,
    },

    /// The requested operation is not valid for the instance's state.
    #[error("cannot {action} instance {pid} in state {state}")]
    InvalidTransition {
        /// Process identifier that was targeted.
        pid: u32,
        /// Current state of the record, as its wire name.
        state: &'static str,
        /// The rejected operation.
        action: &'static str,
    },

    /// The underlying registry operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Errors starting or running the aggregator gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// No free port was found in the configured search window.
    #[error("no free port in {start}..{end}")]
    NoFreePort {
        /// First port tried.
        start: u16,
        /// One past the last port tried.
        end: u16,
    },

    /// The API server failed while serving.
    #[error("gateway server error: {0}")]
    Serve(#[from] std::io::Error),

    /// The underlying registry operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

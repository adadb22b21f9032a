//! Error types for Remedy Core
//!
//! Provides error handling for:
//! - Incident store access (unavailability, compare-and-swap conflicts)
//! - Dispatch and status queries against the actuator
//! - Classifier failures
//! - Retry policy and configuration validation
//! - Illegal state transitions and tampered history
//! - Engine-level failures surfaced to callers

use crate::types::{Fingerprint, IncidentId, IncidentState};

/// Incident store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend cannot be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Compare-and-swap lost against a concurrent writer
    #[error("version conflict on incident {id}: expected {expected}, found {actual}")]
    Conflict {
        id: IncidentId,
        expected: u64,
        actual: u64,
    },

    /// Another incident already holds this fingerprint
    #[error("fingerprint {fingerprint} already tracked by active incident {existing}")]
    ActiveFingerprint {
        fingerprint: Fingerprint,
        existing: IncidentId,
    },

    /// Incident does not exist
    #[error("incident not found: {0}")]
    NotFound(IncidentId),

    /// IO failure in a file-backed store
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot could not be encoded or decoded
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Errors that mean the store itself is not usable right now
    #[inline]
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }
}

/// Failure to hand a remediation attempt to the actuator
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Actuator could not be reached or timed out; worth retrying
    #[error("actuator unreachable: {0}")]
    Unreachable(String),

    /// Actuator refused the request (malformed, forbidden); retrying will not help
    #[error("actuator rejected request: {0}")]
    Rejected(String),

    /// Incident was closed while the call was in flight
    #[error("dispatch cancelled")]
    Cancelled,

    /// Handle could not be persisted
    #[error("failed to record attempt: {0}")]
    Store(#[from] StoreError),
}

impl DispatchError {
    /// Build from a message and a retryable flag
    #[must_use]
    pub fn new(message: impl Into<String>, retryable: bool) -> Self {
        if retryable {
            Self::Unreachable(message.into())
        } else {
            Self::Rejected(message.into())
        }
    }

    /// Whether the failure should consume a retry rather than escalate
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// Status query failure; the monitor keeps polling after these
#[derive(Debug, Clone, thiserror::Error)]
#[error("actuator status query failed: {0}")]
pub struct ActuatorError(pub String);

/// Classifier failure
#[derive(Debug, Clone, thiserror::Error)]
#[error("classification failed: {0}")]
pub struct ClassifyError(pub String);

/// Retry policy validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// Policy allows no attempts at all
    #[error("policy for {0} must allow at least one attempt")]
    ZeroAttempts(String),

    /// Backoff list does not match `max_attempts - 1`
    #[error("policy for {category}: expected {expected} backoff delays, got {actual}")]
    BackoffLength {
        category: String,
        expected: usize,
        actual: usize,
    },

    /// Category listed twice
    #[error("duplicate policy for category {0}")]
    Duplicate(String),
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML syntax or schema error
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A policy entry is invalid
    #[error("invalid policy: {0}")]
    Policy(#[from] PolicyError),

    /// A value is out of range
    #[error("invalid config value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// State machine violations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    /// Edge not in the transition table
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: IncidentState,
        to: IncidentState,
    },

    /// Attempt number does not follow the accounting rules
    #[error("attempt number {actual} invalid for {from} -> {to} (expected {expected})")]
    AttemptMismatch {
        from: IncidentState,
        to: IncidentState,
        expected: u32,
        actual: u32,
    },

    /// Entering Monitoring requires a handle
    #[error("transition into monitoring requires an attempt handle")]
    MissingHandle,

    /// History must begin with the creation event
    #[error("history must start with a creation event")]
    MissingCreation,
}

/// Persisted history failed verification
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    /// Hash chain broken at the given sequence number
    #[error("hash chain broken at sequence {0}")]
    BrokenChain(u64),

    /// Sequence numbers are not contiguous
    #[error("sequence gap: expected {expected}, found {actual}")]
    SequenceGap { expected: u64, actual: u64 },

    /// Recorded edge is not legal
    #[error("illegal edge in history: {0}")]
    IllegalEdge(#[from] StateMachineError),

    /// Cached fields disagree with the folded history
    #[error("cached incident fields diverge from history")]
    CacheDivergence,
}

/// Notification sink failure (logged, never propagated to transitions)
#[derive(Debug, Clone, thiserror::Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Errors surfaced by the engine to its callers
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store stayed unavailable after retries; engine is now halted
    #[error("incident store unavailable: {0}")]
    StoreUnavailable(String),

    /// Engine is halted and refuses new alerts until the store recovers
    #[error("alert processing halted: incident store unavailable")]
    Halted,

    /// Engine was shut down
    #[error("remediation engine is shut down")]
    ShutDown,

    /// Non-transient store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Incident does not exist
    #[error("incident not found: {0}")]
    NotFound(IncidentId),

    /// Incident is already resolved or escalated
    #[error("incident {0} is already closed")]
    AlreadyTerminal(IncidentId),

    /// Transition rejected by the state machine
    #[error("state machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    /// Compare-and-swap kept losing
    #[error("gave up on incident {id} after {attempts} conflicting writes")]
    ConflictRetriesExhausted { id: IncidentId, attempts: u32 },

    /// Configuration could not be applied
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Whether the engine stopped accepting alerts because of this error
    #[inline]
    #[must_use]
    pub fn is_fail_closed(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Halted)
    }
}

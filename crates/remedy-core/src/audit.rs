//! Audit trail for incident transitions
//!
//! Every transition appends exactly one [`AuditEvent`]. Events are sealed
//! with a SHA-256 hash over their contents and the previous event's hash,
//! so edits to persisted history are detectable.

use crate::error::IntegrityError;
use crate::types::{AttemptHandle, IncidentId, IncidentState};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Hash used as `prev_hash` of the first event
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Why a transition happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransitionReason {
    Created,
    DispatchScheduled,
    NotRemediable,
    AutoRemediationDisabled,
    Dispatched,
    DispatchFailed,
    DispatchRejected,
    RemediationSucceeded,
    RemediationFailed,
    MonitorTimeout,
    RetriesExhausted,
    ManualOverride,
}

impl TransitionReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::DispatchScheduled => "dispatch-scheduled",
            Self::NotRemediable => "not-remediable",
            Self::AutoRemediationDisabled => "auto-remediation-disabled",
            Self::Dispatched => "dispatched",
            Self::DispatchFailed => "dispatch-failed",
            Self::DispatchRejected => "dispatch-rejected",
            Self::RemediationSucceeded => "remediation-succeeded",
            Self::RemediationFailed => "remediation-failed",
            Self::MonitorTimeout => "monitor-timeout",
            Self::RetriesExhausted => "retries-exhausted",
            Self::ManualOverride => "manual-override",
        }
    }
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub incident_id: IncidentId,
    /// Position in the incident history, starting at 0
    pub sequence: u64,
    /// Absent on the creation event
    pub from_state: Option<IncidentState>,
    pub to_state: IncidentState,
    pub reason: TransitionReason,
    pub attempt_number: u32,
    pub handle: Option<AttemptHandle>,
    pub detail: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
}

/// Unsealed event contents
#[derive(Debug, Clone)]
pub(crate) struct EventBody {
    pub(crate) incident_id: IncidentId,
    pub(crate) from_state: Option<IncidentState>,
    pub(crate) to_state: IncidentState,
    pub(crate) reason: TransitionReason,
    pub(crate) attempt_number: u32,
    pub(crate) handle: Option<AttemptHandle>,
    pub(crate) detail: Option<String>,
    pub(crate) occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    /// Seal `body` as the next event after `prev`
    pub(crate) fn seal(body: EventBody, prev: Option<&AuditEvent>) -> Self {
        let (sequence, prev_hash) = match prev {
            Some(prev) => (prev.sequence + 1, prev.hash.clone()),
            None => (0, GENESIS_HASH.to_string()),
        };
        let mut event = Self {
            incident_id: body.incident_id,
            sequence,
            from_state: body.from_state,
            to_state: body.to_state,
            reason: body.reason,
            attempt_number: body.attempt_number,
            handle: body.handle,
            detail: body.detail,
            occurred_at: body.occurred_at,
            prev_hash,
            hash: String::new(),
        };
        event.hash = compute_hash(&event);
        event
    }

    /// Whether the stored hash matches the event contents
    #[must_use]
    pub fn is_sealed_correctly(&self) -> bool {
        self.hash == compute_hash(self)
    }
}

fn compute_hash(event: &AuditEvent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.incident_id.to_string().as_bytes());
    hasher.update(event.sequence.to_le_bytes());
    hasher.update(event.from_state.map_or("", IncidentState::as_str).as_bytes());
    hasher.update([0]);
    hasher.update(event.to_state.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(event.reason.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(event.attempt_number.to_le_bytes());
    hasher.update(event.handle.as_ref().map_or("", AttemptHandle::as_str).as_bytes());
    hasher.update([0]);
    hasher.update(event.detail.as_deref().unwrap_or("").as_bytes());
    hasher.update([0]);
    hasher.update(
        event
            .occurred_at
            .to_rfc3339_opts(SecondsFormat::Nanos, true)
            .as_bytes(),
    );
    hasher.update(event.prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check sequence numbering and the hash chain of a history
pub fn verify_chain(events: &[AuditEvent]) -> Result<(), IntegrityError> {
    let mut prev = GENESIS_HASH;
    for (expected, event) in (0u64..).zip(events) {
        if event.sequence != expected {
            return Err(IntegrityError::SequenceGap {
                expected,
                actual: event.sequence,
            });
        }
        if event.prev_hash != prev || !event.is_sealed_correctly() {
            return Err(IntegrityError::BrokenChain(event.sequence));
        }
        prev = &event.hash;
    }
    Ok(())
}

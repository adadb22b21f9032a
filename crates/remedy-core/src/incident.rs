//! Incident record and attempt bookkeeping
//!
//! An [`Incident`] owns its append-only audit history. The state, attempt
//! count, active handle and timestamps are a cache of that history: every
//! mutation goes through [`Incident::record`], which validates the edge,
//! seals a new audit event and folds it into the cached fields.

use crate::audit::{self, AuditEvent, EventBody, TransitionReason};
use crate::error::{IntegrityError, StateMachineError};
use crate::state_machine;
use crate::types::{
    AttemptHandle, FailureCategory, Fingerprint, IncidentId, IncidentState, Priority, Severity,
    SlaStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Data needed to open an incident on first sighting of a fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIncident {
    pub fingerprint: Fingerprint,
    pub category: FailureCategory,
    pub auto_remediable: bool,
    pub severity: Severity,
    pub source: String,
    pub resource: String,
    pub summary: String,
}

/// A requested transition, before validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionDraft {
    pub to: IncidentState,
    pub reason: TransitionReason,
    pub attempt_number: u32,
    pub handle: Option<AttemptHandle>,
    pub detail: Option<String>,
}

impl TransitionDraft {
    #[must_use]
    pub fn new(to: IncidentState, reason: TransitionReason, attempt_number: u32) -> Self {
        Self {
            to,
            reason,
            attempt_number,
            handle: None,
            detail: None,
        }
    }

    #[must_use]
    pub fn with_handle(mut self, handle: AttemptHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// The unit of work: one real-world failure occurrence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub fingerprint: Fingerprint,
    pub failure_category: FailureCategory,
    pub auto_remediable: bool,
    pub severity: Severity,
    pub priority: Priority,
    pub state: IncidentState,
    pub attempt_count: u32,
    pub active_attempt_handle: Option<AttemptHandle>,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    pub source: String,
    pub resource: String,
    pub summary: String,
    history: Vec<AuditEvent>,
}

impl Incident {
    /// Open a new incident in `New` and record its creation event
    #[must_use]
    pub fn open(seed: NewIncident, now: DateTime<Utc>) -> Self {
        let id = IncidentId::new();
        let creation = AuditEvent::seal(
            EventBody {
                incident_id: id,
                from_state: None,
                to_state: IncidentState::New,
                reason: TransitionReason::Created,
                attempt_number: 0,
                handle: None,
                detail: Some(seed.summary.clone()),
                occurred_at: now,
            },
            None,
        );
        Self {
            id,
            fingerprint: seed.fingerprint,
            failure_category: seed.category,
            auto_remediable: seed.auto_remediable,
            priority: seed.severity.priority(),
            severity: seed.severity,
            state: IncidentState::New,
            attempt_count: 0,
            active_attempt_handle: None,
            created_at: now,
            last_transition_at: now,
            source: seed.source,
            resource: seed.resource,
            summary: seed.summary,
            history: vec![creation],
        }
    }

    /// Ordered audit events, creation first
    #[inline]
    #[must_use]
    pub fn history(&self) -> &[AuditEvent] {
        &self.history
    }

    /// Store version used for compare-and-swap
    #[inline]
    #[must_use]
    pub fn version(&self) -> u64 {
        self.history.len() as u64
    }

    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Most recent audit event
    #[must_use]
    pub fn last_event(&self) -> Option<&AuditEvent> {
        self.history.last()
    }

    /// Validate and append a transition
    pub fn record(
        &mut self,
        draft: TransitionDraft,
        now: DateTime<Utc>,
    ) -> Result<&AuditEvent, StateMachineError> {
        state_machine::validate_event(
            Some(self.state),
            draft.to,
            self.attempt_count,
            draft.attempt_number,
            draft.handle.as_ref(),
        )?;

        let event = AuditEvent::seal(
            EventBody {
                incident_id: self.id,
                from_state: Some(self.state),
                to_state: draft.to,
                reason: draft.reason,
                attempt_number: draft.attempt_number,
                handle: draft.handle,
                detail: draft.detail,
                occurred_at: now,
            },
            self.history.last(),
        );
        self.apply(&event);
        self.history.push(event);
        Ok(&self.history[self.history.len() - 1])
    }

    fn apply(&mut self, event: &AuditEvent) {
        self.state = event.to_state;
        self.attempt_count = event.attempt_number;
        self.active_attempt_handle = if event.to_state == IncidentState::Monitoring {
            event.handle.clone()
        } else {
            None
        };
        self.last_transition_at = event.occurred_at;
    }

    /// Rebuild the cached fields by folding the history
    pub fn replay(&self) -> Result<Incident, IntegrityError> {
        let Some(first) = self.history.first() else {
            return Err(StateMachineError::MissingCreation.into());
        };
        state_machine::validate_event(
            first.from_state,
            first.to_state,
            0,
            first.attempt_number,
            first.handle.as_ref(),
        )?;

        let mut folded = self.clone();
        folded.state = IncidentState::New;
        folded.attempt_count = 0;
        folded.active_attempt_handle = None;
        folded.created_at = first.occurred_at;
        folded.last_transition_at = first.occurred_at;

        for event in &self.history[1..] {
            if event.from_state != Some(folded.state) {
                return Err(IntegrityError::CacheDivergence);
            }
            state_machine::validate_event(
                event.from_state,
                event.to_state,
                folded.attempt_count,
                event.attempt_number,
                event.handle.as_ref(),
            )?;
            folded.apply(event);
        }
        Ok(folded)
    }

    /// Verify the hash chain and that the cached fields match the folded history
    pub fn verify_history(&self) -> Result<(), IntegrityError> {
        audit::verify_chain(&self.history)?;
        if self.history.iter().any(|e| e.incident_id != self.id) {
            return Err(IntegrityError::CacheDivergence);
        }
        let folded = self.replay()?;
        if folded != *self {
            return Err(IntegrityError::CacheDivergence);
        }
        Ok(())
    }

    /// Time from creation to resolution; `None` until resolved
    #[must_use]
    pub fn resolution_latency(&self) -> Option<Duration> {
        if self.state != IncidentState::Resolved {
            return None;
        }
        (self.last_transition_at - self.created_at).to_std().ok()
    }

    #[must_use]
    pub fn sla_status(&self) -> SlaStatus {
        match self.resolution_latency() {
            None => SlaStatus::Pending,
            Some(latency) if latency <= self.priority.sla() => SlaStatus::Met,
            Some(_) => SlaStatus::Breached,
        }
    }
}

/// Lifecycle of a single remediation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttemptStatus {
    Running,
    Succeeded,
    Failed,
    TimedOut,
    DispatchFailed,
    Cancelled,
}

impl AttemptStatus {
    #[inline]
    #[must_use]
    pub fn is_finished(self) -> bool {
        !matches!(self, AttemptStatus::Running)
    }
}

/// Per-attempt record keyed by `(incident_id, attempt_number)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub incident_id: IncidentId,
    pub attempt_number: u32,
    pub handle: Option<AttemptHandle>,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl AttemptRecord {
    /// Attempt accepted by the actuator
    #[must_use]
    pub fn running(
        incident_id: IncidentId,
        attempt_number: u32,
        handle: AttemptHandle,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            incident_id,
            attempt_number,
            handle: Some(handle),
            status: AttemptStatus::Running,
            started_at: now,
            completed_at: None,
            failure_reason: None,
        }
    }

    /// Attempt the actuator never accepted
    #[must_use]
    pub fn dispatch_failed(
        incident_id: IncidentId,
        attempt_number: u32,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            incident_id,
            attempt_number,
            handle: None,
            status: AttemptStatus::DispatchFailed,
            started_at: now,
            completed_at: Some(now),
            failure_reason: Some(reason.into()),
        }
    }

    /// Close the attempt with a final status
    pub fn finish(&mut self, status: AttemptStatus, reason: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        self.failure_reason = reason;
        self.completed_at = Some(now);
    }

    /// Wall-clock duration, if finished
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.completed_at
            .and_then(|done| (done - self.started_at).to_std().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;

    fn seed() -> NewIncident {
        NewIncident {
            fingerprint: Fingerprint::new("adf/pipelineA"),
            category: FailureCategory::new("GatewayTimeout"),
            auto_remediable: true,
            severity: Severity::High,
            source: "adf".into(),
            resource: "pipelineA".into(),
            summary: "Gateway timeout".into(),
        }
    }

    fn drive_to_resolution(incident: &mut Incident, start: DateTime<Utc>) {
        incident
            .record(
                TransitionDraft::new(IncidentState::Dispatching, TransitionReason::DispatchScheduled, 1),
                start,
            )
            .unwrap();
        incident
            .record(
                TransitionDraft::new(IncidentState::Monitoring, TransitionReason::Dispatched, 1)
                    .with_handle(AttemptHandle::new("run-1")),
                start,
            )
            .unwrap();
        incident
            .record(
                TransitionDraft::new(IncidentState::Resolved, TransitionReason::RemediationSucceeded, 1),
                start + ChronoDuration::minutes(5),
            )
            .unwrap();
    }

    #[test]
    fn open_records_creation_event() {
        let now = Utc::now();
        let incident = Incident::open(seed(), now);

        assert_eq!(incident.state, IncidentState::New);
        assert_eq!(incident.attempt_count, 0);
        assert_eq!(incident.priority, Priority::P2);
        assert_eq!(incident.version(), 1);
        let creation = &incident.history()[0];
        assert_eq!(creation.from_state, None);
        assert_eq!(creation.reason, TransitionReason::Created);
    }

    #[test]
    fn handle_cached_only_while_monitoring() {
        let now = Utc::now();
        let mut incident = Incident::open(seed(), now);
        incident
            .record(
                TransitionDraft::new(IncidentState::Dispatching, TransitionReason::DispatchScheduled, 1),
                now,
            )
            .unwrap();
        assert_eq!(incident.active_attempt_handle, None);

        incident
            .record(
                TransitionDraft::new(IncidentState::Monitoring, TransitionReason::Dispatched, 1)
                    .with_handle(AttemptHandle::new("run-1")),
                now,
            )
            .unwrap();
        assert_eq!(incident.active_attempt_handle, Some(AttemptHandle::new("run-1")));

        incident
            .record(
                TransitionDraft::new(IncidentState::Dispatching, TransitionReason::RemediationFailed, 2),
                now,
            )
            .unwrap();
        assert_eq!(incident.active_attempt_handle, None);
        assert_eq!(incident.attempt_count, 2);
    }

    #[test]
    fn illegal_transition_leaves_incident_untouched() {
        let now = Utc::now();
        let mut incident = Incident::open(seed(), now);
        let before = incident.clone();

        let err = incident
            .record(
                TransitionDraft::new(IncidentState::Resolved, TransitionReason::RemediationSucceeded, 0),
                now,
            )
            .unwrap_err();
        assert!(matches!(err, StateMachineError::IllegalTransition { .. }));
        assert_eq!(incident, before);
    }

    #[test]
    fn terminal_incident_rejects_transitions() {
        let now = Utc::now();
        let mut incident = Incident::open(seed(), now);
        incident
            .record(
                TransitionDraft::new(IncidentState::Escalated, TransitionReason::NotRemediable, 0),
                now,
            )
            .unwrap();
        assert!(incident
            .record(
                TransitionDraft::new(IncidentState::Dispatching, TransitionReason::DispatchScheduled, 1),
                now,
            )
            .is_err());
    }

    #[test]
    fn replay_matches_cached_fields() {
        let now = Utc::now();
        let mut incident = Incident::open(seed(), now);
        drive_to_resolution(&mut incident, now);

        assert_eq!(incident.replay().unwrap(), incident);
        assert!(incident.verify_history().is_ok());
    }

    #[test]
    fn verify_detects_cache_divergence() {
        let now = Utc::now();
        let mut incident = Incident::open(seed(), now);
        drive_to_resolution(&mut incident, now);
        incident.attempt_count = 3;

        assert_eq!(incident.verify_history(), Err(IntegrityError::CacheDivergence));
    }

    #[test]
    fn sla_status_follows_latency() {
        let now = Utc::now();
        let mut incident = Incident::open(seed(), now);
        assert_eq!(incident.sla_status(), SlaStatus::Pending);

        drive_to_resolution(&mut incident, now);
        assert_eq!(incident.resolution_latency(), Some(Duration::from_secs(300)));
        assert_eq!(incident.sla_status(), SlaStatus::Met);
    }

    #[test]
    fn attempt_record_lifecycle() {
        let now = Utc::now();
        let mut record = AttemptRecord::running(IncidentId::new(), 1, AttemptHandle::new("h"), now);
        assert!(!record.status.is_finished());
        assert_eq!(record.duration(), None);

        record.finish(
            AttemptStatus::Failed,
            Some("cluster died".into()),
            now + ChronoDuration::seconds(10),
        );
        assert!(record.status.is_finished());
        assert_eq!(record.duration(), Some(Duration::from_secs(10)));
    }
}

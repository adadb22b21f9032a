//! Remediation engine
//!
//! Drives each incident from the first alert to a terminal state:
//! - Classifies the alert and collapses duplicates onto the active incident
//! - Routes new incidents to dispatch or straight to escalation
//! - Dispatches attempts, monitors them and retries after the policy backoff
//! - Escalates once the retry budget is spent
//!
//! Every transition for one incident runs under that incident's async lock
//! and is written with compare-and-swap on the history length. Dispatch,
//! monitor polls and backoff sleeps all race the incident's cancellation
//! signal, so a manual override stops them promptly.
//!
//! The only fatal condition is a store that stays unavailable after the
//! configured retries. The engine then halts alert intake and pings the store
//! in the background. Once a ping succeeds the halt is lifted and every open
//! incident is re-driven through `resume`, including those whose outcome or
//! retry could not be written during the outage.

use crate::actuator::{Actuator, Classification, Classifier, RawAlert};
use crate::audit::{AuditEvent, TransitionReason};
use crate::config::RemedyConfig;
use crate::dedup::Deduplicator;
use crate::dispatcher::RemediationDispatcher;
use crate::error::{DispatchError, EngineError, StoreError};
use crate::incident::{AttemptRecord, AttemptStatus, Incident, NewIncident, TransitionDraft};
use crate::monitor::{
    MonitorOutcome, MonitorReport, OutcomeSink, RemediationMonitor, WatchRequest,
};
use crate::notifier::{NotificationSink, Notifier, TransitionEvent};
use crate::policy::{PolicyRegistry, RetryPolicy, RetryPolicyTable};
use crate::store::IncidentStore;
use crate::sync::{cancelled, KeyedLocks};
use crate::types::{
    AttemptHandle, Fingerprint, IncidentId, IncidentState, SlaStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Compare-and-swap attempts before a transition gives up
const MAX_CAS_RETRIES: u32 = 8;

/// Shortest pause between store pings while halted
const MIN_STORE_PING_INTERVAL: Duration = Duration::from_millis(10);

/// Longest alert message kept as the incident summary
const SUMMARY_CHARS: usize = 256;

/// Result of submitting one alert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertOutcome {
    pub incident_id: IncidentId,
    /// `false` when the alert collapsed into an already-active incident
    pub is_new: bool,
    /// Incident state once the alert has been processed
    pub state: IncidentState,
}

/// What `resume` did with the incidents it found
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeReport {
    /// `New` incidents whose first step was finished
    pub restarted: usize,
    /// `Dispatching` incidents dispatched again (idempotently)
    pub redispatched: usize,
    /// Failed attempts put back on the retry path
    pub rescheduled: usize,
    /// `Monitoring` incidents whose handle is polled again
    pub rewatched: usize,
    /// Attempts that had succeeded before the restart
    pub resolved: usize,
}

/// Aggregate view over every stored incident
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncidentStats {
    pub total: usize,
    pub new: usize,
    pub dispatching: usize,
    pub monitoring: usize,
    pub resolved: usize,
    pub escalated: usize,
    /// Attempts dispatched across all incidents
    pub attempts: u64,
    pub mean_time_to_resolve: Option<Duration>,
    pub sla_met: usize,
    pub sla_breached: usize,
}

impl IncidentStats {
    /// Incidents not yet resolved or escalated
    #[must_use]
    pub fn open(&self) -> usize {
        self.new + self.dispatching + self.monitoring
    }
}

/// The alert-to-remediation control loop
#[derive(Clone)]
pub struct RemediationEngine {
    core: Arc<EngineCore>,
}

struct EngineCore {
    me: Weak<EngineCore>,
    config: RemedyConfig,
    store: Arc<dyn IncidentStore>,
    classifier: Arc<dyn Classifier>,
    policies: PolicyRegistry,
    dedup: Deduplicator,
    dispatcher: RemediationDispatcher,
    monitor: RemediationMonitor,
    notifier: Notifier,
    incident_locks: KeyedLocks<IncidentId>,
    cancels: DashMap<IncidentId, watch::Sender<bool>>,
    auto_remediation: AtomicBool,
    halted: AtomicBool,
    closed: AtomicBool,
}

impl RemediationEngine {
    /// Build an engine over the given collaborators
    ///
    /// # Errors
    /// - `EngineError::Config` if the configuration or its policy table is invalid
    pub fn new(
        config: RemedyConfig,
        store: Arc<dyn IncidentStore>,
        classifier: Arc<dyn Classifier>,
        actuator: Arc<dyn Actuator>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let table = config.policy_table()?;
        let policy_count = table.len();

        let core = Arc::new_cyclic(|me| EngineCore {
            me: me.clone(),
            dedup: Deduplicator::new(store.clone()),
            dispatcher: RemediationDispatcher::new(actuator.clone(), store.clone()),
            monitor: RemediationMonitor::new(actuator, config.monitor_settings()),
            notifier: Notifier::new(config.notifier.channel_capacity),
            policies: PolicyRegistry::new(table),
            incident_locks: KeyedLocks::new(),
            cancels: DashMap::new(),
            auto_remediation: AtomicBool::new(config.auto_remediation_enabled),
            halted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            classifier,
            store,
            config,
        });
        info!(
            policies = policy_count,
            auto_remediation = core.config.auto_remediation_enabled,
            "remediation engine ready"
        );
        Ok(Self { core })
    }

    /// Process one alert
    ///
    /// A first sighting opens an incident and runs it up to its first
    /// suspension point (monitoring, or escalation). A duplicate returns the
    /// active incident unchanged.
    ///
    /// # Errors
    /// - `EngineError::Halted` while the store is unavailable
    /// - `EngineError::StoreUnavailable` if the store failed during this call
    pub async fn submit_alert(&self, alert: RawAlert) -> Result<AlertOutcome, EngineError> {
        self.core.submit_alert(alert).await
    }

    /// Recover in-flight work after a restart
    pub async fn resume(&self) -> Result<ResumeReport, EngineError> {
        self.core.resume().await
    }

    /// Escalate an open incident on an operator's behalf
    ///
    /// Stops any in-flight dispatch, backoff or monitor for the incident.
    ///
    /// # Errors
    /// - `EngineError::NotFound` for an unknown id
    /// - `EngineError::AlreadyTerminal` if the incident is already closed
    pub async fn cancel_incident(
        &self,
        id: IncidentId,
        operator: &str,
    ) -> Result<Incident, EngineError> {
        self.core.cancel_incident(id, operator).await
    }

    pub async fn incident(&self, id: IncidentId) -> Result<Option<Incident>, EngineError> {
        let core = &self.core;
        core.store_call("get incident", || core.store.get(id)).await
    }

    pub async fn active_incident(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Incident>, EngineError> {
        let core = &self.core;
        core.store_call("find active incident", || core.store.find_active(fingerprint))
            .await
    }

    /// Every incident opened for a fingerprint, oldest first
    pub async fn incidents_for(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<Incident>, EngineError> {
        let core = &self.core;
        core.store_call("find incidents", || core.store.find_by_fingerprint(fingerprint))
            .await
    }

    pub async fn history(&self, id: IncidentId) -> Result<Vec<AuditEvent>, EngineError> {
        Ok(self.core.load(id).await?.history().to_vec())
    }

    pub async fn attempts(
        &self,
        id: IncidentId,
    ) -> Result<Vec<AttemptRecord>, EngineError> {
        let core = &self.core;
        core.store_call("list attempts", || core.store.attempts(id)).await
    }

    pub async fn stats(&self) -> Result<IncidentStats, EngineError> {
        self.core.stats().await
    }

    /// Stream of committed transitions
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.core.notifier.subscribe()
    }

    /// Feed a notification adapter from a background task
    pub fn attach_sink(&self, sink: Arc<dyn NotificationSink>) -> JoinHandle<()> {
        self.core.notifier.attach(sink)
    }

    /// Swap the retry policy table; returns the previous one
    pub fn replace_policies(&self, table: RetryPolicyTable) -> Arc<RetryPolicyTable> {
        info!(policies = table.len(), "retry policy table replaced");
        self.core.policies.replace(table)
    }

    #[must_use]
    pub fn policies(&self) -> Arc<RetryPolicyTable> {
        self.core.policies.current()
    }

    /// Flip the auto-remediation kill switch at runtime
    pub fn set_auto_remediation(&self, enabled: bool) {
        let previous = self.core.auto_remediation.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            warn!(enabled, "auto-remediation switched");
        }
    }

    #[must_use]
    pub fn auto_remediation_enabled(&self) -> bool {
        self.core.auto_remediation.load(Ordering::SeqCst)
    }

    /// Whether alert intake is halted on store unavailability
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.core.halted.load(Ordering::SeqCst)
    }

    /// Attempt handles currently being polled
    #[must_use]
    pub fn monitored_handles(&self) -> Vec<(AttemptHandle, IncidentId, u32)> {
        self.core.monitor.active_handles()
    }

    #[must_use]
    pub fn config(&self) -> &RemedyConfig {
        &self.core.config
    }

    /// Stop every monitor and pending retry; further alerts are refused
    pub async fn shutdown(&self) {
        self.core.shutdown().await;
    }
}

impl std::fmt::Debug for RemediationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemediationEngine")
            .field("monitor", &self.core.monitor)
            .field("halted", &self.is_halted())
            .finish_non_exhaustive()
    }
}

impl EngineCore {
    async fn submit_alert(&self, alert: RawAlert) -> Result<AlertOutcome, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }
        self.ensure_available().await?;

        let verdict = match self.classifier.classify(&alert).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(source = %alert.source, resource = %alert.resource, error = %e, "classifier failed, treating alert as unknown");
                Classification::fallback(&alert)
            }
        };
        let seed = NewIncident {
            fingerprint: verdict.fingerprint,
            category: verdict.category,
            auto_remediable: verdict.is_remediable,
            severity: verdict.severity,
            source: alert.source.clone(),
            resource: alert.resource.clone(),
            summary: alert.message.chars().take(SUMMARY_CHARS).collect(),
        };

        let resolution = self
            .store_call("resolve fingerprint", || self.dedup.resolve(seed.clone()))
            .await?;
        let incident = resolution.incident;
        if !resolution.is_new {
            debug!(incident_id = %incident.id, fingerprint = %incident.fingerprint, state = %incident.state, "alert collapsed into active incident");
            return Ok(AlertOutcome {
                incident_id: incident.id,
                is_new: false,
                state: incident.state,
            });
        }

        info!(
            incident_id = %incident.id,
            fingerprint = %incident.fingerprint,
            category = %incident.failure_category,
            priority = %incident.priority,
            "incident opened"
        );
        if let Some(created) = incident.last_event() {
            self.notify(&incident, created.clone());
        }

        let id = incident.id;
        self.begin(id).await?;
        let state = self.load(id).await?.state;
        Ok(AlertOutcome {
            incident_id: id,
            is_new: true,
            state,
        })
    }

    /// Route a `New` incident, then dispatch attempt 1 if it was scheduled
    async fn begin(&self, id: IncidentId) -> Result<(), EngineError> {
        if self.with_incident_lock(id, self.begin_locked(id)).await? {
            self.run_attempt(id, 1).await?;
        }
        Ok(())
    }

    async fn begin_locked(&self, id: IncidentId) -> Result<bool, EngineError> {
        let enabled = self.auto_remediation.load(Ordering::SeqCst);
        let table = self.policies.current();

        let committed = self
            .transition_locked(id, |incident| {
                if incident.state != IncidentState::New {
                    return None;
                }
                let category = &incident.failure_category;
                let draft = if !enabled {
                    TransitionDraft::new(
                        IncidentState::Escalated,
                        TransitionReason::AutoRemediationDisabled,
                        0,
                    )
                    .with_detail("auto-remediation is disabled")
                } else if !incident.auto_remediable {
                    TransitionDraft::new(IncidentState::Escalated, TransitionReason::NotRemediable, 0)
                        .with_detail(format!("{category} is not auto-remediable"))
                } else if table.policy_for(category).is_none() {
                    TransitionDraft::new(IncidentState::Escalated, TransitionReason::NotRemediable, 0)
                        .with_detail(format!("no retry policy for {category}"))
                } else {
                    TransitionDraft::new(
                        IncidentState::Dispatching,
                        TransitionReason::DispatchScheduled,
                        1,
                    )
                };
                Some(draft)
            })
            .await?;
        Ok(committed.is_some_and(|incident| incident.state == IncidentState::Dispatching))
    }

    async fn run_attempt(&self, id: IncidentId, attempt: u32) -> Result<(), EngineError> {
        self.with_incident_lock(id, self.run_attempt_locked(id, attempt))
            .await
    }

    async fn run_attempt_locked(&self, id: IncidentId, attempt: u32) -> Result<(), EngineError> {
        let incident = self.load(id).await?;
        if incident.state != IncidentState::Dispatching || incident.attempt_count != attempt {
            debug!(incident_id = %id, attempt, state = %incident.state, "attempt superseded");
            return Ok(());
        }

        let action = self
            .policies
            .policy_for(&incident.failure_category)
            .and_then(|policy| policy.action().map(str::to_string));
        let cancel = self.cancel_rx(id);

        match self
            .dispatcher
            .dispatch(&incident, attempt, action, cancel)
            .await
        {
            Ok(handle) => {
                let committed = self
                    .transition_locked(id, |i| {
                        (i.state == IncidentState::Dispatching && i.attempt_count == attempt).then(
                            || {
                                TransitionDraft::new(
                                    IncidentState::Monitoring,
                                    TransitionReason::Dispatched,
                                    attempt,
                                )
                                .with_handle(handle.clone())
                            },
                        )
                    })
                    .await?;
                if committed.is_some() {
                    self.watch(id, attempt, handle, Duration::ZERO);
                }
                Ok(())
            }
            Err(DispatchError::Cancelled) => {
                debug!(incident_id = %id, attempt, "dispatch cancelled");
                Ok(())
            }
            Err(DispatchError::Store(e)) => Err(self.store_failure("record attempt", e)),
            Err(e) if !e.is_retryable() => {
                let detail = e.to_string();
                self.transition_locked(id, |i| {
                    (i.state == IncidentState::Dispatching && i.attempt_count == attempt).then(|| {
                        TransitionDraft::new(
                            IncidentState::Escalated,
                            TransitionReason::DispatchRejected,
                            attempt,
                        )
                        .with_detail(detail.clone())
                    })
                })
                .await?;
                Ok(())
            }
            Err(e) => {
                self.handle_failure_locked(id, attempt, TransitionReason::DispatchFailed, e.to_string())
                    .await
            }
        }
    }

    /// Retry or escalate after attempt `attempt` failed
    ///
    /// The incident stays in its current state during the backoff.
    async fn handle_failure_locked(
        &self,
        id: IncidentId,
        attempt: u32,
        reason: TransitionReason,
        cause: String,
    ) -> Result<(), EngineError> {
        let incident = self.load(id).await?;
        if !incident.state.holds_attempt() || incident.attempt_count != attempt {
            debug!(incident_id = %id, attempt, state = %incident.state, "stale failure ignored");
            return Ok(());
        }

        let policy = self.policies.policy_for(&incident.failure_category);
        let max_attempts = policy.as_ref().map_or(0, RetryPolicy::max_attempts);
        if !policy.as_ref().is_some_and(|p| p.allows_retry_after(attempt)) {
            self.escalate_exhausted(id, attempt, max_attempts, reason, &cause)
                .await?;
            return Ok(());
        }

        let delay = policy
            .and_then(|p| p.delay_before(attempt + 1))
            .unwrap_or_default();
        info!(
            incident_id = %id,
            attempt,
            next_attempt = attempt + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            %reason,
            cause = %cause,
            "retry scheduled"
        );
        self.schedule_retry(id, attempt, reason, cause, delay);
        Ok(())
    }

    async fn escalate_exhausted(
        &self,
        id: IncidentId,
        attempt: u32,
        max_attempts: u32,
        reason: TransitionReason,
        cause: &str,
    ) -> Result<(), EngineError> {
        let detail = format!("{reason} on attempt {attempt}/{max_attempts}: {cause}");
        self.transition_locked(id, |i| {
            (i.state.holds_attempt() && i.attempt_count == attempt).then(|| {
                TransitionDraft::new(
                    IncidentState::Escalated,
                    TransitionReason::RetriesExhausted,
                    attempt,
                )
                .with_detail(detail.clone())
            })
        })
        .await?;
        Ok(())
    }

    fn schedule_retry(
        &self,
        id: IncidentId,
        failed_attempt: u32,
        reason: TransitionReason,
        cause: String,
        delay: Duration,
    ) {
        let Some(core) = self.me.upgrade() else {
            return;
        };
        let mut cancel = self.cancel_rx(id);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancelled(&mut cancel) => {
                    debug!(incident_id = %id, "pending retry cancelled");
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
            match core.retry(id, failed_attempt, reason, cause).await {
                Ok(()) => {}
                Err(e) if e.is_fail_closed() => {
                    warn!(incident_id = %id, attempt = failed_attempt + 1, error = %e, "retry deferred until the store recovers");
                }
                Err(e) => {
                    error!(incident_id = %id, attempt = failed_attempt + 1, error = %e, "retry failed");
                }
            }
        });
    }

    // Boxed to keep the spawn in `schedule_retry` from depending on its own future type
    fn retry(
        self: Arc<Self>,
        id: IncidentId,
        failed_attempt: u32,
        reason: TransitionReason,
        cause: String,
    ) -> BoxFuture<'static, Result<(), EngineError>> {
        async move {
            let next = failed_attempt + 1;
            let committed = self
                .with_incident_lock(id, self.retry_locked(id, failed_attempt, reason, &cause))
                .await?;
            if committed {
                self.run_attempt(id, next).await?;
            }
            Ok(())
        }
        .boxed()
    }

    async fn retry_locked(
        &self,
        id: IncidentId,
        failed_attempt: u32,
        reason: TransitionReason,
        cause: &str,
    ) -> Result<bool, EngineError> {
        let incident = self.load(id).await?;
        // The table may have been replaced during the backoff
        let policy = self.policies.policy_for(&incident.failure_category);
        let max_attempts = policy.as_ref().map_or(0, RetryPolicy::max_attempts);
        if !policy.is_some_and(|p| p.allows_retry_after(failed_attempt)) {
            self.escalate_exhausted(id, failed_attempt, max_attempts, reason, cause)
                .await?;
            return Ok(false);
        }

        let committed = self
            .transition_locked(id, |i| {
                (i.state.holds_attempt() && i.attempt_count == failed_attempt).then(|| {
                    TransitionDraft::new(IncidentState::Dispatching, reason, failed_attempt + 1)
                        .with_detail(cause.to_string())
                })
            })
            .await?;
        Ok(committed.is_some())
    }

    async fn resolve_locked(&self, report: &MonitorReport) -> Result<(), EngineError> {
        let attempt = report.attempt_number;
        let detail = format!(
            "attempt {attempt} succeeded after {}s",
            report.elapsed.as_secs()
        );
        let committed = self
            .transition_locked(report.incident_id, |i| {
                (i.state == IncidentState::Monitoring
                    && i.attempt_count == attempt
                    && i.active_attempt_handle.as_ref() == Some(&report.handle))
                    .then(|| {
                        TransitionDraft::new(
                            IncidentState::Resolved,
                            TransitionReason::RemediationSucceeded,
                            attempt,
                        )
                        .with_detail(detail.clone())
                    })
            })
            .await?;
        if committed.is_some() {
            self.finish_attempt(report.incident_id, attempt, AttemptStatus::Succeeded, None)
                .await?;
        }
        Ok(())
    }

    async fn fail_locked(
        &self,
        report: &MonitorReport,
        reason: TransitionReason,
        status: AttemptStatus,
        cause: String,
    ) -> Result<(), EngineError> {
        let id = report.incident_id;
        let attempt = report.attempt_number;
        let incident = self.load(id).await?;
        if incident.state != IncidentState::Monitoring
            || incident.attempt_count != attempt
            || incident.active_attempt_handle.as_ref() != Some(&report.handle)
        {
            debug!(incident_id = %id, attempt, "stale monitor outcome ignored");
            return Ok(());
        }

        warn!(incident_id = %id, attempt, handle = %report.handle, %reason, cause = %cause, "remediation attempt failed");
        self.finish_attempt(id, attempt, status, Some(cause.clone()))
            .await?;
        self.handle_failure_locked(id, attempt, reason, cause).await
    }

    async fn cancel_incident(&self, id: IncidentId, operator: &str) -> Result<Incident, EngineError> {
        let incident = self.load(id).await?;
        if incident.is_terminal() {
            return Err(EngineError::AlreadyTerminal(id));
        }

        if let Some(signal) = self.cancels.get(&id) {
            signal.send_replace(true);
        }
        let stopped = self.monitor.cancel_incident(id);
        debug!(incident_id = %id, stopped, "cancellation signalled");

        self.with_incident_lock(id, self.cancel_locked(id, operator))
            .await
    }

    async fn cancel_locked(&self, id: IncidentId, operator: &str) -> Result<Incident, EngineError> {
        let detail = format!("cancelled by {operator}");
        let committed = self
            .transition_locked(id, |i| {
                (!i.is_terminal()).then(|| {
                    TransitionDraft::new(
                        IncidentState::Escalated,
                        TransitionReason::ManualOverride,
                        i.attempt_count,
                    )
                    .with_detail(detail.clone())
                })
            })
            .await?;
        let Some(incident) = committed else {
            return Err(EngineError::AlreadyTerminal(id));
        };
        if incident.attempt_count > 0 {
            self.finish_attempt(id, incident.attempt_count, AttemptStatus::Cancelled, Some(detail))
                .await?;
        }
        Ok(incident)
    }

    async fn resume(&self) -> Result<ResumeReport, EngineError> {
        self.ensure_available().await?;
        let mut report = ResumeReport::default();

        let fresh = self
            .store_call("list new incidents", || {
                self.store.list_in_state(IncidentState::New)
            })
            .await?;
        for incident in fresh {
            self.begin(incident.id).await?;
            report.restarted += 1;
        }

        let dispatching = self
            .store_call("list dispatching incidents", || {
                self.store.list_in_state(IncidentState::Dispatching)
            })
            .await?;
        for incident in dispatching {
            let (id, attempt) = (incident.id, incident.attempt_count);
            let record = self
                .store_call("load attempt", || self.store.attempt(id, attempt))
                .await?;
            match record {
                Some(record) if record.status == AttemptStatus::DispatchFailed => {
                    let cause = record.failure_reason.unwrap_or_default();
                    self.with_incident_lock(
                        id,
                        self.handle_failure_locked(id, attempt, TransitionReason::DispatchFailed, cause),
                    )
                    .await?;
                    report.rescheduled += 1;
                }
                _ => {
                    self.run_attempt(id, attempt).await?;
                    report.redispatched += 1;
                }
            }
        }

        let monitoring = self
            .store_call("list monitoring incidents", || {
                self.store.list_in_state(IncidentState::Monitoring)
            })
            .await?;
        for incident in monitoring {
            let (id, attempt) = (incident.id, incident.attempt_count);
            let Some(handle) = incident.active_attempt_handle.clone() else {
                warn!(incident_id = %id, "monitoring incident without handle, skipping");
                continue;
            };
            let record = self
                .store_call("load attempt", || self.store.attempt(id, attempt))
                .await?;
            let started = record
                .as_ref()
                .map_or(incident.last_transition_at, |r| r.started_at);
            let elapsed = (Utc::now() - started).to_std().unwrap_or_default();
            let outcome_report = |outcome| MonitorReport {
                incident_id: id,
                attempt_number: attempt,
                handle: handle.clone(),
                outcome,
                elapsed,
            };

            match record.as_ref().map(|r| r.status) {
                Some(AttemptStatus::Succeeded) => {
                    let done = outcome_report(MonitorOutcome::Succeeded);
                    self.with_incident_lock(id, self.resolve_locked(&done))
                        .await?;
                    report.resolved += 1;
                }
                Some(status @ (AttemptStatus::Failed | AttemptStatus::TimedOut)) => {
                    let reason = if status == AttemptStatus::TimedOut {
                        TransitionReason::MonitorTimeout
                    } else {
                        TransitionReason::RemediationFailed
                    };
                    let cause = record
                        .and_then(|r| r.failure_reason)
                        .unwrap_or_else(|| reason.to_string());
                    self.with_incident_lock(
                        id,
                        self.handle_failure_locked(id, attempt, reason, cause),
                    )
                    .await?;
                    report.rescheduled += 1;
                }
                _ => {
                    self.watch(id, attempt, handle, elapsed);
                    report.rewatched += 1;
                }
            }
        }

        info!(
            restarted = report.restarted,
            redispatched = report.redispatched,
            rescheduled = report.rescheduled,
            rewatched = report.rewatched,
            resolved = report.resolved,
            "resume complete"
        );
        Ok(report)
    }

    async fn stats(&self) -> Result<IncidentStats, EngineError> {
        let incidents = self
            .store_call("list incidents", || self.store.list_all())
            .await?;

        let mut stats = IncidentStats {
            total: incidents.len(),
            ..IncidentStats::default()
        };
        let mut latencies = Vec::new();
        for incident in &incidents {
            match incident.state {
                IncidentState::New => stats.new += 1,
                IncidentState::Dispatching => stats.dispatching += 1,
                IncidentState::Monitoring => stats.monitoring += 1,
                IncidentState::Resolved => stats.resolved += 1,
                IncidentState::Escalated => stats.escalated += 1,
            }
            match incident.sla_status() {
                SlaStatus::Met => stats.sla_met += 1,
                SlaStatus::Breached => stats.sla_breached += 1,
                SlaStatus::Pending => {}
            }
            stats.attempts += u64::from(incident.attempt_count);
            latencies.extend(incident.resolution_latency());
        }
        if !latencies.is_empty() {
            let count = u32::try_from(latencies.len()).unwrap_or(u32::MAX);
            stats.mean_time_to_resolve = Some(latencies.iter().sum::<Duration>() / count);
        }
        Ok(stats)
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for signal in self.cancels.iter() {
            signal.value().send_replace(true);
        }
        self.monitor.shutdown().await;
        info!("remediation engine stopped");
    }

    /// Apply one transition with compare-and-swap, re-reading on conflict
    ///
    /// `decide` sees the freshly loaded incident and returns `None` when the
    /// transition no longer applies. Caller holds the incident lock.
    async fn transition_locked<D>(
        &self,
        id: IncidentId,
        decide: D,
    ) -> Result<Option<Incident>, EngineError>
    where
        D: Fn(&Incident) -> Option<TransitionDraft> + Send + Sync,
    {
        for _ in 0..MAX_CAS_RETRIES {
            let mut incident = self.load(id).await?;
            let Some(draft) = decide(&incident) else {
                return Ok(None);
            };
            let version = incident.version();
            incident.record(draft, Utc::now())?;

            match self
                .store_call("compare-and-swap incident", || {
                    self.store.compare_and_swap(version, &incident)
                })
                .await
            {
                Ok(()) => {
                    self.committed(&incident);
                    return Ok(Some(incident));
                }
                Err(EngineError::Store(StoreError::Conflict { actual, .. })) => {
                    debug!(incident_id = %id, expected = version, actual, "version conflict, re-reading incident");
                }
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::ConflictRetriesExhausted {
            id,
            attempts: MAX_CAS_RETRIES,
        })
    }

    fn committed(&self, incident: &Incident) {
        let Some(event) = incident.last_event() else {
            return;
        };
        info!(
            incident_id = %incident.id,
            from = event.from_state.map_or("-", IncidentState::as_str),
            to = %event.to_state,
            reason = %event.reason,
            attempt = event.attempt_number,
            "incident transition"
        );
        self.notify(incident, event.clone());

        if incident.is_terminal() {
            self.cancels.remove(&incident.id);
            self.monitor.cancel_incident(incident.id);
            if let Some(latency) = incident.resolution_latency() {
                info!(
                    incident_id = %incident.id,
                    latency_secs = latency.as_secs(),
                    sla = ?incident.sla_status(),
                    "incident resolved"
                );
            }
        }
    }

    fn notify(&self, incident: &Incident, audit: AuditEvent) {
        self.notifier.on_transition(TransitionEvent {
            audit,
            fingerprint: incident.fingerprint.clone(),
            category: incident.failure_category.clone(),
        });
    }

    fn watch(&self, id: IncidentId, attempt: u32, handle: AttemptHandle, already_elapsed: Duration) {
        let Some(core) = self.me.upgrade() else {
            return;
        };
        let sink: Arc<dyn OutcomeSink> = core;
        self.monitor.watch(
            WatchRequest {
                incident_id: id,
                attempt_number: attempt,
                handle,
                already_elapsed,
            },
            self.cancel_rx(id),
            sink,
        );
    }

    fn cancel_rx(&self, id: IncidentId) -> watch::Receiver<bool> {
        self.cancels
            .entry(id)
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    async fn finish_attempt(
        &self,
        id: IncidentId,
        attempt: u32,
        status: AttemptStatus,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        let record = self
            .store_call("load attempt", || self.store.attempt(id, attempt))
            .await?;
        if let Some(mut record) = record {
            if !record.status.is_finished() {
                record.finish(status, reason, Utc::now());
                self.store_call("record attempt", || self.store.put_attempt(&record))
                    .await?;
            }
        }
        Ok(())
    }

    async fn load(&self, id: IncidentId) -> Result<Incident, EngineError> {
        self.store_call("get incident", || self.store.get(id))
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    async fn with_incident_lock<T, Fut>(&self, id: IncidentId, work: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        let guard = self.incident_locks.lock(&id).await;
        let out = work.await;
        drop(guard);
        self.incident_locks.prune(&id);
        out
    }

    /// Clear the halt once the store answers again
    async fn ensure_available(&self) -> Result<(), EngineError> {
        if !self.halted.load(Ordering::SeqCst) {
            return Ok(());
        }
        match self.store.ping().await {
            Ok(()) => {
                self.lift_halt();
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "incident store still unavailable");
                Err(EngineError::Halted)
            }
        }
    }

    /// Leave the halted state and re-drive every open incident
    ///
    /// Outcomes and retries that failed to commit during the outage left
    /// their incidents without a driver; `resume` picks them up again.
    fn lift_halt(&self) {
        if !self.halted.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("incident store reachable again, resuming alert intake");
        if let Some(core) = self.me.upgrade() {
            tokio::spawn(core.recover());
        }
    }

    fn recover(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            match self.resume().await {
                Ok(report) => info!(?report, "open incidents recovered after store outage"),
                Err(e) => error!(error = %e, "recovery after store outage failed"),
            }
        }
        .boxed()
    }

    /// Ping the store until it answers, then lift the halt
    fn watch_store_health(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            let interval = self.config.store_retry_backoff().max(MIN_STORE_PING_INTERVAL);
            loop {
                tokio::time::sleep(interval).await;
                if self.closed.load(Ordering::SeqCst) || !self.halted.load(Ordering::SeqCst) {
                    return;
                }
                match self.store.ping().await {
                    Ok(()) => {
                        self.lift_halt();
                        return;
                    }
                    Err(e) => debug!(error = %e, "incident store still unavailable"),
                }
            }
        }
        .boxed()
    }

    /// Run a store operation, retrying while the store is unavailable
    async fn store_call<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let retries = self.config.store.retry_attempts;
        let mut retried = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_unavailable() && retried < retries => {
                    retried += 1;
                    warn!(operation, retry = retried, error = %e, "store call failed, retrying");
                    tokio::time::sleep(self.config.store_retry_backoff()).await;
                }
                Err(e) => return Err(self.store_failure(operation, e)),
            }
        }
    }

    fn store_failure(&self, operation: &'static str, e: StoreError) -> EngineError {
        if !e.is_unavailable() {
            return EngineError::Store(e);
        }
        if !self.halted.swap(true, Ordering::SeqCst) {
            error!(operation, error = %e, "incident store unavailable, halting alert intake");
            if let Some(core) = self.me.upgrade() {
                tokio::spawn(core.watch_store_health());
            }
        }
        EngineError::StoreUnavailable(e.to_string())
    }
}

#[async_trait]
impl OutcomeSink for EngineCore {
    async fn on_outcome(&self, report: MonitorReport) {
        let id = report.incident_id;
        let result = match &report.outcome {
            MonitorOutcome::Succeeded => self.with_incident_lock(id, self.resolve_locked(&report)).await,
            MonitorOutcome::Failed(cause) => {
                self.with_incident_lock(
                    id,
                    self.fail_locked(
                        &report,
                        TransitionReason::RemediationFailed,
                        AttemptStatus::Failed,
                        cause.clone(),
                    ),
                )
                .await
            }
            MonitorOutcome::TimedOut => {
                let cause = format!(
                    "no terminal status after {}s",
                    report.elapsed.as_secs()
                );
                self.with_incident_lock(
                    id,
                    self.fail_locked(
                        &report,
                        TransitionReason::MonitorTimeout,
                        AttemptStatus::TimedOut,
                        cause,
                    ),
                )
                .await
            }
            MonitorOutcome::Cancelled => return,
        };
        match result {
            Ok(()) => {}
            Err(e) if e.is_fail_closed() => {
                warn!(incident_id = %id, attempt = report.attempt_number, error = %e, "remediation outcome deferred until the store recovers");
            }
            Err(e) => {
                error!(incident_id = %id, attempt = report.attempt_number, error = %e, "could not apply remediation outcome");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{ActuatorStatus, RemediationRequest};
    use crate::error::{ActuatorError, ClassifyError};
    use crate::store::MemoryStore;
    use crate::types::{FailureCategory, Severity};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    struct FixedClassifier {
        category: &'static str,
        remediable: bool,
    }

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(&self, alert: &RawAlert) -> Result<Classification, ClassifyError> {
            Ok(Classification {
                fingerprint: alert.default_fingerprint(),
                category: FailureCategory::new(self.category),
                is_remediable: self.remediable,
                severity: Severity::High,
            })
        }
    }

    struct BrokenClassifier;

    #[async_trait]
    impl Classifier for BrokenClassifier {
        async fn classify(&self, _: &RawAlert) -> Result<Classification, ClassifyError> {
            Err(ClassifyError("model endpoint timed out".into()))
        }
    }

    /// Each invoke pops the next terminal status for that attempt's handle
    #[derive(Default)]
    struct QueueActuator {
        outcomes: Mutex<VecDeque<ActuatorStatus>>,
        handles: Mutex<std::collections::HashMap<String, ActuatorStatus>>,
        invocations: Mutex<Vec<RemediationRequest>>,
    }

    impl QueueActuator {
        fn new(outcomes: Vec<ActuatorStatus>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Actuator for QueueActuator {
        async fn invoke(&self, request: RemediationRequest) -> Result<AttemptHandle, DispatchError> {
            let handle = format!("{}-{}", request.incident_id, request.attempt_number);
            let status = self
                .outcomes
                .lock()
                .pop_front()
                .unwrap_or(ActuatorStatus::Pending);
            self.handles.lock().insert(handle.clone(), status);
            self.invocations.lock().push(request);
            Ok(AttemptHandle::new(handle))
        }

        async fn status(&self, handle: &AttemptHandle) -> Result<ActuatorStatus, ActuatorError> {
            Ok(self
                .handles
                .lock()
                .get(handle.as_str())
                .cloned()
                .unwrap_or(ActuatorStatus::Pending))
        }
    }

    fn engine(
        config: RemedyConfig,
        classifier: impl Classifier + 'static,
        actuator: Arc<QueueActuator>,
    ) -> (RemediationEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine =
            RemediationEngine::new(config, store.clone(), Arc::new(classifier), actuator).unwrap();
        (engine, store)
    }

    async fn settle(engine: &RemediationEngine, id: IncidentId) -> Incident {
        for _ in 0..10_000 {
            let incident = engine.incident(id).await.unwrap().unwrap();
            if incident.is_terminal() {
                return incident;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        panic!("incident {id} never reached a terminal state");
    }

    fn reasons(incident: &Incident) -> Vec<TransitionReason> {
        incident.history().iter().map(|e| e.reason).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn kill_switch_escalates_immediately() {
        let actuator = Arc::new(QueueActuator::default());
        let (engine, _) = engine(
            RemedyConfig::new().with_auto_remediation(false),
            FixedClassifier { category: "GatewayTimeout", remediable: true },
            actuator.clone(),
        );

        let outcome = engine
            .submit_alert(RawAlert::new("adf", "pipelineA", "Gateway timeout"))
            .await
            .unwrap();

        assert_eq!(outcome.state, IncidentState::Escalated);
        let incident = engine.incident(outcome.incident_id).await.unwrap().unwrap();
        assert_eq!(
            reasons(&incident),
            vec![TransitionReason::Created, TransitionReason::AutoRemediationDisabled]
        );
        assert!(actuator.invocations.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn classifier_failure_falls_back_to_unknown() {
        let (engine, _) = engine(
            RemedyConfig::new(),
            BrokenClassifier,
            Arc::new(QueueActuator::default()),
        );

        let outcome = engine
            .submit_alert(RawAlert::new("adf", "pipelineA", "???"))
            .await
            .unwrap();

        let incident = engine.incident(outcome.incident_id).await.unwrap().unwrap();
        assert_eq!(incident.state, IncidentState::Escalated);
        assert_eq!(incident.failure_category, FailureCategory::unknown());
        assert_eq!(incident.fingerprint.as_str(), "adf/pipelineA");
        assert_eq!(incident.history()[1].reason, TransitionReason::NotRemediable);
    }

    #[tokio::test(start_paused = true)]
    async fn remediable_verdict_without_policy_escalates() {
        let (engine, _) = engine(
            RemedyConfig::new(),
            FixedClassifier { category: "SomethingNew", remediable: true },
            Arc::new(QueueActuator::default()),
        );

        let outcome = engine
            .submit_alert(RawAlert::new("adf", "pipelineA", "new failure"))
            .await
            .unwrap();
        let history = engine.history(outcome.incident_id).await.unwrap();
        assert_eq!(history[1].reason, TransitionReason::NotRemediable);
        assert_eq!(history[1].detail.as_deref(), Some("no retry policy for SomethingNew"));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhausted_after_budget() {
        let actuator = Arc::new(QueueActuator::new(vec![
            ActuatorStatus::Failed("boom 1".into()),
            ActuatorStatus::Failed("boom 2".into()),
            ActuatorStatus::Failed("boom 3".into()),
        ]));
        let (engine, _) = engine(
            RemedyConfig::new(),
            FixedClassifier { category: "GatewayTimeout", remediable: true },
            actuator.clone(),
        );

        let outcome = engine
            .submit_alert(RawAlert::new("adf", "pipelineA", "Gateway timeout"))
            .await
            .unwrap();
        assert_eq!(outcome.state, IncidentState::Monitoring);

        let incident = settle(&engine, outcome.incident_id).await;
        assert_eq!(incident.state, IncidentState::Escalated);
        assert_eq!(incident.attempt_count, 3);
        let last = incident.last_event().unwrap();
        assert_eq!(last.reason, TransitionReason::RetriesExhausted);
        assert!(last.detail.as_deref().unwrap().contains("boom 3"));
        assert_eq!(actuator.invocations.lock().len(), 3);

        let attempts = engine.attempts(incident.id).await.unwrap();
        assert!(attempts.iter().all(|a| a.status == AttemptStatus::Failed));
        assert!(incident.verify_history().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_pending_retry() {
        let actuator = Arc::new(QueueActuator::new(vec![ActuatorStatus::Failed("boom".into())]));
        let (engine, _) = engine(
            RemedyConfig::new(),
            FixedClassifier { category: "GatewayTimeout", remediable: true },
            actuator.clone(),
        );

        let outcome = engine
            .submit_alert(RawAlert::new("adf", "pipelineA", "Gateway timeout"))
            .await
            .unwrap();
        // First poll at 30s reports failure; the retry then waits 30s more
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(actuator.invocations.lock().len(), 1);

        let incident = engine
            .cancel_incident(outcome.incident_id, "oncall")
            .await
            .unwrap();
        assert_eq!(incident.state, IncidentState::Escalated);
        assert_eq!(
            incident.last_event().unwrap().reason,
            TransitionReason::ManualOverride
        );

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(actuator.invocations.lock().len(), 1);
        assert!(matches!(
            engine.cancel_incident(outcome.incident_id, "oncall").await,
            Err(EngineError::AlreadyTerminal(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn store_outage_halts_intake_until_ping_succeeds() {
        let (engine, store) = engine(
            RemedyConfig::new().with_store_retry(1, 10),
            FixedClassifier { category: "UserErrorMissingFile", remediable: false },
            Arc::new(QueueActuator::default()),
        );

        store.simulate_outage(true);
        let err = engine
            .submit_alert(RawAlert::new("adf", "pipelineA", "missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StoreUnavailable(_)));
        assert!(engine.is_halted());

        let err = engine
            .submit_alert(RawAlert::new("adf", "pipelineB", "missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Halted));

        store.simulate_outage(false);
        let outcome = engine
            .submit_alert(RawAlert::new("adf", "pipelineB", "missing"))
            .await
            .unwrap();
        assert!(!engine.is_halted());
        assert_eq!(outcome.state, IncidentState::Escalated);
    }

    #[tokio::test(start_paused = true)]
    async fn halt_lifts_without_new_alerts() {
        let (engine, store) = engine(
            RemedyConfig::new().with_store_retry(1, 10),
            FixedClassifier { category: "UserErrorMissingFile", remediable: false },
            Arc::new(QueueActuator::default()),
        );

        store.simulate_outage(true);
        assert!(engine
            .submit_alert(RawAlert::new("adf", "pipelineA", "missing"))
            .await
            .is_err());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(engine.is_halted());

        store.simulate_outage(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!engine.is_halted());
    }

    /// Memory store whose compare-and-swap can be made to lose races
    #[derive(Default)]
    struct ContendedStore {
        inner: MemoryStore,
        /// Conflicts to report before writes go through
        conflicts: AtomicU32,
        /// Escalate behind the engine's back just before it resolves
        escalate_first: AtomicBool,
    }

    #[async_trait]
    impl IncidentStore for ContendedStore {
        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }

        async fn insert(&self, incident: &Incident) -> Result<(), StoreError> {
            self.inner.insert(incident).await
        }

        async fn get(&self, id: IncidentId) -> Result<Option<Incident>, StoreError> {
            self.inner.get(id).await
        }

        async fn find_active(&self, fingerprint: &Fingerprint) -> Result<Option<Incident>, StoreError> {
            self.inner.find_active(fingerprint).await
        }

        async fn find_by_fingerprint(
            &self,
            fingerprint: &Fingerprint,
        ) -> Result<Vec<Incident>, StoreError> {
            self.inner.find_by_fingerprint(fingerprint).await
        }

        async fn list_in_state(&self, state: IncidentState) -> Result<Vec<Incident>, StoreError> {
            self.inner.list_in_state(state).await
        }

        async fn list_all(&self) -> Result<Vec<Incident>, StoreError> {
            self.inner.list_all().await
        }

        async fn compare_and_swap(
            &self,
            expected_version: u64,
            incident: &Incident,
        ) -> Result<(), StoreError> {
            if self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Conflict {
                    id: incident.id,
                    expected: expected_version,
                    actual: expected_version + 1,
                });
            }
            if incident.state == IncidentState::Resolved && self.escalate_first.swap(false, Ordering::SeqCst) {
                let mut current = self.inner.get(incident.id).await?.unwrap();
                let version = current.version();
                current
                    .record(
                        TransitionDraft::new(
                            IncidentState::Escalated,
                            TransitionReason::ManualOverride,
                            current.attempt_count,
                        )
                        .with_detail("escalated by another writer"),
                        Utc::now(),
                    )
                    .unwrap();
                self.inner.compare_and_swap(version, &current).await?;
            }
            self.inner.compare_and_swap(expected_version, incident).await
        }

        async fn attempt(
            &self,
            id: IncidentId,
            attempt_number: u32,
        ) -> Result<Option<AttemptRecord>, StoreError> {
            self.inner.attempt(id, attempt_number).await
        }

        async fn put_attempt(&self, record: &AttemptRecord) -> Result<(), StoreError> {
            self.inner.put_attempt(record).await
        }

        async fn attempts(&self, id: IncidentId) -> Result<Vec<AttemptRecord>, StoreError> {
            self.inner.attempts(id).await
        }
    }

    fn contended_engine(store: Arc<ContendedStore>, actuator: Arc<QueueActuator>) -> RemediationEngine {
        RemediationEngine::new(
            RemedyConfig::new(),
            store,
            Arc::new(FixedClassifier { category: "GatewayTimeout", remediable: true }),
            actuator,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn lost_compare_and_swap_retries_on_fresh_read() {
        let store = Arc::new(ContendedStore::default());
        store.conflicts.store(2, Ordering::SeqCst);
        let engine = contended_engine(
            store.clone(),
            Arc::new(QueueActuator::new(vec![ActuatorStatus::Succeeded])),
        );

        let outcome = engine
            .submit_alert(RawAlert::new("adf", "pipelineA", "gateway timeout"))
            .await
            .unwrap();
        assert_eq!(outcome.state, IncidentState::Monitoring);
        assert_eq!(store.conflicts.load(Ordering::SeqCst), 0);

        let incident = settle(&engine, outcome.incident_id).await;
        assert_eq!(
            reasons(&incident),
            vec![
                TransitionReason::Created,
                TransitionReason::DispatchScheduled,
                TransitionReason::Dispatched,
                TransitionReason::RemediationSucceeded,
            ]
        );
        assert!(incident.verify_history().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_writer_wins_and_engine_rereads() {
        let store = Arc::new(ContendedStore::default());
        store.escalate_first.store(true, Ordering::SeqCst);
        let engine = contended_engine(
            store.clone(),
            Arc::new(QueueActuator::new(vec![ActuatorStatus::Succeeded])),
        );

        let outcome = engine
            .submit_alert(RawAlert::new("adf", "pipelineA", "gateway timeout"))
            .await
            .unwrap();
        let before = engine.history(outcome.incident_id).await.unwrap().len();

        let incident = settle(&engine, outcome.incident_id).await;
        assert_eq!(incident.state, IncidentState::Escalated);
        assert_eq!(incident.history().len(), before + 1);
        assert_eq!(
            incident.last_event().map(|e| e.reason),
            Some(TransitionReason::ManualOverride)
        );
        assert!(incident.verify_history().is_ok());
        let attempt = engine.attempts(outcome.incident_id).await.unwrap();
        assert_eq!(attempt[0].status, AttemptStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn endless_conflicts_give_up() {
        let store = Arc::new(ContendedStore::default());
        store.conflicts.store(u32::MAX, Ordering::SeqCst);
        let engine = contended_engine(store.clone(), Arc::new(QueueActuator::default()));

        let err = engine
            .submit_alert(RawAlert::new("adf", "pipelineA", "gateway timeout"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::ConflictRetriesExhausted { attempts: MAX_CAS_RETRIES, .. }
        ));
        assert!(!engine.is_halted());

        let stuck = store.inner.list_in_state(IncidentState::New).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].version(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_summarize_outcomes() {
        let actuator = Arc::new(QueueActuator::new(vec![ActuatorStatus::Succeeded]));
        let store = Arc::new(MemoryStore::new());
        let engine = RemediationEngine::new(
            RemedyConfig::new(),
            store,
            Arc::new(FixedClassifier { category: "GatewayTimeout", remediable: true }),
            actuator,
        )
        .unwrap();

        let first = engine
            .submit_alert(RawAlert::new("adf", "pipelineA", "timeout"))
            .await
            .unwrap();
        settle(&engine, first.incident_id).await;
        engine.set_auto_remediation(false);
        engine
            .submit_alert(RawAlert::new("adf", "pipelineB", "timeout"))
            .await
            .unwrap();

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.escalated, 1);
        assert_eq!(stats.open(), 0);
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.sla_met + stats.sla_breached, 1);
        assert!(stats.mean_time_to_resolve.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_refuses_new_alerts() {
        let (engine, _) = engine(
            RemedyConfig::new(),
            FixedClassifier { category: "GatewayTimeout", remediable: true },
            Arc::new(QueueActuator::default()),
        );
        engine
            .submit_alert(RawAlert::new("adf", "pipelineA", "timeout"))
            .await
            .unwrap();
        assert_eq!(engine.monitored_handles().len(), 1);

        engine.shutdown().await;
        assert!(engine.monitored_handles().is_empty());
        assert!(matches!(
            engine.submit_alert(RawAlert::new("adf", "pipelineB", "timeout")).await,
            Err(EngineError::ShutDown)
        ));
    }
}

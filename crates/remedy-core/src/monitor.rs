//! Remediation monitoring
//!
//! One supervised task per in-flight attempt polls the actuator until it
//! reports a terminal status or the absolute time budget runs out. Tasks are
//! registered by attempt handle so they can be enumerated, cancelled
//! individually or per incident, and re-created after a restart.

use crate::actuator::{Actuator, ActuatorStatus};
use crate::sync::cancelled;
use crate::types::{AttemptHandle, IncidentId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Polling cadence and ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    /// Absolute budget per attempt, independent of the poll interval
    pub max_duration: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_duration: Duration::from_secs(60 * 60),
        }
    }
}

/// How a watched attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
    /// Stopped by the registry; never delivered to the sink
    Cancelled,
}

/// Terminal report for one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorReport {
    pub incident_id: IncidentId,
    pub attempt_number: u32,
    pub handle: AttemptHandle,
    pub outcome: MonitorOutcome,
    /// Time since the attempt started, including time before a restart
    pub elapsed: Duration,
}

/// Receives terminal outcomes from monitor tasks
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn on_outcome(&self, report: MonitorReport);
}

/// What to watch
#[derive(Debug, Clone)]
pub struct WatchRequest {
    pub incident_id: IncidentId,
    pub attempt_number: u32,
    pub handle: AttemptHandle,
    /// Budget already consumed before this watch began (non-zero on resume)
    pub already_elapsed: Duration,
}

#[derive(Debug)]
struct MonitorTask {
    generation: u64,
    incident_id: IncidentId,
    attempt_number: u32,
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Registry of polling tasks keyed by attempt handle
pub struct RemediationMonitor {
    actuator: Arc<dyn Actuator>,
    settings: MonitorSettings,
    tasks: Arc<DashMap<AttemptHandle, MonitorTask>>,
    generation: AtomicU64,
}

impl RemediationMonitor {
    #[must_use]
    pub fn new(actuator: Arc<dyn Actuator>, settings: MonitorSettings) -> Self {
        Self {
            actuator,
            settings,
            tasks: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn settings(&self) -> MonitorSettings {
        self.settings
    }

    /// Start watching an attempt
    ///
    /// `incident_cancel` is the incident's cancellation signal; the task also
    /// stops when cancelled through the registry. Returns `false` if the handle
    /// is already being watched.
    pub fn watch(
        &self,
        request: WatchRequest,
        incident_cancel: watch::Receiver<bool>,
        sink: Arc<dyn OutcomeSink>,
    ) -> bool {
        match self.tasks.entry(request.handle.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!(handle = %request.handle, "attempt already monitored");
                false
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let (stop, stop_rx) = watch::channel(false);
                let incident_id = request.incident_id;
                let attempt_number = request.attempt_number;
                let join = tokio::spawn(run_task(
                    self.actuator.clone(),
                    self.settings,
                    self.tasks.clone(),
                    generation,
                    request,
                    stop_rx,
                    incident_cancel,
                    sink,
                ));
                slot.insert(MonitorTask {
                    generation,
                    incident_id,
                    attempt_number,
                    stop,
                    join,
                });
                true
            }
        }
    }

    /// Stop watching one handle; no outcome is delivered
    pub fn cancel(&self, handle: &AttemptHandle) -> bool {
        match self.tasks.remove(handle) {
            Some((_, task)) => {
                let _ = task.stop.send(true);
                true
            }
            None => false,
        }
    }

    /// Stop every task belonging to an incident, returning how many were stopped
    pub fn cancel_incident(&self, incident_id: IncidentId) -> usize {
        let handles: Vec<AttemptHandle> = self
            .tasks
            .iter()
            .filter(|entry| entry.incident_id == incident_id)
            .map(|entry| entry.key().clone())
            .collect();
        handles.iter().filter(|h| self.cancel(h)).count()
    }

    /// Handles currently watched, with their incident and attempt number
    #[must_use]
    pub fn active_handles(&self) -> Vec<(AttemptHandle, IncidentId, u32)> {
        self.tasks
            .iter()
            .map(|entry| (entry.key().clone(), entry.incident_id, entry.attempt_number))
            .collect()
    }

    #[must_use]
    pub fn is_watching(&self, handle: &AttemptHandle) -> bool {
        self.tasks.contains_key(handle)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stop all tasks and wait for them to exit
    pub async fn shutdown(&self) {
        let handles: Vec<AttemptHandle> = self.tasks.iter().map(|e| e.key().clone()).collect();
        let mut joins = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some((_, task)) = self.tasks.remove(&handle) {
                let _ = task.stop.send(true);
                joins.push(task.join);
            }
        }
        for join in joins {
            if let Err(e) = join.await {
                warn!(error = %e, "monitor task ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for RemediationMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemediationMonitor")
            .field("settings", &self.settings)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_task(
    actuator: Arc<dyn Actuator>,
    settings: MonitorSettings,
    tasks: Arc<DashMap<AttemptHandle, MonitorTask>>,
    generation: u64,
    request: WatchRequest,
    mut stop: watch::Receiver<bool>,
    mut incident_cancel: watch::Receiver<bool>,
    sink: Arc<dyn OutcomeSink>,
) {
    let started = Instant::now();
    let budget = settings.max_duration.saturating_sub(request.already_elapsed);

    let poll = async {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + settings.poll_interval,
            settings.poll_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match actuator.status(&request.handle).await {
                Ok(ActuatorStatus::Pending) => {}
                Ok(ActuatorStatus::Succeeded) => return MonitorOutcome::Succeeded,
                Ok(ActuatorStatus::Failed(reason)) => return MonitorOutcome::Failed(reason),
                Err(e) => {
                    warn!(incident_id = %request.incident_id, handle = %request.handle, error = %e, "status poll failed");
                }
            }
        }
    };

    let outcome = tokio::select! {
        biased;
        () = cancelled(&mut stop) => MonitorOutcome::Cancelled,
        () = cancelled(&mut incident_cancel) => MonitorOutcome::Cancelled,
        result = tokio::time::timeout(budget, poll) => result.unwrap_or(MonitorOutcome::TimedOut),
    };

    tasks.remove_if(&request.handle, |_, task| task.generation == generation);

    if outcome == MonitorOutcome::Cancelled {
        debug!(incident_id = %request.incident_id, handle = %request.handle, "monitoring cancelled");
        return;
    }

    let report = MonitorReport {
        incident_id: request.incident_id,
        attempt_number: request.attempt_number,
        handle: request.handle,
        outcome,
        elapsed: request.already_elapsed + started.elapsed(),
    };
    sink.on_outcome(report).await;
}

//! Remediation dispatch
//!
//! Hands one attempt to the actuator and persists the returned handle.
//! Dispatch is idempotent per `(incident, attempt)`: concurrent callers are
//! serialized and an attempt that already has a handle is never invoked again,
//! including after a process restart.

use crate::actuator::{Actuator, RemediationRequest};
use crate::error::DispatchError;
use crate::incident::{AttemptRecord, Incident};
use crate::store::IncidentStore;
use crate::sync::{cancelled, KeyedLocks};
use crate::types::{AttemptHandle, IncidentId};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct RemediationDispatcher {
    actuator: Arc<dyn Actuator>,
    store: Arc<dyn IncidentStore>,
    inflight: KeyedLocks<(IncidentId, u32)>,
}

impl RemediationDispatcher {
    #[must_use]
    pub fn new(actuator: Arc<dyn Actuator>, store: Arc<dyn IncidentStore>) -> Self {
        Self {
            actuator,
            store,
            inflight: KeyedLocks::new(),
        }
    }

    /// Dispatch attempt `attempt_number` of `incident`
    ///
    /// The actuator call is raced against `cancel`. On success the handle is
    /// stored in a `Running` attempt record before it is returned.
    ///
    /// # Errors
    /// - `DispatchError::Unreachable` / `Rejected` from the actuator
    /// - `DispatchError::Cancelled` if `cancel` fired first
    /// - `DispatchError::Store` if the handle could not be persisted
    pub async fn dispatch(
        &self,
        incident: &Incident,
        attempt_number: u32,
        action: Option<String>,
        cancel: watch::Receiver<bool>,
    ) -> Result<AttemptHandle, DispatchError> {
        let key = (incident.id, attempt_number);
        let result = {
            let _guard = self.inflight.lock(&key).await;
            self.dispatch_locked(incident, attempt_number, action, cancel)
                .await
        };
        self.inflight.prune(&key);
        result
    }

    async fn dispatch_locked(
        &self,
        incident: &Incident,
        attempt_number: u32,
        action: Option<String>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<AttemptHandle, DispatchError> {
        if let Some(handle) = self
            .store
            .attempt(incident.id, attempt_number)
            .await?
            .and_then(|record| record.handle)
        {
            debug!(incident_id = %incident.id, attempt = attempt_number, %handle, "attempt already dispatched");
            return Ok(handle);
        }

        let request = RemediationRequest {
            incident_id: incident.id,
            category: incident.failure_category.clone(),
            attempt_number,
            action,
        };

        let outcome = tokio::select! {
            biased;
            () = cancelled(&mut cancel) => Err(DispatchError::Cancelled),
            result = self.actuator.invoke(request) => result,
        };

        match outcome {
            Ok(handle) => {
                let record =
                    AttemptRecord::running(incident.id, attempt_number, handle.clone(), Utc::now());
                self.store.put_attempt(&record).await?;
                info!(incident_id = %incident.id, attempt = attempt_number, %handle, "remediation dispatched");
                Ok(handle)
            }
            Err(DispatchError::Cancelled) => Err(DispatchError::Cancelled),
            Err(e) => {
                warn!(incident_id = %incident.id, attempt = attempt_number, error = %e, "dispatch failed");
                let record = AttemptRecord::dispatch_failed(
                    incident.id,
                    attempt_number,
                    e.to_string(),
                    Utc::now(),
                );
                if let Err(store_err) = self.store.put_attempt(&record).await {
                    warn!(incident_id = %incident.id, error = %store_err, "could not record failed dispatch");
                }
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for RemediationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemediationDispatcher")
            .field("inflight", &self.inflight.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::MockActuator;
    use crate::incident::{AttemptStatus, NewIncident};
    use crate::store::MemoryStore;
    use crate::types::{FailureCategory, Fingerprint, Severity};
    use std::time::Duration;

    fn incident() -> Incident {
        Incident::open(
            NewIncident {
                fingerprint: Fingerprint::new("adf/pipelineA"),
                category: FailureCategory::new("GatewayTimeout"),
                auto_remediable: true,
                severity: Severity::Medium,
                source: "adf".into(),
                resource: "pipelineA".into(),
                summary: "Gateway timeout".into(),
            },
            Utc::now(),
        )
    }

    fn never_cancelled() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the rest of the test process
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn persists_handle_before_returning() {
        let mut actuator = MockActuator::new();
        actuator
            .expect_invoke()
            .times(1)
            .returning(|req| Ok(AttemptHandle::new(format!("run-{}", req.attempt_number))));
        let store = Arc::new(MemoryStore::new());
        let dispatcher = RemediationDispatcher::new(Arc::new(actuator), store.clone());
        let incident = incident();

        let handle = dispatcher
            .dispatch(&incident, 1, None, never_cancelled())
            .await
            .unwrap();

        assert_eq!(handle, AttemptHandle::new("run-1"));
        let record = store.attempt(incident.id, 1).await.unwrap().unwrap();
        assert_eq!(record.handle, Some(handle));
        assert_eq!(record.status, AttemptStatus::Running);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_attempt_invokes_actuator_once() {
        let mut actuator = MockActuator::new();
        actuator
            .expect_invoke()
            .times(1)
            .returning(|_| Ok(AttemptHandle::new("run-1")));
        let dispatcher = Arc::new(RemediationDispatcher::new(
            Arc::new(actuator),
            Arc::new(MemoryStore::new()),
        ));
        let incident = incident();

        let calls: Vec<_> = (0..8)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                let incident = incident.clone();
                tokio::spawn(async move {
                    dispatcher
                        .dispatch(&incident, 1, None, never_cancelled())
                        .await
                        .unwrap()
                })
            })
            .collect();

        for call in calls {
            assert_eq!(call.await.unwrap(), AttemptHandle::new("run-1"));
        }
    }

    #[tokio::test]
    async fn failure_is_recorded() {
        let mut actuator = MockActuator::new();
        actuator
            .expect_invoke()
            .returning(|_| Err(DispatchError::Unreachable("connection refused".into())));
        let store = Arc::new(MemoryStore::new());
        let dispatcher = RemediationDispatcher::new(Arc::new(actuator), store.clone());
        let incident = incident();

        let err = dispatcher
            .dispatch(&incident, 1, None, never_cancelled())
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        let record = store.attempt(incident.id, 1).await.unwrap().unwrap();
        assert_eq!(record.status, AttemptStatus::DispatchFailed);
        assert_eq!(record.handle, None);
    }

    #[tokio::test]
    async fn failed_attempt_can_be_redispatched() {
        let mut actuator = MockActuator::new();
        let mut seq = mockall::Sequence::new();
        actuator
            .expect_invoke()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(DispatchError::Unreachable("timeout".into())));
        actuator
            .expect_invoke()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(AttemptHandle::new("run-1b")));
        let dispatcher = RemediationDispatcher::new(Arc::new(actuator), Arc::new(MemoryStore::new()));
        let incident = incident();

        assert!(dispatcher.dispatch(&incident, 1, None, never_cancelled()).await.is_err());
        let handle = dispatcher
            .dispatch(&incident, 1, None, never_cancelled())
            .await
            .unwrap();
        assert_eq!(handle, AttemptHandle::new("run-1b"));
    }

    #[tokio::test]
    async fn store_failure_after_invoke_surfaces() {
        let mut actuator = MockActuator::new();
        let store = Arc::new(MemoryStore::new());
        let flip = store.clone();
        actuator.expect_invoke().returning(move |_| {
            flip.simulate_outage(true);
            Ok(AttemptHandle::new("run-1"))
        });
        let dispatcher = RemediationDispatcher::new(Arc::new(actuator), store.clone());

        let err = dispatcher
            .dispatch(&incident(), 1, None, never_cancelled())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Store(ref e) if e.is_unavailable()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins_over_slow_invoke() {
        struct SlowActuator;

        #[async_trait::async_trait]
        impl Actuator for SlowActuator {
            async fn invoke(&self, _: RemediationRequest) -> Result<AttemptHandle, DispatchError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(AttemptHandle::new("late"))
            }

            async fn status(
                &self,
                _: &AttemptHandle,
            ) -> Result<crate::actuator::ActuatorStatus, crate::error::ActuatorError> {
                unreachable!()
            }
        }

        let store = Arc::new(MemoryStore::new());
        let dispatcher = RemediationDispatcher::new(Arc::new(SlowActuator), store.clone());
        let incident = incident();
        let (tx, rx) = watch::channel(false);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send(true).unwrap();
        });

        let err = dispatcher.dispatch(&incident, 1, None, rx).await.unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled));
        assert!(store.attempt(incident.id, 1).await.unwrap().is_none());
        canceller.await.unwrap();
    }
}

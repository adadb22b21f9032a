use super::IncidentStore;
use crate::error::StoreError;
use crate::incident::{AttemptRecord, Incident};
use crate::types::{Fingerprint, IncidentId, IncidentState};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

/// Serialized form of a store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(super) struct Snapshot {
    pub(super) incidents: Vec<Incident>,
    pub(super) attempts: Vec<AttemptRecord>,
}

/// Tables and indexes shared by the in-memory and file-backed stores
#[derive(Debug, Clone, Default)]
pub(super) struct StoreState {
    incidents: HashMap<IncidentId, Incident>,
    active: HashMap<Fingerprint, IncidentId>,
    attempts: BTreeMap<(IncidentId, u32), AttemptRecord>,
}

impl StoreState {
    pub(super) fn from_snapshot(snapshot: Snapshot) -> Result<Self, StoreError> {
        let mut state = Self::default();
        for incident in snapshot.incidents {
            state.insert(incident)?;
        }
        for record in snapshot.attempts {
            state.put_attempt(record);
        }
        Ok(state)
    }

    pub(super) fn snapshot(&self) -> Snapshot {
        Snapshot {
            incidents: self.list(|_| true),
            attempts: self.attempts.values().cloned().collect(),
        }
    }

    pub(super) fn insert(&mut self, incident: Incident) -> Result<(), StoreError> {
        if !incident.is_terminal() {
            if let Some(existing) = self.active.get(&incident.fingerprint) {
                if *existing != incident.id {
                    return Err(StoreError::ActiveFingerprint {
                        fingerprint: incident.fingerprint.clone(),
                        existing: *existing,
                    });
                }
            }
            self.active.insert(incident.fingerprint.clone(), incident.id);
        }
        self.incidents.insert(incident.id, incident);
        Ok(())
    }

    pub(super) fn get(&self, id: IncidentId) -> Option<Incident> {
        self.incidents.get(&id).cloned()
    }

    pub(super) fn find_active(&self, fingerprint: &Fingerprint) -> Option<Incident> {
        self.active
            .get(fingerprint)
            .and_then(|id| self.incidents.get(id))
            .cloned()
    }

    /// Incidents matching `filter`, oldest first
    pub(super) fn list(&self, filter: impl Fn(&Incident) -> bool) -> Vec<Incident> {
        let mut out: Vec<Incident> = self
            .incidents
            .values()
            .filter(|i| filter(i))
            .cloned()
            .collect();
        out.sort_by_key(|i| (i.created_at, i.id));
        out
    }

    pub(super) fn compare_and_swap(
        &mut self,
        expected_version: u64,
        incident: Incident,
    ) -> Result<(), StoreError> {
        let current = self
            .incidents
            .get(&incident.id)
            .ok_or(StoreError::NotFound(incident.id))?;
        let actual = current.version();
        if actual != expected_version {
            return Err(StoreError::Conflict {
                id: incident.id,
                expected: expected_version,
                actual,
            });
        }

        if incident.is_terminal() && self.active.get(&incident.fingerprint) == Some(&incident.id) {
            self.active.remove(&incident.fingerprint);
        }
        self.incidents.insert(incident.id, incident);
        Ok(())
    }

    pub(super) fn attempt(&self, id: IncidentId, attempt_number: u32) -> Option<AttemptRecord> {
        self.attempts.get(&(id, attempt_number)).cloned()
    }

    pub(super) fn put_attempt(&mut self, record: AttemptRecord) {
        self.attempts
            .insert((record.incident_id, record.attempt_number), record);
    }

    pub(super) fn attempts(&self, id: IncidentId) -> Vec<AttemptRecord> {
        self.attempts
            .range((id, 0)..=(id, u32::MAX))
            .map(|(_, r)| r.clone())
            .collect()
    }
}

/// In-process incident store
///
/// `simulate_outage(true)` makes every call fail with
/// `StoreError::Unavailable` until switched back.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
    outage: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle fault injection
    pub fn simulate_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.outage.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl IncidentStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }

    async fn insert(&self, incident: &Incident) -> Result<(), StoreError> {
        self.check()?;
        self.state.write().insert(incident.clone())
    }

    async fn get(&self, id: IncidentId) -> Result<Option<Incident>, StoreError> {
        self.check()?;
        Ok(self.state.read().get(id))
    }

    async fn find_active(&self, fingerprint: &Fingerprint) -> Result<Option<Incident>, StoreError> {
        self.check()?;
        Ok(self.state.read().find_active(fingerprint))
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<Incident>, StoreError> {
        self.check()?;
        Ok(self.state.read().list(|i| &i.fingerprint == fingerprint))
    }

    async fn list_in_state(&self, state: IncidentState) -> Result<Vec<Incident>, StoreError> {
        self.check()?;
        Ok(self.state.read().list(|i| i.state == state))
    }

    async fn list_all(&self) -> Result<Vec<Incident>, StoreError> {
        self.check()?;
        Ok(self.state.read().list(|_| true))
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        incident: &Incident,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.state
            .write()
            .compare_and_swap(expected_version, incident.clone())
    }

    async fn attempt(
        &self,
        id: IncidentId,
        attempt_number: u32,
    ) -> Result<Option<AttemptRecord>, StoreError> {
        self.check()?;
        Ok(self.state.read().attempt(id, attempt_number))
    }

    async fn put_attempt(&self, record: &AttemptRecord) -> Result<(), StoreError> {
        self.check()?;
        self.state.write().put_attempt(record.clone());
        Ok(())
    }

    async fn attempts(&self, id: IncidentId) -> Result<Vec<AttemptRecord>, StoreError> {
        self.check()?;
        Ok(self.state.read().attempts(id))
    }
}

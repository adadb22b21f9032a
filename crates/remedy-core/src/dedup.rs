//! Alert deduplication
//!
//! Maps a fingerprint onto its single active incident, opening a new one on
//! first sighting. Check-and-create runs under a per-fingerprint lock and is
//! backed by the store's uniqueness constraint on active fingerprints.

use crate::error::StoreError;
use crate::incident::{Incident, NewIncident};
use crate::store::IncidentStore;
use crate::sync::KeyedLocks;
use crate::types::Fingerprint;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

/// Result of resolving a fingerprint
#[derive(Debug, Clone)]
pub struct Resolution {
    pub incident: Incident,
    /// `true` if this call opened the incident
    pub is_new: bool,
}

pub struct Deduplicator {
    store: Arc<dyn IncidentStore>,
    locks: KeyedLocks<Fingerprint>,
}

impl Deduplicator {
    #[must_use]
    pub fn new(store: Arc<dyn IncidentStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
        }
    }

    /// Return the active incident for `seed.fingerprint`, creating it if absent
    ///
    /// A newly opened incident already carries its creation audit event.
    ///
    /// # Errors
    /// Store failures other than the uniqueness rejection are propagated.
    pub async fn resolve(&self, seed: NewIncident) -> Result<Resolution, StoreError> {
        let fingerprint = seed.fingerprint.clone();
        let resolution = {
            let _guard = self.locks.lock(&fingerprint).await;
            self.resolve_locked(seed).await
        };
        self.locks.prune(&fingerprint);
        resolution
    }

    async fn resolve_locked(&self, seed: NewIncident) -> Result<Resolution, StoreError> {
        if let Some(incident) = self.store.find_active(&seed.fingerprint).await? {
            debug!(incident_id = %incident.id, fingerprint = %incident.fingerprint, "duplicate alert");
            return Ok(Resolution {
                incident,
                is_new: false,
            });
        }

        let incident = Incident::open(seed, Utc::now());
        match self.store.insert(&incident).await {
            Ok(()) => Ok(Resolution {
                incident,
                is_new: true,
            }),
            // Another process won the race; fall back to its incident
            Err(StoreError::ActiveFingerprint { existing, .. }) => {
                let incident = self
                    .store
                    .get(existing)
                    .await?
                    .ok_or(StoreError::NotFound(existing))?;
                Ok(Resolution {
                    incident,
                    is_new: false,
                })
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for Deduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("held_locks", &self.locks.len())
            .finish_non_exhaustive()
    }
}

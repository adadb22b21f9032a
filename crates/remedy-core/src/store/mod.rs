//! Incident persistence
//!
//! The store holds incidents (with their inline audit history) and attempt
//! records. Two guarantees carry the control loop's invariants:
//! - `insert` rejects a second non-terminal incident for one fingerprint
//! - `compare_and_swap` only writes when the stored version matches
//!
//! Implementations:
//! - [`MemoryStore`]: in-process, with an outage switch for fault injection
//! - [`FileStore`]: JSON snapshot written atomically after each change

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::StoreError;
use crate::incident::{AttemptRecord, Incident};
use crate::types::{Fingerprint, IncidentId, IncidentState};
use async_trait::async_trait;

/// Durable incident storage
#[async_trait]
pub trait IncidentStore: Send + Sync {
    /// Liveness check; fails while the store cannot accept writes
    async fn ping(&self) -> Result<(), StoreError>;

    /// Insert a fresh incident
    ///
    /// # Errors
    /// - `StoreError::ActiveFingerprint` if another non-terminal incident holds the fingerprint
    async fn insert(&self, incident: &Incident) -> Result<(), StoreError>;

    async fn get(&self, id: IncidentId) -> Result<Option<Incident>, StoreError>;

    /// The non-terminal incident for a fingerprint, if any
    async fn find_active(&self, fingerprint: &Fingerprint) -> Result<Option<Incident>, StoreError>;

    /// Every incident ever opened for a fingerprint, oldest first
    async fn find_by_fingerprint(&self, fingerprint: &Fingerprint)
        -> Result<Vec<Incident>, StoreError>;

    async fn list_in_state(&self, state: IncidentState) -> Result<Vec<Incident>, StoreError>;

    async fn list_all(&self) -> Result<Vec<Incident>, StoreError>;

    /// Replace the stored incident if its version still equals `expected_version`
    ///
    /// # Errors
    /// - `StoreError::Conflict` when a concurrent writer got there first
    /// - `StoreError::NotFound` if the incident was never inserted
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        incident: &Incident,
    ) -> Result<(), StoreError>;

    async fn attempt(
        &self,
        id: IncidentId,
        attempt_number: u32,
    ) -> Result<Option<AttemptRecord>, StoreError>;

    /// Insert or overwrite an attempt record
    async fn put_attempt(&self, record: &AttemptRecord) -> Result<(), StoreError>;

    /// All attempts for an incident, ordered by attempt number
    async fn attempts(&self, id: IncidentId) -> Result<Vec<AttemptRecord>, StoreError>;
}

//! Retry policies per failure category
//!
//! The table is immutable once built. Reloading swaps the whole table
//! through [`PolicyRegistry::replace`]; in-flight readers keep the snapshot
//! they already hold.

use crate::error::PolicyError;
use crate::types::FailureCategory;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Retry budget and backoff schedule for one failure category
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    category: FailureCategory,
    max_attempts: u32,
    backoff: Vec<Duration>,
    action: Option<String>,
}

impl RetryPolicy {
    /// Build a policy; `backoff` must hold exactly `max_attempts - 1` delays
    pub fn new(
        category: impl Into<FailureCategory>,
        max_attempts: u32,
        backoff: Vec<Duration>,
    ) -> Result<Self, PolicyError> {
        let category = category.into();
        if max_attempts == 0 {
            return Err(PolicyError::ZeroAttempts(category.to_string()));
        }
        let expected = (max_attempts - 1) as usize;
        if backoff.len() != expected {
            return Err(PolicyError::BackoffLength {
                category: category.to_string(),
                expected,
                actual: backoff.len(),
            });
        }
        Ok(Self {
            category,
            max_attempts,
            backoff,
            action: None,
        })
    }

    /// Convenience constructor taking delays in seconds
    pub fn from_secs(
        category: impl Into<FailureCategory>,
        max_attempts: u32,
        backoff_secs: &[u64],
    ) -> Result<Self, PolicyError> {
        Self::new(
            category,
            max_attempts,
            backoff_secs.iter().copied().map(Duration::from_secs).collect(),
        )
    }

    /// Actuator action name passed along with each request
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn category(&self) -> &FailureCategory {
        &self.category
    }

    #[inline]
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[inline]
    #[must_use]
    pub fn backoff(&self) -> &[Duration] {
        &self.backoff
    }

    #[inline]
    #[must_use]
    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    /// Delay to wait before dispatching `attempt_number`
    ///
    /// Attempt 1 has no delay. Returns `None` past the budget.
    #[must_use]
    pub fn delay_before(&self, attempt_number: u32) -> Option<Duration> {
        match attempt_number {
            0 => None,
            1 => Some(Duration::ZERO),
            n => self.backoff.get((n - 2) as usize).copied(),
        }
    }

    /// Whether another attempt may follow `attempts_used`
    #[inline]
    #[must_use]
    pub fn allows_retry_after(&self, attempts_used: u32) -> bool {
        attempts_used < self.max_attempts
    }

    /// Same policy with every delay multiplied into a different time unit
    #[must_use]
    pub(crate) fn scaled(mut self, unit: Duration) -> Self {
        self.backoff = self
            .backoff
            .iter()
            .map(|d| unit.saturating_mul(u32::try_from(d.as_secs()).unwrap_or(u32::MAX)))
            .collect();
        self
    }
}

/// Immutable lookup table from failure category to policy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPolicyTable {
    policies: BTreeMap<FailureCategory, RetryPolicy>,
}

impl RetryPolicyTable {
    /// Build from a list, rejecting duplicate categories
    pub fn new(policies: impl IntoIterator<Item = RetryPolicy>) -> Result<Self, PolicyError> {
        let mut map = BTreeMap::new();
        for policy in policies {
            let category = policy.category.clone();
            if map.insert(category.clone(), policy).is_some() {
                return Err(PolicyError::Duplicate(category.to_string()));
            }
        }
        Ok(Self { policies: map })
    }

    /// `None` means the category is not auto-remediable
    #[must_use]
    pub fn policy_for(&self, category: &FailureCategory) -> Option<&RetryPolicy> {
        self.policies.get(category)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RetryPolicy> {
        self.policies.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Default table covering the transient pipeline failures worth retrying
    #[must_use]
    pub fn builtin() -> Self {
        const BUILTIN: &[(&str, u32, &[u64], &str)] = &[
            ("GatewayTimeout", 3, &[30, 60], "rerun-pipeline"),
            ("HttpConnectionFailed", 3, &[30, 60], "rerun-pipeline"),
            ("ThrottlingError", 5, &[30, 60, 120, 300], "rerun-pipeline"),
            ("DatabricksClusterStartFailure", 2, &[60], "restart-cluster"),
            ("ClusterMemoryExhausted", 2, &[60], "restart-cluster"),
            ("DatabricksLibraryInstallationError", 2, &[60], "reinstall-libraries"),
            ("LibraryInstallationFailed", 2, &[60], "reinstall-libraries"),
            ("DatabricksJobExecutionError", 3, &[30, 60], "rerun-job"),
            ("UserErrorSourceBlobNotExists", 2, &[300], "check-upstream"),
        ];

        let policies = BUILTIN.iter().filter_map(|(category, max, backoff, action)| {
            RetryPolicy::from_secs(*category, *max, backoff)
                .ok()
                .map(|p| p.with_action(*action))
        });
        Self {
            policies: policies.map(|p| (p.category.clone(), p)).collect(),
        }
    }

    /// Rescale every backoff from seconds to `unit`
    #[must_use]
    pub(crate) fn scaled(self, unit: Duration) -> Self {
        Self {
            policies: self
                .policies
                .into_iter()
                .map(|(category, policy)| (category, policy.scaled(unit)))
                .collect(),
        }
    }
}

/// Process-wide holder of the current table
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    current: RwLock<Arc<RetryPolicyTable>>,
}

impl PolicyRegistry {
    #[must_use]
    pub fn new(table: RetryPolicyTable) -> Self {
        Self {
            current: RwLock::new(Arc::new(table)),
        }
    }

    /// Snapshot of the active table
    #[must_use]
    pub fn current(&self) -> Arc<RetryPolicyTable> {
        self.current.read().clone()
    }

    /// Atomically swap in a new table, returning the previous one
    pub fn replace(&self, table: RetryPolicyTable) -> Arc<RetryPolicyTable> {
        std::mem::replace(&mut *self.current.write(), Arc::new(table))
    }

    /// Policy lookup against the current table
    #[must_use]
    pub fn policy_for(&self, category: &FailureCategory) -> Option<RetryPolicy> {
        self.current.read().policy_for(category).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_backoff() {
        let err = RetryPolicy::from_secs("GatewayTimeout", 3, &[30]).unwrap_err();
        assert_eq!(
            err,
            PolicyError::BackoffLength {
                category: "GatewayTimeout".into(),
                expected: 2,
                actual: 1,
            }
        );
    }

    #[test]
    fn rejects_zero_attempts() {
        assert_eq!(
            RetryPolicy::from_secs("X", 0, &[]).unwrap_err(),
            PolicyError::ZeroAttempts("X".into())
        );
    }

    #[test]
    fn delay_schedule() {
        let policy = RetryPolicy::from_secs("GatewayTimeout", 3, &[30, 60]).unwrap();
        assert_eq!(policy.delay_before(1), Some(Duration::ZERO));
        assert_eq!(policy.delay_before(2), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay_before(3), Some(Duration::from_secs(60)));
        assert_eq!(policy.delay_before(4), None);
        assert!(policy.allows_retry_after(2));
        assert!(!policy.allows_retry_after(3));
    }

    #[test]
    fn table_rejects_duplicates() {
        let a = RetryPolicy::from_secs("A", 1, &[]).unwrap();
        let err = RetryPolicyTable::new([a.clone(), a]).unwrap_err();
        assert_eq!(err, PolicyError::Duplicate("A".into()));
    }

    #[test]
    fn builtin_table_contents() {
        let table = RetryPolicyTable::builtin();
        assert_eq!(table.len(), 9);

        let gateway = table.policy_for(&FailureCategory::new("GatewayTimeout")).unwrap();
        assert_eq!(gateway.max_attempts(), 3);
        assert_eq!(gateway.backoff(), &[Duration::from_secs(30), Duration::from_secs(60)]);
        assert!(table.policy_for(&FailureCategory::new("UserErrorMissingFile")).is_none());
    }

    #[test]
    fn scaling_to_milliseconds() {
        let table = RetryPolicyTable::builtin().scaled(Duration::from_millis(1));
        let throttling = table.policy_for(&FailureCategory::new("ThrottlingError")).unwrap();
        assert_eq!(throttling.delay_before(5), Some(Duration::from_millis(300)));
    }

    #[test]
    fn registry_replace_swaps_whole_table() {
        let registry = PolicyRegistry::new(RetryPolicyTable::builtin());
        let snapshot = registry.current();

        let replacement = RetryPolicyTable::new([RetryPolicy::from_secs("Only", 1, &[]).unwrap()]).unwrap();
        let previous = registry.replace(replacement);

        assert_eq!(previous.len(), 9);
        assert_eq!(snapshot.len(), 9);
        assert_eq!(registry.current().len(), 1);
        assert!(registry.policy_for(&FailureCategory::new("GatewayTimeout")).is_none());
    }
}

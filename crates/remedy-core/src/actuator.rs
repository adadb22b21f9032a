//! External collaborators: alert classification and remediation execution
//!
//! The engine never talks to a pipeline orchestrator or an ML classifier
//! directly; it goes through the [`Classifier`] and [`Actuator`] traits.

use crate::error::{ActuatorError, ClassifyError, DispatchError};
use crate::types::{AttemptHandle, FailureCategory, Fingerprint, IncidentId, Severity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Alert as received from a monitoring source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAlert {
    /// Source system, e.g. `adf` or `databricks`
    pub source: String,
    /// Pipeline, job or cluster the failure belongs to
    pub resource: String,
    pub run_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl RawAlert {
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            resource: resource.into(),
            run_id: None,
            message: message.into(),
            payload: serde_json::Value::Null,
            received_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Fingerprint used when no classifier verdict is available
    #[must_use]
    pub fn default_fingerprint(&self) -> Fingerprint {
        Fingerprint::derive(&self.source, &self.resource, None)
    }
}

/// Classifier verdict for one alert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub fingerprint: Fingerprint,
    pub category: FailureCategory,
    pub is_remediable: bool,
    pub severity: Severity,
}

impl Classification {
    /// Verdict used when the classifier fails: unknown, not remediable
    #[must_use]
    pub fn fallback(alert: &RawAlert) -> Self {
        Self {
            fingerprint: alert.default_fingerprint(),
            category: FailureCategory::unknown(),
            is_remediable: false,
            severity: Severity::Medium,
        }
    }
}

/// Request handed to the actuator for one attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationRequest {
    pub incident_id: IncidentId,
    pub category: FailureCategory,
    pub attempt_number: u32,
    pub action: Option<String>,
}

/// Attempt status reported by the actuator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActuatorStatus {
    Pending,
    Succeeded,
    Failed(String),
}

impl ActuatorStatus {
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ActuatorStatus::Pending)
    }
}

/// Maps raw alerts to a fingerprint and failure category
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, alert: &RawAlert) -> Result<Classification, ClassifyError>;
}

/// Executes remediation actions and reports their progress
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Start an attempt; the returned handle identifies it for status queries
    async fn invoke(&self, request: RemediationRequest) -> Result<AttemptHandle, DispatchError>;

    /// Poll the status of a previously started attempt
    async fn status(&self, handle: &AttemptHandle) -> Result<ActuatorStatus, ActuatorError>;
}

//! Scripted collaborators
//!
//! `ScriptedActuator` plays back per-category scripts of attempt outcomes and
//! `RuleClassifier` maps alert text onto failure categories with regexes.
//! Together they let the CLI and the test suite drive the real engine
//! without any external service.

use crate::actuator::{
    Actuator, ActuatorStatus, Classification, Classifier, RawAlert, RemediationRequest,
};
use crate::engine::RemediationEngine;
use crate::error::{ActuatorError, ClassifyError, DispatchError, EngineError};
use crate::incident::Incident;
use crate::policy::RetryPolicyTable;
use crate::types::{AttemptHandle, FailureCategory, Fingerprint, IncidentId, IncidentState, Severity};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// What one invocation of the scripted actuator does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    /// Report success on the `after_polls`-th status query
    Succeed { after_polls: u32 },
    /// Report failure on the `after_polls`-th status query
    Fail { after_polls: u32, reason: String },
    /// Stay pending forever
    Hang,
    /// Invocation fails as a transient error
    Unreachable(String),
    /// Invocation is refused
    Reject(String),
}

impl ScriptStep {
    #[must_use]
    pub fn succeed() -> Self {
        Self::Succeed { after_polls: 1 }
    }

    #[must_use]
    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Fail {
            after_polls: 1,
            reason: reason.into(),
        }
    }
}

#[derive(Debug)]
struct ScriptedRun {
    step: ScriptStep,
    polls: u32,
}

/// Actuator that plays back a script per failure category
///
/// Categories without a script, or whose script ran out, succeed on the
/// first poll.
#[derive(Debug, Default)]
pub struct ScriptedActuator {
    scripts: Mutex<HashMap<FailureCategory, VecDeque<ScriptStep>>>,
    runs: DashMap<AttemptHandle, ScriptedRun>,
    invocations: Mutex<Vec<RemediationRequest>>,
    invoke_delay: Option<Duration>,
}

impl ScriptedActuator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue steps for a category
    #[must_use]
    pub fn with_script(
        self,
        category: impl Into<FailureCategory>,
        steps: impl IntoIterator<Item = ScriptStep>,
    ) -> Self {
        self.push_script(category, steps);
        self
    }

    /// Make every invocation take this long
    #[must_use]
    pub fn with_invoke_delay(mut self, delay: Duration) -> Self {
        self.invoke_delay = Some(delay);
        self
    }

    pub fn push_script(
        &self,
        category: impl Into<FailureCategory>,
        steps: impl IntoIterator<Item = ScriptStep>,
    ) {
        self.scripts
            .lock()
            .entry(category.into())
            .or_default()
            .extend(steps);
    }

    /// Every request received, in order
    #[must_use]
    pub fn invocations(&self) -> Vec<RemediationRequest> {
        self.invocations.lock().clone()
    }

    #[must_use]
    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().len()
    }

    fn next_step(&self, category: &FailureCategory) -> ScriptStep {
        self.scripts
            .lock()
            .get_mut(category)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(ScriptStep::succeed)
    }
}

#[async_trait]
impl Actuator for ScriptedActuator {
    async fn invoke(&self, request: RemediationRequest) -> Result<AttemptHandle, DispatchError> {
        if let Some(delay) = self.invoke_delay {
            tokio::time::sleep(delay).await;
        }
        let step = self.next_step(&request.category);
        debug!(incident_id = %request.incident_id, attempt = request.attempt_number, ?step, "scripted invocation");
        self.invocations.lock().push(request);

        match step {
            ScriptStep::Unreachable(message) => Err(DispatchError::Unreachable(message)),
            ScriptStep::Reject(message) => Err(DispatchError::Rejected(message)),
            step => {
                let handle = AttemptHandle::new(format!("sim-{}", uuid::Uuid::new_v4()));
                self.runs
                    .insert(handle.clone(), ScriptedRun { step, polls: 0 });
                Ok(handle)
            }
        }
    }

    async fn status(&self, handle: &AttemptHandle) -> Result<ActuatorStatus, ActuatorError> {
        let mut run = self
            .runs
            .get_mut(handle)
            .ok_or_else(|| ActuatorError(format!("unknown handle {handle}")))?;
        run.polls += 1;
        let polls = run.polls;

        Ok(match &run.step {
            ScriptStep::Succeed { after_polls } if polls >= *after_polls => ActuatorStatus::Succeeded,
            ScriptStep::Fail {
                after_polls,
                reason,
            } if polls >= *after_polls => ActuatorStatus::Failed(reason.clone()),
            _ => ActuatorStatus::Pending,
        })
    }
}

/// One message pattern and the verdict it produces
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pattern: Regex,
    category: FailureCategory,
    severity: Severity,
}

impl ClassificationRule {
    /// # Errors
    /// Returns `ClassifyError` for an invalid regex
    pub fn new(
        pattern: &str,
        category: impl Into<FailureCategory>,
        severity: Severity,
    ) -> Result<Self, ClassifyError> {
        let pattern = Regex::new(pattern).map_err(|e| ClassifyError(e.to_string()))?;
        Ok(Self {
            pattern,
            category: category.into(),
            severity,
        })
    }
}

/// Regex classifier; a category is remediable when the table has a policy for it
///
/// A string `error_type` field in the alert payload wins over the rules, and
/// an optional `severity` field overrides the rule's severity.
#[derive(Debug, Clone)]
pub struct RuleClassifier {
    rules: Vec<ClassificationRule>,
    policies: Arc<RetryPolicyTable>,
}

impl RuleClassifier {
    #[must_use]
    pub fn new(rules: Vec<ClassificationRule>, policies: Arc<RetryPolicyTable>) -> Self {
        Self { rules, policies }
    }

    /// Rules for the common pipeline failure messages
    ///
    /// # Errors
    /// Only if a built-in pattern fails to compile
    pub fn builtin(policies: Arc<RetryPolicyTable>) -> Result<Self, ClassifyError> {
        const RULES: &[(&str, &str, Severity)] = &[
            (r"(?i)gateway\s*time-?out|\b504\b", "GatewayTimeout", Severity::High),
            (r"(?i)connection (refused|reset|failed)", "HttpConnectionFailed", Severity::High),
            (r"(?i)throttl|too many requests|\b429\b", "ThrottlingError", Severity::Medium),
            (r"(?i)cluster.*(failed to start|start failure)", "DatabricksClusterStartFailure", Severity::Critical),
            (r"(?i)out of memory|memory exhausted", "ClusterMemoryExhausted", Severity::Critical),
            (r"(?i)library install", "DatabricksLibraryInstallationError", Severity::High),
            (r"(?i)blob.*(does not exist|not found)", "UserErrorSourceBlobNotExists", Severity::Medium),
            (r"(?i)file.*(missing|not found)", "UserErrorMissingFile", Severity::Low),
            (r"(?i)column.*invalid|invalid column", "UserErrorColumnNameInvalid", Severity::Low),
        ];
        let rules = RULES
            .iter()
            .map(|(pattern, category, severity)| ClassificationRule::new(pattern, *category, *severity))
            .collect::<Result<_, _>>()?;
        Ok(Self::new(rules, policies))
    }

    fn verdict(&self, alert: &RawAlert) -> (FailureCategory, Severity) {
        let rule = self
            .rules
            .iter()
            .find(|rule| rule.pattern.is_match(&alert.message));
        let severity = alert
            .payload
            .get("severity")
            .and_then(|v| v.as_str())
            .map(Severity::parse_lenient)
            .or_else(|| rule.map(|r| r.severity))
            .unwrap_or_default();
        let category = alert
            .payload
            .get("error_type")
            .and_then(|v| v.as_str())
            .map(FailureCategory::from)
            .or_else(|| rule.map(|r| r.category.clone()))
            .unwrap_or_else(FailureCategory::unknown);
        (category, severity)
    }
}

#[async_trait]
impl Classifier for RuleClassifier {
    async fn classify(&self, alert: &RawAlert) -> Result<Classification, ClassifyError> {
        let (category, severity) = self.verdict(alert);
        Ok(Classification {
            fingerprint: Fingerprint::derive(&alert.source, &alert.resource, Some(&category)),
            is_remediable: self.policies.policy_for(&category).is_some(),
            category,
            severity,
        })
    }
}

/// Poll until the incident reaches `state`, sleeping `step` between reads
///
/// Gives up after `limit` reads and returns the last snapshot.
///
/// # Errors
/// - `EngineError::NotFound` if the incident disappears
pub async fn wait_for_state(
    engine: &RemediationEngine,
    id: IncidentId,
    state: IncidentState,
    step: Duration,
    limit: usize,
) -> Result<Incident, EngineError> {
    let mut last = None;
    for _ in 0..limit.max(1) {
        let incident = engine.incident(id).await?.ok_or(EngineError::NotFound(id))?;
        if incident.state == state {
            return Ok(incident);
        }
        last = Some(incident);
        tokio::time::sleep(step).await;
    }
    last.ok_or(EngineError::NotFound(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(category: &str) -> RemediationRequest {
        RemediationRequest {
            incident_id: IncidentId::new(),
            category: FailureCategory::new(category),
            attempt_number: 1,
            action: None,
        }
    }

    #[tokio::test]
    async fn scripted_actuator_plays_back_in_order() {
        let actuator = ScriptedActuator::new().with_script(
            "GatewayTimeout",
            [
                ScriptStep::Unreachable("connection refused".into()),
                ScriptStep::Fail { after_polls: 2, reason: "still broken".into() },
            ],
        );

        let first = actuator.invoke(request("GatewayTimeout")).await.unwrap_err();
        assert!(first.is_retryable());

        let handle = actuator.invoke(request("GatewayTimeout")).await.unwrap();
        assert!(handle.as_str().starts_with("sim-"));
        assert_eq!(actuator.status(&handle).await.unwrap(), ActuatorStatus::Pending);
        assert_eq!(
            actuator.status(&handle).await.unwrap(),
            ActuatorStatus::Failed("still broken".into())
        );

        // Script exhausted: default success
        let handle = actuator.invoke(request("GatewayTimeout")).await.unwrap();
        assert_eq!(actuator.status(&handle).await.unwrap(), ActuatorStatus::Succeeded);
        assert_eq!(actuator.invocation_count(), 3);
    }

    #[tokio::test]
    async fn hang_and_reject() {
        let actuator = ScriptedActuator::new()
            .with_script("A", [ScriptStep::Hang])
            .with_script("B", [ScriptStep::Reject("forbidden".into())]);

        let handle = actuator.invoke(request("A")).await.unwrap();
        for _ in 0..5 {
            assert_eq!(actuator.status(&handle).await.unwrap(), ActuatorStatus::Pending);
        }
        let err = actuator.invoke(request("B")).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(actuator
            .status(&AttemptHandle::new("sim-unknown"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn rule_classifier_matches_messages() {
        let classifier = RuleClassifier::builtin(Arc::new(RetryPolicyTable::builtin())).unwrap();

        let verdict = classifier
            .classify(&RawAlert::new("ADF", "pipelineA", "Gateway Timeout calling sink"))
            .await
            .unwrap();
        assert_eq!(verdict.category.as_str(), "GatewayTimeout");
        assert_eq!(verdict.fingerprint.as_str(), "adf/pipelineA/GatewayTimeout");
        assert!(verdict.is_remediable);
        assert_eq!(verdict.severity, Severity::High);

        let verdict = classifier
            .classify(&RawAlert::new("adf", "pipelineA", "input file missing"))
            .await
            .unwrap();
        assert_eq!(verdict.category.as_str(), "UserErrorMissingFile");
        assert!(!verdict.is_remediable);

        let verdict = classifier
            .classify(&RawAlert::new("adf", "pipelineA", "???"))
            .await
            .unwrap();
        assert_eq!(verdict.category, FailureCategory::unknown());
        assert_eq!(verdict.severity, Severity::Medium);
    }

    #[tokio::test]
    async fn payload_overrides_rules() {
        let classifier = RuleClassifier::builtin(Arc::new(RetryPolicyTable::builtin())).unwrap();
        let alert = RawAlert::new("databricks", "job-7", "Gateway timeout").with_payload(
            serde_json::json!({ "error_type": "ThrottlingError", "severity": "critical" }),
        );

        let verdict = classifier.classify(&alert).await.unwrap();
        assert_eq!(verdict.category.as_str(), "ThrottlingError");
        assert_eq!(verdict.severity, Severity::Critical);
        assert!(verdict.is_remediable);
    }

    #[test]
    fn invalid_rule_is_rejected() {
        assert!(ClassificationRule::new("(unclosed", "X", Severity::Low).is_err());
    }
}

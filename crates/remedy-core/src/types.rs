//! Core identifiers and enums
//!
//! Defines the vocabulary shared by every component:
//! - Incident identifiers and deduplication fingerprints
//! - Failure categories and actuator attempt handles
//! - Incident states
//! - Severity, priority and SLA targets

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use ulid::Ulid;

/// Unique incident identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IncidentId(pub Ulid);

impl IncidentId {
    /// Generate new incident ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for IncidentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IncidentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for IncidentId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Deduplication key identifying "the same underlying failure"
///
/// Only unique among currently-active incidents; a resolved incident frees
/// its fingerprint for the next occurrence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an externally derived fingerprint
    #[inline]
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Derive a fingerprint from the alert source and resource
    ///
    /// `derive("adf", "pipelineA", None)` yields `adf/pipelineA`; passing a
    /// category appends it so distinct failure kinds on one resource are
    /// tracked separately.
    #[must_use]
    pub fn derive(source: &str, resource: &str, category: Option<&FailureCategory>) -> Self {
        let base = format!(
            "{}/{}",
            source.trim().to_lowercase(),
            resource.trim()
        );
        match category {
            Some(category) => Self(format!("{base}/{category}")),
            None => Self(base),
        }
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Classification tag supplied by the external classifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureCategory(String);

impl FailureCategory {
    /// Category used when the classifier cannot be reached
    pub const UNKNOWN: &'static str = "UnknownError";

    #[inline]
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[inline]
    #[must_use]
    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FailureCategory {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for FailureCategory {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier returned by the actuator for one remediation attempt
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptHandle(String);

impl AttemptHandle {
    #[inline]
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AttemptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incident lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncidentState {
    /// Created, not yet routed
    New,
    /// A remediation attempt is being handed to the actuator
    Dispatching,
    /// An attempt is in flight and being polled
    Monitoring,
    /// Remediation succeeded
    Resolved,
    /// Handed to a human
    Escalated,
}

impl IncidentState {
    /// Every state, in lifecycle order
    pub const ALL: [IncidentState; 5] = [
        IncidentState::New,
        IncidentState::Dispatching,
        IncidentState::Monitoring,
        IncidentState::Resolved,
        IncidentState::Escalated,
    ];

    /// Terminal states accept no further transitions
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, IncidentState::Resolved | IncidentState::Escalated)
    }

    /// States in which an attempt handle may be held
    #[inline]
    #[must_use]
    pub fn holds_attempt(self) -> bool {
        matches!(self, IncidentState::Dispatching | IncidentState::Monitoring)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            IncidentState::New => "new",
            IncidentState::Dispatching => "dispatching",
            IncidentState::Monitoring => "monitoring",
            IncidentState::Resolved => "resolved",
            IncidentState::Escalated => "escalated",
        }
    }
}

impl fmt::Display for IncidentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity reported by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Severity {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Severity {
    /// Map severity onto a ticket priority
    #[inline]
    #[must_use]
    pub fn priority(self) -> Priority {
        match self {
            Severity::Critical => Priority::P1,
            Severity::High => Priority::P2,
            Severity::Medium => Priority::P3,
            Severity::Low => Priority::P4,
        }
    }

    /// Lenient parse; anything unrecognised is Medium
    #[must_use]
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "low" => Severity::Low,
            _ => Severity::Medium,
        }
    }
}

/// Ticket priority derived from severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P1,
    P2,
    P3,
    P4,
}

impl Priority {
    /// Time allowed between incident creation and resolution
    #[must_use]
    pub fn sla(self) -> Duration {
        match self {
            Priority::P1 => Duration::from_secs(900),
            Priority::P2 => Duration::from_secs(1800),
            Priority::P3 => Duration::from_secs(7200),
            Priority::P4 => Duration::from_secs(86_400),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Whether a resolved incident met its SLA target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlaStatus {
    /// Not resolved (yet)
    Pending,
    Met,
    Breached,
}

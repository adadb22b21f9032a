//! Remedy Core - alert-to-remediation control loop
//!
//! Turns pipeline failure alerts into tracked incidents and drives them to a
//! terminal outcome:
//! - Collapses repeated alerts for one failure into a single active incident
//! - Looks up the retry budget and backoff schedule for the failure category
//! - Dispatches remediation attempts to an external actuator
//! - Monitors in-flight attempts with an absolute timeout
//! - Escalates to a human when automation gives up
//!
//! # Example
//!
//! ```rust,ignore
//! use remedy_core::prelude::*;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RemedyConfig::new();
//! let engine = RemediationEngine::new(config, store, classifier, actuator)?;
//! engine.resume().await?;
//!
//! let outcome = engine.submit_alert(RawAlert::new("adf", "pipelineA", "Gateway timeout")).await?;
//! println!("incident {} is {}", outcome.incident_id, outcome.state);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
pub mod actuator;
pub mod audit;
pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod incident;
pub mod monitor;
pub mod notifier;
pub mod policy;
pub mod state_machine;
pub mod store;
pub mod sync;
pub mod types;

// Scripted collaborators for simulation and tests
pub mod simulator;

// Re-exports for convenience
pub use actuator::{
    Actuator, ActuatorStatus, Classification, Classifier, RawAlert, RemediationRequest,
};
pub use audit::{AuditEvent, TransitionReason};
pub use config::{RemedyConfig, TimeUnit};
pub use dedup::{Deduplicator, Resolution};
pub use dispatcher::RemediationDispatcher;
pub use engine::{AlertOutcome, IncidentStats, RemediationEngine, ResumeReport};
pub use error::{
    ActuatorError, ClassifyError, ConfigError, DispatchError, EngineError, IntegrityError,
    NotifyError, PolicyError, StateMachineError, StoreError,
};
pub use incident::{AttemptRecord, AttemptStatus, Incident, NewIncident, TransitionDraft};
pub use monitor::{MonitorOutcome, MonitorReport, MonitorSettings, OutcomeSink, RemediationMonitor};
pub use notifier::{NotificationSink, Notifier, TracingSink, TransitionEvent};
pub use policy::{PolicyRegistry, RetryPolicy, RetryPolicyTable};
pub use store::{FileStore, IncidentStore, MemoryStore};
pub use types::{
    AttemptHandle, FailureCategory, Fingerprint, IncidentId, IncidentState, Priority, Severity,
    SlaStatus,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for wiring up an engine
    pub use crate::{
        Actuator, ActuatorStatus, Classification, Classifier, FailureCategory, Fingerprint,
        IncidentId, IncidentState, IncidentStore, MemoryStore, RawAlert, RemedyConfig,
        RemediationEngine, RetryPolicy, RetryPolicyTable,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Scripted scenarios played against the real engine in millisecond time

use anyhow::{Context, Result};
use remedy_core::simulator::{RuleClassifier, ScriptStep, ScriptedActuator};
use remedy_core::{
    FileStore, Incident, IncidentId, IncidentStore, MemoryStore, RawAlert, RemediationEngine,
    RemedyConfig, TimeUnit, TracingSink,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scenario {
    GatewayTimeout,
    MissingFile,
    Duplicates,
    Exhausted,
    Timeout,
}

impl Scenario {
    pub(crate) const NAMES: [&'static str; 5] =
        ["gateway-timeout", "missing-file", "duplicates", "exhausted", "timeout"];

    pub(crate) fn parse(name: &str) -> Option<Self> {
        match name {
            "gateway-timeout" => Some(Self::GatewayTimeout),
            "missing-file" => Some(Self::MissingFile),
            "duplicates" => Some(Self::Duplicates),
            "exhausted" => Some(Self::Exhausted),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    fn actuator(self) -> ScriptedActuator {
        let actuator = ScriptedActuator::new();
        match self {
            Self::GatewayTimeout => actuator.with_script(
                "GatewayTimeout",
                [ScriptStep::fail("copy activity timed out"), ScriptStep::succeed()],
            ),
            Self::MissingFile => actuator,
            Self::Duplicates => {
                actuator.with_script("GatewayTimeout", [ScriptStep::Succeed { after_polls: 5 }])
            }
            Self::Exhausted => actuator.with_script(
                "GatewayTimeout",
                (1..=3).map(|i| ScriptStep::fail(format!("gateway still down ({i})"))),
            ),
            Self::Timeout => {
                actuator.with_script("GatewayTimeout", [ScriptStep::Hang, ScriptStep::succeed()])
            }
        }
    }

    fn alerts(self) -> Vec<RawAlert> {
        let gateway = || RawAlert::new("adf", "pipelineA", "Gateway timeout on copy activity");
        match self {
            Self::MissingFile => vec![RawAlert::new(
                "adf",
                "pipelineA",
                "Input file missing in landing container",
            )],
            Self::Duplicates => (0..5).map(|_| gateway()).collect(),
            _ => vec![gateway()],
        }
    }
}

pub(crate) async fn run(config: RemedyConfig, scenario: Scenario) -> Result<()> {
    let config = config
        .with_time_unit(TimeUnit::Milliseconds)
        .with_monitor(10, 500);
    let store: Arc<dyn IncidentStore> = match &config.store.path {
        Some(path) => Arc::new(
            FileStore::open(path).with_context(|| format!("opening {}", path.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };
    let actuator = Arc::new(scenario.actuator());
    let classifier = RuleClassifier::builtin(Arc::new(config.policy_table()?))?;
    let engine = RemediationEngine::new(config, store, Arc::new(classifier), actuator.clone())?;
    let sink = engine.attach_sink(Arc::new(TracingSink));

    info!(?scenario, "starting simulation");
    let resumed = engine.resume().await?;
    info!(?resumed, "store recovered");

    let mut tasks = Vec::new();
    for alert in scenario.alerts() {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move { engine.submit_alert(alert).await }));
    }
    let mut ids: Vec<IncidentId> = Vec::new();
    for task in tasks {
        let outcome = task.await??;
        if !ids.contains(&outcome.incident_id) {
            ids.push(outcome.incident_id);
        }
    }

    for id in ids {
        let incident = settle(&engine, id).await?;
        print_incident(&incident);
        for event in incident.history() {
            println!(
                "  #{:<2} {:>11} -> {:<11} attempt={} {} {}",
                event.sequence,
                event.from_state.map_or("-", |s| s.as_str()),
                event.to_state,
                event.attempt_number,
                event.reason,
                event.detail.as_deref().unwrap_or("")
            );
        }
    }

    let stats = engine.stats().await?;
    println!(
        "incidents={} resolved={} escalated={} attempts={} invocations={}",
        stats.total,
        stats.resolved,
        stats.escalated,
        stats.attempts,
        actuator.invocation_count()
    );
    engine.shutdown().await;
    sink.abort();
    Ok(())
}

async fn settle(engine: &RemediationEngine, id: IncidentId) -> Result<Incident> {
    tokio::time::timeout(SETTLE_TIMEOUT, async {
        loop {
            let incident = engine.incident(id).await?.context("incident disappeared")?;
            if incident.is_terminal() {
                return Ok::<_, anyhow::Error>(incident);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("incident did not settle")?
}

pub(crate) fn print_incident(incident: &Incident) {
    println!(
        "{} {} [{}] {} attempts={} priority={} sla={:?}",
        incident.id,
        incident.fingerprint,
        incident.failure_category,
        incident.state,
        incident.attempt_count,
        incident.priority,
        incident.sla_status()
    );
}

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use remedy_core::{FileStore, Fingerprint, IncidentId, IncidentStore, RemedyConfig};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

mod simulate;

use simulate::Scenario;

fn cli() -> Command {
    Command::new("remedy")
        .version(remedy_core::VERSION)
        .about("Alert-to-remediation control loop")
        .arg_required_else_help(true)
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run a scripted scenario against the real engine")
                .arg(
                    Arg::new("scenario")
                        .long("scenario")
                        .default_value("gateway-timeout")
                        .value_parser(Scenario::NAMES)
                        .help("Scenario to play"),
                )
                .arg(
                    Arg::new("store")
                        .long("store")
                        .value_parser(value_parser!(PathBuf))
                        .help("Persist incidents to this JSON file (overrides store.path)"),
                ),
        )
        .subcommand(Command::new("policies").about("Print the effective retry policy table"))
        .subcommand(
            Command::new("check-config")
                .about("Validate a configuration file")
                .arg(
                    Arg::new("path")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("inspect")
                .about("Show incidents from a file store")
                .arg(store_arg())
                .arg(Arg::new("id").long("id").help("Incident id"))
                .arg(Arg::new("fingerprint").long("fingerprint").help("Incident fingerprint"))
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("verify")
                .about("Check hash chains and cached fields of every stored incident")
                .arg(store_arg()),
        )
}

fn store_arg() -> Arg {
    Arg::new("store")
        .long("store")
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("Path of the incident store file")
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

fn load_config(matches: &ArgMatches) -> Result<RemedyConfig> {
    let config = match matches.get_one::<PathBuf>("config") {
        Some(path) => RemedyConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RemedyConfig::new(),
    };
    Ok(config.with_env_overrides()?)
}

fn open_store(args: &ArgMatches) -> Result<FileStore> {
    let path = args
        .get_one::<PathBuf>("store")
        .context("--store is required")?;
    if !path.exists() {
        bail!("no store at {}", path.display());
    }
    FileStore::open(path).with_context(|| format!("opening {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    match matches.subcommand() {
        Some(("simulate", args)) => {
            let config = load_config(&matches)?;
            let scenario = args
                .get_one::<String>("scenario")
                .and_then(|name| Scenario::parse(name))
                .context("unknown scenario")?;
            let config = match args.get_one::<PathBuf>("store") {
                Some(path) => config.with_store_path(path),
                None => config,
            };
            simulate::run(config, scenario).await?;
        }
        Some(("policies", _)) => {
            let table = load_config(&matches)?.policy_table()?;
            println!("{:<36} {:>8}  {:<24} ACTION", "CATEGORY", "ATTEMPTS", "BACKOFF");
            for policy in table.iter() {
                let backoff: Vec<String> = policy
                    .backoff()
                    .iter()
                    .map(|d| format!("{d:?}"))
                    .collect();
                println!(
                    "{:<36} {:>8}  {:<24} {}",
                    policy.category(),
                    policy.max_attempts(),
                    backoff.join(","),
                    policy.action().unwrap_or("-")
                );
            }
        }
        Some(("check-config", args)) => {
            let path = args
                .get_one::<PathBuf>("path")
                .context("path is required")?;
            let config = RemedyConfig::load(path)?;
            config.validate()?;
            let table = config.policy_table()?;
            println!(
                "{}: ok ({} policies, auto-remediation {})",
                path.display(),
                table.len(),
                if config.auto_remediation_enabled { "on" } else { "off" }
            );
        }
        Some(("inspect", args)) => inspect(args).await?,
        Some(("verify", args)) => verify(args).await?,
        _ => {
            cli().print_help()?;
        }
    }
    Ok(())
}

async fn inspect(args: &ArgMatches) -> Result<()> {
    let store = open_store(args)?;
    let incidents = if let Some(id) = args.get_one::<String>("id") {
        let id: IncidentId = id.parse().context("invalid incident id")?;
        store.get(id).await?.into_iter().collect()
    } else if let Some(fingerprint) = args.get_one::<String>("fingerprint") {
        store
            .find_by_fingerprint(&Fingerprint::new(fingerprint.as_str()))
            .await?
    } else {
        store.list_all().await?
    };

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&incidents)?);
        return Ok(());
    }
    if incidents.is_empty() {
        println!("no incidents");
    }
    for incident in &incidents {
        simulate::print_incident(incident);
        for attempt in store.attempts(incident.id).await? {
            println!(
                "    attempt {} {:?} handle={} {}",
                attempt.attempt_number,
                attempt.status,
                attempt.handle.as_ref().map_or("-", |h| h.as_str()),
                attempt.failure_reason.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

async fn verify(args: &ArgMatches) -> Result<()> {
    let store = open_store(args)?;
    let incidents = store.list_all().await?;
    let mut broken = 0usize;
    for incident in &incidents {
        if let Err(e) = incident.verify_history() {
            broken += 1;
            println!("{}: {e}", incident.id);
        }
    }
    if broken > 0 {
        bail!("{broken} of {} incidents failed verification", incidents.len());
    }
    println!("{} incidents verified", incidents.len());
    Ok(())
}

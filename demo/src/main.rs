//! ARBITER — end-to-end demo CLI.
//!
//! Wires the full pipeline together: load a policy directory, compile and
//! publish a snapshot, then answer check requests or plan queries read from
//! JSON files.
//!
//! Usage:
//!   cargo run -p demo -- list  --policies ./policies
//!   cargo run -p demo -- check --policies ./policies --request ./check.json
//!   cargo run -p demo -- plan  --policies ./policies --request ./plan.json

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use arbiter_contracts::config::EngineConfig;
use arbiter_contracts::request::CheckInput;
use arbiter_engine::{compile, Engine, PlanInput, Store};
use arbiter_policy::{hash_hex, load_policy_dir};
use arbiter_schema::SchemaRegistry;

// ── CLI definition ────────────────────────────────────────────────────────────

/// ARBITER — policy decision point demo.
#[derive(Parser)]
#[command(
    name = "demo",
    about = "ARBITER policy decision point demo",
    long_about = "Loads a policy directory, compiles it into a snapshot, and\n\
                  answers check requests or plan queries from JSON files."
)]
struct Cli {
    /// Directory of .yaml/.json policy files.
    #[arg(long, global = true, default_value = "policies")]
    policies: PathBuf,

    /// Optional directory of JSON Schema documents, registered by filename.
    #[arg(long, global = true)]
    schemas: Option<PathBuf>,

    /// Optional engine configuration file (YAML or JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the compiled policies with their content hashes and imports.
    List,
    /// Decide a check request read from a JSON file.
    Check {
        /// Path to a CheckInput JSON document.
        #[arg(long)]
        request: PathBuf,
    },
    /// Compute the residual filter for a plan query read from a JSON file.
    Plan {
        /// Path to a PlanInput JSON document.
        #[arg(long)]
        request: PathBuf,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    // Structured logging; set RUST_LOG=debug to watch the pipeline.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let engine = build_engine(cli)?;

    match &cli.command {
        Command::List => list(&engine),
        Command::Check { request } => check(&engine, request),
        Command::Plan { request } => plan(&engine, request),
    }
}

/// Load policies, schemas, and config, and publish the first snapshot.
fn build_engine(cli: &Cli) -> Result<Engine, String> {
    let loaded = load_policy_dir(&cli.policies).map_err(|e| e.to_string())?;
    for (path, error) in &loaded.failures {
        eprintln!("skipped {}: {error}", path.display());
    }
    if loaded.policies.is_empty() {
        return Err(format!(
            "no loadable policies under {}",
            cli.policies.display()
        ));
    }

    let snapshot = compile(&loaded.policies).map_err(|e| e.to_string())?;
    let store = Arc::new(Store::new());
    store.publish(snapshot);

    let mut registry = SchemaRegistry::new();
    if let Some(schema_dir) = &cli.schemas {
        register_schemas(&mut registry, schema_dir)?;
    }

    let config = match &cli.config {
        None => EngineConfig::default(),
        Some(path) => read_config(path)?,
    };

    Ok(Engine::new(store, Arc::new(registry), config))
}

fn register_schemas(registry: &mut SchemaRegistry, dir: &Path) -> Result<(), String> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| format!("cannot read schema directory {}: {e}", dir.display()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let bytes = std::fs::read(&path)
            .map_err(|e| format!("cannot read schema {}: {e}", path.display()))?;
        let document: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| format!("schema {} is not valid JSON: {e}", path.display()))?;
        registry
            .register(&name, &document)
            .map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<EngineConfig, String> {
    let bytes = std::fs::read(path)
        .map_err(|e| format!("cannot read config {}: {e}", path.display()))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_slice(&bytes)
            .map_err(|e| format!("invalid config {}: {e}", path.display())),
        _ => serde_yaml::from_slice(&bytes)
            .map_err(|e| format!("invalid config {}: {e}", path.display())),
    }
}

// ── Subcommands ───────────────────────────────────────────────────────────────

fn list(engine: &Engine) -> Result<(), String> {
    let snapshot = engine.store().snapshot();
    for id in snapshot.ids() {
        let unit = snapshot.get(id).expect("listed id resolves");
        let hash = match unit {
            arbiter_engine::CompiledPolicy::Resource(rp) => rp.hash,
            arbiter_engine::CompiledPolicy::Principal(pp) => pp.hash,
        };
        println!("{id}  {}", hash_hex(hash));
        if let Some(deps) = snapshot.dependencies(id) {
            for dep in deps {
                println!("  imports {dep}");
            }
        }
    }
    Ok(())
}

fn check(engine: &Engine, request: &Path) -> Result<(), String> {
    let input: CheckInput = read_json(request)?;
    let result = engine.check(&input).map_err(|e| e.to_string())?;

    println!("request: {}", result.request_id);
    for (action, decision) in &result.actions {
        println!(
            "  {action}: {} ({})",
            match decision.effect {
                arbiter_contracts::policy::Effect::Allow => "ALLOW",
                arbiter_contracts::policy::Effect::Deny => "DENY",
            },
            decision.policy
        );
    }
    if !result.effective_derived_roles.is_empty() {
        println!("  derived roles: {}", result.effective_derived_roles.join(", "));
    }
    for error in &result.validation_errors {
        println!("  validation: {:?} {}: {}", error.source, error.path, error.message);
    }
    for output in &result.outputs {
        println!("  output {}: {}", output.src, output.val);
    }
    Ok(())
}

fn plan(engine: &Engine, request: &Path) -> Result<(), String> {
    let input: PlanInput = read_json(request)?;
    let output = engine.plan(&input).map_err(|e| e.to_string())?;
    println!(
        "plan for {} on {} (request {}):",
        output.action, output.kind, output.request_id
    );
    println!("  {}", output.filter);
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, String> {
    let bytes = std::fs::read(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("invalid request {}: {e}", path.display()))
}

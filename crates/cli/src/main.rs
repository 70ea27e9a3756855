use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use futures::stream::{self, StreamExt};
use keel_api::{
    AllOf, ConditionMatch, Engine, FieldsMatch, ManifestApi, ManifestPlan, ManifestState, ReadinessPredicate,
    Rollout, WaitTarget,
};
use keel_convert::{build_identity, parse_manifests, untyped};
use keel_core::{ApplyStrategy, EngineConfig, HostValue, KeelResult, ResourceIdentity};
use serde_json::json;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod state;

use crate::state::StateFile;

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel: reconcile Kubernetes manifests")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for manifests that do not set one
    #[arg(long = "ns", global = true, env = "KEEL_NAMESPACE")]
    namespace: Option<String>,

    /// Field manager; keep it stable across runs against the same objects
    #[arg(long = "field-manager", global = true, env = "KEEL_FIELD_MANAGER")]
    field_manager: Option<String>,

    /// Take over fields other managers own instead of failing
    #[arg(long = "force-conflicts", global = true, action = ArgAction::SetTrue)]
    force_conflicts: bool,

    /// Write strategy: `ssa` (server-side apply) or `merge`
    #[arg(long = "strategy", global = true, env = "KEEL_APPLY_STRATEGY")]
    strategy: Option<ApplyStrategy>,

    /// State file holding the baselines of earlier runs
    #[arg(long = "state", global = true, env = "KEEL_STATE", default_value = "keel-state.json")]
    state: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Args, Debug)]
struct Inputs {
    /// Manifest files (multi-document YAML); `-` reads stdin
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Manifests processed at once
    #[arg(long = "concurrency", default_value_t = 4)]
    concurrency: usize,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show what apply would change
    Plan {
        #[command(flatten)]
        inputs: Inputs,
    },
    /// Apply manifests and record their baselines
    Apply {
        #[command(flatten)]
        inputs: Inputs,
        /// Wait for a status condition, e.g. `Ready=True` (repeatable)
        #[arg(long = "wait-condition")]
        wait_condition: Vec<String>,
        /// Wait for a field to match a regex, e.g. `status.phase=^Running$` (repeatable)
        #[arg(long = "wait-field")]
        wait_field: Vec<String>,
        /// Wait for a Deployment/StatefulSet/DaemonSet rollout
        #[arg(long = "wait-rollout", action = ArgAction::SetTrue)]
        wait_rollout: bool,
        /// Wait timeout in seconds
        #[arg(long = "timeout")]
        timeout: Option<u64>,
        /// Ask the server what it would store; nothing is persisted
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Delete the objects the manifests declare
    Delete {
        #[command(flatten)]
        inputs: Inputs,
        /// Wait until the objects are gone
        #[arg(long = "wait", action = ArgAction::SetTrue)]
        wait: bool,
        /// Wait timeout in seconds
        #[arg(long = "timeout")]
        timeout: Option<u64>,
    },
    /// Print the resolved schema of a kind
    Schema {
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        gvk: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

fn engine_config(cli: &Cli) -> EngineConfig {
    let mut config = EngineConfig::from_env();
    if let Some(m) = &cli.field_manager {
        config.field_manager = m.clone();
    }
    config.force_conflicts |= cli.force_conflicts;
    if let Some(s) = cli.strategy {
        config.strategy = s;
    }
    config
}

/// One manifest document, keyed the way the state file keys it.
struct Doc {
    key: String,
    identity: ResourceIdentity,
    desired: HostValue,
}

fn read_input(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut s = String::new();
        std::io::stdin().read_to_string(&mut s).context("reading stdin")?;
        return Ok(s);
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

/// Fill in `metadata.namespace` where the manifest leaves it out.
fn default_namespace(desired: &mut HostValue, ns: &str) {
    if let HostValue::Object(attrs) | HostValue::Map(attrs) = desired {
        if let Some(HostValue::Object(meta) | HostValue::Map(meta)) = attrs.get_mut("metadata") {
            let declared = meta.get("namespace").map_or(false, |v| !v.is_absent());
            if !declared {
                meta.insert("namespace".into(), HostValue::string(ns));
            }
        }
    }
}

fn collect_docs(sources: &[(String, String)], ns: Option<&str>, config: &EngineConfig) -> Result<Vec<Doc>> {
    let mut seen = HashSet::new();
    let mut docs = Vec::new();
    for (name, text) in sources {
        let values = parse_manifests(text, config.max_yaml_bytes, config.max_yaml_nodes)
            .with_context(|| format!("parsing {name}"))?;
        for (i, value) in values.iter().enumerate() {
            let mut desired = untyped(value);
            if let Some(ns) = ns {
                default_namespace(&mut desired, ns);
            }
            let identity = build_identity(&desired, None).with_context(|| format!("{name}: document {}", i + 1))?;
            let key = identity.to_string();
            if !seen.insert(key.clone()) {
                anyhow::bail!("{key} is declared more than once");
            }
            docs.push(Doc { key, identity, desired });
        }
    }
    Ok(docs)
}

fn load_docs(inputs: &Inputs, ns: Option<&str>, config: &EngineConfig) -> Result<Vec<Doc>> {
    let sources = inputs
        .files
        .iter()
        .map(|p| read_input(p).map(|text| (p.display().to_string(), text)))
        .collect::<Result<Vec<_>>>()?;
    let docs = collect_docs(&sources, ns, config)?;
    info!(files = inputs.files.len(), manifests = docs.len(), "manifests loaded");
    Ok(docs)
}

fn wait_target(conditions: &[String], fields: &[String], rollout: bool) -> Result<Option<WaitTarget>> {
    let mut preds: Vec<Box<dyn ReadinessPredicate>> = Vec::new();
    for c in conditions {
        preds.push(Box::new(ConditionMatch::parse(c).map_err(anyhow::Error::msg)?));
    }
    if !fields.is_empty() {
        preds.push(Box::new(FieldsMatch::parse(fields.iter().map(String::as_str)).map_err(anyhow::Error::msg)?));
    }
    if rollout {
        preds.push(Box::new(Rollout));
    }
    Ok(match preds.len() {
        0 => None,
        1 => preds.pop().map(|p| WaitTarget::Ready(Arc::from(p))),
        _ => Some(WaitTarget::ready(AllOf(preds))),
    })
}

fn paths<'a>(it: impl Iterator<Item = &'a keel_core::FieldPath>) -> Vec<String> {
    it.map(ToString::to_string).collect()
}

fn plan_row(key: &str, plan: &ManifestPlan) -> serde_json::Value {
    json!({
        "manifest": key,
        "identity": plan.identity().to_string(),
        "exists": plan.exists(),
        "noop": plan.is_noop(),
        "summary": plan.summary(),
        "set": paths(plan.set_paths().iter()),
        "delete": paths(plan.deletions()),
        "drift": paths(plan.drift()),
    })
}

fn print_plan_human(plan: &ManifestPlan) {
    let id = plan.identity();
    if !plan.exists() {
        println!("+ {id}: create");
    } else if plan.is_noop() {
        println!("= {id}: no changes");
    } else {
        let s = plan.summary();
        println!("~ {id}: {} to add, {} to change, {} to remove", s.adds, s.updates, s.removes);
    }
    if plan.exists() {
        for p in plan.set_paths() {
            println!("    ~ {p}");
        }
    }
    for p in plan.deletions() {
        println!("    - {p}");
    }
    for p in plan.drift() {
        println!("    ! {p} (changed remotely by another manager; accepted)");
    }
}

fn print_json(v: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn finish(failed: usize, total: usize) -> Result<()> {
    if failed > 0 {
        anyhow::bail!("{failed} of {total} manifest(s) failed");
    }
    Ok(())
}

async fn run_plan(
    engine: &Engine,
    docs: Vec<Doc>,
    state: &StateFile,
    concurrency: usize,
    output: Output,
    cancel: &CancellationToken,
) -> Result<()> {
    let total = docs.len();
    let results: Vec<(Doc, KeelResult<ManifestPlan>)> = stream::iter(docs)
        .map(|doc| {
            let prior = state.objects.get(&doc.key);
            async move {
                let res = engine.plan(&doc.desired, prior, cancel).await;
                (doc, res)
            }
        })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    let mut failed = 0;
    let mut rows = Vec::new();
    for (doc, res) in &results {
        match res {
            Ok(plan) => match output {
                Output::Human => print_plan_human(plan),
                Output::Json => rows.push(plan_row(&doc.key, plan)),
            },
            Err(e) => {
                failed += 1;
                match output {
                    Output::Human => eprintln!("plan error: {e}"),
                    Output::Json => rows.push(json!({"manifest": doc.key, "error": e.to_string()})),
                }
            }
        }
    }
    if output == Output::Json {
        print_json(&json!(rows))?;
    }
    finish(failed, total)
}

enum Applied {
    Report(keel_api::ApplyReport),
    DryRun(HostValue),
}

async fn apply_one(
    engine: &Engine,
    doc: &Doc,
    prior: Option<&ManifestState>,
    wait: Option<&WaitTarget>,
    dry_run: bool,
    cancel: &CancellationToken,
) -> KeelResult<Applied> {
    let plan = engine.plan(&doc.desired, prior, cancel).await?;
    if dry_run {
        return Ok(Applied::DryRun(engine.dry_run(&plan, cancel).await?));
    }
    Ok(Applied::Report(engine.apply(&plan, wait, cancel).await?))
}

#[allow(clippy::too_many_arguments)]
async fn run_apply(
    engine: &Engine,
    docs: Vec<Doc>,
    state: &mut StateFile,
    state_path: &Path,
    concurrency: usize,
    wait: Option<WaitTarget>,
    dry_run: bool,
    output: Output,
    cancel: &CancellationToken,
) -> Result<()> {
    let total = docs.len();
    let results: Vec<(Doc, KeelResult<Applied>)> = {
        let snapshot = &*state;
        let wait = wait.as_ref();
        stream::iter(docs)
            .map(|doc| {
                let prior = snapshot.objects.get(&doc.key);
                async move {
                    let res = apply_one(engine, &doc, prior, wait, dry_run, cancel).await;
                    (doc, res)
                }
            })
            .buffered(concurrency.max(1))
            .collect()
            .await
    };

    let mut failed = 0;
    let mut rows = Vec::new();
    for (doc, res) in results {
        match res {
            Ok(Applied::Report(report)) => {
                let satisfied = report.wait.as_ref().map_or(true, |w| w.is_satisfied());
                if !satisfied {
                    failed += 1;
                }
                match output {
                    Output::Human => {
                        let verb = if report.created {
                            "created"
                        } else if report.changed {
                            "configured"
                        } else {
                            "unchanged"
                        };
                        println!("{} {verb}", report.state.identity);
                        if let Some(w) = &report.wait {
                            let reason = w.reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default();
                            println!("    wait {} after {} poll(s), {} ms{reason}", w.state.as_str(), w.polls, w.elapsed_ms);
                        }
                    }
                    Output::Json => rows.push(json!({
                        "manifest": doc.key,
                        "identity": report.state.identity.to_string(),
                        "created": report.created,
                        "changed": report.changed,
                        "wait": report.wait,
                    })),
                }
                state.objects.insert(doc.key, report.state);
            }
            Ok(Applied::DryRun(obj)) => match output {
                Output::Human => {
                    println!("{} (dry run)", doc.identity);
                    println!("{}", serde_json::to_string_pretty(&keel_convert::to_wire(&obj).map(serde_json::Value::from))?);
                }
                Output::Json => rows.push(json!({"manifest": doc.key, "dry_run": keel_convert::to_wire(&obj).map(serde_json::Value::from)})),
            },
            Err(e) => {
                failed += 1;
                match output {
                    Output::Human => eprintln!("apply error: {e}"),
                    Output::Json => rows.push(json!({"manifest": doc.key, "error": e.to_string()})),
                }
            }
        }
    }
    if !dry_run {
        state.save(state_path)?;
    }
    if output == Output::Json {
        print_json(&json!(rows))?;
    }
    finish(failed, total)
}

#[allow(clippy::too_many_arguments)]
async fn run_delete(
    engine: &Engine,
    docs: Vec<Doc>,
    state: &mut StateFile,
    state_path: &Path,
    concurrency: usize,
    wait: bool,
    output: Output,
    cancel: &CancellationToken,
) -> Result<()> {
    let total = docs.len();
    // generated names are only known from an earlier apply
    let targets: Vec<(String, ResourceIdentity)> = docs
        .into_iter()
        .filter_map(|doc| {
            let id = state.objects.get(&doc.key).map(|s| s.identity.clone()).unwrap_or(doc.identity);
            if id.is_generated() {
                warn!(object = %id, "no recorded name for generated object; skipping");
                return None;
            }
            Some((doc.key, id))
        })
        .collect();

    let results: Vec<_> = stream::iter(targets)
        .map(|(key, id)| async move {
            let res = engine.delete(&id, wait, cancel).await;
            (key, res)
        })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    let mut failed = 0;
    let mut rows = Vec::new();
    for (key, res) in results {
        match res {
            Ok(report) => {
                if report.wait.as_ref().map_or(false, |w| !w.is_satisfied()) {
                    failed += 1;
                }
                match output {
                    Output::Human => {
                        let verb = if report.existed { "deleted" } else { "already gone" };
                        println!("{} {verb}", report.identity);
                    }
                    Output::Json => rows.push(json!({"manifest": key, "report": report})),
                }
                state.objects.remove(&key);
            }
            Err(e) => {
                failed += 1;
                match output {
                    Output::Human => eprintln!("delete error: {e}"),
                    Output::Json => rows.push(json!({"manifest": key, "error": e.to_string()})),
                }
            }
        }
    }
    state.save(state_path)?;
    if output == Output::Json {
        print_json(&json!(rows))?;
    }
    finish(failed, total)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let mut config = engine_config(&cli);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received; cancelling");
                cancel.cancel();
            }
        }
    });

    match &cli.command {
        Commands::Plan { inputs } => {
            info!(files = inputs.files.len(), "plan invoked");
            let docs = load_docs(inputs, cli.namespace.as_deref(), &config)?;
            let state = StateFile::load(&cli.state)?;
            let engine = Engine::connect(config).await?;
            run_plan(&engine, docs, &state, inputs.concurrency, cli.output, &cancel).await
        }
        Commands::Apply { inputs, wait_condition, wait_field, wait_rollout, timeout, dry_run } => {
            info!(files = inputs.files.len(), dry_run, "apply invoked");
            if let Some(t) = timeout {
                config.wait.timeout_secs = *t;
            }
            let wait = wait_target(wait_condition, wait_field, *wait_rollout)?;
            let docs = load_docs(inputs, cli.namespace.as_deref(), &config)?;
            let mut state = StateFile::load(&cli.state)?;
            let engine = Engine::connect(config).await?;
            run_apply(&engine, docs, &mut state, &cli.state, inputs.concurrency, wait, *dry_run, cli.output, &cancel).await
        }
        Commands::Delete { inputs, wait, timeout } => {
            info!(files = inputs.files.len(), wait, "delete invoked");
            if let Some(t) = timeout {
                config.wait.timeout_secs = *t;
            }
            let docs = load_docs(inputs, cli.namespace.as_deref(), &config)?;
            let mut state = StateFile::load(&cli.state)?;
            let engine = Engine::connect(config).await?;
            run_delete(&engine, docs, &mut state, &cli.state, inputs.concurrency, *wait, cli.output, &cancel).await
        }
        Commands::Schema { gvk } => {
            info!(gvk = %gvk, "schema invoked");
            let engine = Engine::connect(config).await?;
            let resolved = engine.schema(gvk, &cancel).await?;
            match cli.output {
                Output::Human => {
                    let r = &resolved.resource;
                    let scope = if r.namespaced { "namespaced" } else { "cluster" };
                    println!("{} • {} • {} • schema from {}", r.gvk_key(), r.plural, scope, resolved.source);
                    print!("{}", resolved.schema.render_tree());
                }
                Output::Json => print_json(&json!({
                    "resource": resolved.resource,
                    "source": resolved.source,
                    "schema": &*resolved.schema,
                }))?,
            }
            Ok(())
        }
    }
}

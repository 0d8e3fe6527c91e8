pub mod command;
pub mod environment;
pub mod faults;
pub mod gateway;
pub mod key;
pub mod ledger;
pub mod plan;
pub mod poller;
pub mod sweep;
pub mod trial;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use crate::key::{ConfigurationKey, Dimension, DimensionValue, TrialParameters};
pub use crate::ledger::{FileBackend, ResultStore, TrialRecord, TrialStatus};
pub use crate::plan::{SweepOverrides, SweepPlan};
pub use crate::sweep::{SweepController, SweepSummary};
pub use crate::trial::{PayloadSpec, TrialExecutor, TrialFamily};

use crate::command::CommandLine;
use crate::environment::{ComposeEnvironment, Environment};
use crate::gateway::CliGateway;
use crate::poller::{Clock, SystemClock};

pub fn ensure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let written = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepResult {
    pub family: TrialFamily,
    pub ledger: PathBuf,
    pub cells: usize,
    pub target: usize,
    pub summary: SweepSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct CellStatus {
    pub key: String,
    pub completed: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepStatus {
    pub family: TrialFamily,
    pub ledger: PathBuf,
    pub target: usize,
    pub cells: Vec<CellStatus>,
    pub outstanding: usize,
}

fn load_plan(path: &Path, overrides: &SweepOverrides) -> Result<SweepPlan> {
    let mut plan = SweepPlan::load(path)?;
    plan.apply_overrides(overrides);
    if plan.target == 0 {
        return Err(anyhow!("target must be at least 1"));
    }
    Ok(plan)
}

fn plan_command(argv: &[String], plan: &SweepPlan) -> CommandLine {
    CommandLine::new(argv.to_vec()).in_dir(plan.base_dir())
}

fn compose_environment(plan: &SweepPlan, clock: Arc<dyn Clock>) -> ComposeEnvironment {
    let topology = &plan.topology;
    let renderer = if topology.render_command.is_empty() {
        None
    } else {
        Some(plan_command(&topology.render_command, plan))
    };
    ComposeEnvironment::new(
        renderer,
        plan_command(&topology.compose_command, plan),
        plan_command(&topology.docker_command, plan),
        plan.timings.warmup(),
        clock,
    )
}

fn cli_gateway(plan: &SweepPlan) -> Result<CliGateway> {
    CliGateway::new(
        plan_command(&plan.storage_cli.command, plan),
        plan.base_dir(),
        plan.endpoints.gateway_endpoints(),
    )
    .context("building storage gateway")
}

/// Run the sweep described by the plan at `plan_path` until every cell holds
/// `target` completed trials, resuming from whatever the ledger already has.
pub fn run_sweep(plan_path: &Path, overrides: &SweepOverrides) -> Result<SweepResult> {
    let plan = load_plan(plan_path, overrides)?;
    let keys = plan.configuration_keys()?;
    let mut cells: BTreeMap<ConfigurationKey, (TrialParameters, PayloadSpec)> = BTreeMap::new();
    for key in &keys {
        let params = plan.parameters_for(key)?;
        let payload = plan.payload_for(&params)?.clone();
        cells.insert(key.clone(), (params, payload));
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let env = compose_environment(&plan, clock.clone());
    let gateway = cli_gateway(&plan)?;
    let settings = plan.trial_settings();
    let mut store = ResultStore::load(FileBackend::new(&plan.ledger))?;

    tracing::info!(
        family = plan.family.as_str(),
        cells = keys.len(),
        target = plan.target,
        ledger = %plan.ledger.display(),
        "starting sweep"
    );
    // Clear whatever an interrupted run left behind.
    env.teardown();

    let executor = TrialExecutor::new(&env, &gateway, clock.as_ref(), &settings);
    let controller =
        SweepController::new(keys, plan.target).with_max_passes(plan.max_passes);
    let summary = controller.run(&mut store, |key| {
        let (params, payload) = &cells[key];
        executor.run(params, payload)
    })?;
    tracing::info!(
        passes = summary.passes,
        recorded = summary.recorded,
        outstanding = summary.outstanding,
        "sweep finished"
    );

    Ok(SweepResult {
        family: plan.family,
        ledger: plan.ledger.clone(),
        cells: controller.keys().len(),
        target: plan.target,
        summary,
    })
}

pub fn describe_sweep(plan_path: &Path, overrides: &SweepOverrides) -> Result<SweepStatus> {
    let plan = load_plan(plan_path, overrides)?;
    let store = ResultStore::load(FileBackend::new(&plan.ledger))?;
    let cells: Vec<CellStatus> = plan
        .configuration_keys()?
        .iter()
        .map(|key| CellStatus {
            key: key.ledger_key(),
            completed: store.completed(key),
            remaining: store.remaining(key, plan.target),
        })
        .collect();
    let outstanding = cells.iter().map(|c| c.remaining).sum();
    Ok(SweepStatus {
        family: plan.family,
        ledger: plan.ledger.clone(),
        target: plan.target,
        cells,
        outstanding,
    })
}

pub fn teardown_environment(plan_path: &Path) -> Result<()> {
    let plan = SweepPlan::load(plan_path)?;
    let env = compose_environment(&plan, Arc::new(SystemClock::new()));
    env.teardown();
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub payload_size: Option<String>,
    pub depth: Option<u32>,
    pub address: Option<String>,
}

pub fn download_payload(plan_path: &Path, request: &DownloadRequest) -> Result<Value> {
    let plan = SweepPlan::load(plan_path)?;
    let size = request
        .payload_size
        .clone()
        .unwrap_or_else(|| plan.defaults.payload_size.clone());
    let payload = plan
        .payloads
        .get(&size)
        .ok_or_else(|| anyhow!("no payload declared for size {}", size))?;
    let depth = request.depth.unwrap_or(plan.defaults.repair_depth);
    let address = request
        .address
        .clone()
        .unwrap_or_else(|| plan.endpoints.download_address.clone());
    let gateway = cli_gateway(&plan)?;
    tracing::info!(file = %payload.file_cid, depth, address = %address, "downloading payload");
    gateway
        .download(&payload.file_cid, &payload.meta_cid, depth, &address)
        .with_context(|| format!("downloading {}", payload.file_cid))?;
    Ok(serde_json::json!({
        "payload_size": size,
        "file_cid": payload.file_cid,
        "meta_cid": payload.meta_cid,
        "depth": depth,
        "address": address,
    }))
}

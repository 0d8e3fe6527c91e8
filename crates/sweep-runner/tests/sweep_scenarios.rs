use std::cell::{Cell, RefCell};
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use sweep_runner::command::CommandError;
use sweep_runner::environment::{Environment, TopologySpec};
use sweep_runner::faults::NodeNaming;
use sweep_runner::gateway::{CollabRepairRequest, OperationGateway, ProbeError, Recovery, UploadMode};
use sweep_runner::ledger::{LedgerBackend, MemoryBackend};
use sweep_runner::poller::ManualClock;
use sweep_runner::trial::{ErasureParams, Timings, TrialPhase, TrialSettings};
use sweep_runner::{
    ConfigurationKey, Dimension, DimensionValue, FileBackend, PayloadSpec, ResultStore,
    SweepController, TrialExecutor, TrialFamily, TrialParameters, TrialRecord, TrialStatus,
};

#[derive(Default)]
struct StubEnvironment {
    provisions: Cell<usize>,
    teardowns: Cell<usize>,
}

impl Environment for StubEnvironment {
    fn provision(&self, _spec: &TopologySpec) -> anyhow::Result<()> {
        self.provisions.set(self.provisions.get() + 1);
        Ok(())
    }

    fn teardown(&self) {
        self.teardowns.set(self.teardowns.get() + 1);
    }

    fn stop_containers(&self, _names: &[String]) -> Result<(), CommandError> {
        Ok(())
    }
}

/// Storage stub that completes every operation on the first probe.
struct StubGateway {
    pinned: bool,
    peers: usize,
    repairs: RefCell<Vec<CollabRepairRequest>>,
}

impl StubGateway {
    fn completing(peers: usize) -> Self {
        Self {
            pinned: true,
            peers,
            repairs: RefCell::new(Vec::new()),
        }
    }
}

impl OperationGateway for StubGateway {
    fn upload(&self, _payload: &Path, _mode: &UploadMode) -> Result<(), CommandError> {
        Ok(())
    }

    fn pin_status(&self, _meta_cid: &str) -> Result<bool, ProbeError> {
        Ok(self.pinned)
    }

    fn download_count(
        &self,
        _file_cid: &str,
        _meta_cid: Option<&str>,
        _depth: u32,
        _with_metrics: bool,
    ) -> Result<Recovery, CommandError> {
        Ok(Recovery::Count(1290))
    }

    fn trigger_collab_repair(&self, request: &CollabRepairRequest) -> Result<(), ProbeError> {
        self.repairs.borrow_mut().push(request.clone());
        Ok(())
    }

    fn repair_done(&self) -> Result<bool, ProbeError> {
        Ok(true)
    }

    fn fetch_metrics(&self) -> Result<Value, ProbeError> {
        Ok(json!({"repairTime": 3.5, "blocksRepaired": 1290}))
    }

    fn count_active_peers(&self) -> Result<usize, ProbeError> {
        Ok(self.peers)
    }
}

fn scenario_key() -> ConfigurationKey {
    ConfigurationKey::new(vec![
        (Dimension::NodeCount, DimensionValue::Count(20)),
        (Dimension::FaultCount, DimensionValue::Count(1)),
        (Dimension::RepairDepth, DimensionValue::Count(5)),
    ])
}

fn settings(family: TrialFamily) -> TrialSettings {
    TrialSettings {
        family,
        timings: Timings::default(),
        erasure: ErasureParams::default(),
        naming: NodeNaming::default(),
    }
}

fn payload() -> PayloadSpec {
    PayloadSpec {
        path: "largefile_25MB.txt".into(),
        file_cid: "QmFile".to_string(),
        meta_cid: "QmMeta".to_string(),
        total_blocks: Some(1290),
    }
}

fn params(key: &ConfigurationKey) -> TrialParameters {
    TrialParameters::default().resolve(key).expect("resolve")
}

fn completed_record() -> TrialRecord {
    let now = Utc::now();
    TrialRecord {
        status: TrialStatus::Success,
        started_at: now,
        finished_at: now,
        phase: TrialPhase::Completed,
        metrics: json!({"repairTime": 1.0}),
        detail: None,
    }
}

#[test]
fn scenario_a_empty_ledger_fills_to_target() {
    let key = scenario_key();
    let env = StubEnvironment::default();
    let gateway = StubGateway::completing(19);
    let clock = ManualClock::new();
    let s = settings(TrialFamily::CollabRepair);
    let executor = TrialExecutor::new(&env, &gateway, &clock, &s);
    let backend = MemoryBackend::new();
    let mut store = ResultStore::load(backend.clone()).expect("load");

    let summary = SweepController::new(vec![key.clone()], 10)
        .run(&mut store, |k| executor.run(&params(k), &payload()))
        .expect("sweep");

    assert_eq!(summary.recorded, 10);
    assert_eq!(summary.attempts, 10);
    assert_eq!(store.completed(&key), 10);
    assert_eq!(store.remaining(&key, 10), 0);
    assert_eq!(backend.write_count(), 10);
    assert_eq!(env.provisions.get(), 10);
    assert_eq!(env.teardowns.get(), 10);
    assert_eq!(gateway.repairs.borrow().len(), 10);
    assert!(store
        .records(&key)
        .iter()
        .all(|r| r.metrics == json!({"repairTime": 3.5, "blocksRepaired": 1290})));
}

#[test]
fn scenario_b_pin_never_converges_times_out_without_record() {
    let key = scenario_key();
    let env = StubEnvironment::default();
    let gateway = StubGateway {
        pinned: false,
        ..StubGateway::completing(19)
    };
    let clock = ManualClock::new();
    let s = settings(TrialFamily::CollabRepair);
    let executor = TrialExecutor::new(&env, &gateway, &clock, &s);
    let backend = MemoryBackend::new();
    let mut store = ResultStore::load(backend.clone()).expect("load");

    let mut outcomes = Vec::new();
    let summary = SweepController::new(vec![key.clone()], 1)
        .with_max_passes(Some(1))
        .run(&mut store, |k| {
            let record = executor.run(&params(k), &payload());
            outcomes.push(record.status);
            record
        })
        .expect("sweep");

    assert_eq!(outcomes, vec![TrialStatus::TimedOut]);
    assert_eq!(clock.elapsed(), Duration::from_secs(300));
    assert_eq!(env.teardowns.get(), 1);
    assert_eq!(summary.recorded, 0);
    assert_eq!(summary.outstanding, 1);
    assert_eq!(store.completed(&key), 0);
    assert_eq!(backend.write_count(), 0);
    assert!(gateway.repairs.borrow().is_empty());
}

#[test]
fn scenario_c_partial_ledger_runs_only_the_difference() {
    let key = scenario_key();
    let backend = MemoryBackend::new();
    {
        let mut seed = ResultStore::load(backend.clone()).expect("load");
        for _ in 0..4 {
            seed.append(&key, completed_record()).expect("seed");
        }
    }

    let env = StubEnvironment::default();
    let gateway = StubGateway::completing(19);
    let clock = ManualClock::new();
    let s = settings(TrialFamily::CollabRepair);
    let executor = TrialExecutor::new(&env, &gateway, &clock, &s);
    let mut store = ResultStore::load(backend.clone()).expect("reload");
    assert_eq!(store.completed(&key), 4);

    let summary = SweepController::new(vec![key.clone()], 10)
        .run(&mut store, |k| executor.run(&params(k), &payload()))
        .expect("sweep");

    assert_eq!(summary.attempts, 6);
    assert_eq!(summary.recorded, 6);
    assert_eq!(env.teardowns.get(), 6);
    let reloaded = ResultStore::load(backend).expect("reload");
    assert_eq!(reloaded.completed(&key), 10);
}

#[test]
fn scenario_d_malformed_ledger_file_loads_empty() {
    let root = std::env::temp_dir().join(format!(
        "sweep_scenario_d_{}_{}",
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    std::fs::create_dir_all(&root).expect("temp dir");
    let path = root.join("results.json");
    std::fs::write(&path, "{\"node_count=20/fault_count=1\": [{\"status\": ").expect("write");

    let mut store = ResultStore::load(FileBackend::new(&path)).expect("malformed ledger is not fatal");
    assert!(store.ledger().is_empty());
    assert_eq!(store.remaining(&scenario_key(), 10), 10);

    // The first append replaces the garbage with a well-formed ledger.
    store
        .append(&scenario_key(), completed_record())
        .expect("append");
    let reloaded = ResultStore::load(FileBackend::new(&path)).expect("reload");
    assert_eq!(reloaded.completed(&scenario_key()), 1);
    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn resumption_issues_exactly_target_minus_completed() {
    let key = scenario_key();
    let target = 5;
    for already in 0..=target + 1 {
        let backend = MemoryBackend::new();
        let mut store = ResultStore::load(backend).expect("load");
        for _ in 0..already {
            store.append(&key, completed_record()).expect("seed");
        }
        let mut issued = 0;
        SweepController::new(vec![key.clone()], target)
            .run(&mut store, |_| {
                issued += 1;
                completed_record()
            })
            .expect("sweep");
        assert_eq!(issued, target.saturating_sub(already), "with {} already", already);
        assert_eq!(store.completed(&key), target.max(already));
    }
}

#[test]
fn interrupted_sweeps_never_lose_records() {
    let keys = vec![
        scenario_key(),
        ConfigurationKey::new(vec![
            (Dimension::NodeCount, DimensionValue::Count(20)),
            (Dimension::FaultCount, DimensionValue::Count(3)),
            (Dimension::RepairDepth, DimensionValue::Count(5)),
        ]),
    ];
    let backend = MemoryBackend::new();
    let mut observed: Vec<Vec<usize>> = Vec::new();

    // Each invocation dies on its third ledger write.
    for _ in 0..4 {
        backend.fail_writes(false);
        let mut store = ResultStore::load(backend.clone()).expect("load");
        observed.push(keys.iter().map(|k| store.completed(k)).collect());
        let writes_before = backend.write_count();
        let trigger = backend.clone();
        let result = SweepController::new(keys.clone(), 3).run(&mut store, |_| {
            if trigger.write_count() >= writes_before + 2 {
                trigger.fail_writes(true);
            }
            completed_record()
        });
        if result.is_ok() {
            break;
        }
    }
    backend.fail_writes(false);
    let store = ResultStore::load(backend.clone()).expect("final load");
    observed.push(keys.iter().map(|k| store.completed(k)).collect());

    for window in observed.windows(2) {
        for (before, after) in window[0].iter().zip(&window[1]) {
            assert!(after >= before, "ledger shrank: {:?}", observed);
        }
    }
    assert_eq!(observed.last(), Some(&vec![3, 3]));
    assert!(backend.describe().contains("memory"));
}

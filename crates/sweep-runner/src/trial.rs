use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::environment::{Environment, EnvironmentHandle, TopologySpec};
use crate::faults::{inject_faults, FaultMode, NodeNaming};
use crate::gateway::{CollabRepairRequest, OperationGateway, Recovery, UploadMode};
use crate::key::TrialParameters;
use crate::ledger::{TrialRecord, TrialStatus};
use crate::poller::{await_condition, Clock, PollOutcome, PollSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialPhase {
    Idle,
    Provisioned,
    Uploaded,
    PinConverged,
    Faulted,
    PeersConverged,
    OperationTriggered,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialFamily {
    Reliability,
    Replication,
    SingleRepair,
    CollabRepair,
}

impl TrialFamily {
    pub fn community(self) -> bool {
        self == TrialFamily::CollabRepair
    }

    pub fn fault_mode(self) -> FaultMode {
        if self.community() {
            FaultMode::CommunityAware
        } else {
            FaultMode::Uniform
        }
    }

    pub fn waits_for_pin(self) -> bool {
        self != TrialFamily::Replication
    }

    pub fn waits_for_discovery(self) -> bool {
        self == TrialFamily::CollabRepair
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrialFamily::Reliability => "reliability",
            TrialFamily::Replication => "replication",
            TrialFamily::SingleRepair => "single_repair",
            TrialFamily::CollabRepair => "collab_repair",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub warmup_secs: u64,
    pub poll_interval_secs: u64,
    pub pin_timeout_secs: u64,
    pub settle_secs: u64,
    pub discovery_timeout_secs: u64,
    pub repair_timeout_secs: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            warmup_secs: 5,
            poll_interval_secs: 3,
            pin_timeout_secs: 300,
            settle_secs: 120,
            discovery_timeout_secs: 300,
            repair_timeout_secs: 1800,
        }
    }
}

impl Timings {
    fn poll(&self, timeout_secs: u64) -> PollSpec {
        PollSpec::new(
            Duration::from_secs(self.poll_interval_secs),
            Duration::from_secs(timeout_secs),
        )
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSpec {
    pub path: PathBuf,
    pub file_cid: String,
    pub meta_cid: String,
    #[serde(default)]
    pub total_blocks: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErasureParams {
    pub alpha: u32,
    pub s: u32,
    pub p: u32,
}

impl Default for ErasureParams {
    fn default() -> Self {
        Self { alpha: 3, s: 5, p: 5 }
    }
}

#[derive(Debug, Clone)]
pub struct TrialSettings {
    pub family: TrialFamily,
    pub timings: Timings,
    pub erasure: ErasureParams,
    pub naming: NodeNaming,
}

enum Interrupted {
    TimedOut(String),
    Failed(String),
}

pub struct TrialExecutor<'a> {
    env: &'a dyn Environment,
    gateway: &'a dyn OperationGateway,
    clock: &'a dyn Clock,
    settings: &'a TrialSettings,
}

impl<'a> TrialExecutor<'a> {
    pub fn new(
        env: &'a dyn Environment,
        gateway: &'a dyn OperationGateway,
        clock: &'a dyn Clock,
        settings: &'a TrialSettings,
    ) -> Self {
        Self {
            env,
            gateway,
            clock,
            settings,
        }
    }

    /// Run one trial. Never fails: problems end up in the record's status.
    pub fn run(&self, params: &TrialParameters, payload: &PayloadSpec) -> TrialRecord {
        let started_at = Utc::now();
        let spec = TopologySpec {
            params: params.clone(),
            community: self.settings.family.community(),
        };
        let mut phase = TrialPhase::Idle;
        let result = match EnvironmentHandle::provision(self.env, &spec) {
            Err(err) => Err(Interrupted::Failed(format!("provision: {:#}", err))),
            Ok(handle) => {
                phase = TrialPhase::Provisioned;
                let result = self.drive(&handle, params, payload, &mut phase);
                handle.teardown();
                result
            }
        };

        let (status, metrics, detail) = match result {
            Ok((status, metrics)) => (status, metrics, None),
            Err(Interrupted::TimedOut(what)) => {
                tracing::warn!(phase = ?phase, "trial timed out waiting for {}", what);
                (
                    TrialStatus::TimedOut,
                    Value::Null,
                    Some(format!("timed out waiting for {}", what)),
                )
            }
            Err(Interrupted::Failed(why)) => {
                tracing::warn!(phase = ?phase, "trial failed: {}", why);
                (TrialStatus::Failed, Value::Null, Some(why))
            }
        };
        TrialRecord {
            status,
            started_at,
            finished_at: Utc::now(),
            phase,
            metrics,
            detail,
        }
    }

    fn drive(
        &self,
        handle: &EnvironmentHandle<'_>,
        params: &TrialParameters,
        payload: &PayloadSpec,
        phase: &mut TrialPhase,
    ) -> Result<(TrialStatus, Value), Interrupted> {
        let family = self.settings.family;
        let timings = &self.settings.timings;

        self.gateway
            .upload(&payload.path, &self.upload_mode(params))
            .map_err(|e| Interrupted::Failed(format!("upload: {}", e)))?;
        *phase = TrialPhase::Uploaded;

        if family.waits_for_pin() {
            let meta_cid = payload.meta_cid.as_str();
            let outcome = await_condition(self.clock, timings.poll(timings.pin_timeout_secs), || {
                self.gateway.pin_status(meta_cid)
            });
            expect_satisfied(outcome, "pin convergence")?;
            *phase = TrialPhase::PinConverged;
        }
        self.clock.sleep(Duration::from_secs(timings.settle_secs));

        inject_faults(
            handle.environment(),
            &self.settings.naming,
            params.fault_count as usize,
            family.fault_mode(),
        )
        .map_err(|e| Interrupted::Failed(format!("fault injection: {}", e)))?;
        *phase = TrialPhase::Faulted;

        if family.waits_for_discovery() {
            let expected = params.expected_survivors() as usize;
            let outcome = await_condition(
                self.clock,
                timings.poll(timings.discovery_timeout_secs),
                || Ok(self.gateway.count_active_peers()? == expected),
            );
            expect_satisfied(outcome, "peer discovery convergence")?;
            *phase = TrialPhase::PeersConverged;
        }

        let measured = match family {
            TrialFamily::Reliability => {
                self.count_blocks(payload, Some(payload.meta_cid.as_str()), params.repair_depth)?
            }
            TrialFamily::Replication => self.count_blocks(payload, None, 1)?,
            TrialFamily::SingleRepair => {
                let recovery = self
                    .gateway
                    .download_count(
                        &payload.file_cid,
                        Some(payload.meta_cid.as_str()),
                        params.repair_depth,
                        true,
                    )
                    .map_err(|e| Interrupted::Failed(format!("download: {}", e)))?;
                (TrialStatus::Success, recovery.into_value())
            }
            TrialFamily::CollabRepair => {
                let request = CollabRepairRequest {
                    file_cid: payload.file_cid.clone(),
                    meta_cid: payload.meta_cid.clone(),
                    depth: params.repair_depth,
                    origin: String::new(),
                    num_peers: params.repair_peers,
                };
                if let Err(err) = self.gateway.trigger_collab_repair(&request) {
                    tracing::warn!(error = %err, "repair trigger not acknowledged, waiting for completion anyway");
                }
                *phase = TrialPhase::OperationTriggered;
                let outcome = await_condition(
                    self.clock,
                    timings.poll(timings.repair_timeout_secs),
                    || self.gateway.repair_done(),
                );
                expect_satisfied(outcome, "repair completion")?;
                let metrics = self
                    .gateway
                    .fetch_metrics()
                    .map_err(|e| Interrupted::Failed(format!("fetching repair metrics: {}", e)))?;
                (TrialStatus::Success, metrics)
            }
        };
        *phase = TrialPhase::Completed;
        Ok(measured)
    }

    fn count_blocks(
        &self,
        payload: &PayloadSpec,
        meta_cid: Option<&str>,
        depth: u32,
    ) -> Result<(TrialStatus, Value), Interrupted> {
        let recovery = self
            .gateway
            .download_count(&payload.file_cid, meta_cid, depth, false)
            .map_err(|e| Interrupted::Failed(format!("download count: {}", e)))?;
        let status = match (&recovery, payload.total_blocks) {
            (Recovery::Count(n), Some(total)) if *n < total => TrialStatus::Partial,
            _ => TrialStatus::Success,
        };
        if let (Recovery::Count(n), Some(total)) = (&recovery, payload.total_blocks) {
            tracing::info!("total blocks retrieved: {}/{}", n, total);
        }
        Ok((status, recovery.into_value()))
    }

    fn upload_mode(&self, params: &TrialParameters) -> UploadMode {
        match self.settings.family {
            TrialFamily::Replication => UploadMode::DirectReplication(params.replication_factor),
            _ => UploadMode::Erasure {
                alpha: self.settings.erasure.alpha,
                s: self.settings.erasure.s,
                p: self.settings.erasure.p,
                // Pin on every node so pin convergence covers the whole cluster.
                replication: params.node_count,
            },
        }
    }
}

fn expect_satisfied(outcome: PollOutcome, what: &str) -> Result<(), Interrupted> {
    match outcome {
        PollOutcome::Satisfied { probes, waited } => {
            tracing::info!(probes, waited_secs = waited.as_secs(), "{} reached", what);
            Ok(())
        }
        PollOutcome::TimedOut { .. } => Err(Interrupted::TimedOut(what.to_string())),
    }
}

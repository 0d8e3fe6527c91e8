use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::faults::{max_faults, NodeNaming};
use crate::gateway::GatewayEndpoints;
use crate::key::{ConfigurationKey, Dimension, DimensionValue, TrialParameters};
use crate::trial::{ErasureParams, PayloadSpec, Timings, TrialFamily, TrialSettings};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Axis {
    pub dimension: Dimension,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<DimensionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<u32>,
    /// Range end as `node_count - n`, evaluated per cell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_below_nodes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
}

impl Axis {
    fn is_range(&self) -> bool {
        self.start.is_some() || self.end.is_some() || self.end_below_nodes.is_some()
    }

    fn values_for(&self, node_count: u32) -> Vec<DimensionValue> {
        if !self.is_range() {
            return self.values.clone();
        }
        let start = self.start.unwrap_or(0);
        let end = match (self.end, self.end_below_nodes) {
            (Some(end), _) => end,
            (None, Some(below)) => node_count.saturating_sub(below),
            (None, None) => start,
        };
        let step = self.step.unwrap_or(1).max(1) as usize;
        (start..end)
            .step_by(step)
            .map(DimensionValue::Count)
            .collect()
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let name = self.dimension.as_str();
        if self.is_range() {
            if !self.values.is_empty() {
                problems.push(format!("grid axis {}: give either values or a range, not both", name));
            }
            if self.dimension == Dimension::PayloadSize {
                problems.push("grid axis payload_size: ranges are only valid for counts".to_string());
            }
            if self.end.is_some() == self.end_below_nodes.is_some() {
                problems.push(format!(
                    "grid axis {}: range needs exactly one of end / end_below_nodes",
                    name
                ));
            }
            if self.step == Some(0) {
                problems.push(format!("grid axis {}: step must be positive", name));
            }
            if self.end_below_nodes.is_some() && self.dimension == Dimension::NodeCount {
                problems.push("grid axis node_count: end_below_nodes is circular".to_string());
            }
        } else if self.values.is_empty() {
            problems.push(format!("grid axis {}: no values", name));
        }
        for value in &self.values {
            let ok = match (self.dimension, value) {
                (Dimension::PayloadSize, DimensionValue::Size(_)) => true,
                (Dimension::PayloadSize, DimensionValue::Count(_)) => false,
                (_, DimensionValue::Count(_)) => true,
                (_, DimensionValue::Size(_)) => false,
            };
            if !ok {
                problems.push(format!("grid axis {}: invalid value {}", name, value));
            }
            // `/` and `=` delimit ledger key segments.
            if let DimensionValue::Size(label) = value {
                if label.contains(|c| c == '/' || c == '=') {
                    problems.push(format!(
                        "grid axis {}: label '{}' may not contain '/' or '='",
                        name, label
                    ));
                }
            }
        }
        problems
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub render_command: Vec<String>,
    pub compose_command: Vec<String>,
    pub docker_command: Vec<String>,
    pub naming: NodeNaming,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            render_command: Vec::new(),
            compose_command: vec!["docker-compose".to_string()],
            docker_command: vec!["docker".to_string()],
            naming: NodeNaming::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageCliConfig {
    pub command: Vec<String>,
    #[serde(flatten)]
    pub erasure: ErasureParams,
}

impl Default for StorageCliConfig {
    fn default() -> Self {
        Self {
            command: vec!["go".to_string(), "run".to_string(), "../main.go".to_string()],
            erasure: ErasureParams::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub control_api: String,
    pub repair_api: String,
    pub cluster_api: String,
    pub download_address: String,
    pub request_timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            control_api: "http://localhost:3000".to_string(),
            repair_api: "http://localhost:7071".to_string(),
            cluster_api: "http://localhost:9095".to_string(),
            download_address: "localhost:7071".to_string(),
            request_timeout_secs: 10,
        }
    }
}

impl EndpointConfig {
    pub fn gateway_endpoints(&self) -> GatewayEndpoints {
        GatewayEndpoints {
            control_api: self.control_api.trim_end_matches('/').to_string(),
            repair_api: self.repair_api.trim_end_matches('/').to_string(),
            cluster_api: self.cluster_api.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SweepOverrides {
    pub ledger: Option<PathBuf>,
    pub target: Option<usize>,
    pub max_passes: Option<usize>,
}

fn default_target() -> usize {
    10
}

fn default_ledger() -> PathBuf {
    PathBuf::from("results.json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepPlan {
    pub family: TrialFamily,
    #[serde(default = "default_target")]
    pub target: usize,
    #[serde(default = "default_ledger")]
    pub ledger: PathBuf,
    #[serde(default)]
    pub max_passes: Option<usize>,
    #[serde(default)]
    pub defaults: TrialParameters,
    #[serde(default)]
    pub grid: Vec<Axis>,
    #[serde(default)]
    pub payloads: BTreeMap<String, PayloadSpec>,
    #[serde(default)]
    pub timings: Timings,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub storage_cli: StorageCliConfig,
    #[serde(default)]
    pub endpoints: EndpointConfig,
    #[serde(skip)]
    base_dir: PathBuf,
}

impl SweepPlan {
    pub fn load(path: &Path) -> Result<Self> {
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .canonicalize()
            .unwrap_or_else(|_| PathBuf::from("."));
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading sweep plan {}", path.display()))?;
        Self::from_yaml_str(&raw, &base_dir)
            .with_context(|| format!("loading sweep plan {}", path.display()))
    }

    pub fn from_yaml_str(raw: &str, base_dir: &Path) -> Result<Self> {
        let mut plan: SweepPlan = serde_yaml::from_str(raw)?;
        plan.base_dir = base_dir.to_path_buf();
        plan.ledger = plan.resolve_path(&plan.ledger);
        let resolved: BTreeMap<String, PayloadSpec> = plan
            .payloads
            .iter()
            .map(|(size, spec)| {
                let mut spec = spec.clone();
                spec.path = plan.resolve_path(&spec.path);
                (size.clone(), spec)
            })
            .collect();
        plan.payloads = resolved;
        plan.validate()?;
        Ok(plan)
    }

    pub fn apply_overrides(&mut self, overrides: &SweepOverrides) {
        if let Some(ledger) = &overrides.ledger {
            self.ledger = ledger.clone();
        }
        if let Some(target) = overrides.target {
            self.target = target;
        }
        if overrides.max_passes.is_some() {
            self.max_passes = overrides.max_passes;
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn configuration_keys(&self) -> Result<Vec<ConfigurationKey>> {
        let mut partial: Vec<Vec<(Dimension, DimensionValue)>> = vec![Vec::new()];
        for axis in &self.grid {
            let mut next = Vec::new();
            for entries in &partial {
                let node_count = self
                    .defaults
                    .resolve(&ConfigurationKey::new(entries.clone()))?
                    .node_count;
                for value in axis.values_for(node_count) {
                    let mut extended = entries.clone();
                    extended.push((axis.dimension, value));
                    next.push(extended);
                }
            }
            partial = next;
        }
        Ok(partial.into_iter().map(ConfigurationKey::new).collect())
    }

    pub fn parameters_for(&self, key: &ConfigurationKey) -> Result<TrialParameters> {
        self.defaults.resolve(key)
    }

    pub fn payload_for(&self, params: &TrialParameters) -> Result<&PayloadSpec> {
        self.payloads
            .get(&params.payload_size)
            .ok_or_else(|| anyhow!("no payload declared for size {}", params.payload_size))
    }

    pub fn trial_settings(&self) -> TrialSettings {
        TrialSettings {
            family: self.family,
            timings: self.timings.clone(),
            erasure: self.storage_cli.erasure,
            naming: self.topology.naming.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.target == 0 {
            problems.push("target must be at least 1".to_string());
        }
        if self.timings.poll_interval_secs == 0 {
            problems.push("timings.poll_interval_secs must be positive".to_string());
        }
        if self.storage_cli.command.is_empty() {
            problems.push("storage_cli.command is empty".to_string());
        }
        if self.topology.compose_command.is_empty() {
            problems.push("topology.compose_command is empty".to_string());
        }
        if self.topology.docker_command.is_empty() {
            problems.push("topology.docker_command is empty".to_string());
        }

        let mut seen = BTreeSet::new();
        for axis in &self.grid {
            if !seen.insert(axis.dimension) {
                problems.push(format!("grid axis {} declared twice", axis.dimension));
            }
            problems.extend(axis.problems());
        }

        // Per-cell checks only make sense once the axes themselves are sound.
        if problems.is_empty() {
            match self.configuration_keys() {
                Err(err) => problems.push(format!("{:#}", err)),
                Ok(keys) if keys.is_empty() => problems.push("grid expands to no cells".to_string()),
                Ok(keys) => {
                    let mut missing_payloads = BTreeSet::new();
                    for key in &keys {
                        let params = match self.parameters_for(key) {
                            Ok(p) => p,
                            Err(err) => {
                                problems.push(format!("{}: {:#}", key, err));
                                continue;
                            }
                        };
                        if params.node_count < 2 {
                            problems.push(format!("{}: topology needs at least 2 nodes", key));
                        } else if params.fault_count as usize > max_faults(params.node_count as usize) {
                            problems.push(format!(
                                "{}: {} faults would disable node 1 of {}",
                                key, params.fault_count, params.node_count
                            ));
                        }
                        if !self.payloads.contains_key(&params.payload_size) {
                            missing_payloads.insert(params.payload_size.clone());
                        }
                    }
                    for size in missing_payloads {
                        problems.push(format!("payloads: no entry for size {}", size));
                    }
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "sweep plan is invalid:\n{}",
                problems
                    .iter()
                    .map(|p| format!("  - {}", p))
                    .collect::<Vec<_>>()
                    .join("\n")
            ))
        }
    }
}

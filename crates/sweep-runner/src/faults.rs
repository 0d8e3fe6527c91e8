use serde::{Deserialize, Serialize};

use crate::command::CommandError;
use crate::environment::Environment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultMode {
    Uniform,
    CommunityAware,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeNaming {
    pub storage_prefix: String,
    pub overlay_prefix: String,
    pub cluster_prefix: String,
}

impl Default for NodeNaming {
    fn default() -> Self {
        Self {
            storage_prefix: "storage".to_string(),
            overlay_prefix: "overlay".to_string(),
            cluster_prefix: "cluster".to_string(),
        }
    }
}

impl NodeNaming {
    pub fn containers_for(&self, index: usize, mode: FaultMode) -> Vec<String> {
        let mut names = vec![format!("{}{}", self.storage_prefix, index)];
        if mode == FaultMode::CommunityAware {
            names.push(format!("{}{}", self.overlay_prefix, index));
        }
        names.push(format!("{}{}", self.cluster_prefix, index));
        names
    }
}

/// Node indices disabled for `count` faults: `[0, 2, 3, ..., count]`.
/// Index 1 serves the endpoints used after faults and is never stopped.
pub fn fault_targets(count: usize) -> Vec<usize> {
    if count == 0 {
        return Vec::new();
    }
    std::iter::once(0).chain(2..=count).collect()
}

pub fn max_faults(node_count: usize) -> usize {
    node_count.saturating_sub(1)
}

pub fn inject_faults(
    env: &dyn Environment,
    naming: &NodeNaming,
    count: usize,
    mode: FaultMode,
) -> Result<Vec<usize>, CommandError> {
    let targets = fault_targets(count);
    for index in &targets {
        let names = naming.containers_for(*index, mode);
        tracing::info!(node = index, containers = ?names, "disabling node");
        env.stop_containers(&names)?;
    }
    Ok(targets)
}

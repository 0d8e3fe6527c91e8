use std::fmt;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    NodeCount,
    FaultCount,
    RepairDepth,
    RepairPeers,
    ReplicationFactor,
    PayloadSize,
}

impl Dimension {
    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::NodeCount => "node_count",
            Dimension::FaultCount => "fault_count",
            Dimension::RepairDepth => "repair_depth",
            Dimension::RepairPeers => "repair_peers",
            Dimension::ReplicationFactor => "replication_factor",
            Dimension::PayloadSize => "payload_size",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DimensionValue {
    Count(u32),
    Size(String),
}

impl fmt::Display for DimensionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimensionValue::Count(n) => write!(f, "{}", n),
            DimensionValue::Size(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigurationKey {
    entries: Vec<(Dimension, DimensionValue)>,
}

impl ConfigurationKey {
    pub fn new(entries: Vec<(Dimension, DimensionValue)>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[(Dimension, DimensionValue)] {
        &self.entries
    }

    pub fn ledger_key(&self) -> String {
        self.entries
            .iter()
            .map(|(d, v)| format!("{}={}", d, v))
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl fmt::Display for ConfigurationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .entries
            .iter()
            .map(|(d, v)| format!("{}: {}", d, v))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "({})", rendered)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialParameters {
    pub node_count: u32,
    pub fault_count: u32,
    pub repair_depth: u32,
    pub repair_peers: u32,
    pub replication_factor: u32,
    pub payload_size: String,
}

impl Default for TrialParameters {
    fn default() -> Self {
        Self {
            node_count: 10,
            fault_count: 0,
            repair_depth: 5,
            repair_peers: 3,
            replication_factor: 4,
            payload_size: "25MB".to_string(),
        }
    }
}

impl TrialParameters {
    pub fn resolve(&self, key: &ConfigurationKey) -> Result<Self> {
        let mut params = self.clone();
        for (dimension, value) in key.entries() {
            params.set(*dimension, value)?;
        }
        Ok(params)
    }

    pub fn set(&mut self, dimension: Dimension, value: &DimensionValue) -> Result<()> {
        match (dimension, value) {
            (Dimension::PayloadSize, DimensionValue::Size(s)) => self.payload_size = s.clone(),
            (Dimension::PayloadSize, DimensionValue::Count(n)) => {
                return Err(anyhow!("payload_size expects a size label, got {}", n));
            }
            (_, DimensionValue::Size(s)) => {
                return Err(anyhow!("{} expects an integer, got '{}'", dimension, s));
            }
            (Dimension::NodeCount, DimensionValue::Count(n)) => self.node_count = *n,
            (Dimension::FaultCount, DimensionValue::Count(n)) => self.fault_count = *n,
            (Dimension::RepairDepth, DimensionValue::Count(n)) => self.repair_depth = *n,
            (Dimension::RepairPeers, DimensionValue::Count(n)) => self.repair_peers = *n,
            (Dimension::ReplicationFactor, DimensionValue::Count(n)) => {
                self.replication_factor = *n
            }
        }
        Ok(())
    }

    pub fn expected_survivors(&self) -> u32 {
        self.node_count.saturating_sub(self.fault_count)
    }
}

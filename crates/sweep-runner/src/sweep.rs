use anyhow::Result;
use serde::Serialize;

use crate::key::ConfigurationKey;
use crate::ledger::{LedgerBackend, ResultStore, TrialRecord};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub passes: usize,
    pub attempts: usize,
    pub recorded: usize,
    pub discarded: usize,
    pub outstanding: usize,
}

pub struct SweepController {
    keys: Vec<ConfigurationKey>,
    target: usize,
    max_passes: Option<usize>,
}

impl SweepController {
    pub fn new(keys: Vec<ConfigurationKey>, target: usize) -> Self {
        Self {
            keys,
            target,
            max_passes: None,
        }
    }

    pub fn with_max_passes(mut self, max_passes: Option<usize>) -> Self {
        self.max_passes = max_passes;
        self
    }

    pub fn keys(&self) -> &[ConfigurationKey] {
        &self.keys
    }

    pub fn outstanding<B: LedgerBackend>(&self, store: &ResultStore<B>) -> usize {
        self.keys
            .iter()
            .map(|k| store.remaining(k, self.target))
            .sum()
    }

    pub fn run<B, F>(&self, store: &mut ResultStore<B>, mut trial: F) -> Result<SweepSummary>
    where
        B: LedgerBackend,
        F: FnMut(&ConfigurationKey) -> TrialRecord,
    {
        let mut summary = SweepSummary::default();
        loop {
            let outstanding = self.outstanding(store);
            if outstanding == 0 {
                break;
            }
            if self.max_passes.is_some_and(|max| summary.passes >= max) {
                tracing::warn!(outstanding, "pass limit reached with trials outstanding");
                break;
            }
            summary.passes += 1;
            tracing::info!(pass = summary.passes, outstanding, "starting sweep pass");

            for key in &self.keys {
                let remaining = store.remaining(key, self.target);
                tracing::info!(
                    "{}: completed {}, total runs {}",
                    key,
                    store.completed(key),
                    remaining
                );
                for attempt in 1..=remaining {
                    summary.attempts += 1;
                    tracing::info!("{}: trial {}/{}", key, attempt, remaining);
                    let record = trial(key);
                    if record.status.is_recordable() {
                        store.append(key, record)?;
                        summary.recorded += 1;
                    } else {
                        summary.discarded += 1;
                        tracing::info!(
                            status = record.status.as_str(),
                            "{}: trial not recorded, cell will be retried",
                            key
                        );
                    }
                }
            }
        }
        summary.outstanding = self.outstanding(store);
        Ok(summary)
    }
}

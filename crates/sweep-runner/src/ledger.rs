use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::atomic_write_bytes;
use crate::key::ConfigurationKey;
use crate::trial::TrialPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Success,
    Partial,
    Failed,
    TimedOut,
}

impl TrialStatus {
    pub fn is_recordable(self) -> bool {
        matches!(self, TrialStatus::Success | TrialStatus::Partial)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrialStatus::Success => "success",
            TrialStatus::Partial => "partial",
            TrialStatus::Failed => "failed",
            TrialStatus::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub status: TrialStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phase: TrialPhase,
    pub metrics: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub type ResultLedger = BTreeMap<String, Vec<TrialRecord>>;

pub trait LedgerBackend {
    fn read(&self) -> io::Result<Option<Vec<u8>>>;

    fn replace(&self, bytes: &[u8]) -> io::Result<()>;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LedgerBackend for FileBackend {
    fn read(&self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn replace(&self, bytes: &[u8]) -> io::Result<()> {
        atomic_write_bytes(&self.path, bytes)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    bytes: Option<Vec<u8>>,
    fail_writes: bool,
    writes: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let backend = Self::default();
        backend.lock().bytes = Some(bytes.into());
        backend
    }

    pub fn bytes(&self) -> Option<Vec<u8>> {
        self.lock().bytes.clone()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LedgerBackend for MemoryBackend {
    fn read(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.lock().bytes.clone())
    }

    fn replace(&self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        state.bytes = Some(bytes.to_vec());
        state.writes += 1;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

pub struct ResultStore<B: LedgerBackend> {
    backend: B,
    ledger: ResultLedger,
}

impl<B: LedgerBackend> ResultStore<B> {
    /// Load the persisted ledger.
    ///
    /// A missing ledger starts empty. So does an unparseable one: prior
    /// history is dropped with a warning rather than aborting the sweep. Only
    /// an I/O failure reading the backend is an error.
    pub fn load(backend: B) -> Result<Self> {
        let ledger = match backend
            .read()
            .with_context(|| format!("reading ledger {}", backend.describe()))?
        {
            None => ResultLedger::new(),
            Some(bytes) => match serde_json::from_slice::<ResultLedger>(&bytes) {
                Ok(ledger) => ledger,
                Err(err) => {
                    tracing::warn!(
                        ledger = %backend.describe(),
                        error = %err,
                        "ledger is unparseable, starting with no prior results"
                    );
                    ResultLedger::new()
                }
            },
        };
        Ok(Self { backend, ledger })
    }

    pub fn ledger(&self) -> &ResultLedger {
        &self.ledger
    }

    pub fn records(&self, key: &ConfigurationKey) -> &[TrialRecord] {
        self.ledger
            .get(&key.ledger_key())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn completed(&self, key: &ConfigurationKey) -> usize {
        self.records(key).len()
    }

    pub fn remaining(&self, key: &ConfigurationKey, target: usize) -> usize {
        target.saturating_sub(self.completed(key))
    }

    /// Append `record` under `key` and persist the whole ledger.
    ///
    /// The in-memory ledger only changes once the backend write succeeded.
    pub fn append(&mut self, key: &ConfigurationKey, record: TrialRecord) -> Result<()> {
        if !record.status.is_recordable() {
            return Err(anyhow!(
                "refusing to record {} trial for {}",
                record.status.as_str(),
                key
            ));
        }
        let ledger_key = key.ledger_key();
        let mut next = self.ledger.clone();
        next.entry(ledger_key).or_default().push(record);
        let bytes = serde_json::to_vec_pretty(&next)?;
        self.backend
            .replace(&bytes)
            .with_context(|| format!("writing ledger {}", self.backend.describe()))?;
        self.ledger = next;
        Ok(())
    }
}

// src/store/mod.rs

//! The fingerprint store: content-addressed objects plus per-target records.
//!
//! Objects hold serialized target values, keyed by their own hash. Entries
//! record the last successful build of each target; diagnostics record the
//! last failure; history keeps superseded entries until garbage collection.

pub mod file;
pub mod hash;
pub mod memory;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::errors::{PipewrightError, Result};
use crate::lang::Value;

pub use file::FileStore;
pub use hash::{file_fingerprint, hash_file, FileHashCache, Fingerprint};
pub use memory::MemoryStore;

/// The components a target's fingerprint is computed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintParts {
    /// Hash of the canonical command text.
    pub command: Fingerprint,
    /// Hash over the sorted `(dependency, fingerprint)` pairs.
    pub depend: Fingerprint,
    /// Declared input files and their content hashes.
    pub inputs: BTreeMap<String, Fingerprint>,
    /// Declared output files and their content hashes.
    pub outputs: BTreeMap<String, Fingerprint>,
    /// Hash of the trigger mode.
    pub trigger: Fingerprint,
    /// Hash of the trigger's `change` value, when it has one.
    pub change: Option<Fingerprint>,
}

impl FingerprintParts {
    pub fn fingerprint(&self) -> Fingerprint {
        let mut parts: Vec<(String, String)> = vec![
            ("command".into(), self.command.to_string()),
            ("depend".into(), self.depend.to_string()),
            ("trigger".into(), self.trigger.to_string()),
        ];
        for (path, hash) in &self.inputs {
            parts.push((format!("in:{path}"), hash.to_string()));
        }
        for (path, hash) in &self.outputs {
            parts.push((format!("out:{path}"), hash.to_string()));
        }
        if let Some(change) = &self.change {
            parts.push(("change".into(), change.to_string()));
        }
        Fingerprint::combine(parts.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Success,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failed,
    TimedOut,
}

/// One try at building a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub number: u32,
    pub outcome: AttemptOutcome,
    pub elapsed_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Metadata about a build, readable without loading the value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildMeta {
    pub elapsed_secs: f64,
    pub cpu_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(default)]
    pub attempts: Vec<Attempt>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub traceback: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<serde_json::Value>,
    /// Seconds since the Unix epoch.
    pub finished_at: u64,
}

/// The last successful build of a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub target: String,
    pub fingerprint: Fingerprint,
    pub parts: FingerprintParts,
    pub status: BuildStatus,
    /// Object key of the serialized value.
    pub value: Fingerprint,
    pub meta: BuildMeta,
}

/// The last failed build of a target. Never carries a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub target: String,
    pub status: BuildStatus,
    pub meta: BuildMeta,
}

/// A superseded (or current) entry kept for garbage collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub target: String,
    pub fingerprint: Fingerprint,
    pub value: Fingerprint,
    pub recorded_at: u64,
}

/// What a garbage collection removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub entries_removed: Vec<String>,
    pub history_removed: usize,
    pub objects_removed: usize,
}

/// Storage backend for fingerprints, values and build records.
///
/// Every method takes `&self`; reads may happen from many workers at once.
/// Writers must check [`concurrent_writes`](Self::concurrent_writes) before
/// writing from more than one thread.
pub trait FingerprintStore: Send + Sync + Debug {
    /// Whether several threads may write at the same time.
    fn concurrent_writes(&self) -> bool;

    fn put_object(&self, bytes: &[u8]) -> Result<Fingerprint>;
    fn get_object(&self, key: &Fingerprint) -> Result<Vec<u8>>;
    fn has_object(&self, key: &Fingerprint) -> Result<bool>;

    fn get_entry(&self, target: &str) -> Result<Option<CacheEntry>>;
    /// Replace the target's entry and append a history record.
    fn put_entry(&self, entry: &CacheEntry) -> Result<()>;
    fn remove_entry(&self, target: &str) -> Result<bool>;
    fn list_entries(&self) -> Result<Vec<String>>;

    fn get_diagnostic(&self, target: &str) -> Result<Option<Diagnostic>>;
    fn put_diagnostic(&self, diagnostic: &Diagnostic) -> Result<()>;
    fn clear_diagnostic(&self, target: &str) -> Result<()>;
    fn list_diagnostics(&self) -> Result<Vec<String>>;

    /// History records of `target`, oldest first.
    fn history(&self, target: &str) -> Result<Vec<HistoryRecord>>;

    /// Drop everything belonging to targets outside `tracked`, optionally
    /// trim history to the latest record, and delete unreferenced objects.
    fn gc(&self, tracked: &BTreeSet<String>, prune_history: bool) -> Result<GcReport>;
}

/// Serialize `value` and store it as an object.
pub fn save_value(store: &dyn FingerprintStore, value: &Value) -> Result<Fingerprint> {
    let bytes = encode_value(value)?;
    store.put_object(&bytes)
}

pub fn encode_value(value: &Value) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| PipewrightError::store("value", e))
}

/// Load and decode the object `key`.
pub fn load_value(store: &dyn FingerprintStore, key: &Fingerprint) -> Result<Value> {
    let bytes = store.get_object(key)?;
    serde_json::from_slice(&bytes).map_err(|e| PipewrightError::store(key.as_str(), e))
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Objects referenced by the given entries and history records.
pub(crate) fn live_objects<'a>(
    entries: impl IntoIterator<Item = &'a CacheEntry>,
    history: impl IntoIterator<Item = &'a HistoryRecord>,
) -> BTreeSet<Fingerprint> {
    let mut live: BTreeSet<Fingerprint> = entries.into_iter().map(|e| e.value.clone()).collect();
    live.extend(history.into_iter().map(|h| h.value.clone()));
    live
}

// src/store/memory.rs

//! In-memory store. Safe for concurrent writers; nothing survives the process.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use crate::errors::{PipewrightError, Result};
use crate::store::{
    live_objects, now_secs, CacheEntry, Diagnostic, Fingerprint, FingerprintStore, GcReport,
    HistoryRecord,
};

#[derive(Debug, Default)]
struct Inner {
    objects: HashMap<Fingerprint, Vec<u8>>,
    entries: BTreeMap<String, CacheEntry>,
    diagnostics: BTreeMap<String, Diagnostic>,
    history: BTreeMap<String, Vec<HistoryRecord>>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.read().objects.len()
    }
}

impl FingerprintStore for MemoryStore {
    fn concurrent_writes(&self) -> bool {
        true
    }

    fn put_object(&self, bytes: &[u8]) -> Result<Fingerprint> {
        let key = Fingerprint::of_bytes(bytes);
        self.write()
            .objects
            .entry(key.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(key)
    }

    fn get_object(&self, key: &Fingerprint) -> Result<Vec<u8>> {
        self.read()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| PipewrightError::store(key.as_str(), "object not found"))
    }

    fn has_object(&self, key: &Fingerprint) -> Result<bool> {
        Ok(self.read().objects.contains_key(key))
    }

    fn get_entry(&self, target: &str) -> Result<Option<CacheEntry>> {
        Ok(self.read().entries.get(target).cloned())
    }

    fn put_entry(&self, entry: &CacheEntry) -> Result<()> {
        let mut inner = self.write();
        inner.entries.insert(entry.target.clone(), entry.clone());
        inner
            .history
            .entry(entry.target.clone())
            .or_default()
            .push(HistoryRecord {
                target: entry.target.clone(),
                fingerprint: entry.fingerprint.clone(),
                value: entry.value.clone(),
                recorded_at: now_secs(),
            });
        debug!(target = %entry.target, fingerprint = %entry.fingerprint, "stored cache entry (memory)");
        Ok(())
    }

    fn remove_entry(&self, target: &str) -> Result<bool> {
        Ok(self.write().entries.remove(target).is_some())
    }

    fn list_entries(&self) -> Result<Vec<String>> {
        Ok(self.read().entries.keys().cloned().collect())
    }

    fn get_diagnostic(&self, target: &str) -> Result<Option<Diagnostic>> {
        Ok(self.read().diagnostics.get(target).cloned())
    }

    fn put_diagnostic(&self, diagnostic: &Diagnostic) -> Result<()> {
        self.write()
            .diagnostics
            .insert(diagnostic.target.clone(), diagnostic.clone());
        Ok(())
    }

    fn clear_diagnostic(&self, target: &str) -> Result<()> {
        self.write().diagnostics.remove(target);
        Ok(())
    }

    fn list_diagnostics(&self) -> Result<Vec<String>> {
        Ok(self.read().diagnostics.keys().cloned().collect())
    }

    fn history(&self, target: &str) -> Result<Vec<HistoryRecord>> {
        Ok(self.read().history.get(target).cloned().unwrap_or_default())
    }

    fn gc(&self, tracked: &BTreeSet<String>, prune_history: bool) -> Result<GcReport> {
        let mut inner = self.write();
        let mut report = GcReport::default();

        let untracked: Vec<String> = inner
            .entries
            .keys()
            .filter(|t| !tracked.contains(*t))
            .cloned()
            .collect();
        for target in &untracked {
            inner.entries.remove(target);
        }
        report.entries_removed = untracked;
        inner.diagnostics.retain(|t, _| tracked.contains(t));

        let mut history_removed = 0;
        inner.history.retain(|t, records| {
            if !tracked.contains(t) {
                history_removed += records.len();
                return false;
            }
            if prune_history && records.len() > 1 {
                history_removed += records.len() - 1;
                records.drain(..records.len() - 1);
            }
            true
        });
        report.history_removed = history_removed;

        let live = live_objects(inner.entries.values(), inner.history.values().flatten());
        let before = inner.objects.len();
        inner.objects.retain(|key, _| live.contains(key));
        report.objects_removed = before - inner.objects.len();

        info!(
            entries = report.entries_removed.len(),
            history = report.history_removed,
            objects = report.objects_removed,
            "garbage collection finished (memory)"
        );
        Ok(report)
    }
}

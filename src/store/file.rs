// src/store/file.rs

//! On-disk store.
//!
//! Layout under the store root:
//!
//! ```text
//! objects/<hash>            serialized values
//! entries/<target>.json     last successful build
//! diagnostics/<target>.json last failed build
//! history/<target>.json     superseded builds, oldest first
//! ```
//!
//! Every file is replaced atomically (temp file + rename), but appending to
//! history is a read-modify-write, so this store does not accept concurrent
//! writers.

use std::collections::BTreeSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::config::validate::is_valid_target_name;
use crate::errors::{PipewrightError, Result};
use crate::store::{
    live_objects, now_secs, CacheEntry, Diagnostic, Fingerprint, FingerprintStore, GcReport,
    HistoryRecord,
};

const OBJECTS: &str = "objects";
const ENTRIES: &str = "entries";
const DIAGNOSTICS: &str = "diagnostics";
const HISTORY: &str = "history";

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [OBJECTS, ENTRIES, DIAGNOSTICS, HISTORY] {
            fs::create_dir_all(root.join(dir)).map_err(|e| {
                PipewrightError::store(root.display().to_string(), format!("cannot create {dir}/: {e}"))
            })?;
        }
        debug!(root = %root.display(), "opened file store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Records are named after their target, so only symbols map to files.
    fn record_path(&self, dir: &str, target: &str) -> Result<PathBuf> {
        if !is_valid_target_name(target) {
            return Err(PipewrightError::store(
                format!("{dir}/{target}"),
                "invalid target name",
            ));
        }
        Ok(self.root.join(dir).join(format!("{target}.json")))
    }

    fn object_path(&self, key: &Fingerprint) -> PathBuf {
        self.root.join(OBJECTS).join(key.as_str())
    }

    fn read_record<T: DeserializeOwned>(&self, dir: &str, target: &str) -> Result<Option<T>> {
        let path = self.record_path(dir, target)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PipewrightError::store(format!("{dir}/{target}"), e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| PipewrightError::store(format!("{dir}/{target}"), format!("corrupt record: {e}")))
    }

    fn write_record<T: Serialize>(&self, dir: &str, target: &str, record: &T) -> Result<()> {
        self.record_path(dir, target)?;
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.root.join(dir), &format!("{target}.json"), &bytes)
            .map_err(|e| PipewrightError::store(format!("{dir}/{target}"), e))
    }

    fn remove_record(&self, dir: &str, target: &str) -> Result<bool> {
        match fs::remove_file(self.record_path(dir, target)?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PipewrightError::store(format!("{dir}/{target}"), e)),
        }
    }

    fn list_records(&self, dir: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let read = fs::read_dir(self.root.join(dir)).map_err(|e| PipewrightError::store(dir, e))?;
        for item in read {
            let item = item.map_err(|e| PipewrightError::store(dir, e))?;
            let file_name = item.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(target) = name.strip_suffix(".json").filter(|t| is_valid_target_name(t)) {
                names.push(target.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(dir.join(name)).map_err(|e| e.error)?;
    Ok(())
}

impl FingerprintStore for FileStore {
    fn concurrent_writes(&self) -> bool {
        false
    }

    fn put_object(&self, bytes: &[u8]) -> Result<Fingerprint> {
        let key = Fingerprint::of_bytes(bytes);
        if !self.object_path(&key).exists() {
            write_atomic(&self.root.join(OBJECTS), key.as_str(), bytes)
                .map_err(|e| PipewrightError::store(key.as_str(), e))?;
        }
        Ok(key)
    }

    fn get_object(&self, key: &Fingerprint) -> Result<Vec<u8>> {
        let bytes = fs::read(self.object_path(key)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => PipewrightError::store(key.as_str(), "object not found"),
            _ => PipewrightError::store(key.as_str(), e),
        })?;
        if Fingerprint::of_bytes(&bytes) != *key {
            return Err(PipewrightError::store(
                key.as_str(),
                "object content does not match its key",
            ));
        }
        Ok(bytes)
    }

    fn has_object(&self, key: &Fingerprint) -> Result<bool> {
        Ok(self.object_path(key).is_file())
    }

    fn get_entry(&self, target: &str) -> Result<Option<CacheEntry>> {
        self.read_record(ENTRIES, target)
    }

    fn put_entry(&self, entry: &CacheEntry) -> Result<()> {
        self.write_record(ENTRIES, &entry.target, entry)?;
        let mut history = self.history(&entry.target)?;
        history.push(HistoryRecord {
            target: entry.target.clone(),
            fingerprint: entry.fingerprint.clone(),
            value: entry.value.clone(),
            recorded_at: now_secs(),
        });
        self.write_record(HISTORY, &entry.target, &history)?;
        debug!(target = %entry.target, fingerprint = %entry.fingerprint, "stored cache entry (file)");
        Ok(())
    }

    fn remove_entry(&self, target: &str) -> Result<bool> {
        self.remove_record(ENTRIES, target)
    }

    fn list_entries(&self) -> Result<Vec<String>> {
        self.list_records(ENTRIES)
    }

    fn get_diagnostic(&self, target: &str) -> Result<Option<Diagnostic>> {
        self.read_record(DIAGNOSTICS, target)
    }

    fn put_diagnostic(&self, diagnostic: &Diagnostic) -> Result<()> {
        self.write_record(DIAGNOSTICS, &diagnostic.target, diagnostic)
    }

    fn clear_diagnostic(&self, target: &str) -> Result<()> {
        self.remove_record(DIAGNOSTICS, target).map(|_| ())
    }

    fn list_diagnostics(&self) -> Result<Vec<String>> {
        self.list_records(DIAGNOSTICS)
    }

    fn history(&self, target: &str) -> Result<Vec<HistoryRecord>> {
        Ok(self.read_record(HISTORY, target)?.unwrap_or_default())
    }

    fn gc(&self, tracked: &BTreeSet<String>, prune_history: bool) -> Result<GcReport> {
        let mut report = GcReport::default();

        for target in self.list_entries()? {
            if !tracked.contains(&target) {
                self.remove_record(ENTRIES, &target)?;
                report.entries_removed.push(target);
            }
        }
        for target in self.list_diagnostics()? {
            if !tracked.contains(&target) {
                self.remove_record(DIAGNOSTICS, &target)?;
            }
        }

        let mut kept_history = Vec::new();
        for target in self.list_records(HISTORY)? {
            let mut records = self.history(&target)?;
            if !tracked.contains(&target) {
                report.history_removed += records.len();
                self.remove_record(HISTORY, &target)?;
                continue;
            }
            if prune_history && records.len() > 1 {
                let keep = records.split_off(records.len() - 1);
                report.history_removed += records.len();
                self.write_record(HISTORY, &target, &keep)?;
                records = keep;
            }
            kept_history.extend(records);
        }

        let mut entries = Vec::new();
        for target in self.list_entries()? {
            if let Some(entry) = self.get_entry(&target)? {
                entries.push(entry);
            }
        }
        let live = live_objects(&entries, &kept_history);

        let objects = fs::read_dir(self.root.join(OBJECTS)).map_err(|e| PipewrightError::store(OBJECTS, e))?;
        for item in objects {
            let item = item.map_err(|e| PipewrightError::store(OBJECTS, e))?;
            let name = item.file_name().to_string_lossy().to_string();
            let is_live = Fingerprint::parse(&name).is_some_and(|key| live.contains(&key));
            if !is_live {
                fs::remove_file(item.path()).map_err(|e| PipewrightError::store(name.clone(), e))?;
                report.objects_removed += 1;
            }
        }

        info!(
            entries = report.entries_removed.len(),
            history = report.history_removed,
            objects = report.objects_removed,
            "garbage collection finished (file)"
        );
        Ok(report)
    }
}

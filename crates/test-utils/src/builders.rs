#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use pipewright::errors::Result;
use pipewright::lang::{Builtins, EvalError, Value};
use pipewright::project::Project;
use pipewright::store::{FingerprintStore, MemoryStore};
use tempfile::TempDir;

pub const PLAN_FILE: &str = "Pipewright.toml";

/// A project directory in a temp dir: plan, environment scripts and input
/// files are written into it, and the store lives under it.
pub struct TestProject {
    dir: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create temp dir"),
        }
    }

    /// A project whose plan file holds `plan`.
    pub fn with_plan(plan: &str) -> Self {
        let project = Self::new();
        project.plan(plan);
        project
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    /// Write a file, creating parent directories.
    pub fn write(&self, rel: &str, contents: &str) -> &Self {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dirs");
        }
        fs::write(&path, contents).expect("write file");
        self
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path(rel)).expect("read file")
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.path(rel).exists()
    }

    pub fn remove(&self, rel: &str) {
        fs::remove_file(self.path(rel)).expect("remove file");
    }

    /// Replace the plan file.
    pub fn plan(&self, toml: &str) -> &Self {
        self.write(PLAN_FILE, toml)
    }

    pub fn try_open(&self) -> Result<Project> {
        Project::open(self.path(PLAN_FILE))
    }

    /// Open with the standard builtins and the on-disk store.
    pub fn open(&self) -> Project {
        self.try_open().expect("open project")
    }

    /// Open with extra natives and the on-disk store.
    pub fn open_with(&self, builtins: Builtins) -> Project {
        let plan = pipewright::config::load_and_validate(self.path(PLAN_FILE)).expect("load plan");
        let store = pipewright::store::FileStore::open(self.path(&plan.config.store))
            .expect("open file store");
        Project::from_plan(plan, self.root(), Arc::new(store), builtins).expect("open project")
    }

    /// Open against `store` instead of the on-disk store.
    pub fn open_with_store(&self, builtins: Builtins, store: Arc<dyn FingerprintStore>) -> Project {
        let plan = pipewright::config::load_and_validate(self.path(PLAN_FILE)).expect("load plan");
        Project::from_plan(plan, self.root(), store, builtins).expect("open project")
    }

    /// Open against a fresh in-memory store.
    pub fn open_in_memory(&self, builtins: Builtins) -> (Project, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let project = self.open_with_store(builtins, store.clone());
        (project, store)
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts calls per key, shared between natives and the test.
///
/// Registers:
/// - `count(key)`: increments `key` and returns the new count;
/// - `flaky(key, n)`: increments `key`, fails while the count is `<= n`,
///   then returns the count.
#[derive(Debug, Clone, Default)]
pub struct CallCounter {
    counts: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> usize {
        self.counts.lock().expect("counter lock").get(key).copied().unwrap_or(0)
    }

    pub fn reset(&self) {
        self.counts.lock().expect("counter lock").clear();
    }

    fn bump(&self, key: &str) -> usize {
        let mut counts = self.counts.lock().expect("counter lock");
        let n = counts.entry(key.to_string()).or_insert(0);
        *n += 1;
        *n
    }

    /// The standard builtins plus `count` and `flaky`.
    pub fn builtins(&self) -> Builtins {
        let mut b = Builtins::standard();
        self.register(&mut b);
        b
    }

    pub fn register(&self, builtins: &mut Builtins) {
        let counter = self.clone();
        builtins.register("count", move |_, args| {
            let key = string_arg(args.get(0, "key"))?;
            Ok(Value::Num(counter.bump(&key) as f64))
        });

        let counter = self.clone();
        builtins.register("flaky", move |_, args| {
            let key = string_arg(args.get(0, "key"))?;
            let failures = args.get(1, "n").and_then(Value::as_num).unwrap_or(1.0) as usize;
            let n = counter.bump(&key);
            if n <= failures {
                return Err(EvalError::Runtime(format!("flaky '{key}' failed on call {n}")));
            }
            Ok(Value::Num(n as f64))
        });
    }
}

fn string_arg(value: Option<&Value>) -> std::result::Result<String, EvalError> {
    match value {
        Some(Value::Str(s)) => Ok(s.clone()),
        other => Err(EvalError::Runtime(format!("expected a string key, got {other:?}"))),
    }
}

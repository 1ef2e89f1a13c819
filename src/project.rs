// src/project.rs

//! A plan together with its environment, dependency graph and store.
//!
//! Opening a project sources the environment scripts, extracts every
//! target's dependencies and builds the graph, so configuration errors
//! surface before anything runs. The project is a snapshot: reopen it after
//! editing the plan, the environment scripts or a `knitr_in` document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::validate::is_valid_target_name;
use crate::config::{load_and_validate, PlanFile, TargetDef};
use crate::dag::{build_graph, DependencyGraph, GraphExport, NodeKind, NodeStatus};
use crate::engine::assess::Assessor;
use crate::engine::memory::LazyDeps;
use crate::engine::{AbortHandle, BuildPlan, RunOptions, RunReport, Runtime};
use crate::errors::{PipewrightError, Result};
use crate::extract::{extract, extract_target, Deps, Role};
use crate::imports::{fingerprint_imports, load_environment, Environment, ImportTable, Script};
use crate::lang::{Builtins, EvalContext, Value};
use crate::stale::Reason;
use crate::store::{
    load_value, BuildMeta, BuildStatus, FileHashCache, FileStore, Fingerprint, FingerprintStore,
    GcReport,
};

/// What is recorded about a target, without its value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetMeta {
    pub target: String,
    /// Status of the latest build.
    pub status: BuildStatus,
    /// Fingerprint of the last successful build.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    /// Metadata of the latest build, failed or not.
    pub meta: BuildMeta,
    /// Metadata of the last successful build when the latest one failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<BuildMeta>,
}

#[derive(Debug)]
pub struct Project {
    root: PathBuf,
    plan: PlanFile,
    env: Environment,
    ctx: Arc<EvalContext>,
    store: Arc<dyn FingerprintStore>,
    deps: BTreeMap<String, Deps>,
    graph: DependencyGraph,
}

impl Project {
    /// Open the plan at `path` with the standard builtins and its file store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let plan = load_and_validate(path)?;
        let root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let store = Arc::new(FileStore::open(root.join(&plan.config.store))?);
        Self::from_plan(plan, root, store, Builtins::standard())
    }

    /// Environment scripts are read from `plan.config.environment`,
    /// relative to `root`.
    pub fn from_plan(
        plan: PlanFile,
        root: impl Into<PathBuf>,
        store: Arc<dyn FingerprintStore>,
        builtins: Builtins,
    ) -> Result<Self> {
        let root = root.into();
        let scripts = plan
            .config
            .environment
            .iter()
            .map(|path| Script::read(&root, path))
            .collect::<Result<Vec<_>>>()?;
        Self::from_parts(plan, root, store, builtins, &scripts)
    }

    /// Like [`from_plan`](Self::from_plan) with the environment given as
    /// source text.
    pub fn from_parts(
        plan: PlanFile,
        root: impl Into<PathBuf>,
        store: Arc<dyn FingerprintStore>,
        builtins: Builtins,
        scripts: &[Script],
    ) -> Result<Self> {
        let root = root.into();
        let builtins = Arc::new(builtins);
        let env = load_environment(scripts, builtins.clone(), &root)?;

        let wrappers = env.imports.wrappers();
        let mut deps = BTreeMap::new();
        for target in &plan.targets {
            let mut target_deps = extract_target(&target.command, &wrappers, &root);
            for expr in target.trigger.expressions() {
                target_deps.merge(extract(expr, Role::Target, &wrappers));
            }
            debug!(target = %target.name, deps = ?target_deps, "extracted dependencies");
            deps.insert(target.name.clone(), target_deps);
        }

        let graph = build_graph(&deps, &env.imports)?;
        let ctx = Arc::new(EvalContext::new(builtins, env.shared.clone(), root.clone()));
        info!(
            root = %root.display(),
            targets = plan.targets.len(),
            imports = env.imports.len(),
            "project opened"
        );

        Ok(Self {
            root,
            plan,
            env,
            ctx,
            store,
            deps,
            graph,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn plan(&self) -> &PlanFile {
        &self.plan
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn imports(&self) -> &ImportTable {
        &self.env.imports
    }

    pub fn store(&self) -> &Arc<dyn FingerprintStore> {
        &self.store
    }

    pub fn context(&self) -> &Arc<EvalContext> {
        &self.ctx
    }

    /// Run options taken from the plan's `[config]`.
    pub fn run_options(&self) -> RunOptions {
        let config = &self.plan.config;
        RunOptions {
            jobs: config.jobs,
            keep_going: config.keep_going,
            memory: config.memory_strategy,
            targets: None,
            lock_envir: config.lock_envir,
        }
    }

    /// The extracted dependency sets of a target.
    pub fn deps_target(&self, name: &str) -> Result<&Deps> {
        self.deps
            .get(name)
            .ok_or_else(|| PipewrightError::TargetNotFound(name.to_string()))
    }

    fn target(&self, name: &str) -> Result<&TargetDef> {
        self.plan
            .target(name)
            .ok_or_else(|| PipewrightError::TargetNotFound(name.to_string()))
    }

    fn build_plan(&self, files: &mut FileHashCache) -> Result<BuildPlan> {
        let import_fingerprints =
            fingerprint_imports(&self.graph, &self.env.imports, files, &self.root)?;
        Ok(BuildPlan {
            graph: self.graph.clone(),
            targets: self
                .plan
                .targets
                .iter()
                .map(|t| (t.name.clone(), t.clone()))
                .collect(),
            deps: self.deps.clone(),
            import_fingerprints,
        })
    }

    /// Build everything that is outdated.
    pub async fn make(&self, options: RunOptions) -> Result<RunReport> {
        self.make_with_abort(options, AbortHandle::new()).await
    }

    pub async fn make_with_abort(&self, options: RunOptions, abort: AbortHandle) -> Result<RunReport> {
        let plan = self.build_plan(&mut FileHashCache::new())?;
        Runtime::new(Arc::new(plan), self.ctx.clone(), self.store.clone(), options)
            .run(abort)
            .await
    }

    /// Outdated targets and why, without building anything.
    ///
    /// Targets downstream of an outdated target are reported as outdated too
    /// when their trigger watches dependencies.
    pub fn outdated(&self) -> Result<BTreeMap<String, Vec<Reason>>> {
        let mut files = FileHashCache::new();
        let mut fingerprints =
            fingerprint_imports(&self.graph, &self.env.imports, &mut files, &self.root)?;
        let assessor = Assessor {
            graph: &self.graph,
            ctx: &self.ctx,
            store: self.store.as_ref(),
        };

        let mut outdated: BTreeMap<String, Vec<Reason>> = BTreeMap::new();
        for name in self.graph.topological_order() {
            if self.graph.kind_of(name) != Some(NodeKind::Target) {
                continue;
            }
            let def = self.target(name)?;
            let deps = self.deps_target(name)?;
            let target_deps = self.graph.target_dependencies_of(name);

            let upstream: Vec<Reason> = if def.trigger.depend {
                target_deps
                    .iter()
                    .filter(|d| outdated.contains_key(*d))
                    .map(|d| Reason::Upstream(d.clone()))
                    .collect()
            } else {
                Vec::new()
            };

            let values = LazyDeps::new(self.store.clone(), target_deps.into_iter().collect());
            let mut reasons = match assessor.assess(def, deps, &fingerprints, &mut files, &values) {
                Ok(assessment) => {
                    if let Some(entry) = &assessment.entry {
                        fingerprints.insert(name.clone(), entry.fingerprint.clone());
                    }
                    assessment.staleness.reasons()
                }
                Err(e @ PipewrightError::Store { .. }) => return Err(e),
                Err(e) if upstream.is_empty() => return Err(e),
                Err(_) => Vec::new(),
            };
            reasons.extend(upstream);
            if !reasons.is_empty() {
                outdated.insert(name.clone(), reasons);
            }
        }
        Ok(outdated)
    }

    /// Nodes with their status, and edges.
    pub fn graph_export(&self) -> Result<GraphExport> {
        let outdated = self.outdated()?;
        let failed = self.store.list_diagnostics()?;
        let cached = self.store.list_entries()?;
        Ok(GraphExport::new(&self.graph, |name| {
            if failed.iter().any(|f| f == name) {
                NodeStatus::Failed
            } else if !cached.iter().any(|c| c == name) {
                NodeStatus::Missing
            } else if outdated.contains_key(name) {
                NodeStatus::Outdated
            } else {
                NodeStatus::UpToDate
            }
        }))
    }

    /// The cached value of a target.
    pub fn load(&self, name: &str) -> Result<Value> {
        check_name(name)?;
        let entry = self
            .store
            .get_entry(name)?
            .ok_or_else(|| PipewrightError::TargetNotFound(format!("{name} (never built)")))?;
        load_value(self.store.as_ref(), &entry.value)
    }

    /// Build metadata of a target, without loading its value.
    pub fn meta(&self, name: &str) -> Result<Option<TargetMeta>> {
        check_name(name)?;
        let entry = self.store.get_entry(name)?;
        let diagnostic = self.store.get_diagnostic(name)?;
        Ok(match (entry, diagnostic) {
            (entry, Some(diagnostic)) => Some(TargetMeta {
                target: name.to_string(),
                status: diagnostic.status,
                fingerprint: entry.as_ref().map(|e| e.fingerprint.clone()),
                meta: diagnostic.meta,
                last_success: entry.map(|e| e.meta),
            }),
            (Some(entry), None) => Some(TargetMeta {
                target: name.to_string(),
                status: entry.status,
                fingerprint: Some(entry.fingerprint),
                meta: entry.meta,
                last_success: None,
            }),
            (None, None) => None,
        })
    }

    /// Targets with a cache entry.
    pub fn cached(&self) -> Result<Vec<String>> {
        self.store.list_entries()
    }

    /// Targets whose latest build failed.
    pub fn failed(&self) -> Result<Vec<String>> {
        self.store.list_diagnostics()
    }

    /// Elapsed seconds of the last successful build of each cached target.
    pub fn build_times(&self) -> Result<BTreeMap<String, f64>> {
        let mut times = BTreeMap::new();
        for name in self.store.list_entries()? {
            if let Some(entry) = self.store.get_entry(&name)? {
                times.insert(name, entry.meta.elapsed_secs);
            }
        }
        Ok(times)
    }

    /// Remove the records of `targets` (all cached targets when empty).
    ///
    /// Values stay in the object store until the next [`gc`](Self::gc).
    pub fn clean(&self, targets: &[String]) -> Result<Vec<String>> {
        let names = if targets.is_empty() {
            let mut all = self.store.list_entries()?;
            all.extend(self.store.list_diagnostics()?);
            all.sort();
            all.dedup();
            all
        } else {
            for name in targets {
                check_name(name)?;
            }
            targets.to_vec()
        };

        let mut removed = Vec::new();
        for name in names {
            let had_entry = self.store.remove_entry(&name)?;
            let had_diagnostic = self.store.get_diagnostic(&name)?.is_some();
            self.store.clear_diagnostic(&name)?;
            if had_entry || had_diagnostic {
                removed.push(name);
            }
        }
        info!(removed = removed.len(), "cleaned");
        Ok(removed)
    }

    /// Drop records of targets no longer in the plan and unreferenced values.
    pub fn gc(&self, prune_history: bool) -> Result<GcReport> {
        let tracked = self.plan.target_names().map(str::to_string).collect();
        self.store.gc(&tracked, prune_history)
    }
}

fn check_name(name: &str) -> Result<()> {
    if is_valid_target_name(name) {
        Ok(())
    } else {
        Err(PipewrightError::TargetNotFound(format!("{name} (invalid target name)")))
    }
}

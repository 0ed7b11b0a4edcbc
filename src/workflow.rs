//! Workflow registration and control surface.
//!
//! The [`Workflow`] owns the module records (arena-style, indexed by
//! insertion order), the cached dependency graph, the shared parameter
//! store, and the run state the scheduler mutates. Policies, priorities,
//! executors, hooks, and observers all live here; the round loop itself is
//! in `scheduler.rs`.
//!
//! `execute` borrows the workflow exclusively, so mid-run lifecycle control
//! (cancel/suspend/resume from another task) goes through the cloneable
//! [`WorkflowController`] snapshot, which shares the run state and the
//! per-module cooperative flags.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tokio::runtime::Handle;
use tracing::debug;

use crate::error::WorkflowError;
use crate::graph::DepGraph;
use crate::module::{ControlFlags, Module, ModuleCtx};
use crate::param_store::ParamStore;
use crate::types::{ErrorPolicy, ModuleState, ModuleStats, TimeoutPolicy, WorkflowStats};

/// Most modules have a handful of dependencies; keep them on the stack.
pub(crate) type DepVec = SmallVec<[Arc<str>; 4]>;

/// Registration record for one module.
pub(crate) struct ModuleEntry {
    pub(crate) name: Arc<str>,
    pub(crate) module: Arc<dyn Module>,
    pub(crate) deps: DepVec,
    pub(crate) preferred: Option<Handle>,
    pub(crate) flags: Arc<ControlFlags>,
}

/// Scheduler-owned per-module runtime data, reset on every run.
#[derive(Debug, Clone)]
pub(crate) struct ModuleData {
    pub(crate) state: ModuleState,
    pub(crate) stats: ModuleStats,
    pub(crate) priority: i32,
    pub(crate) deferred_rounds: u32,
}

impl ModuleData {
    fn new(priority: i32) -> Self {
        Self {
            state: ModuleState::Pending,
            stats: ModuleStats::default(),
            priority,
            deferred_rounds: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.state = ModuleState::Pending;
        self.stats = ModuleStats::default();
        self.deferred_rounds = 0;
        // Priority persists so aging is observable across runs.
    }
}

/// Run state shared between the workflow, the scheduler loop, and any
/// controllers. Mutated only in short batch updates, never across an await.
pub(crate) struct RunState {
    pub(crate) cancel: AtomicBool,
    pub(crate) data: Mutex<Vec<ModuleData>>,
    pub(crate) errors: Mutex<FxHashMap<Arc<str>, String>>,
}

impl RunState {
    fn new() -> Self {
        Self {
            cancel: AtomicBool::new(false),
            data: Mutex::new(Vec::new()),
            errors: Mutex::new(FxHashMap::default()),
        }
    }
}

/// One module as seen by lifecycle pushes: enough to flip flags, fire
/// hooks, and update the shared state slot.
#[derive(Clone)]
struct ControlTarget {
    idx: usize,
    module: Arc<dyn Module>,
    flags: Arc<ControlFlags>,
}

type NameHook = Box<dyn Fn(&str) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Hooks {
    pub(crate) on_start: Option<NameHook>,
    pub(crate) on_complete: Option<NameHook>,
    pub(crate) on_error: Option<ErrorHook>,
}

/// A DAG of named modules executed in topological rounds.
///
/// Modules are registered with [`add_module`](Workflow::add_module),
/// dependencies come from [`Module::dependencies`] or
/// [`add_edge`](Workflow::add_edge), and [`execute`](Workflow::execute)
/// runs the whole graph. See the crate docs for the scheduling model.
pub struct Workflow {
    pub(crate) entries: Vec<ModuleEntry>,
    pub(crate) index: FxHashMap<Arc<str>, usize>,
    pub(crate) graph: Option<DepGraph>,
    pub(crate) run: Arc<RunState>,
    pub(crate) store: Arc<ParamStore>,
    pub(crate) stats: WorkflowStats,
    pub(crate) default_executor: Option<Handle>,
    pub(crate) error_policy: ErrorPolicy,
    pub(crate) timeout_policy: TimeoutPolicy,
    pub(crate) global_timeout: Option<Duration>,
    pub(crate) default_priority: i32,
    pub(crate) aging_step: i32,
    pub(crate) max_concurrency: Option<usize>,
    pub(crate) hooks: Hooks,
}

impl Workflow {
    /// Empty workflow with a fresh default parameter store.
    pub fn new() -> Self {
        Self::with_param_store(Arc::new(ParamStore::new()))
    }

    /// Empty workflow sharing an externally-owned parameter store.
    pub fn with_param_store(store: Arc<ParamStore>) -> Self {
        Self {
            entries: Vec::new(),
            index: FxHashMap::default(),
            graph: None,
            run: Arc::new(RunState::new()),
            store,
            stats: WorkflowStats::default(),
            default_executor: None,
            error_policy: ErrorPolicy::default(),
            timeout_policy: TimeoutPolicy::default(),
            global_timeout: None,
            default_priority: 0,
            aging_step: 1,
            max_concurrency: None,
            hooks: Hooks::default(),
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a module. Fails with `EmptyName` or `DuplicateName`.
    pub fn add_module(&mut self, module: impl Module + 'static) -> Result<(), WorkflowError> {
        self.add_module_arc(Arc::new(module))
    }

    /// Register an already-shared module.
    pub fn add_module_arc(&mut self, module: Arc<dyn Module>) -> Result<(), WorkflowError> {
        let name = module.name();
        if name.is_empty() {
            return Err(WorkflowError::EmptyName);
        }
        if self.index.contains_key(name) {
            return Err(WorkflowError::DuplicateName(name.to_string()));
        }

        let name: Arc<str> = Arc::from(name);
        let deps: DepVec = module
            .dependencies()
            .into_iter()
            .map(Arc::from)
            .collect();

        let idx = self.entries.len();
        self.index.insert(Arc::clone(&name), idx);
        self.entries.push(ModuleEntry {
            name,
            module,
            deps,
            preferred: None,
            flags: Arc::new(ControlFlags::default()),
        });
        self.run.data.lock().push(ModuleData::new(self.default_priority));
        self.graph = None;
        Ok(())
    }

    /// Add a dependency edge: `to` depends on `from`. Both must be
    /// registered.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), WorkflowError> {
        let from_idx = *self
            .index
            .get(from)
            .ok_or_else(|| WorkflowError::UnknownModule(from.to_string()))?;
        let to_idx = *self
            .index
            .get(to)
            .ok_or_else(|| WorkflowError::UnknownModule(to.to_string()))?;
        let from_name = Arc::clone(&self.entries[from_idx].name);
        self.entries[to_idx].deps.push(from_name);
        self.graph = None;
        Ok(())
    }

    /// Remove all modules and reset every piece of runtime state,
    /// including the cancel flag and the graph cache.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.graph = None;
        self.run.cancel.store(false, Ordering::Relaxed);
        self.run.data.lock().clear();
        self.run.errors.lock().clear();
        self.stats = WorkflowStats::default();
    }

    pub fn module_count(&self) -> usize {
        self.entries.len()
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Module names in insertion order.
    pub fn module_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.to_string()).collect()
    }

    // ------------------------------------------------------------------
    // Policy setters
    // ------------------------------------------------------------------

    pub fn set_error_policy(&mut self, policy: ErrorPolicy) {
        self.error_policy = policy;
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        self.error_policy
    }

    pub fn set_timeout_policy(&mut self, policy: TimeoutPolicy) {
        self.timeout_policy = policy;
    }

    pub fn timeout_policy(&self) -> TimeoutPolicy {
        self.timeout_policy
    }

    /// Global deadline for a whole run; zero disables it.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.global_timeout = (timeout > Duration::ZERO).then_some(timeout);
    }

    /// Priority assigned to modules registered from now on.
    pub fn set_default_priority(&mut self, priority: i32) {
        self.default_priority = priority;
    }

    /// Priority increment granted to a deferred module per round.
    pub fn set_priority_aging_step(&mut self, step: i32) {
        self.aging_step = step;
    }

    /// Cap on modules launched per round; zero disables the cap.
    pub fn set_max_concurrency_per_round(&mut self, max: usize) {
        self.max_concurrency = (max > 0).then_some(max);
    }

    pub fn set_module_priority(&mut self, name: &str, priority: i32) -> Result<(), WorkflowError> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| WorkflowError::UnknownModule(name.to_string()))?;
        self.run.data.lock()[idx].priority = priority;
        Ok(())
    }

    /// Current priority of a module, or the default priority when the name
    /// is not registered.
    pub fn get_module_priority(&self, name: &str) -> i32 {
        match self.index.get(name) {
            Some(&idx) => self.run.data.lock()[idx].priority,
            None => self.default_priority,
        }
    }

    // ------------------------------------------------------------------
    // Executors and parameter store
    // ------------------------------------------------------------------

    /// Runtime handle modules run on unless they pick their own.
    pub fn set_default_executor(&mut self, handle: Handle) {
        self.default_executor = Some(handle);
    }

    /// Set the preferred handle of every registered module.
    pub fn set_executor_for_all(&mut self, handle: Handle) {
        for entry in &mut self.entries {
            entry.preferred = Some(handle.clone());
        }
    }

    /// Set the preferred handle of one module.
    pub fn set_module_executor(&mut self, name: &str, handle: Handle) -> Result<(), WorkflowError> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| WorkflowError::UnknownModule(name.to_string()))?;
        self.entries[idx].preferred = Some(handle);
        Ok(())
    }

    /// Replace the shared parameter store. Modules launched after this see
    /// the new store.
    pub fn set_param_store(&mut self, store: Arc<ParamStore>) {
        self.store = store;
    }

    pub fn param_store(&self) -> Arc<ParamStore> {
        Arc::clone(&self.store)
    }

    /// Context of a registered module, for out-of-band cooperative waits
    /// or for running the module by hand.
    pub fn module_context(&self, name: &str) -> Result<ModuleCtx, WorkflowError> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| WorkflowError::UnknownModule(name.to_string()))?;
        Ok(ModuleCtx::new(
            Some(Arc::clone(&self.store)),
            Arc::clone(&self.entries[idx].flags),
        ))
    }

    // ------------------------------------------------------------------
    // Hooks
    // ------------------------------------------------------------------

    /// Called with the module name when a module is launched.
    pub fn set_on_start(&mut self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.hooks.on_start = Some(Box::new(hook));
    }

    /// Called with the module name when a module completes successfully.
    pub fn set_on_complete(&mut self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.hooks.on_complete = Some(Box::new(hook));
    }

    /// Called with the module name and error message when a module fails.
    pub fn set_on_error(&mut self, hook: impl Fn(&str, &str) + Send + Sync + 'static) {
        self.hooks.on_error = Some(Box::new(hook));
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    pub fn get_module_state(&self, name: &str) -> Result<ModuleState, WorkflowError> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| WorkflowError::UnknownModule(name.to_string()))?;
        Ok(self.run.data.lock()[idx].state)
    }

    pub fn get_all_states(&self) -> HashMap<String, ModuleState> {
        let data = self.run.data.lock();
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.to_string(), data[i].state))
            .collect()
    }

    /// Names of `Failed` modules, in insertion order.
    pub fn get_failed_modules(&self) -> Vec<String> {
        let data = self.run.data.lock();
        self.entries
            .iter()
            .enumerate()
            .filter(|(i, _)| data[*i].state == ModuleState::Failed)
            .map(|(_, e)| e.name.to_string())
            .collect()
    }

    /// Error message recorded for a module, if any.
    pub fn get_error(&self, name: &str) -> Option<String> {
        self.run.errors.lock().get(name).cloned()
    }

    pub fn get_workflow_stats(&self) -> WorkflowStats {
        self.stats
    }

    pub fn get_module_stats(&self, name: &str) -> Result<ModuleStats, WorkflowError> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| WorkflowError::UnknownModule(name.to_string()))?;
        Ok(self.run.data.lock()[idx].stats)
    }

    pub fn get_all_module_stats(&self) -> HashMap<String, ModuleStats> {
        let data = self.run.data.lock();
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.to_string(), data[i].stats))
            .collect()
    }

    // ------------------------------------------------------------------
    // Lifecycle controls
    // ------------------------------------------------------------------

    /// Set the cancel flag without touching module states; the scheduler
    /// picks it up at its next cancellation check.
    pub fn request_cancel(&self) {
        self.run.cancel.store(true, Ordering::Relaxed);
    }

    pub fn cancel_requested(&self) -> bool {
        self.run.cancel.load(Ordering::Relaxed)
    }

    /// Cancel the workflow: sets the cancel flag and, for every non-`Done`
    /// module, flips its cooperative flag, fires `on_cancel`, and marks it
    /// `Canceled`.
    pub fn cancel(&self) {
        apply_cancel(&self.control_targets(), &self.run);
    }

    /// Suspend every module: flags flip, `on_suspend` fires, non-`Done`
    /// states become `Suspended`. Running tasks keep running and observe
    /// suspension at their `check_suspend` points.
    pub fn suspend(&self) {
        apply_suspend(&self.control_targets(), &self.run);
    }

    /// Resume: clears the suspended flags, wakes `check_suspend` waiters,
    /// fires `on_resume`, and moves `Suspended` modules back to `Pending`.
    pub fn resume(&self) {
        apply_resume(&self.control_targets(), &self.run);
    }

    /// Cloneable handle for controlling the workflow from other tasks
    /// while `execute` holds it exclusively. Snapshots the modules
    /// registered so far.
    pub fn controller(&self) -> WorkflowController {
        WorkflowController {
            targets: Arc::new(self.control_targets()),
            run: Arc::clone(&self.run),
        }
    }

    fn control_targets(&self) -> Vec<ControlTarget> {
        self.entries
            .iter()
            .enumerate()
            .map(|(idx, e)| ControlTarget {
                idx,
                module: Arc::clone(&e.module),
                flags: Arc::clone(&e.flags),
            })
            .collect()
    }

    pub(crate) fn ensure_graph(&mut self) -> Result<(), WorkflowError> {
        if self.graph.is_none() {
            debug!(modules = self.entries.len(), "building dependency graph");
            self.graph = Some(DepGraph::build(&self.entries, &self.index)?);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn build_graph_for_test(&mut self) -> Result<DepGraph, WorkflowError> {
        self.ensure_graph()?;
        Ok(self.graph.clone().expect("graph cache just built"))
    }
}

impl Default for Workflow {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable lifecycle handle over a workflow's run state.
///
/// Obtained from [`Workflow::controller`]; reflects the modules registered
/// at creation time.
#[derive(Clone)]
pub struct WorkflowController {
    targets: Arc<Vec<ControlTarget>>,
    run: Arc<RunState>,
}

impl WorkflowController {
    /// See [`Workflow::request_cancel`].
    pub fn request_cancel(&self) {
        self.run.cancel.store(true, Ordering::Relaxed);
    }

    /// See [`Workflow::cancel`].
    pub fn cancel(&self) {
        apply_cancel(&self.targets, &self.run);
    }

    /// See [`Workflow::suspend`].
    pub fn suspend(&self) {
        apply_suspend(&self.targets, &self.run);
    }

    /// See [`Workflow::resume`].
    pub fn resume(&self) {
        apply_resume(&self.targets, &self.run);
    }

    pub fn cancel_requested(&self) -> bool {
        self.run.cancel.load(Ordering::Relaxed)
    }
}

fn apply_cancel(targets: &[ControlTarget], run: &RunState) {
    run.cancel.store(true, Ordering::Relaxed);
    let mut done = Vec::with_capacity(targets.len());
    {
        let mut data = run.data.lock();
        for t in targets {
            let is_done = data
                .get(t.idx)
                .map(|d| d.state == ModuleState::Done)
                .unwrap_or(true);
            if let Some(d) = data.get_mut(t.idx) {
                if !is_done {
                    d.state = ModuleState::Canceled;
                }
            }
            done.push(is_done);
        }
    }
    // Hooks run outside the lock; Done modules are left alone.
    for (t, is_done) in targets.iter().zip(done) {
        if !is_done {
            t.flags.cancel();
            t.module.on_cancel();
        }
    }
}

fn apply_suspend(targets: &[ControlTarget], run: &RunState) {
    {
        let mut data = run.data.lock();
        for t in targets {
            if let Some(d) = data.get_mut(t.idx) {
                if d.state != ModuleState::Done {
                    d.state = ModuleState::Suspended;
                }
            }
        }
    }
    for t in targets {
        t.flags.suspend();
        t.module.on_suspend();
    }
}

fn apply_resume(targets: &[ControlTarget], run: &RunState) {
    {
        let mut data = run.data.lock();
        for t in targets {
            if let Some(d) = data.get_mut(t.idx) {
                if d.state == ModuleState::Suspended {
                    d.state = ModuleState::Pending;
                }
            }
        }
    }
    for t in targets {
        t.flags.resume();
        t.module.on_resume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModuleError;
    use crate::module::FnModule;
    use async_trait::async_trait;

    fn ready(name: &str) -> FnModule {
        FnModule::new(name, |_ctx| async { Ok(()) })
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut wf = Workflow::new();
        wf.add_module(ready("dup")).unwrap();
        assert!(matches!(
            wf.add_module(ready("dup")),
            Err(WorkflowError::DuplicateName(n)) if n == "dup"
        ));
    }

    #[test]
    fn empty_name_is_rejected() {
        let mut wf = Workflow::new();
        assert!(matches!(
            wf.add_module(ready("")),
            Err(WorkflowError::EmptyName)
        ));
    }

    #[test]
    fn add_edge_requires_known_modules() {
        let mut wf = Workflow::new();
        wf.add_module(ready("a")).unwrap();
        assert!(matches!(
            wf.add_edge("a", "b"),
            Err(WorkflowError::UnknownModule(n)) if n == "b"
        ));
        assert!(matches!(
            wf.add_edge("x", "a"),
            Err(WorkflowError::UnknownModule(n)) if n == "x"
        ));
    }

    #[test]
    fn names_and_counts_follow_insertion_order() {
        let mut wf = Workflow::new();
        wf.add_module(ready("first")).unwrap();
        wf.add_module(ready("second")).unwrap();
        assert_eq!(wf.module_count(), 2);
        assert!(wf.has_module("first"));
        assert!(!wf.has_module("third"));
        assert_eq!(wf.module_names(), vec!["first", "second"]);
    }

    #[test]
    fn clear_resets_everything() {
        let mut wf = Workflow::new();
        wf.add_module(ready("a")).unwrap();
        wf.request_cancel();
        wf.clear();
        assert_eq!(wf.module_count(), 0);
        assert!(!wf.cancel_requested());
        // A fresh module under the old name is fine again.
        wf.add_module(ready("a")).unwrap();
    }

    #[test]
    fn module_priority_defaults_and_overrides() {
        let mut wf = Workflow::new();
        wf.set_default_priority(3);
        wf.add_module(ready("a")).unwrap();
        assert_eq!(wf.get_module_priority("a"), 3);
        wf.set_module_priority("a", 9).unwrap();
        assert_eq!(wf.get_module_priority("a"), 9);
        // Unknown names report the default.
        assert_eq!(wf.get_module_priority("nope"), 3);
        assert!(wf.set_module_priority("nope", 1).is_err());
    }

    #[test]
    fn observers_reject_unknown_modules() {
        let wf = Workflow::new();
        assert!(matches!(
            wf.get_module_state("ghost"),
            Err(WorkflowError::UnknownModule(_))
        ));
        assert!(matches!(
            wf.get_module_stats("ghost"),
            Err(WorkflowError::UnknownModule(_))
        ));
        assert!(wf.get_error("ghost").is_none());
    }

    /// Probe that records which lifecycle hooks fired.
    struct ProbeModule {
        name: String,
        canceled: AtomicBool,
        suspended: AtomicBool,
    }

    impl ProbeModule {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                canceled: AtomicBool::new(false),
                suspended: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Module for ProbeModule {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(&self, _ctx: ModuleCtx) -> Result<(), ModuleError> {
            Ok(())
        }

        fn on_cancel(&self) {
            self.canceled.store(true, Ordering::Relaxed);
        }

        fn on_suspend(&self) {
            self.suspended.store(true, Ordering::Relaxed);
        }

        fn on_resume(&self) {
            self.suspended.store(false, Ordering::Relaxed);
        }
    }

    #[test]
    fn suspend_resume_cancel_push_states_and_hooks() {
        let mut wf = Workflow::new();
        let probe = Arc::new(ProbeModule::new("probe"));
        wf.add_module_arc(Arc::clone(&probe) as Arc<dyn Module>).unwrap();

        wf.suspend();
        assert!(probe.suspended.load(Ordering::Relaxed));
        assert_eq!(wf.get_module_state("probe").unwrap(), ModuleState::Suspended);

        wf.resume();
        assert!(!probe.suspended.load(Ordering::Relaxed));
        assert_eq!(wf.get_module_state("probe").unwrap(), ModuleState::Pending);

        wf.cancel();
        assert!(probe.canceled.load(Ordering::Relaxed));
        assert!(wf.cancel_requested());
        assert_eq!(wf.get_module_state("probe").unwrap(), ModuleState::Canceled);
    }

    #[test]
    fn controller_shares_run_state() {
        let mut wf = Workflow::new();
        wf.add_module(ready("a")).unwrap();
        let controller = wf.controller();
        let clone = controller.clone();

        clone.suspend();
        assert_eq!(wf.get_module_state("a").unwrap(), ModuleState::Suspended);
        controller.resume();
        assert_eq!(wf.get_module_state("a").unwrap(), ModuleState::Pending);
        controller.cancel();
        assert!(wf.cancel_requested());
        assert!(clone.cancel_requested());
    }

    #[test]
    fn module_context_sees_control_flags() {
        let mut wf = Workflow::new();
        wf.add_module(ready("a")).unwrap();
        let ctx = wf.module_context("a").unwrap();
        assert!(!ctx.is_suspended());
        wf.suspend();
        assert!(ctx.is_suspended());
        wf.resume();
        assert!(!ctx.is_suspended());
        assert!(wf.module_context("ghost").is_err());
    }

    #[test]
    fn set_param_store_replaces_shared_store() {
        let mut wf = Workflow::new();
        let first = wf.param_store();
        first.set("k", 1i32);
        let replacement = Arc::new(ParamStore::new());
        wf.set_param_store(Arc::clone(&replacement));
        assert!(Arc::ptr_eq(&wf.param_store(), &replacement));
        assert!(!wf.param_store().exists("k"));
    }
}

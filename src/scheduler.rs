//! Ready-queue round scheduler.
//!
//! One `execute` call runs the graph in rounds: drain every ready module,
//! skip the ones with failed dependencies, admit up to the concurrency cap
//! by priority (aging the rest), spawn the admitted bodies on their chosen
//! runtime handles, await the whole layer (racing the global deadline),
//! classify the results under the error policy, and relax outgoing edges.
//! Rounds are barriers: nothing from round N+1 starts before every admitted
//! future of round N has resolved, which is what gives dependents their
//! happens-before edge.
//!
//! Cancellation is cooperative. The scheduler never aborts a spawned task;
//! abandoned tasks are detached and keep running to completion on their
//! runtime.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, instrument, warn};

use crate::error::{ModuleError, WorkflowError};
use crate::graph::DepGraph;
use crate::module::ModuleCtx;
use crate::types::{ErrorPolicy, ModuleState, TimeoutPolicy, WorkflowStats};
use crate::workflow::Workflow;

const INTERRUPTED_MSG: &str = "Workflow canceled or timed out";

type TaskHandle = JoinHandle<Result<(), ModuleError>>;
type RoundResults = FxHashMap<usize, Result<(), ModuleError>>;

impl Workflow {
    /// Run the whole graph to completion.
    ///
    /// Resolves `Ok(())` when the ready queue drains without a fatal
    /// classification; fails with [`WorkflowError::Interrupted`] on cancel
    /// or global timeout, with the first module's own error under
    /// `CancelOnError`, or with a configuration error from the graph
    /// build. A cyclic region is not an error: its modules simply remain
    /// `Pending` when the call returns.
    #[instrument(skip(self), fields(modules = self.entries.len()))]
    pub async fn execute(&mut self) -> Result<(), WorkflowError> {
        info!("starting workflow run");
        let result = self.run_rounds().await;

        let end = Instant::now();
        self.stats.end_time = Some(end);
        if let Some(start) = self.stats.start_time {
            self.stats.duration = end.saturating_duration_since(start);
        }

        match &result {
            Ok(()) => info!(
                duration_ms = self.stats.duration.as_millis() as u64,
                "workflow run finished"
            ),
            Err(error) => warn!(%error, "workflow run failed"),
        }
        result
    }

    /// Synchronous entry point: builds a multi-thread runtime and blocks
    /// on [`execute`](Workflow::execute). Must not be called from inside
    /// an async context.
    pub fn execute_blocking(&mut self) -> Result<(), WorkflowError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| WorkflowError::Runtime(e.to_string()))?;
        runtime.block_on(self.execute())
    }

    async fn run_rounds(&mut self) -> Result<(), WorkflowError> {
        {
            let mut data = self.run.data.lock();
            for d in data.iter_mut() {
                d.reset();
            }
        }
        self.run.errors.lock().clear();
        self.stats = WorkflowStats {
            start_time: Some(Instant::now()),
            end_time: None,
            duration: Duration::ZERO,
        };

        self.ensure_graph()?;
        let graph = self.graph.as_ref().expect("graph cache just built");

        let n = graph.node_count;
        let mut indeg = graph.indeg.clone();
        let mut failed_deps = vec![0usize; n];
        let deadline = self.global_timeout.map(|t| Instant::now() + t);

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| indeg[i] == 0).collect();

        while !queue.is_empty() {
            if self.run.cancel.load(Ordering::Relaxed) {
                warn!("cancel flag set, skipping remaining modules");
                self.sweep_unsettled();
                return Err(WorkflowError::Interrupted(INTERRUPTED_MSG.to_string()));
            }

            let layer: Vec<usize> = queue.drain(..).collect();
            debug!(layer = layer.len(), "starting round");

            // Partition: modules with a failed ancestor never launch.
            let mut skip_layer = Vec::new();
            let mut runnable = Vec::new();
            {
                let mut data = self.run.data.lock();
                for &u in &layer {
                    if failed_deps[u] > 0 {
                        data[u].state = ModuleState::Skipped;
                        data[u].stats.mark_skipped();
                        skip_layer.push(u);
                    } else {
                        runnable.push(u);
                    }
                }
            }

            let (run_layer, deferred) = self.admit(runnable);
            if !deferred.is_empty() {
                debug!(deferred = deferred.len(), "deferring past the concurrency cap");
                self.age_and_requeue(&deferred, &mut queue);
            }

            let mut handles: Vec<(usize, TaskHandle)> = Vec::with_capacity(run_layer.len());
            for &u in &run_layer {
                handles.push((u, self.launch(u)));
            }

            let mut results: RoundResults = FxHashMap::default();
            let deadline_hit = match deadline {
                Some(d) => {
                    if Instant::now() >= d {
                        true
                    } else {
                        tokio::select! {
                            _ = drain_handles(&mut handles, &mut results) => false,
                            _ = tokio::time::sleep_until(d.into()) => true,
                        }
                    }
                }
                None => {
                    drain_handles(&mut handles, &mut results).await;
                    false
                }
            };

            if deadline_hit {
                warn!("global timeout elapsed, abandoning in-flight modules");
                self.apply_timeout_effect(&run_layer, &mut handles, &mut results)
                    .await;
                self.sweep_unsettled();
                // Dropping the handles detaches still-running tasks.
                return Err(WorkflowError::Interrupted(INTERRUPTED_MSG.to_string()));
            }

            self.process_layer(&run_layer, &results)?;
            self.relax_edges(graph, &run_layer, &mut indeg, &mut failed_deps, &mut queue);
            self.relax_edges(graph, &skip_layer, &mut indeg, &mut failed_deps, &mut queue);
        }

        Ok(())
    }

    /// Mark `Running`, stamp the start time, fire `on_start`, and spawn
    /// the body on the module's chosen handle, wrapping it in the
    /// per-module timeout when one is set.
    fn launch(&self, u: usize) -> TaskHandle {
        let entry = &self.entries[u];
        {
            let mut data = self.run.data.lock();
            data[u].state = ModuleState::Running;
            data[u].stats.mark_start(Instant::now());
        }
        if let Some(hook) = &self.hooks.on_start {
            hook(&entry.name);
        }
        debug!(module = %entry.name, "launching module");

        let handle = entry
            .preferred
            .clone()
            .or_else(|| entry.module.select_executor())
            .or_else(|| self.default_executor.clone())
            .unwrap_or_else(Handle::current);

        let module = Arc::clone(&entry.module);
        let ctx = ModuleCtx::new(Some(Arc::clone(&self.store)), Arc::clone(&entry.flags));
        let per_timeout = module.timeout();

        handle.spawn(async move {
            if per_timeout > Duration::ZERO {
                match tokio::time::timeout(per_timeout, module.execute(ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(ModuleError::Timeout),
                }
            } else {
                module.execute(ctx).await
            }
        })
    }

    /// Admission gating: without a cap, or with the layer under it, admit
    /// everything. Otherwise pick the top-K by (priority desc, insertion
    /// index asc) with a partial selection and hand back the rest.
    fn admit(&self, runnable: Vec<usize>) -> (Vec<usize>, Vec<usize>) {
        let cap = match self.max_concurrency {
            Some(cap) if runnable.len() > cap => cap,
            _ => return (runnable, Vec::new()),
        };

        let mut sorted = runnable;
        {
            let data = self.run.data.lock();
            let better = |a: usize, b: usize| {
                data[b].priority
                    .cmp(&data[a].priority)
                    .then(a.cmp(&b))
            };
            sorted.select_nth_unstable_by(cap - 1, |&a, &b| better(a, b));
            sorted[..cap].sort_unstable_by(|&a, &b| better(a, b));
        }
        let deferred = sorted.split_off(cap);
        (sorted, deferred)
    }

    /// Aging: each deferred module gains one `aging_step` on top of its
    /// currently stored priority (so deferral compounds across rounds) and
    /// goes back to the queue.
    fn age_and_requeue(&self, deferred: &[usize], queue: &mut VecDeque<usize>) {
        let mut data = self.run.data.lock();
        for &u in deferred {
            data[u].deferred_rounds += 1;
            data[u].priority += self.aging_step;
            data[u].state = ModuleState::Pending;
            debug!(
                module = %self.entries[u].name,
                priority = data[u].priority,
                rounds = data[u].deferred_rounds,
                "aged deferred module"
            );
            queue.push_back(u);
        }
    }

    fn process_layer(
        &self,
        run_layer: &[usize],
        results: &RoundResults,
    ) -> Result<(), WorkflowError> {
        match self.error_policy {
            ErrorPolicy::CancelOnError => self.classify_cancel_on_error(run_layer, results),
            ErrorPolicy::ContinueOnError => {
                self.classify_continue_on_error(run_layer, results);
                Ok(())
            }
        }
    }

    /// Inspect results in launch order; the first failure marks everything
    /// not yet inspected (and everything still pending in later layers) as
    /// `Skipped`, sets the cancel flag, and re-raises the module's error.
    fn classify_cancel_on_error(
        &self,
        run_layer: &[usize],
        results: &RoundResults,
    ) -> Result<(), WorkflowError> {
        let mut completed: Vec<usize> = Vec::new();
        let mut failure: Option<(usize, String, bool)> = None;
        let mut swept: Vec<usize> = Vec::new();

        {
            let mut data = self.run.data.lock();
            let now = Instant::now();
            for (pos, &u) in run_layer.iter().enumerate() {
                let result = results.get(&u).expect("layer fully drained");
                match result {
                    Ok(()) => {
                        data[u].state = ModuleState::Done;
                        data[u].stats.mark_end(now);
                        completed.push(u);
                    }
                    Err(ModuleError::Timeout)
                        if self.timeout_policy == TimeoutPolicy::AsNormal =>
                    {
                        data[u].state = ModuleState::Timeout;
                        data[u].stats.mark_end(now);
                        self.run.errors.lock().insert(
                            Arc::clone(&self.entries[u].name),
                            ModuleError::Timeout.to_string(),
                        );
                    }
                    Err(error) => {
                        data[u].state = ModuleState::Failed;
                        data[u].stats.mark_end(now);
                        failure = Some((u, error.to_string(), error.is_timeout()));
                        // The not-yet-inspected remainder of the layer is
                        // skipped even if it happened to finish.
                        for &uj in &run_layer[pos + 1..] {
                            data[uj].state = ModuleState::Skipped;
                            data[uj].stats.mark_skipped();
                            swept.push(uj);
                        }
                        break;
                    }
                }
            }

            if failure.is_some() {
                // Leave nothing Pending: later layers are unreachable once
                // the run aborts, so settle them as Skipped too.
                for (j, d) in data.iter_mut().enumerate() {
                    if !d.state.is_settled() {
                        d.state = ModuleState::Skipped;
                        d.stats.mark_skipped();
                        swept.push(j);
                    }
                }
            }
        }

        self.fire_complete(&completed);

        let Some((u, message, is_timeout)) = failure else {
            return Ok(());
        };

        self.run.cancel.store(true, Ordering::Relaxed);
        let name = Arc::clone(&self.entries[u].name);
        warn!(module = %name, error = %message, "module failed, canceling run");
        self.run
            .errors
            .lock()
            .insert(Arc::clone(&name), message.clone());
        for &uj in &swept {
            let entry = &self.entries[uj];
            entry.flags.cancel();
            entry.module.on_cancel();
        }
        if let Some(hook) = &self.hooks.on_error {
            hook(&name, &message);
        }

        if is_timeout {
            Err(WorkflowError::Interrupted(message))
        } else {
            Err(WorkflowError::ModuleFailed {
                module: name.to_string(),
                message,
            })
        }
    }

    /// Record every result and keep going; failures only reach later
    /// layers through `failed_dep_count` propagation.
    fn classify_continue_on_error(&self, run_layer: &[usize], results: &RoundResults) {
        let mut completed: Vec<usize> = Vec::new();
        let mut failed: Vec<(usize, String)> = Vec::new();

        {
            let mut data = self.run.data.lock();
            let mut errors = self.run.errors.lock();
            let now = Instant::now();
            for &u in run_layer {
                let result = results.get(&u).expect("layer fully drained");
                match result {
                    Ok(()) => {
                        data[u].state = ModuleState::Done;
                        data[u].stats.mark_end(now);
                        completed.push(u);
                    }
                    Err(ModuleError::Timeout)
                        if self.timeout_policy == TimeoutPolicy::AsNormal =>
                    {
                        data[u].state = ModuleState::Timeout;
                        data[u].stats.mark_end(now);
                        errors.insert(
                            Arc::clone(&self.entries[u].name),
                            ModuleError::Timeout.to_string(),
                        );
                    }
                    Err(error) => {
                        data[u].state = ModuleState::Failed;
                        data[u].stats.mark_end(now);
                        errors.insert(Arc::clone(&self.entries[u].name), error.to_string());
                        failed.push((u, error.to_string()));
                    }
                }
            }
        }

        for (u, message) in &failed {
            warn!(module = %self.entries[*u].name, error = %message, "module failed, continuing");
        }
        self.fire_complete(&completed);
        self.fire_error(&failed);
    }

    /// Global timeout effect: set the cancel flag, settle the launched
    /// layer from whatever resolved during the race (`Done` / `Failed` /
    /// unresolved → `Skipped` with `on_cancel`), then settle everything
    /// still pending as `Skipped`.
    async fn apply_timeout_effect(
        &self,
        run_layer: &[usize],
        handles: &mut [(usize, TaskHandle)],
        results: &mut RoundResults,
    ) {
        self.run.cancel.store(true, Ordering::Relaxed);

        // Harvest results that landed between the deadline and now.
        for (u, handle) in handles.iter_mut() {
            if !results.contains_key(u) && handle.is_finished() {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(join_error) => Err(join_failure(join_error)),
                };
                results.insert(*u, result);
            }
        }

        let mut completed: Vec<usize> = Vec::new();
        let mut failed: Vec<(usize, String)> = Vec::new();
        let mut unresolved: Vec<usize> = Vec::new();
        for &u in run_layer {
            match results.get(&u) {
                Some(Ok(())) => completed.push(u),
                Some(Err(error)) => failed.push((u, error.to_string())),
                None => unresolved.push(u),
            }
        }

        {
            let mut data = self.run.data.lock();
            let now = Instant::now();
            for &u in &completed {
                data[u].state = ModuleState::Done;
                data[u].stats.mark_end(now);
            }
            for (u, _) in &failed {
                data[*u].state = ModuleState::Failed;
                data[*u].stats.mark_end(now);
            }
            for &u in &unresolved {
                data[u].state = ModuleState::Skipped;
                data[u].stats.mark_skipped();
            }
        }
        {
            let mut errors = self.run.errors.lock();
            for (u, message) in &failed {
                errors.insert(Arc::clone(&self.entries[*u].name), message.clone());
            }
        }

        for &u in &unresolved {
            let entry = &self.entries[u];
            entry.flags.cancel();
            entry.module.on_cancel();
        }
        self.fire_complete(&completed);
        self.fire_error(&failed);
    }

    /// Settle every `Pending`/`Running` module as `Skipped` with its
    /// cooperative cancel signal.
    fn sweep_unsettled(&self) {
        let mut swept = Vec::new();
        {
            let mut data = self.run.data.lock();
            for (u, d) in data.iter_mut().enumerate() {
                if !d.state.is_settled() {
                    d.state = ModuleState::Skipped;
                    d.stats.mark_skipped();
                    swept.push(u);
                }
            }
        }
        for &u in &swept {
            let entry = &self.entries[u];
            entry.flags.cancel();
            entry.module.on_cancel();
        }
    }

    /// For each settled `u`, bump `failed_dep_count` of its dependents when
    /// `u` ended `Failed`/`Skipped`, and queue dependents whose in-degree
    /// reaches zero. The next round's partition decides whether they run.
    fn relax_edges(
        &self,
        graph: &DepGraph,
        settled: &[usize],
        indeg: &mut [usize],
        failed_deps: &mut [usize],
        queue: &mut VecDeque<usize>,
    ) {
        let data = self.run.data.lock();
        for &u in settled {
            let u_failed = matches!(
                data[u].state,
                ModuleState::Failed | ModuleState::Skipped
            );
            for &v in graph.dependents(u) {
                if u_failed {
                    failed_deps[v] += 1;
                }
                indeg[v] -= 1;
                if indeg[v] == 0 {
                    queue.push_back(v);
                }
            }
        }
    }

    fn fire_complete(&self, completed: &[usize]) {
        if let Some(hook) = &self.hooks.on_complete {
            for &u in completed {
                hook(&self.entries[u].name);
            }
        }
    }

    fn fire_error(&self, failed: &[(usize, String)]) {
        if let Some(hook) = &self.hooks.on_error {
            for (u, message) in failed {
                hook(&self.entries[*u].name, message);
            }
        }
    }
}

/// Await every handle in launch order, recording each module's result.
/// Awaiting sequentially is fine: the tasks already run concurrently, and
/// the loop only needs all of them resolved before classification.
async fn drain_handles(handles: &mut [(usize, TaskHandle)], results: &mut RoundResults) {
    for (u, handle) in handles.iter_mut() {
        if results.contains_key(u) {
            continue;
        }
        let result = match handle.await {
            Ok(result) => result,
            Err(join_error) => Err(join_failure(join_error)),
        };
        results.insert(*u, result);
    }
}

/// A join error means the task panicked or its runtime shut down before it
/// could run; either way it is that module's failure.
fn join_failure(error: JoinError) -> ModuleError {
    ModuleError::Failed(error.to_string())
}

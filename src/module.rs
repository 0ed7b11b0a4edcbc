//! The module abstraction: the unit of work a workflow schedules.
//!
//! [`Module`] is a capability trait: one required async operation
//! (`execute`) plus default-implemented knobs (dependencies, timeout,
//! executor selection, lifecycle hooks). Implementations are registered as
//! `Arc<dyn Module>` so straggling tasks keep their module alive.
//!
//! Each execution receives a [`ModuleCtx`]: the injected parameter store
//! plus the module's cooperative cancel/suspend flags. The scheduler never
//! preempts a running module; cooperation happens at explicit
//! [`ModuleCtx::check_suspend`] points.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::Notify;

use crate::error::{ModuleError, ParamError};
use crate::param_store::ParamStore;

/// A unit of asynchronous work with a unique name and dependency list.
///
/// Only [`execute`](Module::execute) is required. The remaining methods are
/// capabilities with defaults: no dependencies, no per-module timeout, no
/// preferred executor, no-op lifecycle hooks.
#[async_trait]
pub trait Module: Send + Sync {
    /// Unique name within the workflow.
    fn name(&self) -> &str;

    /// Names of modules this one reads happens-before from.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// The async body. Errors surface through the returned `Result`; a
    /// panic is classified as a failure by the scheduler.
    async fn execute(&self, ctx: ModuleCtx) -> Result<(), ModuleError>;

    /// Per-module timeout; zero disables it.
    fn timeout(&self) -> Duration {
        Duration::ZERO
    }

    /// Whether the module reacts to cooperative cancellation by exiting
    /// early. Purely advisory; the scheduler treats a normally-completing
    /// canceled module as `Done` either way.
    fn cancellable(&self) -> bool {
        false
    }

    /// Runtime handle the module prefers to run on; `None` falls back to
    /// the workflow default.
    fn select_executor(&self) -> Option<Handle> {
        None
    }

    /// Called when the workflow cancels this module. The framework flips
    /// the cooperative flag before invoking this hook.
    fn on_cancel(&self) {}

    /// Called when the workflow suspends this module.
    fn on_suspend(&self) {}

    /// Called when the workflow resumes this module.
    fn on_resume(&self) {}
}

/// Cooperative control flags shared between the scheduler, the controller,
/// and a module's executions.
#[derive(Default)]
pub(crate) struct ControlFlags {
    canceled: AtomicBool,
    suspended: AtomicBool,
    resumed: Notify,
}

impl ControlFlags {
    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
        // Wake anyone parked in check_suspend.
        self.resumed.notify_waiters();
    }

    pub(crate) fn suspend(&self) {
        self.suspended.store(true, Ordering::Relaxed);
    }

    pub(crate) fn resume(&self) {
        self.suspended.store(false, Ordering::Relaxed);
        self.resumed.notify_waiters();
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Relaxed)
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Relaxed)
    }
}

/// Per-execution context handed to [`Module::execute`]: parameter store
/// access plus the module's cooperative flags. Cloning is cheap.
#[derive(Clone)]
pub struct ModuleCtx {
    store: Option<Arc<ParamStore>>,
    flags: Arc<ControlFlags>,
}

impl ModuleCtx {
    pub(crate) fn new(store: Option<Arc<ParamStore>>, flags: Arc<ControlFlags>) -> Self {
        Self { store, flags }
    }

    /// Context with fresh flags and no store, for running a module outside
    /// a workflow. Param helpers fail with [`ParamError::NoStore`].
    pub fn detached() -> Self {
        Self::new(None, Arc::new(ControlFlags::default()))
    }

    /// The attached parameter store, if any.
    pub fn store(&self) -> Option<&Arc<ParamStore>> {
        self.store.as_ref()
    }

    fn require_store(&self) -> Result<&Arc<ParamStore>, ParamError> {
        self.store.as_ref().ok_or(ParamError::NoStore)
    }

    /// Insert or replace a shared parameter.
    pub fn set_param<T: Any + Send + Sync>(
        &self,
        key: impl Into<String>,
        value: T,
    ) -> Result<(), ParamError> {
        self.require_store()?.set(key, value);
        Ok(())
    }

    /// Shared handle to a parameter written by this or another module.
    pub fn get_param<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>, ParamError> {
        self.require_store()?.get(key)
    }

    /// Read access under the shard read lock.
    pub fn with_read_param<T, R>(&self, key: &str, f: impl FnOnce(&T) -> R) -> Result<R, ParamError>
    where
        T: Any + Send + Sync,
    {
        self.require_store()?.with_read(key, f)
    }

    /// Write access under the shard write lock.
    pub fn with_write_param<T, R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, ParamError>
    where
        T: Any + Send + Sync + Clone,
    {
        self.require_store()?.with_write(key, f)
    }

    pub fn param_exists(&self, key: &str) -> Result<bool, ParamError> {
        Ok(self.require_store()?.exists(key))
    }

    /// Whether this module has been cooperatively canceled.
    pub fn is_canceled(&self) -> bool {
        self.flags.is_canceled()
    }

    pub fn is_suspended(&self) -> bool {
        self.flags.is_suspended()
    }

    /// Park while `suspended && !canceled`. Returns as soon as the module
    /// is resumed or canceled; safe to call from any point in a module
    /// body.
    pub async fn check_suspend(&self) {
        loop {
            // Arm the notification before re-checking the flags so a
            // resume/cancel between the check and the await is not lost.
            let notified = self.flags.resumed.notified();
            if !self.flags.is_suspended() || self.flags.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}

type ModuleFuture = Pin<Box<dyn Future<Output = Result<(), ModuleError>> + Send>>;

/// A module built from a name and an async closure, with fluent setters
/// for the optional capabilities.
///
/// ```
/// use weft::FnModule;
///
/// let module = FnModule::new("fetch", |_ctx| async { Ok(()) })
///     .depends_on("config")
///     .with_timeout(std::time::Duration::from_secs(5));
/// ```
pub struct FnModule {
    name: String,
    deps: Vec<String>,
    timeout: Duration,
    cancellable: bool,
    executor: Option<Handle>,
    body: Box<dyn Fn(ModuleCtx) -> ModuleFuture + Send + Sync>,
}

impl FnModule {
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(ModuleCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ModuleError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            deps: Vec::new(),
            timeout: Duration::ZERO,
            cancellable: false,
            executor: None,
            body: Box::new(move |ctx| Box::pin(body(ctx))),
        }
    }

    /// Add a dependency on another module.
    pub fn depends_on(mut self, dep: impl Into<String>) -> Self {
        self.deps.push(dep.into());
        self
    }

    /// Add several dependencies at once.
    pub fn depends_on_all<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Per-module timeout; zero disables it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellable(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }

    /// Preferred runtime handle.
    pub fn with_executor(mut self, handle: Handle) -> Self {
        self.executor = Some(handle);
        self
    }
}

#[async_trait]
impl Module for FnModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<String> {
        self.deps.clone()
    }

    async fn execute(&self, ctx: ModuleCtx) -> Result<(), ModuleError> {
        (self.body)(ctx).await
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn cancellable(&self) -> bool {
        self.cancellable
    }

    fn select_executor(&self) -> Option<Handle> {
        self.executor.clone()
    }
}

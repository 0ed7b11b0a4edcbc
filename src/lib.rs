//! Weft - async DAG workflow scheduler
//!
//! Modules (units of async work) declare dependencies by name; the
//! workflow runs them in topological rounds on tokio, launching every
//! ready module of a round in parallel and holding the next round until
//! the whole layer resolves. Policies control what happens around the
//! core loop: error handling (`CancelOnError` / `ContinueOnError`), global
//! and per-module timeouts, priority admission with a per-round
//! concurrency cap and anti-starvation aging, and cooperative
//! cancel/suspend/resume. Modules exchange data through a sharded,
//! type-checked parameter store.
//!
//! ## Architecture
//!
//! - `workflow`: module registration, control surface, observers
//! - `scheduler`: ready-queue round loop (admission, timeout races,
//!   classification, edge relaxation)
//! - `graph`: cached CSR dependency graph
//! - `module`: the `Module` trait, execution context, closure modules
//! - `param_store`: sharded typed key→value store (DashMap)
//! - `types`: states, policies, timing stats
//! - `error`: layered error types
//!
//! ## Example
//!
//! ```
//! use weft::{FnModule, Workflow};
//!
//! # async fn demo() -> Result<(), weft::WorkflowError> {
//! let mut workflow = Workflow::new();
//! workflow.add_module(FnModule::new("producer", |ctx| async move {
//!     ctx.set_param("answer", 42i32)?;
//!     Ok(())
//! }))?;
//! workflow.add_module(
//!     FnModule::new("consumer", |ctx| async move {
//!         let answer = ctx.get_param::<i32>("answer")?;
//!         assert_eq!(*answer, 42);
//!         Ok(())
//!     })
//!     .depends_on("producer"),
//! )?;
//! workflow.execute().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
mod graph;
pub mod module;
pub mod param_store;
mod scheduler;
pub mod types;
pub mod workflow;

pub use error::{ModuleError, ParamError, WorkflowError};
pub use module::{FnModule, Module, ModuleCtx};
pub use param_store::ParamStore;
pub use types::{ErrorPolicy, ModuleState, ModuleStats, TimeoutPolicy, WorkflowStats};
pub use workflow::{Workflow, WorkflowController};

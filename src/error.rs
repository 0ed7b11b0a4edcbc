//! Error types, split by layer: workflow-level control and configuration
//! errors, module execution errors, and parameter store errors.
//!
//! The layers stay separate on purpose: modules only ever see `ModuleError`
//! and `ParamError`, while `WorkflowError` is what `Workflow::execute` and
//! the configuration surface return.

use thiserror::Error;

/// Errors returned by [`Workflow`](crate::Workflow) configuration and
/// execution.
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// A module was registered under a name that is already taken.
    #[error("duplicate module name: {0}")]
    DuplicateName(String),

    /// A module was registered with an empty name.
    #[error("module name must not be empty")]
    EmptyName,

    /// An edge or observer referenced a name that is not registered.
    #[error("unknown module: {0}")]
    UnknownModule(String),

    /// A declared dependency is not registered in the workflow.
    #[error("missing dependency: {dependency} for module: {module}")]
    MissingDependency { module: String, dependency: String },

    /// The run was canceled or a timeout fired. Carries one of the two
    /// canonical messages: "Workflow canceled or timed out" for the global
    /// cancel/deadline path, "Module timed out" for a per-module timeout
    /// re-raised under `CancelOnError`.
    #[error("{0}")]
    Interrupted(String),

    /// A module failed under `CancelOnError`; displays the module's own
    /// error message unchanged.
    #[error("{message}")]
    ModuleFailed { module: String, message: String },

    /// A tokio runtime could not be constructed for `execute_blocking`.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl WorkflowError {
    /// True for the cancel/timeout interruption variants.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, WorkflowError::Interrupted(_))
    }
}

/// Errors produced by a module body.
#[derive(Error, Debug)]
pub enum ModuleError {
    /// General execution failure with a user-provided message.
    #[error("{0}")]
    Failed(String),

    /// The module's own timeout elapsed before its body resolved.
    #[error("Module timed out")]
    Timeout,

    /// A parameter store access failed inside the module body.
    #[error(transparent)]
    Param(#[from] ParamError),
}

impl ModuleError {
    /// Shorthand for a general failure.
    pub fn failed(msg: impl Into<String>) -> Self {
        ModuleError::Failed(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ModuleError::Timeout)
    }
}

/// Errors produced by [`ParamStore`](crate::ParamStore) accesses.
#[derive(Error, Debug)]
pub enum ParamError {
    /// No value is stored under the key.
    #[error("param not found: {0}")]
    NotFound(String),

    /// A value exists but was stored under a different type tag.
    #[error("type mismatch for key: {0}")]
    TypeMismatch(String),

    /// The context has no parameter store attached.
    #[error("no parameter store attached")]
    NoStore,
}

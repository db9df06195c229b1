// Top-level error for callers driving the engine through `TemplateEngine`.

use template_sandbox::SandboxError;
use thiserror::Error;

use crate::composer::CompositionError;
use crate::config::ConfigError;
use crate::extensions::LifecycleError;
use crate::inheritance::InheritanceError;
use crate::persistence::StorageError;
use crate::template::ModelError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Structural(#[from] ModelError),

    #[error(transparent)]
    Inheritance(#[from] InheritanceError),

    #[error(transparent)]
    Composition(#[from] CompositionError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type EngineResult<T> = Result<T, EngineError>;

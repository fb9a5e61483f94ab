// Executor Errors
// Error taxonomy shared by every phase of the build engine

use crate::client::ClientError;
use crate::runtime::RuntimeError;

use thiserror::Error;

/// Result alias used across the engine
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Errors raised while resolving secrets
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("unrecognized secret type: {0}")]
    UnrecognizedType(String),

    #[error("unable to retrieve {kind} secret {key}: {source}")]
    Retrieve {
        kind: String,
        key: String,
        #[source]
        source: ClientError,
    },

    #[error("invalid secret key {key}: {reason}")]
    InvalidKey { key: String, reason: String },
}

/// Errors that can occur while driving a build
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Bad or missing configuration for a container or for the engine itself
    #[error("setup error: {0}")]
    Setup(String),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("build server error: {0}")]
    Client(#[from] ClientError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("attempting to use privileged image(s) ({images}) as untrusted repo {repo}")]
    UntrustedImages { images: String, repo: String },

    /// A stage this stage needs finished with an error
    #[error("dependency {stage} failed: {message}")]
    Dependency { stage: String, message: String },

    /// A container the build depends on finished with a non-zero exit code
    #[error("{name} container exited with non-zero code {code}")]
    ContainerExit { name: String, code: i32 },

    #[error("file {file} is {size} bytes, over the {limit} byte limit")]
    FileTooLarge { file: String, size: u64, limit: u64 },

    #[error("file {file} would bring the build to {total} bytes, over the {limit} byte limit")]
    BuildFilesTooLarge { file: String, total: u64, limit: u64 },

    #[error("context canceled")]
    Canceled,

    #[error("task panicked: {0}")]
    TaskPanicked(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ExecutorError>,
    },
}

impl ExecutorError {
    /// Wrap the error with a description of the operation that failed
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for a setup error
    pub fn setup(message: impl Into<String>) -> Self {
        Self::Setup(message.into())
    }

    /// Whether the innermost error is a cancellation
    pub fn is_canceled(&self) -> bool {
        matches!(self.root(), Self::Canceled)
    }

    /// The innermost error beneath any context wrappers
    pub fn root(&self) -> &ExecutorError {
        match self {
            Self::Context { source, .. } => source.root(),
            err => err,
        }
    }
}

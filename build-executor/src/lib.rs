// Build Executor Library
// Execution engine driving one CI build through its container lifecycle

pub mod client;
pub mod config;
pub mod environment;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod records;
pub mod registry;
pub mod runtime;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use error::{ExecutorError, ExecutorResult, SecretError};

// Re-export engine types
pub use config::ExecutorConfig;
pub use executor::{Executor, ExecutorBuilder, Role, StepFile, StreamRequest};

// Re-export capability traits
pub use client::{BuildClient, ClientError, ClientResult};
pub use runtime::{LogStream, Runtime, RuntimeError, RuntimeResult};

// Re-export model types
pub use pipeline::{Container, Pipeline, Ruleset, Secret, SecretPull, Stage, StepSecret};
pub use records::{
    Artifact, Build, Log, Record, Repo, SecretValue, Status, TestAttachment, TestReport,
};

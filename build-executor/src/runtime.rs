// Runtime Capabilities
// Abstract container engine the executor drives (docker, kubernetes, ...)

use crate::pipeline::{Container, Pipeline};

use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

/// Driver name reported by docker-backed runtimes
pub const DRIVER_DOCKER: &str = "docker";

/// Driver name reported by kubernetes-backed runtimes
pub const DRIVER_KUBERNETES: &str = "kubernetes";

/// Readable stream of container output
pub type LogStream = Box<dyn AsyncRead + Send + Unpin>;

/// Result alias for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors reported by a runtime backend
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("network not found: {0}")]
    NetworkNotFound(String),

    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    /// Logs are not available yet; the caller may retry
    #[error("container {0} is not ready")]
    NotReady(String),

    #[error("{0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability set of a container runtime backend
#[async_trait::async_trait]
pub trait Runtime: Send + Sync {
    /// Name of the backend, e.g. `docker`
    fn driver(&self) -> &str;

    /// Prepare a container (workspace, entrypoint, pull policy)
    async fn setup_container(&self, ctn: &mut Container) -> RuntimeResult<()>;

    /// Create and start a container
    async fn run_container(&self, ctn: &Container, pipeline: &Pipeline) -> RuntimeResult<()>;

    /// Block until the container exits
    async fn wait_container(&self, ctn: &Container) -> RuntimeResult<()>;

    /// Capture the container state, recording its exit code
    async fn inspect_container(&self, ctn: &mut Container) -> RuntimeResult<()>;

    /// Open the container's output stream
    async fn tail_container(&self, ctn: &Container) -> RuntimeResult<LogStream>;

    async fn remove_container(&self, ctn: &Container) -> RuntimeResult<()>;

    async fn create_network(&self, pipeline: &Pipeline) -> RuntimeResult<()>;

    /// Diagnostic description of the build network
    async fn inspect_network(&self, pipeline: &Pipeline) -> RuntimeResult<Vec<u8>>;

    async fn remove_network(&self, pipeline: &Pipeline) -> RuntimeResult<()>;

    async fn create_volume(&self, pipeline: &Pipeline) -> RuntimeResult<()>;

    /// Diagnostic description of the build volume
    async fn inspect_volume(&self, pipeline: &Pipeline) -> RuntimeResult<Vec<u8>>;

    async fn remove_volume(&self, pipeline: &Pipeline) -> RuntimeResult<()>;

    /// Build-level resources needed before any container is created
    async fn setup_build(&self, pipeline: &Pipeline) -> RuntimeResult<()>;

    /// Finalize the execution unit once every container is created
    async fn assemble_build(&self, pipeline: &Pipeline) -> RuntimeResult<()>;

    async fn inspect_build(&self, pipeline: &Pipeline) -> RuntimeResult<Vec<u8>>;

    async fn remove_build(&self, pipeline: &Pipeline) -> RuntimeResult<()>;

    /// Build-level log/event streaming, running until the token is cancelled
    /// or the runtime has nothing left to stream
    async fn stream_build(
        &self,
        pipeline: &Pipeline,
        token: CancellationToken,
    ) -> RuntimeResult<()>;

    /// Verify the container image, returning a diagnostic description
    async fn inspect_image(&self, ctn: &Container) -> RuntimeResult<Vec<u8>>;
}

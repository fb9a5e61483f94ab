// Build Executor
// Session state shared by every phase of a single build

pub mod artifacts;
pub mod build;
pub mod container;
pub mod logs;
pub mod secrets;
pub mod stage;
pub mod stream;

pub use artifacts::StepFile;
pub use container::{finalize_record, Role};
pub use secrets::{escape_newline_secrets, inject_secrets, secret_matches};
pub use stream::StreamRequest;

use crate::client::BuildClient;
use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, ExecutorResult};
use crate::pipeline::{Container, Pipeline, RuleData};
use crate::records::{Build, Log, Record, Repo, SecretValue, Status};
use crate::registry::Registry;
use crate::runtime::Runtime;

use parking_lot::Mutex;
use stage::StageSignals;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::error;

/// Drives one build through Create, Plan, Assemble, Exec, Stream and Destroy.
///
/// An executor is created once per build and shared behind an `Arc` between
/// the phase running on the caller's task and the stage and streaming tasks
/// it spawns.
pub struct Executor {
    pub(crate) build: Mutex<Build>,
    pub(crate) repo: Repo,
    pub(crate) pipeline: Arc<Pipeline>,
    pub(crate) runtime: Arc<dyn Runtime>,
    pub(crate) client: Arc<dyn BuildClient>,
    pub(crate) config: ExecutorConfig,

    /// Prepared init container, set by CreateBuild
    pub(crate) init: Mutex<Option<Container>>,
    /// Resolved secret values keyed by pipeline secret name
    pub(crate) secrets: Mutex<HashMap<String, SecretValue>>,

    /// Containers after Create, keyed by container id
    pub(crate) containers: Registry<Container>,
    pub(crate) steps: Registry<Record>,
    pub(crate) services: Registry<Record>,
    pub(crate) logs: Registry<Log>,
    pub(crate) stage_signals: StageSignals,
    /// Bytes of artifacts and test attachments recorded so far
    pub(crate) uploaded_bytes: AtomicU64,

    pub(crate) stream_tx: Mutex<Option<mpsc::UnboundedSender<StreamRequest>>>,
    pub(crate) stream_rx: Mutex<Option<mpsc::UnboundedReceiver<StreamRequest>>>,

    /// Last engine error, advisory only
    pub(crate) err: Mutex<Option<String>>,
}

impl Executor {
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::default()
    }

    /// Snapshot of the build record
    pub fn build(&self) -> Build {
        self.build.lock().clone()
    }

    pub fn repo(&self) -> &Repo {
        &self.repo
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Record of a step, keyed by container id
    pub fn step(&self, id: &str) -> Option<Record> {
        self.steps.load(id)
    }

    /// Record of a service, keyed by container id
    pub fn service(&self, id: &str) -> Option<Record> {
        self.services.load(id)
    }

    /// Log of a step or service, keyed by container id
    pub fn log(&self, id: &str) -> Option<Log> {
        self.logs.load(id)
    }

    /// Last engine error recorded by any phase
    pub fn last_error(&self) -> Option<String> {
        self.err.lock().clone()
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.build.lock().status = status;
    }

    pub(crate) fn status(&self) -> Status {
        self.build.lock().status
    }

    pub(crate) fn record_error(&self, err: &ExecutorError) {
        *self.err.lock() = Some(err.to_string());
    }

    /// Build data rulesets are evaluated against
    pub(crate) fn rule_data(&self, status: Status) -> RuleData {
        let build = self.build.lock();
        RuleData {
            branch: build.branch.clone(),
            event: build.full_event(),
            repo: self.repo.full_name(),
            status,
        }
    }

    /// Container as left by Create, falling back to the pipeline definition
    pub(crate) fn prepared(&self, ctn: &Container) -> Container {
        self.containers.load(&ctn.id).unwrap_or_else(|| ctn.clone())
    }

    pub(crate) fn init_id(&self) -> Option<String> {
        self.init.lock().as_ref().map(|init| init.id.clone())
    }

    /// Every resolved secret value, used to mask log output
    pub(crate) fn secret_values(&self) -> Vec<String> {
        self.secrets
            .lock()
            .values()
            .map(|secret| secret.value.clone())
            .filter(|value| !value.is_empty())
            .collect()
    }

    /// Persist the build record, keeping the server's copy on success
    pub(crate) async fn upload_build(&self) -> ExecutorResult<()> {
        let build = self.build();
        let updated = self
            .client
            .update_build(&self.repo, &build)
            .await
            .map_err(|e| ExecutorError::from(e).context("unable to upload build state"))?;

        let mut current = self.build.lock();
        current.id = updated.id;
        Ok(())
    }

    /// Mark the build as errored after an engine failure and persist it
    pub(crate) async fn snapshot_build(&self, err: &ExecutorError) {
        self.record_error(err);
        {
            let mut build = self.build.lock();
            build.error = err.to_string();
            if !build.status.is_terminal() && build.status != Status::Canceled {
                build.status = Status::Error;
            }
            if build.finished == 0 {
                build.finished = crate::records::now();
            }
        }

        if let Err(upload_err) = self.upload_build().await {
            error!(build = self.build.lock().number, error = %upload_err, "unable to snapshot build");
        }
    }

    /// Stop accepting stream requests so the coordinator can drain and exit
    pub(crate) fn close_stream_intake(&self) {
        self.stream_tx.lock().take();
    }
}

/// Assembles an [`Executor`] from its collaborators
#[derive(Default)]
pub struct ExecutorBuilder {
    build: Option<Build>,
    repo: Repo,
    pipeline: Option<Pipeline>,
    runtime: Option<Arc<dyn Runtime>>,
    client: Option<Arc<dyn BuildClient>>,
    config: ExecutorConfig,
}

impl ExecutorBuilder {
    pub fn with_build(mut self, build: Build) -> Self {
        self.build = Some(build);
        self
    }

    pub fn with_repo(mut self, repo: Repo) -> Self {
        self.repo = repo;
        self
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn Runtime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_client(mut self, client: Arc<dyn BuildClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ExecutorResult<Arc<Executor>> {
        let build = self
            .build
            .ok_or_else(|| ExecutorError::setup("no build provided to executor"))?;
        let pipeline = self
            .pipeline
            .ok_or_else(|| ExecutorError::setup("no pipeline provided to executor"))?;
        let runtime = self
            .runtime
            .ok_or_else(|| ExecutorError::setup("no runtime provided to executor"))?;
        let client = self
            .client
            .ok_or_else(|| ExecutorError::setup("no build client provided to executor"))?;

        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Executor {
            build: Mutex::new(build),
            repo: self.repo,
            pipeline: Arc::new(pipeline),
            runtime,
            client,
            config: self.config,
            init: Mutex::new(None),
            secrets: Mutex::new(HashMap::new()),
            containers: Registry::new(),
            steps: Registry::new(),
            services: Registry::new(),
            logs: Registry::new(),
            stage_signals: StageSignals::new(),
            uploaded_bytes: AtomicU64::new(0),
            stream_tx: Mutex::new(Some(tx)),
            stream_rx: Mutex::new(Some(rx)),
            err: Mutex::new(None),
        }))
    }
}

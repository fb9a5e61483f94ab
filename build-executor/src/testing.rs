// Test Doubles
// In-memory runtime and build server used by the engine's tests

use crate::client::{BuildClient, ClientError, ClientResult};
use crate::config::ExecutorConfig;
use crate::executor::Executor;
use crate::pipeline::{Container, Pipeline};
use crate::records::{
    Artifact, Build, Log, Record, Repo, SecretValue, TestAttachment, TestReport,
};
use crate::runtime::{LogStream, Runtime, RuntimeError, RuntimeResult, DRIVER_DOCKER};

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;

/// Runtime whose containers exist only in memory.
///
/// Behavior is configured per container name: exit codes, run delays and
/// output. Every call is appended to an event list tests can inspect.
pub struct MockRuntime {
    driver: String,
    missing_images: HashSet<String>,
    missing_containers: HashSet<String>,
    exit_codes: HashMap<String, i32>,
    delays: HashMap<String, Duration>,
    outputs: HashMap<String, String>,
    tail_failures: Mutex<HashMap<String, u32>>,
    failing_runs: HashSet<String>,
    live: HashSet<String>,
    writers: Mutex<HashMap<String, DuplexStream>>,
    events: Mutex<Vec<String>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            driver: DRIVER_DOCKER.to_string(),
            missing_images: HashSet::new(),
            missing_containers: HashSet::new(),
            exit_codes: HashMap::new(),
            delays: HashMap::new(),
            outputs: HashMap::new(),
            tail_failures: Mutex::new(HashMap::new()),
            failing_runs: HashSet::new(),
            live: HashSet::new(),
            writers: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn with_driver(mut self, driver: &str) -> Self {
        self.driver = driver.to_string();
        self
    }

    pub fn with_missing_image(mut self, image: &str) -> Self {
        self.missing_images.insert(image.to_string());
        self
    }

    /// Containers the runtime no longer knows about
    pub fn with_missing_container(mut self, name: &str) -> Self {
        self.missing_containers.insert(name.to_string());
        self
    }

    pub fn with_exit_code(mut self, name: &str, code: i32) -> Self {
        self.exit_codes.insert(name.to_string(), code);
        self
    }

    /// Time the container takes to finish once started
    pub fn with_delay(mut self, name: &str, delay: Duration) -> Self {
        self.delays.insert(name.to_string(), delay);
        self
    }

    pub fn with_output(mut self, name: &str, output: &str) -> Self {
        self.outputs.insert(name.to_string(), output.to_string());
        self
    }

    /// Report output as not ready for the first `count` tail attempts
    pub fn with_tail_failures(self, name: &str, count: u32) -> Self {
        self.tail_failures.lock().insert(name.to_string(), count);
        self
    }

    /// Fail to start the container
    pub fn with_run_failure(mut self, name: &str) -> Self {
        self.failing_runs.insert(name.to_string());
        self
    }

    /// Keep the output stream open until the container is removed
    pub fn with_live_output(mut self, name: &str) -> Self {
        self.live.insert(name.to_string());
        self
    }

    /// Calls made so far, e.g. `run:echo` or `remove_network`
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// Position of the first matching event
    pub fn position(&self, event: &str) -> Option<usize> {
        self.events.lock().iter().position(|e| e == event)
    }

    fn record(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }
}

#[async_trait::async_trait]
impl Runtime for MockRuntime {
    fn driver(&self) -> &str {
        &self.driver
    }

    async fn setup_container(&self, ctn: &mut Container) -> RuntimeResult<()> {
        if ctn.directory.is_empty() {
            ctn.directory = "/workspace".to_string();
        }
        Ok(())
    }

    async fn run_container(&self, ctn: &Container, _pipeline: &Pipeline) -> RuntimeResult<()> {
        if self.failing_runs.contains(&ctn.name) {
            return Err(RuntimeError::Failed(format!("unable to start {}", ctn.name)));
        }
        self.record(format!("run:{}", ctn.name));
        Ok(())
    }

    async fn wait_container(&self, ctn: &Container) -> RuntimeResult<()> {
        if let Some(delay) = self.delays.get(&ctn.name) {
            tokio::time::sleep(*delay).await;
        }
        self.record(format!("done:{}", ctn.name));
        Ok(())
    }

    async fn inspect_container(&self, ctn: &mut Container) -> RuntimeResult<()> {
        if self.missing_containers.contains(&ctn.name) {
            return Err(RuntimeError::ContainerNotFound(ctn.id.clone()));
        }
        ctn.exit_code = self.exit_codes.get(&ctn.name).copied().unwrap_or(0);
        Ok(())
    }

    async fn tail_container(&self, ctn: &Container) -> RuntimeResult<LogStream> {
        {
            let mut failures = self.tail_failures.lock();
            if let Some(remaining) = failures.get_mut(&ctn.name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(RuntimeError::NotReady(ctn.id.clone()));
                }
            }
        }

        let removed = self.position(&format!("remove:{}", ctn.name)).is_some();
        if self.live.contains(&ctn.name) && !removed {
            let (reader, writer) = tokio::io::duplex(64);
            self.writers.lock().insert(ctn.name.clone(), writer);
            return Ok(Box::new(reader));
        }

        let output = self.outputs.get(&ctn.name).cloned().unwrap_or_default();
        Ok(Box::new(Cursor::new(output.into_bytes())))
    }

    async fn remove_container(&self, ctn: &Container) -> RuntimeResult<()> {
        if self.missing_containers.contains(&ctn.name) {
            return Err(RuntimeError::ContainerNotFound(ctn.id.clone()));
        }
        // closing the writer ends a live output stream
        self.writers.lock().remove(&ctn.name);
        self.record(format!("remove:{}", ctn.name));
        Ok(())
    }

    async fn create_network(&self, _pipeline: &Pipeline) -> RuntimeResult<()> {
        self.record("create_network");
        Ok(())
    }

    async fn inspect_network(&self, pipeline: &Pipeline) -> RuntimeResult<Vec<u8>> {
        Ok(format!("network {} ready\n", pipeline.id).into_bytes())
    }

    async fn remove_network(&self, _pipeline: &Pipeline) -> RuntimeResult<()> {
        self.record("remove_network");
        Ok(())
    }

    async fn create_volume(&self, _pipeline: &Pipeline) -> RuntimeResult<()> {
        self.record("create_volume");
        Ok(())
    }

    async fn inspect_volume(&self, pipeline: &Pipeline) -> RuntimeResult<Vec<u8>> {
        Ok(format!("volume {} ready\n", pipeline.id).into_bytes())
    }

    async fn remove_volume(&self, _pipeline: &Pipeline) -> RuntimeResult<()> {
        self.record("remove_volume");
        Ok(())
    }

    async fn setup_build(&self, _pipeline: &Pipeline) -> RuntimeResult<()> {
        self.record("setup_build");
        Ok(())
    }

    async fn assemble_build(&self, _pipeline: &Pipeline) -> RuntimeResult<()> {
        self.record("assemble_build");
        Ok(())
    }

    async fn inspect_build(&self, _pipeline: &Pipeline) -> RuntimeResult<Vec<u8>> {
        Ok(b"build assembled\n".to_vec())
    }

    async fn remove_build(&self, _pipeline: &Pipeline) -> RuntimeResult<()> {
        self.record("remove_build");
        Ok(())
    }

    async fn stream_build(&self, _pipeline: &Pipeline, _token: CancellationToken) -> RuntimeResult<()> {
        Ok(())
    }

    async fn inspect_image(&self, ctn: &Container) -> RuntimeResult<Vec<u8>> {
        if self.missing_images.contains(&ctn.image) {
            return Err(RuntimeError::ImageNotFound(ctn.image.clone()));
        }
        Ok(format!("{} verified\n", ctn.image).into_bytes())
    }
}

/// Build server keeping the latest state of everything it is sent
pub struct MockClient {
    next_id: AtomicI64,
    builds: Mutex<Vec<Build>>,
    steps: Mutex<HashMap<String, Record>>,
    services: Mutex<HashMap<String, Record>>,
    step_logs: Mutex<HashMap<i64, Log>>,
    service_logs: Mutex<HashMap<i64, Log>>,
    secrets: HashMap<String, SecretValue>,
    artifacts: Mutex<Vec<Artifact>>,
    test_reports: Mutex<Vec<TestReport>>,
    test_attachments: Mutex<Vec<TestAttachment>>,
    fail_log_uploads: bool,
    reject_files: bool,
}

impl MockClient {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            builds: Mutex::new(Vec::new()),
            steps: Mutex::new(HashMap::new()),
            services: Mutex::new(HashMap::new()),
            step_logs: Mutex::new(HashMap::new()),
            service_logs: Mutex::new(HashMap::new()),
            secrets: HashMap::new(),
            artifacts: Mutex::new(Vec::new()),
            test_reports: Mutex::new(Vec::new()),
            test_attachments: Mutex::new(Vec::new()),
            fail_log_uploads: false,
            reject_files: false,
        }
    }

    /// Serve a secret for `kind`, org, repo-or-team and key
    pub fn with_secret(mut self, kind: &str, org: &str, name: &str, key: &str, value: SecretValue) -> Self {
        self.secrets
            .insert(format!("{}/{}/{}/{}", kind, org, name, key), value);
        self
    }

    pub fn with_failing_log_uploads(mut self) -> Self {
        self.fail_log_uploads = true;
        self
    }

    /// Refuse artifact and test attachment records
    pub fn with_rejected_files(mut self) -> Self {
        self.reject_files = true;
        self
    }

    /// Latest state of the build as uploaded
    pub fn last_build(&self) -> Option<Build> {
        self.builds.lock().last().cloned()
    }

    pub fn step(&self, name: &str) -> Option<Record> {
        self.steps.lock().get(name).cloned()
    }

    pub fn service(&self, name: &str) -> Option<Record> {
        self.services.lock().get(name).cloned()
    }

    pub fn step_log(&self, number: i64) -> Option<Log> {
        self.step_logs.lock().get(&number).cloned()
    }

    pub fn artifacts(&self) -> Vec<Artifact> {
        self.artifacts.lock().clone()
    }

    pub fn test_attachments(&self) -> Vec<TestAttachment> {
        self.test_attachments.lock().clone()
    }

    fn assign_id(&self, id: i64) -> i64 {
        if id != 0 {
            return id;
        }
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl BuildClient for MockClient {
    async fn update_build(&self, _repo: &Repo, build: &Build) -> ClientResult<Build> {
        let mut build = build.clone();
        build.id = self.assign_id(build.id);
        self.builds.lock().push(build.clone());
        Ok(build)
    }

    async fn update_step(&self, _repo: &Repo, _build: &Build, step: &Record) -> ClientResult<Record> {
        let mut step = step.clone();
        step.id = self.assign_id(step.id);
        self.steps.lock().insert(step.name.clone(), step.clone());
        Ok(step)
    }

    async fn update_service(&self, _repo: &Repo, _build: &Build, service: &Record) -> ClientResult<Record> {
        let mut service = service.clone();
        service.id = self.assign_id(service.id);
        self.services.lock().insert(service.name.clone(), service.clone());
        Ok(service)
    }

    async fn get_step_log(&self, _repo: &Repo, build: &Build, number: i64) -> ClientResult<Log> {
        let existing = self.step_logs.lock().get(&number).cloned();
        Ok(existing.unwrap_or_else(|| Log::new(build.id, number)))
    }

    async fn update_step_log(&self, _repo: &Repo, _build: &Build, log: &Log) -> ClientResult<()> {
        if self.fail_log_uploads {
            return Err(ClientError::Unreachable("log upload refused".to_string()));
        }
        self.step_logs.lock().insert(log.number, log.clone());
        Ok(())
    }

    async fn get_service_log(&self, _repo: &Repo, build: &Build, number: i64) -> ClientResult<Log> {
        let existing = self.service_logs.lock().get(&number).cloned();
        Ok(existing.unwrap_or_else(|| Log::new(build.id, number)))
    }

    async fn update_service_log(&self, _repo: &Repo, _build: &Build, log: &Log) -> ClientResult<()> {
        if self.fail_log_uploads {
            return Err(ClientError::Unreachable("log upload refused".to_string()));
        }
        self.service_logs.lock().insert(log.number, log.clone());
        Ok(())
    }

    async fn get_secret(
        &self,
        _engine: &str,
        kind: &str,
        org: &str,
        name: &str,
        key: &str,
    ) -> ClientResult<SecretValue> {
        self.secrets
            .get(&format!("{}/{}/{}/{}", kind, org, name, key))
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("secret {}", key)))
    }

    async fn create_artifact(&self, _repo: &Repo, _build: &Build, artifact: &Artifact) -> ClientResult<Artifact> {
        if self.reject_files {
            return Err(ClientError::Rejected(format!("artifact {}", artifact.file_name)));
        }
        let mut artifact = artifact.clone();
        artifact.id = self.assign_id(artifact.id);
        self.artifacts.lock().push(artifact.clone());
        Ok(artifact)
    }

    async fn create_test_report(&self, _repo: &Repo, _build: &Build, report: &TestReport) -> ClientResult<TestReport> {
        let mut report = report.clone();
        report.id = self.assign_id(report.id);
        self.test_reports.lock().push(report.clone());
        Ok(report)
    }

    async fn create_test_attachment(
        &self,
        _repo: &Repo,
        _build: &Build,
        attachment: &TestAttachment,
    ) -> ClientResult<TestAttachment> {
        if self.reject_files {
            return Err(ClientError::Rejected(format!("attachment {}", attachment.file_name)));
        }
        let mut attachment = attachment.clone();
        attachment.id = self.assign_id(attachment.id);
        self.test_attachments.lock().push(attachment.clone());
        Ok(attachment)
    }
}

pub fn test_build() -> Build {
    Build {
        id: 1,
        number: 1,
        event: "push".to_string(),
        branch: "main".to_string(),
        commit: "48afb5bdc41ad69bf22588491333f7cf71135163".to_string(),
        ..Default::default()
    }
}

pub fn test_repo() -> Repo {
    Repo {
        id: 1,
        org: "octocat".to_string(),
        name: "hello".to_string(),
        branch: "main".to_string(),
        ..Default::default()
    }
}

/// Executor for a YAML pipeline with default configuration
pub fn executor_with(yaml: &str, runtime: Arc<MockRuntime>, client: Arc<MockClient>) -> Arc<Executor> {
    executor_with_config(yaml, runtime, client, ExecutorConfig::default())
}

pub fn executor_with_config(
    yaml: &str,
    runtime: Arc<MockRuntime>,
    client: Arc<MockClient>,
    config: ExecutorConfig,
) -> Arc<Executor> {
    Executor::builder()
        .with_build(test_build())
        .with_repo(test_repo())
        .with_pipeline(Pipeline::from_yaml(yaml).unwrap())
        .with_runtime(runtime)
        .with_client(client)
        .with_config(config.with_flush_interval(Duration::from_millis(50)))
        .build()
        .unwrap()
}

// Build Controller
// Top-level state machine driving every container of a pipeline

use crate::error::{ExecutorError, ExecutorResult};
use crate::executor::{escape_newline_secrets, Executor, Role};
use crate::pipeline::{privileged_images, Container, SecretPull};
use crate::records::{now, Build, Record, SecretValue, Status};
use crate::registry::Registry;
use crate::task::{with_timeout, TaskGroup};

use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Secret metadata safe to print into the init log
#[derive(Serialize)]
struct SanitizedSecret<'a> {
    name: &'a str,
    org: &'a str,
    repo: &'a str,
    team: &'a str,
    value: &'static str,
    images: &'a [String],
    events: &'a [String],
    allow_command: bool,
}

impl<'a> From<&'a SecretValue> for SanitizedSecret<'a> {
    fn from(secret: &'a SecretValue) -> Self {
        Self {
            name: &secret.name,
            org: &secret.org,
            repo: &secret.repo,
            team: &secret.team,
            value: "[secure]",
            images: &secret.images,
            events: &secret.events,
            allow_command: secret.allow_command,
        }
    }
}

impl Executor {
    /// Mark the build running, set up build-level resources and prepare the
    /// init step.
    pub async fn create_build(&self, token: &CancellationToken) -> ExecutorResult<()> {
        let result = self.create_build_inner(token).await;
        if let Err(err) = &result {
            self.snapshot_build(err).await;
        }
        result
    }

    async fn create_build_inner(&self, token: &CancellationToken) -> ExecutorResult<()> {
        ensure_active(token)?;

        {
            let mut build = self.build.lock();
            build.status = Status::Running;
            build.started = now();
            build.host = self.config.hostname.clone();
            build.runtime = self.runtime.driver().to_string();
            build.distribution = self.config.distribution.clone();
        }
        info!(build = self.build().number, repo = %self.repo.full_name(), "creating build");

        self.upload_build().await?;

        self.runtime
            .setup_build(&self.pipeline)
            .await
            .map_err(|e| ExecutorError::from(e).context("unable to setup build"))?;

        let init = self
            .pipeline
            .init_container()
            .cloned()
            .ok_or_else(|| ExecutorError::setup("no init step found in pipeline"))?;
        *self.init.lock() = Some(init.clone());

        self.create_container(Role::Step, &init).await?;
        self.plan_container(Role::Step, &init).await
    }

    /// Create the build network and volume and pull build-start secrets.
    ///
    /// Diagnostics go into the init log, which is uploaded whatever happens.
    pub async fn plan_build(&self, token: &CancellationToken) -> ExecutorResult<()> {
        let result = self.plan_build_inner(token).await;
        if let Err(err) = &result {
            self.append_init_log(format!("error: {}\n", err).as_bytes());
            self.finish_init(false).await;
            self.snapshot_build(err).await;
        }
        self.upload_init_log().await;
        result
    }

    async fn plan_build_inner(&self, token: &CancellationToken) -> ExecutorResult<()> {
        ensure_active(token)?;
        info!(build = self.build().number, "planning build");

        self.runtime
            .create_network(&self.pipeline)
            .await
            .map_err(|e| ExecutorError::from(e).context("unable to create network"))?;

        self.append_init_log(b"> Inspecting runtime network...\n");
        let network = self
            .runtime
            .inspect_network(&self.pipeline)
            .await
            .map_err(|e| ExecutorError::from(e).context("unable to inspect network"))?;
        self.append_init_log(&network);

        self.runtime
            .create_volume(&self.pipeline)
            .await
            .map_err(|e| ExecutorError::from(e).context("unable to create volume"))?;

        self.append_init_log(b"> Inspecting runtime volume...\n");
        let volume = self
            .runtime
            .inspect_volume(&self.pipeline)
            .await
            .map_err(|e| ExecutorError::from(e).context("unable to inspect volume"))?;
        self.append_init_log(&volume);

        let pulled: Vec<_> = self
            .pipeline
            .secrets
            .iter()
            .filter(|secret| !secret.is_plugin() && secret.pull == SecretPull::BuildStart)
            .collect();

        for secret in pulled {
            ensure_active(token)?;

            info!(secret = %secret.name, engine = %secret.engine, kind = %secret.kind, "pulling secret");
            self.append_init_log(
                format!(
                    "> Pulling {} {} secret {}...\n",
                    secret.engine, secret.kind, secret.name
                )
                .as_bytes(),
            );

            let value = self
                .pull_secret(secret)
                .await
                .map_err(|e| e.context("unable to pull secrets"))?;

            let sanitized = serde_json::to_string_pretty(&SanitizedSecret::from(&value))
                .map_err(|e| ExecutorError::setup(format!("unable to render secret: {}", e)))?;
            self.append_init_log(format!("{}\n", sanitized).as_bytes());

            self.secrets.lock().insert(secret.name.clone(), value);
        }

        escape_newline_secrets(&mut self.secrets.lock());
        Ok(())
    }

    /// Create every service, step and secret origin, verify their images and
    /// have the runtime assemble the build.
    ///
    /// The init step is finalized here: success when assembly succeeds,
    /// failure otherwise, with the error text appended to its log.
    pub async fn assemble_build(&self, token: &CancellationToken) -> ExecutorResult<()> {
        let result = self.assemble_build_inner(token).await;
        if let Err(err) = &result {
            self.append_init_log(format!("error: {}\n", err).as_bytes());
        }
        self.upload_init_log().await;
        self.finish_init(result.is_ok()).await;
        if let Err(err) = &result {
            self.snapshot_build(err).await;
        }
        result
    }

    async fn assemble_build_inner(&self, token: &CancellationToken) -> ExecutorResult<()> {
        ensure_active(token)?;
        info!(build = self.build().number, "assembling build");

        for service in &self.pipeline.services {
            self.create_container(Role::Service, service).await?;
            self.verify_image("service", service).await?;
        }

        for stage in self.pipeline.runnable_stages() {
            for step in &stage.steps {
                ensure_active(token)?;
                self.create_container(Role::Step, step).await?;
                self.verify_image("step", step).await?;
            }
        }

        for step in self.pipeline.steps.iter().filter(|s| !s.is_init()) {
            ensure_active(token)?;
            self.create_container(Role::Step, step).await?;
            self.verify_image("step", step).await?;
        }

        for origin in self.pipeline.secrets.iter().filter_map(|s| s.origin.as_ref()) {
            self.create_container(Role::Secret, origin).await?;
            self.verify_image("secret", origin).await?;
        }

        if self.config.enforce_trusted_repos {
            let images = self.pipeline.images();
            let privileged = privileged_images(&images, &self.config.privileged_images);

            if !privileged.is_empty() && !self.repo.trusted {
                return Err(ExecutorError::UntrustedImages {
                    images: privileged.join(", "),
                    repo: self.repo.full_name(),
                });
            }
        }

        self.runtime
            .assemble_build(&self.pipeline)
            .await
            .map_err(|e| ExecutorError::from(e).context("unable to assemble build"))?;

        self.append_init_log(b"> Inspecting runtime build...\n");
        let inspected = self
            .runtime
            .inspect_build(&self.pipeline)
            .await
            .map_err(|e| ExecutorError::from(e).context("unable to inspect build"))?;
        self.append_init_log(&inspected);

        Ok(())
    }

    async fn verify_image(&self, kind: &str, ctn: &Container) -> ExecutorResult<()> {
        self.append_init_log(format!("> Preparing {} image {}...\n", kind, ctn.image).as_bytes());

        let image = self
            .runtime
            .inspect_image(&self.prepared(ctn))
            .await
            .map_err(|e| {
                ExecutorError::from(e).context(format!("unable to inspect {} {}", kind, ctn.name))
            })?;
        self.append_init_log(&image);
        Ok(())
    }

    /// Settle and persist the init step record
    async fn finish_init(&self, success: bool) {
        let Some(id) = self.init_id() else {
            return;
        };
        let Some(mut record) = self.steps.load(&id) else {
            return;
        };
        if record.finished != 0 {
            return;
        }

        record.status = if success {
            Status::Success
        } else {
            Status::Failure
        };
        record.finished = now();

        match self.persist_record(Role::Step, &record).await {
            Ok(persisted) => self.steps.store(id, persisted),
            Err(err) => {
                error!(step = %record.name, error = %err, "unable to upload init state");
                self.steps.store(id, record);
            }
        }
    }

    /// Run secret plugins, services, top-level steps and then every stage.
    ///
    /// Whatever the outcome, stream intake is closed and the final build
    /// record is persisted.
    pub async fn exec_build(self: &Arc<Self>, token: &CancellationToken) -> ExecutorResult<()> {
        let result = self.exec_build_inner(token).await;

        self.close_stream_intake();

        if let Err(err) = &result {
            error!(build = self.build().number, error = %err, "build execution failed");
            self.snapshot_build(err).await;
            return result;
        }

        {
            let mut build = self.build.lock();
            if build.status == Status::Running {
                build.status = Status::Success;
            }
            build.finished = now();
        }
        info!(build = self.build().number, status = %self.status(), "build finished");

        if let Err(err) = self.upload_build().await {
            error!(build = self.build().number, error = %err, "unable to upload final build state");
        }

        result
    }

    async fn exec_build_inner(self: &Arc<Self>, token: &CancellationToken) -> ExecutorResult<()> {
        ensure_active(token)?;

        self.exec_secrets(token)
            .await
            .map_err(|e| e.context("unable to execute secret"))?;

        for service in &self.pipeline.services {
            self.plan_container(Role::Service, service).await?;
            self.exec_container(Role::Service, token, service).await?;
        }

        for step in self.pipeline.steps.iter().filter(|s| !s.is_init()) {
            ensure_active(token)?;

            if !step.ruleset.execute(&self.rule_data(self.status())) {
                debug!(step = %step.name, "skipping step");
                self.skip_step(step);
                continue;
            }

            self.plan_container(Role::Step, step).await?;
            self.load_lazy_secrets(step).await?;

            let exit_code = self.exec_container(Role::Step, token, step).await?;
            if exit_code != 0 && !step.ruleset.continue_on_failure {
                self.set_status(Status::Failure);
            }
        }

        let mut stages = TaskGroup::new(token);
        let stage_token = stages.token();

        let runnable: Vec<_> = self.pipeline.runnable_stages().cloned().collect();
        let completions: Vec<_> = runnable
            .iter()
            .map(|stage| self.stage_signals.register(&stage.name))
            .collect();

        for (stage, completion) in runnable.into_iter().zip(completions) {
            let exec = Arc::clone(self);
            let token = stage_token.clone();

            stages.spawn(async move {
                let result = match exec.plan_stage(&token, &stage).await {
                    Ok(()) => exec.exec_stage(&token, &stage).await,
                    Err(err) => Err(err),
                };
                completion.complete(&result);

                result.map_err(|e| e.context(format!("unable to execute stage {}", stage.name)))
            });
        }

        stages.wait().await
    }

    /// Tear down every container and the build-level resources.
    ///
    /// Failures are logged and teardown continues with the next resource.
    pub async fn destroy_build(&self) -> ExecutorResult<()> {
        info!(build = self.build().number, "destroying build");

        for step in self.pipeline.steps.iter().filter(|s| !s.is_init()) {
            if let Err(err) = self.destroy_container(Role::Step, step).await {
                error!(step = %step.name, error = %err, "unable to destroy step");
            }
        }

        for stage in self.pipeline.runnable_stages() {
            for step in &stage.steps {
                if let Err(err) = self.destroy_container(Role::Step, step).await {
                    error!(stage = %stage.name, step = %step.name, error = %err, "unable to destroy step");
                }
            }
        }

        for service in &self.pipeline.services {
            if let Err(err) = self.destroy_container(Role::Service, service).await {
                error!(service = %service.name, error = %err, "unable to destroy service");
            }
        }

        for origin in self.pipeline.secrets.iter().filter_map(|s| s.origin.as_ref()) {
            if let Err(err) = self.destroy_container(Role::Secret, origin).await {
                error!(secret = %origin.name, error = %err, "unable to destroy secret");
            }
        }

        if let Err(err) = self.runtime.remove_volume(&self.pipeline).await {
            error!(error = %err, "unable to remove volume");
        }

        if let Err(err) = self.runtime.remove_network(&self.pipeline).await {
            error!(error = %err, "unable to remove network");
        }

        if let Err(err) = self.runtime.remove_build(&self.pipeline).await {
            error!(error = %err, "unable to remove build");
        }

        Ok(())
    }

    /// Cancel the build: every container not already finished is marked
    /// canceled, then the build is torn down.
    ///
    /// Running containers are not stopped cooperatively; teardown removes them.
    pub async fn cancel_build(&self) -> ExecutorResult<Build> {
        warn!(build = self.build().number, "canceling build");

        self.set_status(Status::Canceled);

        for service in &self.pipeline.services {
            self.cancel_container(&self.services, service);
        }

        for step in &self.pipeline.steps {
            self.cancel_container(&self.steps, step);
        }

        for stage in &self.pipeline.stages {
            for step in &stage.steps {
                self.cancel_container(&self.steps, step);
            }
        }

        if let Err(err) = self.upload_build().await {
            error!(build = self.build().number, error = %err, "unable to upload canceled build");
        }

        self.destroy_build().await?;
        Ok(self.build())
    }

    fn cancel_container(&self, records: &Registry<Record>, ctn: &Container) {
        let mut record = records
            .load(&ctn.id)
            .unwrap_or_else(|| Record::from_container(&self.build(), &self.prepared(ctn)));

        if !record.status.is_terminal() {
            record.status = Status::Canceled;
        }
        records.store(ctn.id.clone(), record);
    }

    /// Drive the build end to end, returning its final state.
    ///
    /// Create, Plan, Assemble and Exec are bounded by the build timeout.
    /// Streaming runs under `token` alone, concurrently with teardown: the
    /// output of services and detached steps only ends once Destroy removes
    /// their containers, so the coordinator is awaited after Destroy.
    pub async fn run(self: &Arc<Self>, token: CancellationToken) -> ExecutorResult<Build> {
        let timeout = with_timeout(&token, self.config.build_timeout_for(&self.repo));

        let streamer = {
            let exec = Arc::clone(self);
            let token = token.clone();
            tokio::spawn(async move { exec.stream_build(token).await })
        };

        let result = self.run_phases(&timeout).await;
        if let Err(err) = &result {
            error!(build = self.build().number, error = %err, "build failed");
            self.close_stream_intake();
        }

        if let Err(err) = self.destroy_build().await {
            error!(error = %err, "unable to destroy build");
        }

        match streamer.await {
            Ok(Err(err)) => error!(error = %err, "unable to stream build"),
            Err(err) => error!(error = %err, "stream coordinator panicked"),
            Ok(Ok(())) => {}
        }
        timeout.cancel();

        Ok(self.build())
    }

    async fn run_phases(self: &Arc<Self>, timeout: &CancellationToken) -> ExecutorResult<()> {
        self.create_build(timeout).await?;
        self.plan_build(timeout).await?;
        self.assemble_build(timeout).await?;
        self.exec_build(timeout).await
    }
}

fn ensure_active(token: &CancellationToken) -> ExecutorResult<()> {
    if token.is_cancelled() {
        return Err(ExecutorError::Canceled);
    }
    Ok(())
}

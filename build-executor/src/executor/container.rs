// Container Lifecycle
// Create, Plan, Exec, Stream and Destroy for steps, services and secret origins

use crate::client::ClientResult;
use crate::environment;
use crate::error::{ExecutorError, ExecutorResult};
use crate::executor::secrets::inject_secrets;
use crate::executor::Executor;
use crate::pipeline::Container;
use crate::records::{now, Log, Record, Status, KILLED_EXIT_CODE};
use crate::registry::Registry;

use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a container backs within the build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Step,
    Service,
    /// Origin container of a plugin-backed secret
    Secret,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Step => "step",
            Role::Service => "service",
            Role::Secret => "secret",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settle a record's final status before it is uploaded.
///
/// Records already settled keep their status, so finalizing twice changes
/// nothing. A record still pending never reported completion and is
/// considered killed. Anything else succeeded unless the container exited
/// non-zero before a finish time was recorded.
pub fn finalize_record(record: &mut Record, exit_code: i32) {
    match record.status {
        Status::Canceled
        | Status::Error
        | Status::Failure
        | Status::Skipped
        | Status::Killed
        | Status::Success => {}
        Status::Pending => {
            record.exit_code = KILLED_EXIT_CODE;
            record.finished = now();
            record.status = Status::Killed;
            if record.started == 0 {
                record.started = record.finished;
            }
        }
        _ => record.status = Status::Success,
    }

    if record.finished == 0 {
        record.finished = now();

        // a canceled container stays canceled whatever it exited with
        if exit_code != 0 && record.status != Status::Canceled {
            record.exit_code = exit_code;
            record.status = Status::Failure;
        }
    }
}

impl Executor {
    fn records(&self, role: Role) -> &Registry<Record> {
        match role {
            Role::Service => &self.services,
            Role::Step | Role::Secret => &self.steps,
        }
    }

    pub(crate) async fn persist_record(&self, role: Role, record: &Record) -> ClientResult<Record> {
        let build = self.build();
        match role {
            Role::Service => self.client.update_service(&self.repo, &build, record).await,
            Role::Step | Role::Secret => self.client.update_step(&self.repo, &build, record).await,
        }
    }

    async fn fetch_log(&self, role: Role, number: i64) -> ClientResult<Log> {
        let build = self.build();
        match role {
            Role::Service => self.client.get_service_log(&self.repo, &build, number).await,
            Role::Step | Role::Secret => self.client.get_step_log(&self.repo, &build, number).await,
        }
    }

    pub(crate) async fn persist_log(&self, role: Role, log: &Log) -> ClientResult<()> {
        let build = self.build();
        match role {
            Role::Service => self.client.update_service_log(&self.repo, &build, log).await,
            Role::Step | Role::Secret => self.client.update_step_log(&self.repo, &build, log).await,
        }
    }

    /// Prepare a container for the runtime and store the result for later phases
    pub(crate) async fn create_container(&self, role: Role, ctn: &Container) -> ExecutorResult<()> {
        debug!(role = %role, container = %ctn.id, "creating container");

        let fail = |e: ExecutorError| e.context(format!("unable to create {} {}", role, ctn.name));

        ctn.validate().map_err(fail)?;

        let mut prepared = ctn.clone();
        self.runtime
            .setup_container(&mut prepared)
            .await
            .map_err(|e| fail(e.into()))?;

        let build = self.build();
        match role {
            Role::Step | Role::Service => {
                let record = Record::from_container(&build, &prepared);
                environment::merge(&mut prepared, &build, &self.repo, &record, &self.config);

                let secrets = self.secrets.lock().clone();
                inject_secrets(&mut prepared, &secrets);
            }
            Role::Secret => {
                prepared
                    .environment
                    .extend(environment::build_environment(&build, &self.repo, &self.config));
            }
        }
        prepared.substitute();

        self.containers.store(prepared.id.clone(), prepared);
        Ok(())
    }

    /// Persist the running record, open its log and register both by container id
    pub(crate) async fn plan_container(&self, role: Role, ctn: &Container) -> ExecutorResult<()> {
        debug!(role = %role, container = %ctn.id, "planning container");

        let fail = |e: ExecutorError| e.context(format!("unable to plan {} {}", role, ctn.name));

        let mut prepared = self.prepared(ctn);
        let build = self.build();

        let mut record = Record::from_container(&build, &prepared);
        record.status = Status::Running;
        record.started = now();

        let record = self
            .persist_record(role, &record)
            .await
            .map_err(|e| fail(e.into()))?;

        // the server may assign the number only now
        environment::merge(&mut prepared, &build, &self.repo, &record, &self.config);

        let log = self
            .fetch_log(role, record.number)
            .await
            .map_err(|e| fail(e.into()))?;

        self.records(role).store(prepared.id.clone(), record);
        self.logs.store(prepared.id.clone(), log);
        self.containers.store(prepared.id.clone(), prepared);
        Ok(())
    }

    /// Start a container, register its stream and wait for it unless detached.
    ///
    /// Returns the exit code reported by the runtime, 0 for containers that
    /// are not awaited.
    pub(crate) async fn exec_container(
        self: &Arc<Self>,
        role: Role,
        token: &CancellationToken,
        ctn: &Container,
    ) -> ExecutorResult<i32> {
        let mut prepared = self.prepared(ctn);
        let records = self.records(role);

        info!(role = %role, container = %prepared.id, "executing container");

        if let Err(err) = self.runtime.run_container(&prepared, &self.pipeline).await {
            let err = ExecutorError::from(err);
            if role != Role::Secret {
                records.update(&prepared.id, |record| {
                    record.status = Status::Error;
                    record.error = err.to_string();
                    record.finished = now();
                });
            }
            return Err(err.context(format!("unable to run {} {}", role, prepared.name)));
        }

        self.request_stream(role, prepared.clone());

        if role == Role::Service || prepared.detach {
            return Ok(0);
        }

        tokio::select! {
            result = self.runtime.wait_container(&prepared) => {
                result.map_err(|e| {
                    ExecutorError::from(e).context(format!("unable to wait for {} {}", role, prepared.name))
                })?;
            }
            _ = token.cancelled() => {
                return Err(ExecutorError::Canceled
                    .context(format!("unable to wait for {} {}", role, prepared.name)));
            }
        }

        self.runtime
            .inspect_container(&mut prepared)
            .await
            .map_err(|e| {
                ExecutorError::from(e).context(format!("unable to inspect {} {}", role, prepared.name))
            })?;

        let exit_code = prepared.exit_code;
        records.update(&prepared.id, |record| record.exit_code = exit_code);
        self.containers.store(prepared.id.clone(), prepared);

        Ok(exit_code)
    }

    /// Tail a container into its log; secret origins write into the init log
    pub(crate) async fn stream_container(
        &self,
        role: Role,
        ctn: &Container,
        token: CancellationToken,
    ) -> ExecutorResult<()> {
        let (log_role, log_id) = match role {
            Role::Secret => match self.init_id() {
                Some(id) => (Role::Step, id),
                None => return Err(ExecutorError::setup("no init step to stream secret output into")),
            },
            _ => (role, ctn.id.clone()),
        };

        self.stream_logs(log_role, ctn, &log_id, token)
            .await
            .map_err(|e| e.context(format!("unable to stream {} {}", role, ctn.name)))
    }

    /// Best-effort teardown of one container; the final record is always uploaded
    pub(crate) async fn destroy_container(&self, role: Role, ctn: &Container) -> ExecutorResult<()> {
        debug!(role = %role, container = %ctn.id, "destroying container");

        let mut current = self.prepared(ctn);

        if let Err(err) = self.runtime.inspect_container(&mut current).await {
            warn!(role = %role, container = %ctn.id, error = %err, "unable to inspect container");
        }

        let removed = self.runtime.remove_container(&current).await.map_err(|e| {
            ExecutorError::from(e).context(format!("unable to remove {} {}", role, ctn.name))
        });

        if role != Role::Secret {
            self.upload_container(role, &current).await?;
        }

        removed
    }

    /// Finalize the container's record and persist it
    pub(crate) async fn upload_container(&self, role: Role, ctn: &Container) -> ExecutorResult<()> {
        let records = self.records(role);
        let mut record = records
            .load(&ctn.id)
            .unwrap_or_else(|| Record::from_container(&self.build(), ctn));

        let exit_code = if ctn.exit_code != 0 {
            ctn.exit_code
        } else {
            record.exit_code
        };
        finalize_record(&mut record, exit_code);

        let persisted = self.persist_record(role, &record).await.map_err(|e| {
            ExecutorError::from(e).context(format!("unable to upload {} {} state", role, ctn.name))
        });

        records.store(ctn.id.clone(), persisted.as_ref().cloned().unwrap_or(record));
        persisted.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: Status) -> Record {
        Record {
            status,
            ..Default::default()
        }
    }

    #[test]
    fn test_finalize_success_on_zero_exit() {
        let mut rec = record(Status::Running);
        rec.started = 10;
        finalize_record(&mut rec, 0);

        assert_eq!(rec.status, Status::Success);
        assert_eq!(rec.exit_code, 0);
        assert!(rec.finished > 0);
    }

    #[test]
    fn test_finalize_failure_on_non_zero_exit() {
        let mut rec = record(Status::Running);
        finalize_record(&mut rec, 2);

        assert_eq!(rec.status, Status::Failure);
        assert_eq!(rec.exit_code, 2);
    }

    #[test]
    fn test_finalize_pending_is_killed() {
        let mut rec = record(Status::Pending);
        finalize_record(&mut rec, 0);

        assert_eq!(rec.status, Status::Killed);
        assert_eq!(rec.exit_code, KILLED_EXIT_CODE);
        assert_eq!(rec.started, rec.finished);
    }

    #[test]
    fn test_finalize_keeps_terminal_failures() {
        for status in [Status::Canceled, Status::Error, Status::Failure, Status::Skipped] {
            let mut rec = record(status);
            rec.finished = 5;
            finalize_record(&mut rec, 0);
            assert_eq!(rec.status, status);
            assert_eq!(rec.finished, 5);
        }
    }

    #[test]
    fn test_finalize_twice_keeps_killed() {
        let mut rec = record(Status::Pending);
        finalize_record(&mut rec, 0);
        let settled = rec.clone();

        finalize_record(&mut rec, 0);
        assert_eq!(rec, settled);
        assert_eq!(rec.status, Status::Killed);
    }

    #[test]
    fn test_finalize_never_upgrades_canceled() {
        let mut rec = record(Status::Canceled);
        finalize_record(&mut rec, 1);

        assert_eq!(rec.status, Status::Canceled);
        assert!(rec.finished > 0);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Step.to_string(), "step");
        assert_eq!(Role::Secret.as_str(), "secret");
    }
}

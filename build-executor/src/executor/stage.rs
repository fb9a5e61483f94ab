// Stage Scheduler
// Dependency waits and sequential step execution for pipeline stages

use crate::error::{ExecutorError, ExecutorResult};
use crate::executor::{Executor, Role};
use crate::pipeline::{Container, Stage};
use crate::records::{now, Record, Status};

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Final outcome a stage publishes to the stages that need it
pub type StageOutcome = Result<(), String>;

/// Completion signals keyed by stage name.
///
/// Each signal is resolved once by the task owning the stage. Any number of
/// dependents may wait on it; a signal dropped without an outcome counts as a
/// clean completion.
#[derive(Debug, Default)]
pub struct StageSignals {
    signals: DashMap<String, watch::Receiver<Option<StageOutcome>>>,
}

/// Write side of a stage's signal; dropping it closes the signal
#[derive(Debug)]
pub struct StageCompletion {
    stage: String,
    tx: watch::Sender<Option<StageOutcome>>,
}

impl StageCompletion {
    /// Publish the stage outcome and close the signal
    pub fn complete(self, outcome: &ExecutorResult<()>) {
        let value = match outcome {
            Ok(()) => Ok(()),
            Err(err) => Err(err.to_string()),
        };
        debug!(stage = %self.stage, "closing stage signal");
        self.tx.send_replace(Some(value));
    }
}

impl StageSignals {
    pub fn new() -> Self {
        Self {
            signals: DashMap::new(),
        }
    }

    /// Track a stage, returning the handle its owner completes
    pub fn register(&self, stage: &str) -> StageCompletion {
        let (tx, rx) = watch::channel(None);
        self.signals.insert(stage.to_string(), rx);
        StageCompletion {
            stage: stage.to_string(),
            tx,
        }
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.signals.contains_key(stage)
    }

    /// Wait for a stage to finish; `None` when the stage is not tracked
    pub async fn wait(&self, stage: &str) -> Option<StageOutcome> {
        let mut rx = self.signals.get(stage).map(|entry| entry.value().clone())?;

        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(outcome) = current {
                return Some(outcome);
            }

            if rx.changed().await.is_err() {
                let last = rx.borrow().clone();
                return Some(last.unwrap_or(Ok(())));
            }
        }
    }
}

impl Executor {
    /// Wait until every stage this stage needs has finished.
    ///
    /// Untracked stages are not waited on. A dependency that finished with an
    /// error fails this stage too.
    pub(crate) async fn plan_stage(
        &self,
        token: &CancellationToken,
        stage: &Stage,
    ) -> ExecutorResult<()> {
        debug!(stage = %stage.name, "planning stage");

        for needs in &stage.needs {
            if !self.stage_signals.contains(needs) {
                continue;
            }

            debug!(stage = %stage.name, needs = %needs, "waiting for dependency");

            let outcome = tokio::select! {
                outcome = self.stage_signals.wait(needs) => outcome,
                _ = token.cancelled() => {
                    return Err(ExecutorError::Canceled
                        .context(format!("stage {} stopped waiting for {}", stage.name, needs)));
                }
            };

            if let Some(Err(message)) = outcome {
                error!(stage = %stage.name, needs = %needs, error = %message, "dependency returned error");
                return Err(ExecutorError::Dependency {
                    stage: needs.clone(),
                    message,
                });
            }
        }

        Ok(())
    }

    /// Run a stage's steps in order.
    ///
    /// Steps are evaluated against the build status, or against the stage's
    /// own status when the stage is independent. A step failing without
    /// `continue` fails both the stage and the build.
    pub(crate) async fn exec_stage(
        self: &Arc<Self>,
        token: &CancellationToken,
        stage: &Stage,
    ) -> ExecutorResult<()> {
        info!(stage = %stage.name, "executing stage");

        let mut stage_status = Status::Running;

        for step in &stage.steps {
            let status = if stage.independent {
                stage_status
            } else {
                self.status()
            };

            if !step.ruleset.execute(&self.rule_data(status)) {
                debug!(stage = %stage.name, step = %step.name, %status, "skipping step");
                self.skip_step(step);
                continue;
            }

            self.plan_container(Role::Step, step).await?;
            self.load_lazy_secrets(step).await?;

            let exit_code = self.exec_container(Role::Step, token, step).await?;
            if exit_code != 0 && !step.ruleset.continue_on_failure {
                stage_status = Status::Failure;
                self.set_status(Status::Failure);
            }
        }

        Ok(())
    }

    /// Record a step the rules or the stop condition kept from running
    pub(crate) fn skip_step(&self, step: &Container) {
        let mut record = self
            .steps
            .load(&step.id)
            .unwrap_or_else(|| Record::from_container(&self.build(), &self.prepared(step)));

        record.status = Status::Skipped;
        if record.finished == 0 {
            record.finished = now();
        }
        self.steps.store(step.id.clone(), record);
    }
}

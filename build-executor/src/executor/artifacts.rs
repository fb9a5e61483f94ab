// Step Files
// Artifact and test report records, bounded per file and per build

use crate::error::{ExecutorError, ExecutorResult};
use crate::executor::Executor;
use crate::records::{now, Artifact, Record, TestAttachment, TestReport};

use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// A file in object storage that a step wants recorded against the build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFile {
    pub file_name: String,
    pub object_path: String,
    /// Size in bytes
    pub size: u64,
}

impl StepFile {
    pub fn new(file_name: impl Into<String>, object_path: impl Into<String>, size: u64) -> Self {
        Self {
            file_name: file_name.into(),
            object_path: object_path.into(),
            size,
        }
    }
}

impl Executor {
    /// Record a file a step produced as a build artifact.
    ///
    /// The file counts against the per-file and per-build size limits. Its
    /// bytes are given back when the build server refuses the record.
    pub async fn record_artifact(&self, step_id: &str, file: &StepFile) -> ExecutorResult<Artifact> {
        let step = self.planned_step(step_id)?;
        self.reserve_file(file)?;

        let build = self.build();
        let artifact = Artifact {
            id: 0,
            build_id: build.id,
            step_id: step.id,
            file_name: file.file_name.clone(),
            object_path: file.object_path.clone(),
            file_size: file.size,
            created: now(),
        };

        match self.client.create_artifact(&self.repo, &build, &artifact).await {
            Ok(created) => {
                info!(step = %step.name, file = %file.file_name, size = file.size, "recorded artifact");
                Ok(created)
            }
            Err(err) => {
                self.release_file(file.size);
                Err(ExecutorError::from(err)
                    .context(format!("unable to record artifact {}", file.file_name)))
            }
        }
    }

    /// Open a test report for a step that has been planned
    pub async fn create_test_report(&self, step_id: &str) -> ExecutorResult<TestReport> {
        let step = self.planned_step(step_id)?;

        let build = self.build();
        let report = TestReport {
            id: 0,
            build_id: build.id,
            step_id: step.id,
            created: now(),
        };

        debug!(step = %step.name, "creating test report");

        self.client
            .create_test_report(&self.repo, &build, &report)
            .await
            .map_err(|e| {
                ExecutorError::from(e).context(format!("unable to create test report for step {}", step.name))
            })
    }

    /// Attach a file to a test report; limits apply as for artifacts
    pub async fn attach_test_file(
        &self,
        report: &TestReport,
        file: &StepFile,
    ) -> ExecutorResult<TestAttachment> {
        self.reserve_file(file)?;

        let build = self.build();
        let attachment = TestAttachment {
            id: 0,
            test_report_id: report.id,
            file_name: file.file_name.clone(),
            object_path: file.object_path.clone(),
            file_size: file.size,
            created: now(),
        };

        match self
            .client
            .create_test_attachment(&self.repo, &build, &attachment)
            .await
        {
            Ok(created) => {
                debug!(report = report.id, file = %file.file_name, size = file.size, "attached test file");
                Ok(created)
            }
            Err(err) => {
                self.release_file(file.size);
                Err(ExecutorError::from(err)
                    .context(format!("unable to attach test file {}", file.file_name)))
            }
        }
    }

    /// Bytes of artifacts and test attachments recorded so far
    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes.load(Ordering::SeqCst)
    }

    fn planned_step(&self, step_id: &str) -> ExecutorResult<Record> {
        match self.steps.load(step_id) {
            Some(record) if record.id != 0 => Ok(record),
            _ => Err(ExecutorError::setup(format!("step {} has not been planned", step_id))),
        }
    }

    fn reserve_file(&self, file: &StepFile) -> ExecutorResult<()> {
        let limit = self.config.file_size_limit;
        if limit > 0 && file.size > limit {
            warn!(file = %file.file_name, size = file.size, limit, "file exceeds size limit");
            return Err(ExecutorError::FileTooLarge {
                file: file.file_name.clone(),
                size: file.size,
                limit,
            });
        }

        let limit = self.config.build_file_size_limit;
        self.uploaded_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                let total = used.checked_add(file.size)?;
                (limit == 0 || total <= limit).then_some(total)
            })
            .map(|_| ())
            .map_err(|used| {
                warn!(file = %file.file_name, used, limit, "build file size limit reached");
                ExecutorError::BuildFilesTooLarge {
                    file: file.file_name.clone(),
                    total: used.saturating_add(file.size),
                    limit,
                }
            })
    }

    fn release_file(&self, size: u64) {
        // the closure never declines, so the update always applies
        let _ = self
            .uploaded_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(size))
            });
    }
}

// Log Streaming
// Buffers container output and uploads it to the build server periodically

use crate::error::{ExecutorError, ExecutorResult};
use crate::executor::{Executor, Role};
use crate::pipeline::Container;
use crate::records::mask_bytes;
use crate::runtime::LogStream;

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Attempts made to open a container's output before giving up
const TAIL_ATTEMPTS: u32 = 5;

/// Delay before the first tail retry, doubled after each attempt
const TAIL_BACKOFF: Duration = Duration::from_millis(100);

impl Executor {
    /// Tail a container's output into the log registered under `log_id`.
    ///
    /// Output is buffered and flushed every flush interval, with secret values
    /// masked before each upload. Reading stops at end of output, when the log
    /// reaches the configured maximum size, or when `token` is cancelled. A
    /// final flush always runs.
    pub(crate) async fn stream_logs(
        &self,
        role: Role,
        ctn: &Container,
        log_id: &str,
        token: CancellationToken,
    ) -> ExecutorResult<()> {
        let stream = self.tail_with_retry(ctn, &token).await?;
        let mut reader = BufReader::new(stream);

        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        let mut pending: Vec<u8> = Vec::new();
        let mut line: Vec<u8> = Vec::new();

        loop {
            tokio::select! {
                read = reader.read_until(b'\n', &mut line) => match read {
                    Ok(0) => break,
                    Ok(_) => {
                        pending.append(&mut line);

                        if self.log_limit_reached(log_id, pending.len()) {
                            warn!(
                                container = %ctn.id,
                                max = self.config.max_log_size,
                                "log reached maximum size, no more output will be captured"
                            );
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(container = %ctn.id, error = %err, "unable to read container output");
                        break;
                    }
                },
                _ = ticker.tick() => self.flush_log(role, log_id, &mut pending).await,
                _ = token.cancelled() => {
                    debug!(container = %ctn.id, "streaming context canceled");
                    break;
                }
            }
        }

        // keep whatever partial line is left
        pending.append(&mut line);
        self.flush_log(role, log_id, &mut pending).await;

        Ok(())
    }

    async fn tail_with_retry(
        &self,
        ctn: &Container,
        token: &CancellationToken,
    ) -> ExecutorResult<LogStream> {
        let mut delay = TAIL_BACKOFF;
        let mut attempt = 1;

        loop {
            match self.runtime.tail_container(ctn).await {
                Ok(stream) => return Ok(stream),
                Err(err) if attempt < TAIL_ATTEMPTS => {
                    debug!(container = %ctn.id, attempt, error = %err, "container output not available yet");
                }
                Err(err) => {
                    return Err(ExecutorError::from(err)
                        .context(format!("unable to tail container {}", ctn.id)))
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => return Err(ExecutorError::Canceled),
            }

            delay *= 2;
            attempt += 1;
        }
    }

    fn log_limit_reached(&self, log_id: &str, pending: usize) -> bool {
        self.log_room(log_id).is_some_and(|room| pending >= room)
    }

    /// Bytes the log may still take; `None` when size is unlimited
    fn log_room(&self, log_id: &str) -> Option<usize> {
        let max = self.config.max_log_size;
        if max == 0 {
            return None;
        }

        let stored = self.logs.load(log_id).map(|log| log.data.len()).unwrap_or(0);
        Some(max.saturating_sub(stored))
    }

    /// Append buffered output to the log and upload it; failures are logged only.
    ///
    /// Output past the maximum log size is dropped.
    pub(crate) async fn flush_log(&self, role: Role, log_id: &str, pending: &mut Vec<u8>) {
        if pending.is_empty() {
            return;
        }

        let mut data = mask_bytes(pending, &self.secret_values());
        pending.clear();

        if let Some(room) = self.log_room(log_id) {
            data.truncate(room);
            if data.is_empty() {
                return;
            }
        }

        if !self.logs.update(log_id, |log| log.append_data(&data)) {
            warn!(container = %log_id, "no log registered for container");
            return;
        }

        self.upload_log(role, log_id).await;
    }

    /// Upload the stored log for a container; failures are logged only
    pub(crate) async fn upload_log(&self, role: Role, log_id: &str) {
        let Some(log) = self.logs.load(log_id) else {
            return;
        };

        if let Err(err) = self.persist_log(role, &log).await {
            error!(container = %log_id, error = %err, "unable to upload container logs");
        }
    }

    /// Append text to the init step's log without uploading it
    pub(crate) fn append_init_log(&self, data: &[u8]) {
        if let Some(id) = self.init_id() {
            let data = mask_bytes(data, &self.secret_values());
            self.logs.update(&id, |log| log.append_data(&data));
        }
    }

    pub(crate) async fn upload_init_log(&self) {
        if let Some(id) = self.init_id() {
            self.upload_log(Role::Step, &id).await;
        }
    }
}

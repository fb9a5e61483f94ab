// Task Coordination
// Task groups with first-error cancellation and delayed cancel propagation

use crate::error::{ExecutorError, ExecutorResult};

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A set of concurrent tasks sharing one cancellation token.
///
/// The first task to fail records its error and cancels the shared token so
/// siblings observing it can stop early. `wait` joins every task and returns
/// that first error.
pub struct TaskGroup {
    token: CancellationToken,
    tasks: JoinSet<()>,
    first_error: Arc<Mutex<Option<ExecutorError>>>,
}

impl TaskGroup {
    /// Create a group whose token is a child of `parent`
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            tasks: JoinSet::new(),
            first_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Token shared by every task of the group
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ExecutorResult<()>> + Send + 'static,
    {
        let token = self.token.clone();
        let first_error = Arc::clone(&self.first_error);

        self.tasks.spawn(async move {
            if let Err(err) = task.await {
                record_error(&first_error, err);
                token.cancel();
            }
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task, then cancel the group token
    pub async fn wait(mut self) -> ExecutorResult<()> {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(join_err) = joined {
                record_error(
                    &self.first_error,
                    ExecutorError::TaskPanicked(join_err.to_string()),
                );
                self.token.cancel();
            }
        }

        self.token.cancel();

        match self.first_error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn record_error(slot: &Mutex<Option<ExecutorError>>, err: ExecutorError) {
    let mut slot = slot.lock();
    if slot.is_none() {
        *slot = Some(err);
    }
}

/// Derive a token that is cancelled only after `parent` is cancelled and
/// `grace` has elapsed, or as soon as the returned token is cancelled
/// directly by its owner, whichever comes first.
pub fn with_delayed_cancel(
    parent: &CancellationToken,
    grace: Duration,
    name: &'static str,
) -> CancellationToken {
    let child = CancellationToken::new();
    let parent = parent.clone();
    let ctx = child.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = parent.cancelled() => {
                trace!(context = name, ?grace, "parent context done, starting timer");
            }
            _ = ctx.cancelled() => {
                trace!(context = name, "context done before parent context");
                return;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(grace) => {
                trace!(context = name, "timed out propagating cancel");
                ctx.cancel();
            }
            _ = ctx.cancelled() => {
                trace!(context = name, "finished context");
            }
        }
    });

    child
}

/// Derive a token cancelled when `parent` is, or once `timeout` elapses
pub fn with_timeout(parent: &CancellationToken, timeout: Duration) -> CancellationToken {
    let child = parent.child_token();
    let ctx = child.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => ctx.cancel(),
            _ = ctx.cancelled() => {}
        }
    });

    child
}

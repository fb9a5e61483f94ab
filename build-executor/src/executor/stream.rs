// Stream Coordinator
// Single supervisor for every container's log streaming task

use crate::error::{ExecutorError, ExecutorResult};
use crate::executor::{Executor, Role};
use crate::pipeline::Container;
use crate::task::{with_delayed_cancel, TaskGroup};

use futures_util::future::{BoxFuture, FutureExt};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Streaming work handed to the coordinator, run with the streaming token
pub type StreamFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ExecutorResult<()>> + Send>;

/// A container asking for its output to be streamed
pub struct StreamRequest {
    pub role: Role,
    pub container: Container,
    pub stream: StreamFn,
}

impl fmt::Debug for StreamRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRequest")
            .field("role", &self.role)
            .field("container", &self.container.id)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Queue a started container for streaming
    pub(crate) fn request_stream(self: &Arc<Self>, role: Role, ctn: Container) {
        let exec = Arc::clone(self);
        let target = ctn.clone();

        let request = StreamRequest {
            role,
            container: ctn,
            stream: Box::new(move |token| {
                async move { exec.stream_container(role, &target, token).await }.boxed()
            }),
        };

        let sent = match self.stream_tx.lock().as_ref() {
            Some(tx) => tx.send(request).map_err(|e| e.0),
            None => Err(request),
        };

        if let Err(request) = sent {
            warn!(role = %role, container = %request.container.id, "stream intake closed, output will not be captured");
        }
    }

    /// Supervise log streaming for the whole build.
    ///
    /// Each stream request becomes its own task, next to one task for the
    /// runtime's build-level streaming. Intake ends once ExecBuild closes the
    /// request channel or the streaming token is cancelled. Streaming tasks
    /// run under a token that fires only after `token` is cancelled and the
    /// log streaming grace period elapses, so trailing output can drain.
    pub async fn stream_build(self: &Arc<Self>, token: CancellationToken) -> ExecutorResult<()> {
        let Some(mut requests) = self.stream_rx.lock().take() else {
            return Err(ExecutorError::setup("build is already being streamed"));
        };

        let delayed = with_delayed_cancel(&token, self.config.log_streaming_timeout, "streaming");
        let mut streams = TaskGroup::new(&delayed);
        let streaming = streams.token();

        let exec = Arc::clone(self);
        let runtime_token = streaming.clone();
        streams.spawn(async move {
            exec.runtime
                .stream_build(&exec.pipeline, runtime_token)
                .await
                .map_err(|e| ExecutorError::from(e).context("unable to stream build"))
        });

        loop {
            tokio::select! {
                biased;

                _ = streaming.cancelled() => {
                    debug!("streaming context canceled");
                    break;
                }
                request = requests.recv() => {
                    let Some(request) = request else {
                        debug!("stream intake closed");
                        break;
                    };

                    debug!(role = %request.role, container = %request.container.id, "streaming container");

                    let task_token = streaming.clone();
                    streams.spawn(async move {
                        let id = request.container.id.clone();
                        if let Err(err) = (request.stream)(task_token).await {
                            error!(container = %id, error = %err, "unable to stream container");
                        }
                        Ok(())
                    });
                }
            }
        }

        debug!(tasks = streams.len(), "waiting for stream functions to return");
        let result = streams.wait().await;
        delayed.cancel();

        info!("all stream functions have returned");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::{executor_with, MockClient, MockRuntime};

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_request(counter: &Arc<AtomicUsize>, id: &str) -> StreamRequest {
        let counter = Arc::clone(counter);
        StreamRequest {
            role: Role::Step,
            container: Container::new(id, id, "alpine"),
            stream: Box::new(move |_token: CancellationToken| {
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), ExecutorError>(())
                }
                .boxed()
            }),
        }
    }

    #[tokio::test]
    async fn test_runs_requests_until_intake_closes() {
        let exec = executor_with(
            "steps: []",
            Arc::new(MockRuntime::new()),
            Arc::new(MockClient::new()),
        );
        let counter = Arc::new(AtomicUsize::new(0));

        {
            let tx = exec.stream_tx.lock();
            let tx = tx.as_ref().unwrap();
            tx.send(counting_request(&counter, "a")).unwrap();
            tx.send(counting_request(&counter, "b")).unwrap();
        }
        exec.close_stream_intake();

        exec.stream_build(CancellationToken::new()).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stream_errors_are_not_fatal() {
        let exec = executor_with(
            "steps: []",
            Arc::new(MockRuntime::new()),
            Arc::new(MockClient::new()),
        );

        {
            let tx = exec.stream_tx.lock();
            tx.as_ref()
                .unwrap()
                .send(StreamRequest {
                    role: Role::Service,
                    container: Container::new("svc", "svc", "redis"),
                    stream: Box::new(|_token: CancellationToken| {
                        async { Err::<(), _>(ExecutorError::setup("tail failed")) }.boxed()
                    }),
                })
                .unwrap();
        }
        exec.close_stream_intake();

        assert!(exec.stream_build(CancellationToken::new()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drains_within_grace_period() {
        let exec = executor_with(
            "steps: []",
            Arc::new(MockRuntime::new()),
            Arc::new(MockClient::new()),
        );
        let build_token = CancellationToken::new();
        let observed = Arc::new(AtomicUsize::new(0));

        {
            let seen = Arc::clone(&observed);
            let tx = exec.stream_tx.lock();
            tx.as_ref()
                .unwrap()
                .send(StreamRequest {
                    role: Role::Step,
                    container: Container::new("slow", "slow", "alpine"),
                    stream: Box::new(move |token: CancellationToken| {
                        async move {
                            token.cancelled().await;
                            seen.fetch_add(1, Ordering::SeqCst);
                            Ok::<(), ExecutorError>(())
                        }
                        .boxed()
                    }),
                })
                .unwrap();
        }

        let coordinator = {
            let exec = Arc::clone(&exec);
            let token = build_token.clone();
            tokio::spawn(async move { exec.stream_build(token).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        build_token.cancel();

        // the stream keeps running through the grace period
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(observed.load(Ordering::SeqCst), 0);

        tokio::time::sleep(exec.config.log_streaming_timeout).await;
        coordinator.await.unwrap().unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_requests_after_close_are_dropped() {
        let exec = executor_with(
            "steps: []",
            Arc::new(MockRuntime::new()),
            Arc::new(MockClient::new()),
        );
        exec.close_stream_intake();
        exec.request_stream(Role::Step, Container::new("late", "late", "alpine"));

        exec.stream_build(CancellationToken::new()).await.unwrap();
        assert!(exec.stream_build(CancellationToken::new()).await.is_err());
    }
}

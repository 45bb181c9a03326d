//! The pull-model poll queue.
//!
//! Poll requests resolve to `(topic_id, parsed_address)` tasks pushed onto
//! a bounded queue. A worker drains it, serially or with limited
//! parallelism depending on the handler's declared capability, guarding
//! every `poll()` call with a hard timeout so a hung southbound read can
//! never wedge the queue.

use crate::driver::Outbound;
use crate::handler::{Handler, PollConcurrency};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, Semaphore},
    time::{timeout, Duration},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-task deadline for one southbound read.
pub(crate) const POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Queue depth. Overflow means we are polling faster than the device can
/// answer; tasks are dropped with an error rather than queued without
/// bound.
pub(crate) const QUEUE_MAX: usize = 20;

#[derive(Debug)]
pub(crate) struct PollTask<A> {
    pub topic_id: String,
    pub address: A,
}

/// Handle for enqueueing poll work; the worker lives until the handler's
/// cancellation token fires.
pub(crate) struct PollQueue<A> {
    tx: mpsc::Sender<PollTask<A>>,
}

impl<A> PollQueue<A> {
    /// Returns false when the queue is full.
    pub fn push(&self, task: PollTask<A>) -> bool {
        self.tx.try_send(task).is_ok()
    }
}

/// Spawn the worker for `handler` and return the queue handle.
pub(crate) fn spawn<H: Handler>(
    handler: Arc<H>,
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
) -> PollQueue<H::Address> {
    let (tx, mut rx) = mpsc::channel::<PollTask<H::Address>>(QUEUE_MAX);
    let concurrency = handler.poll_concurrency();

    tokio::spawn(async move {
        match concurrency {
            PollConcurrency::Serial => loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    task = rx.recv() => {
                        let Some(task) = task else { break };
                        run_task(&handler, &outbound, task).await;
                    }
                }
            },
            PollConcurrency::Parallel { limit } => {
                let semaphore = Arc::new(Semaphore::new(limit.max(1)));
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        task = rx.recv() => {
                            let Some(task) = task else { break };
                            let Ok(permit) =
                                Arc::clone(&semaphore).acquire_owned().await else { break };
                            let handler = Arc::clone(&handler);
                            let outbound = outbound.clone();
                            tokio::spawn(async move {
                                let _permit = permit;
                                run_task(&handler, &outbound, task).await;
                            });
                        }
                    }
                }
            }
        }
        debug!("Poll worker stopped");
    });

    PollQueue { tx }
}

async fn run_task<H: Handler>(
    handler: &Arc<H>,
    outbound: &mpsc::UnboundedSender<Outbound>,
    task: PollTask<H::Address>,
) {
    match timeout(POLL_TIMEOUT, handler.poll(&task.address)).await {
        Ok(Ok(Some(payload))) => {
            let _ = outbound.send(Outbound::Data {
                topic_id: task.topic_id,
                payload,
            });
        }
        Ok(Ok(None)) => debug!(topic_id = %task.topic_id, "Poll returned no data"),
        Ok(Err(e)) => {
            warn!(topic_id = %task.topic_id, error = %e, "Poll failed");
            let _ = outbound.send(Outbound::PollError {
                topic_id: task.topic_id,
                message: e.to_string(),
            });
        }
        Err(_) => {
            warn!(topic_id = %task.topic_id, "Poll abandoned after {POLL_TIMEOUT:?}");
            let _ = outbound.send(Outbound::PollError {
                topic_id: task.topic_id,
                message: format!("poll timed out after {POLL_TIMEOUT:?}"),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverResult;
    use crate::status::ConnectStatus;
    use async_trait::async_trait;
    use bytes::Bytes;

    /// Addresses are behaviors: "hang" never resolves, "fail" errors,
    /// anything else echoes itself after a short delay.
    struct ScriptedHandler {
        concurrency: PollConcurrency,
    }

    #[async_trait]
    impl Handler for ScriptedHandler {
        type Address = String;

        async fn connect(&self) -> ConnectStatus {
            ConnectStatus::Up
        }

        fn parse_address(&self, spec: &str) -> Option<String> {
            Some(spec.to_string())
        }

        fn poll_concurrency(&self) -> PollConcurrency {
            self.concurrency
        }

        async fn poll(&self, addr: &String) -> DriverResult<Option<Bytes>> {
            match addr.as_str() {
                "hang" => {
                    futures_pending().await;
                    unreachable!()
                }
                "fail" => Err(crate::error::DriverError::ExecutionError("boom".into())),
                other => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(Some(Bytes::copy_from_slice(other.as_bytes())))
                }
            }
        }

        async fn close(&self) {}
    }

    async fn futures_pending() {
        std::future::pending::<()>().await
    }

    fn task(id: &str, addr: &str) -> PollTask<String> {
        PollTask {
            topic_id: id.to_string(),
            address: addr.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn serial_queue_survives_a_hung_task() {
        let handler = Arc::new(ScriptedHandler {
            concurrency: PollConcurrency::Serial,
        });
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let queue = spawn(handler, outbound_tx, CancellationToken::new());

        assert!(queue.push(task("t1", "a1")));
        assert!(queue.push(task("t2", "hang")));
        assert!(queue.push(task("t3", "a3")));

        // t1 completes, t2 is abandoned at the timeout, t3 still runs.
        let first = outbound_rx.recv().await.unwrap();
        assert!(matches!(first, Outbound::Data { ref topic_id, .. } if topic_id == "t1"));

        let second = outbound_rx.recv().await.unwrap();
        assert!(matches!(second, Outbound::PollError { ref topic_id, .. } if topic_id == "t2"));

        let third = outbound_rx.recv().await.unwrap();
        assert!(matches!(third, Outbound::Data { ref topic_id, .. } if topic_id == "t3"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_reports_an_error_and_continues() {
        let handler = Arc::new(ScriptedHandler {
            concurrency: PollConcurrency::Serial,
        });
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let queue = spawn(handler, outbound_tx, CancellationToken::new());

        assert!(queue.push(task("t1", "fail")));
        assert!(queue.push(task("t2", "a2")));

        let first = outbound_rx.recv().await.unwrap();
        match first {
            Outbound::PollError { topic_id, message } => {
                assert_eq!(topic_id, "t1");
                assert!(message.contains("boom"));
            }
            other => panic!("expected PollError, got {other:?}"),
        }
        let second = outbound_rx.recv().await.unwrap();
        assert!(matches!(second, Outbound::Data { ref topic_id, .. } if topic_id == "t2"));
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_queue_overlaps_tasks() {
        let handler = Arc::new(ScriptedHandler {
            concurrency: PollConcurrency::Parallel { limit: 4 },
        });
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let queue = spawn(handler, outbound_tx, CancellationToken::new());

        // A hung task must not delay the others in parallel mode.
        assert!(queue.push(task("t1", "hang")));
        for i in 2..=4 {
            assert!(queue.push(task(&format!("t{i}"), "a")));
        }

        let mut data = 0;
        let mut errors = 0;
        for _ in 0..4 {
            match outbound_rx.recv().await.unwrap() {
                Outbound::Data { .. } => data += 1,
                Outbound::PollError { topic_id, .. } => {
                    assert_eq!(topic_id, "t1");
                    errors += 1;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!((data, errors), (3, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn queue_overflow_is_reported_to_the_caller() {
        let handler = Arc::new(ScriptedHandler {
            concurrency: PollConcurrency::Serial,
        });
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let queue = spawn(handler, outbound_tx, CancellationToken::new());

        // One task in flight plus a full queue; the next push must fail.
        let mut accepted = 0;
        for i in 0..(QUEUE_MAX + 2) {
            if queue.push(task(&format!("t{i}"), "hang")) {
                accepted += 1;
            }
        }
        assert!(accepted <= QUEUE_MAX + 1);
        assert!(accepted >= QUEUE_MAX);
    }
}

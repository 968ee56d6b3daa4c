//! Bounded-concurrency consumer of a broker queue with ack/nack, panic
//! isolation and graceful drain, generic over the payload type so the
//! writer's and reader's pools share one implementation instead of each
//! hand-rolling their own ack/concurrency loop.
//!
//! The concurrency/ack-loop shape is grounded in the reference server's
//! `federation::queue::run_worker` (ticker + `CancellationToken` select);
//! the worker-slot-plus-panic-recovery state machine is grounded in the
//! original Go source's `message_consumer.go` (`workers chan struct{}` +
//! `sync.WaitGroup` + `recover()` -> nack-with-requeue). `tokio_util`'s
//! `TaskTracker` plays the role of that wait group.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, warn};

use crate::error::ChatError;

/// One unit of work pulled off the broker. `payload` is already an `Err`
/// when the delivery could not be decoded, so the pool can nack it without
/// requeue (poison-pill discard) before ever calling the processor.
pub struct Delivery<T> {
    pub tag: u64,
    pub payload: Result<T, String>,
}

/// Supplies queue declaration, a lazy sequence of deliveries, and ack/nack.
/// Broker-specific code (AMQP, in tests: in-memory) lives entirely behind
/// this contract.
#[async_trait]
pub trait Source<T>: Send + Sync + 'static {
    async fn declare_queue(&self) -> Result<(), ChatError>;

    /// Starts consuming and returns a channel of deliveries. Closing the
    /// channel signals the source is exhausted/closed.
    async fn events(self: Arc<Self>) -> mpsc::Receiver<Delivery<T>>;

    async fn ack(&self, tag: u64) -> Result<(), ChatError>;

    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), ChatError>;
}

#[async_trait]
pub trait Processor<T>: Send + Sync + 'static {
    async fn process(&self, item: &T) -> Result<(), ChatError>;
}

/// At most `concurrency` `Process` invocations run at once; slot release
/// happens in a guaranteed-run epilogue on every exit path via RAII
/// (`OwnedSemaphorePermit` dropped at the end of `handle_one`).
pub struct WorkerPool<T, S, P> {
    source: Arc<S>,
    processor: Arc<P>,
    concurrency: usize,
    tracker: TaskTracker,
    _payload: PhantomData<fn() -> T>,
}

impl<T, S, P> WorkerPool<T, S, P>
where
    T: Send + 'static,
    S: Source<T>,
    P: Processor<T>,
{
    pub fn new(source: S, processor: P, concurrency: usize) -> Self {
        Self {
            source: Arc::new(source),
            processor: Arc::new(processor),
            concurrency,
            tracker: TaskTracker::new(),
            _payload: PhantomData,
        }
    }

    /// Runs until `shutdown` is cancelled or the source closes, then waits
    /// for all in-flight workers before returning — start and graceful stop
    /// folded into one call. Unacked in-flight messages are left for the
    /// broker to redeliver on next start; the pool never synthesises acks
    /// during shutdown.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ChatError> {
        self.source.declare_queue().await?;
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut events = Arc::clone(&self.source).events().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                maybe_delivery = events.recv() => {
                    match maybe_delivery {
                        None => break,
                        Some(delivery) => {
                            let permit = Arc::clone(&semaphore)
                                .acquire_owned()
                                .await
                                .expect("semaphore never closed while pool is running");
                            let source = Arc::clone(&self.source);
                            let processor = Arc::clone(&self.processor);
                            self.tracker.spawn(async move {
                                let _permit = permit;
                                Self::handle_one(source, processor, delivery).await;
                            });
                        }
                    }
                }
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        Ok(())
    }

    async fn handle_one(source: Arc<S>, processor: Arc<P>, delivery: Delivery<T>) {
        let Delivery { tag, payload } = delivery;

        let item = match payload {
            Ok(item) => item,
            Err(decode_err) => {
                warn!(tag, error = %decode_err, "poison payload, discarding without requeue");
                if let Err(e) = source.nack(tag, false).await {
                    error!(tag, error = %e, "failed to nack poison payload");
                }
                return;
            }
        };

        let outcome = std::panic::AssertUnwindSafe(processor.process(&item))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                if let Err(e) = source.ack(tag).await {
                    error!(tag, error = %e, "failed to ack processed delivery");
                }
            }
            Ok(Err(e)) => {
                warn!(tag, error = %e, "processing failed, nacking with requeue");
                if let Err(e) = source.nack(tag, true).await {
                    error!(tag, error = %e, "failed to nack failed delivery");
                }
            }
            Err(panic) => {
                let msg = panic_message(&panic);
                error!(tag, panic = %msg, "processor panicked, nacking with requeue");
                if let Err(e) = source.nack(tag, true).await {
                    error!(tag, error = %e, "failed to nack after panic");
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct VecSource {
        items: AsyncMutex<Vec<Delivery<u32>>>,
        acked: Arc<AtomicUsize>,
        nacked_requeue: Arc<AtomicUsize>,
        nacked_drop: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Source<u32> for VecSource {
        async fn declare_queue(&self) -> Result<(), ChatError> {
            Ok(())
        }

        async fn events(self: Arc<Self>) -> mpsc::Receiver<Delivery<u32>> {
            let (tx, rx) = mpsc::channel(16);
            let mut items = self.items.lock().await;
            for item in items.drain(..) {
                tx.send(item).await.ok();
            }
            rx
        }

        async fn ack(&self, _tag: u64) -> Result<(), ChatError> {
            self.acked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn nack(&self, _tag: u64, requeue: bool) -> Result<(), ChatError> {
            if requeue {
                self.nacked_requeue.fetch_add(1, Ordering::SeqCst);
            } else {
                self.nacked_drop.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    struct EchoProcessor {
        seen: Arc<AtomicUsize>,
        fail_on: Option<u32>,
        panic_on: Option<u32>,
    }

    #[async_trait]
    impl Processor<u32> for EchoProcessor {
        async fn process(&self, item: &u32) -> Result<(), ChatError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if Some(*item) == self.panic_on {
                panic!("boom on {item}");
            }
            if Some(*item) == self.fail_on {
                return Err(ChatError::transient("synthetic failure"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn successful_items_are_acked() {
        let acked = Arc::new(AtomicUsize::new(0));
        let source = VecSource {
            items: AsyncMutex::new(vec![
                Delivery { tag: 1, payload: Ok(1) },
                Delivery { tag: 2, payload: Ok(2) },
            ]),
            acked: acked.clone(),
            nacked_requeue: Arc::new(AtomicUsize::new(0)),
            nacked_drop: Arc::new(AtomicUsize::new(0)),
        };
        let processor = EchoProcessor {
            seen: Arc::new(AtomicUsize::new(0)),
            fail_on: None,
            panic_on: None,
        };
        let pool = WorkerPool::new(source, processor, 4);
        // Runs until the source's channel closes (VecSource closes after draining).
        pool.run(CancellationToken::new()).await.unwrap();
        assert_eq!(acked.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn decode_failure_is_dropped_without_requeue() {
        let nacked_drop = Arc::new(AtomicUsize::new(0));
        let source = VecSource {
            items: AsyncMutex::new(vec![Delivery {
                tag: 1,
                payload: Err("bad json".to_string()),
            }]),
            acked: Arc::new(AtomicUsize::new(0)),
            nacked_requeue: Arc::new(AtomicUsize::new(0)),
            nacked_drop: nacked_drop.clone(),
        };
        let processor = EchoProcessor {
            seen: Arc::new(AtomicUsize::new(0)),
            fail_on: None,
            panic_on: None,
        };
        let pool = WorkerPool::new(source, processor, 4);
        pool.run(CancellationToken::new()).await.unwrap();
        assert_eq!(nacked_drop.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn processing_error_requeues() {
        let nacked_requeue = Arc::new(AtomicUsize::new(0));
        let source = VecSource {
            items: AsyncMutex::new(vec![Delivery { tag: 1, payload: Ok(7) }]),
            acked: Arc::new(AtomicUsize::new(0)),
            nacked_requeue: nacked_requeue.clone(),
            nacked_drop: Arc::new(AtomicUsize::new(0)),
        };
        let processor = EchoProcessor {
            seen: Arc::new(AtomicUsize::new(0)),
            fail_on: Some(7),
            panic_on: None,
        };
        let pool = WorkerPool::new(source, processor, 4);
        pool.run(CancellationToken::new()).await.unwrap();
        assert_eq!(nacked_requeue.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panic_is_isolated_and_requeues() {
        let nacked_requeue = Arc::new(AtomicUsize::new(0));
        let source = VecSource {
            items: AsyncMutex::new(vec![
                Delivery { tag: 1, payload: Ok(13) },
                Delivery { tag: 2, payload: Ok(14) },
            ]),
            acked: Arc::new(AtomicUsize::new(0)),
            nacked_requeue: nacked_requeue.clone(),
            nacked_drop: Arc::new(AtomicUsize::new(0)),
        };
        let seen = Arc::new(AtomicUsize::new(0));
        let processor = EchoProcessor {
            seen: seen.clone(),
            fail_on: None,
            panic_on: Some(13),
        };
        let pool = WorkerPool::new(source, processor, 1);
        pool.run(CancellationToken::new()).await.unwrap();
        assert_eq!(nacked_requeue.load(Ordering::SeqCst), 1);
        // The pool keeps processing subsequent items after a panic.
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}

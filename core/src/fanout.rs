//! Per-channel multiplexer: one upstream KV pub/sub subscription shared by
//! N local subscribers, with bounded mailboxes and slow-consumer eviction.
//!
//! Adapted from the reference server's `realtime::sse::SseState`, which
//! keeps one `broadcast::Sender` per conversation behind a single
//! `RwLock<HashMap<..>>` and tears nothing down when subscribers leave.
//! `broadcast` fans out for free but cannot selectively evict a single lagging
//! receiver, so this hub replaces it with one bounded `mpsc` mailbox per
//! subscriber and does the fan-out by hand, which is what lets it evict a
//! subscriber that misses its delivery deadline without affecting others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type Payload = bytes::Bytes;

/// A bounded queue owned by exactly one subscriber. Closed on eviction or
/// on unsubscribe; the subscriber observes this as `recv() -> None`.
pub struct Mailbox {
    id: u64,
    channel: String,
    rx: mpsc::Receiver<Payload>,
}

impl Mailbox {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }
}

struct ChannelState {
    subscribers: HashMap<u64, mpsc::Sender<Payload>>,
    next_id: u64,
    /// Child of the hub's root shutdown token. Cancelled either by
    /// `unsubscribe` tearing down the last subscriber, or by process-wide
    /// shutdown cancelling the root — whichever happens first.
    reader_shutdown: CancellationToken,
}

impl ChannelState {
    fn new(reader_shutdown: CancellationToken) -> Self {
        Self {
            subscribers: HashMap::new(),
            next_id: 0,
            reader_shutdown,
        }
    }
}

/// Abstraction over the upstream KV pub/sub so the hub's eviction/refcount
/// logic can be unit-tested without a live Redis instance.
#[async_trait::async_trait]
pub trait UpstreamBroker: Send + Sync + 'static {
    type Subscription: UpstreamSubscription;

    async fn subscribe(&self, channel: &str) -> Result<Self::Subscription, crate::error::ChatError>;

    async fn publish(&self, channel: &str, payload: Payload) -> Result<(), crate::error::ChatError>;
}

#[async_trait::async_trait]
pub trait UpstreamSubscription: Send + 'static {
    /// Returns `None` when the upstream subscription is closed.
    async fn next_payload(&mut self) -> Option<Payload>;
}

/// The multiplexer itself. Holds one mutex guarding the channel -> state
/// map; the per-channel subscriber set lives behind the same mutex, per the
/// concurrency model's "one mutex is sufficient at this scale" note.
pub struct FanoutHub<B: UpstreamBroker> {
    broker: Arc<B>,
    channels: Mutex<HashMap<String, ChannelState>>,
    mailbox_capacity: usize,
    enqueue_deadline: Duration,
    shutdown: CancellationToken,
}

impl<B: UpstreamBroker> FanoutHub<B> {
    /// `shutdown` is the process-wide root token; every reader task this hub
    /// spawns races a child of it alongside its own refcounted teardown
    /// signal, so process shutdown stops all reader tasks together.
    pub fn new(
        broker: B,
        mailbox_capacity: usize,
        enqueue_deadline: Duration,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker: Arc::new(broker),
            channels: Mutex::new(HashMap::new()),
            mailbox_capacity,
            enqueue_deadline,
            shutdown,
        })
    }

    /// First subscriber on a channel opens the upstream subscription and
    /// spawns exactly one reader task; subsequent subscribers just get a
    /// fresh mailbox.
    pub async fn subscribe(self: &Arc<Self>, channel: &str) -> Result<Mailbox, crate::error::ChatError> {
        let mut guard = self.channels.lock().await;
        let is_new = !guard.contains_key(channel);
        let teardown = self.shutdown.child_token();
        let state = guard
            .entry(channel.to_string())
            .or_insert_with(|| ChannelState::new(teardown.clone()));

        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = mpsc::channel(self.mailbox_capacity);
        state.subscribers.insert(id, tx);
        let reader_token = state.reader_shutdown.clone();
        drop(guard);

        if is_new {
            let upstream = self.broker.subscribe(channel).await?;
            let hub = Arc::clone(self);
            let channel_owned = channel.to_string();
            tokio::spawn(async move {
                hub.run_reader(channel_owned, upstream, reader_token).await;
            });
        }

        Ok(Mailbox {
            id,
            channel: channel.to_string(),
            rx,
        })
    }

    /// Removes the mailbox, closes it, decrements refcount. Unsubscribing an
    /// already-evicted mailbox is a benign no-op.
    pub async fn unsubscribe(&self, channel: &str, mailbox_id: u64) -> bool {
        let mut guard = self.channels.lock().await;
        let Some(state) = guard.get_mut(channel) else {
            return false;
        };
        let removed = state.subscribers.remove(&mailbox_id).is_some();
        if removed && state.subscribers.is_empty() {
            state.reader_shutdown.cancel();
            guard.remove(channel);
        }
        removed
    }

    /// Publishes to the upstream KV only; per the concurrency model,
    /// publishers never touch the hub's map directly.
    pub async fn publish(&self, channel: &str, payload: Payload) -> Result<(), crate::error::ChatError> {
        self.broker.publish(channel, payload).await
    }

    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .await
            .get(channel)
            .map(|s| s.subscribers.len())
            .unwrap_or(0)
    }

    async fn run_reader(
        self: Arc<Self>,
        channel: String,
        mut upstream: B::Subscription,
        shutdown: CancellationToken,
    ) {
        info!(channel = %channel, "fanout reader started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!(channel = %channel, "fanout reader cancelled");
                    // No-op if `unsubscribe` already removed this channel;
                    // closes any mailboxes still open when cancellation came
                    // from process-wide shutdown instead.
                    self.teardown(&channel).await;
                    break;
                }
                maybe_payload = upstream.next_payload() => {
                    match maybe_payload {
                        Some(payload) => {
                            if self.dispatch(&channel, payload).await == 0 {
                                // Last subscriber evicted/unsubscribed during
                                // dispatch; refcount already at zero.
                                break;
                            }
                        }
                        None => {
                            warn!(channel = %channel, "upstream subscription closed");
                            self.teardown(&channel).await;
                            break;
                        }
                    }
                }
            }
        }
        info!(channel = %channel, "fanout reader stopped");
    }

    /// Attempts to enqueue `payload` into every subscriber's mailbox with a
    /// deadline; subscribers that miss the deadline are evicted. Returns the
    /// surviving subscriber count.
    async fn dispatch(&self, channel: &str, payload: Payload) -> usize {
        let snapshot: Vec<(u64, mpsc::Sender<Payload>)> = {
            let guard = self.channels.lock().await;
            match guard.get(channel) {
                Some(state) => state
                    .subscribers
                    .iter()
                    .map(|(id, tx)| (*id, tx.clone()))
                    .collect(),
                None => return 0,
            }
        };

        let mut evicted = Vec::new();
        for (id, tx) in snapshot {
            let outcome = tokio::time::timeout(self.enqueue_deadline, tx.send(payload.clone())).await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(_)) => evicted.push(id),
                Err(_elapsed) => {
                    warn!(channel = %channel, subscriber = id, "slow consumer evicted");
                    metrics::counter!("fanout_slow_consumer_evictions_total", 1);
                    evicted.push(id);
                }
            }
        }

        if evicted.is_empty() {
            return self.subscriber_count(channel).await;
        }

        let mut guard = self.channels.lock().await;
        let Some(state) = guard.get_mut(channel) else {
            return 0;
        };
        for id in evicted {
            state.subscribers.remove(&id);
        }
        let remaining = state.subscribers.len();
        if remaining == 0 {
            guard.remove(channel);
        }
        remaining
    }

    async fn teardown(&self, channel: &str) {
        self.channels.lock().await.remove(channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    /// In-memory stand-in for Redis pub/sub: one broadcast channel per
    /// `subscribe()` call, backed by a shared map of senders so `publish`
    /// can reach every live subscription.
    #[derive(Clone, Default)]
    struct MemoryBroker {
        channels: Arc<Mutex<HashMap<String, broadcast::Sender<Payload>>>>,
        subscribe_calls: Arc<AtomicUsize>,
    }

    struct MemorySubscription {
        rx: broadcast::Receiver<Payload>,
    }

    #[async_trait::async_trait]
    impl UpstreamSubscription for MemorySubscription {
        async fn next_payload(&mut self) -> Option<Payload> {
            loop {
                match self.rx.recv().await {
                    Ok(p) => return Some(p),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }
    }

    #[async_trait::async_trait]
    impl UpstreamBroker for MemoryBroker {
        type Subscription = MemorySubscription;

        async fn subscribe(&self, channel: &str) -> Result<Self::Subscription, crate::error::ChatError> {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            let mut guard = self.channels.lock().await;
            let tx = guard
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(64).0)
                .clone();
            Ok(MemorySubscription { rx: tx.subscribe() })
        }

        async fn publish(&self, channel: &str, payload: Payload) -> Result<(), crate::error::ChatError> {
            let mut guard = self.channels.lock().await;
            let tx = guard
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(64).0);
            let _ = tx.send(payload);
            Ok(())
        }
    }

    fn hub(capacity: usize, deadline_ms: u64) -> Arc<FanoutHub<MemoryBroker>> {
        FanoutHub::new(
            MemoryBroker::default(),
            capacity,
            Duration::from_millis(deadline_ms),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn first_subscriber_opens_upstream_once() {
        let hub = hub(10, 100);
        let m1 = hub.subscribe("bob").await.unwrap();
        let _m2 = hub.subscribe("bob").await.unwrap();
        assert_eq!(hub.broker.subscribe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(hub.subscriber_count("bob").await, 2);
        drop(m1);
    }

    #[tokio::test]
    async fn publish_reaches_all_local_subscribers() {
        let hub = hub(10, 100);
        let mut m1 = hub.subscribe("bob").await.unwrap();
        let mut m2 = hub.subscribe("bob").await.unwrap();
        hub.publish("bob", Payload::from_static(b"hello")).await.unwrap();
        assert_eq!(m1.recv().await.unwrap(), Payload::from_static(b"hello"));
        assert_eq!(m2.recv().await.unwrap(), Payload::from_static(b"hello"));
    }

    #[tokio::test]
    async fn unsubscribe_last_subscriber_tears_down_channel() {
        let hub = hub(10, 100);
        let m1 = hub.subscribe("bob").await.unwrap();
        assert!(hub.unsubscribe("bob", m1.id()).await);
        tokio::task::yield_now().await;
        assert_eq!(hub.subscriber_count("bob").await, 0);
        // Re-subscribing opens a fresh upstream subscription.
        let _m2 = hub.subscribe("bob").await.unwrap();
        assert_eq!(hub.broker.subscribe_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unsubscribe_of_unknown_mailbox_is_benign() {
        let hub = hub(10, 100);
        assert!(!hub.unsubscribe("nobody-home", 999).await);
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_without_affecting_others() {
        // Mailbox capacity 1 + short deadline: a subscriber that never
        // drains will miss the deadline on the second publish.
        let hub = hub(1, 20);
        let mut healthy = hub.subscribe("bob").await.unwrap();
        let stuck = hub.subscribe("bob").await.unwrap();

        hub.publish("bob", Payload::from_static(b"one")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Drain the healthy subscriber but never touch `stuck`'s mailbox.
        assert_eq!(healthy.recv().await.unwrap(), Payload::from_static(b"one"));

        hub.publish("bob", Payload::from_static(b"two")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(healthy.recv().await.unwrap(), Payload::from_static(b"two"));

        // `stuck`'s mailbox should now be closed.
        assert_eq!(stuck_closed(stuck).await, true);
        assert_eq!(hub.subscriber_count("bob").await, 1);
    }

    #[tokio::test]
    async fn process_shutdown_stops_reader_without_unsubscribe() {
        let root = CancellationToken::new();
        let hub = FanoutHub::new(MemoryBroker::default(), 10, Duration::from_millis(100), root.clone());
        let mut m1 = hub.subscribe("bob").await.unwrap();

        root.cancel();
        // Reader task observes cancellation and drops the mailbox sender;
        // recv() resolves to None without anyone calling unsubscribe.
        assert_eq!(m1.recv().await, None);
    }

    async fn stuck_closed(mut mailbox: Mailbox) -> bool {
        // First item may still be buffered (capacity 1); drain until closed.
        loop {
            match mailbox.recv().await {
                Some(_) => continue,
                None => return true,
            }
        }
    }
}

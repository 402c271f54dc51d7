//! Event stream fan-out: ring-buffered replay, bounded
//! per-subscriber buffers, drop-on-full, and the register-before-replay
//! correctness requirement. Grounded on this codebase's use
//! of bounded `mpsc` channels for the reload-signal path, generalized to a
//! full publish/subscribe hub.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};
use crate::stream::envelope::{EnvelopeKind, StreamEnvelope};

struct Subscriber {
    main_tx: mpsc::Sender<StreamEnvelope>,
    terminal_tx: mpsc::UnboundedSender<StreamEnvelope>,
}

struct HubState {
    ring: VecDeque<StreamEnvelope>,
    ring_capacity: usize,
    next_sequence: u64,
    subscribers: HashMap<u64, Subscriber>,
}

/// A live subscription: the replay set computed atomically with
/// registration, plus a receiver for everything published afterward.
pub struct Subscription {
    pub replay: Vec<StreamEnvelope>,
    main_rx: mpsc::Receiver<StreamEnvelope>,
    terminal_rx: mpsc::UnboundedReceiver<StreamEnvelope>,
    hub: Arc<StreamHubInner>,
    id: u64,
}

impl Subscription {
    /// Awaits the next live envelope (replay must be drained by the caller
    /// first). Returns `None` once unsubscribed or the hub is dropped.
    pub async fn recv(&mut self) -> Option<StreamEnvelope> {
        tokio::select! {
            Some(terminal) = self.terminal_rx.recv() => Some(terminal),
            msg = self.main_rx.recv() => msg,
        }
    }

    /// Idempotent unsubscribe.
    pub async fn unsubscribe(&self) {
        self.hub.unsubscribe(self.id).await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let hub = self.hub.clone();
        let id = self.id;
        tokio::spawn(async move { hub.unsubscribe(id).await });
    }
}

struct StreamHubInner {
    state: Mutex<HubState>,
    max_subscribers: usize,
    subscriber_buffer_size: usize,
    next_subscriber_id: AtomicU64,
}

impl StreamHubInner {
    async fn unsubscribe(&self, id: u64) {
        self.state.lock().await.subscribers.remove(&id);
    }
}

/// One event stream source (one `(cluster, domain, scope)`). Created fresh
/// per stream; the per-cluster subsystem owns the map of active hubs.
#[derive(Clone)]
pub struct StreamHub {
    inner: Arc<StreamHubInner>,
}

impl StreamHub {
    pub fn new(ring_capacity: usize, subscriber_buffer_size: usize, max_subscribers: usize) -> Self {
        Self {
            inner: Arc::new(StreamHubInner {
                state: Mutex::new(HubState {
                    ring: VecDeque::with_capacity(ring_capacity),
                    ring_capacity,
                    next_sequence: 1,
                    subscribers: HashMap::new(),
                }),
                max_subscribers,
                subscriber_buffer_size,
                next_subscriber_id: AtomicU64::new(1),
            }),
        }
    }

    /// Non-blocking from the producer's perspective: stamps a sequence
    /// number, appends to the ring buffer, and fans out to subscribers
    /// under a single critical section.
    pub async fn publish(&self, kind: EnvelopeKind, payload: Value) -> u64 {
        let mut state = self.inner.state.lock().await;
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let envelope = StreamEnvelope::new(sequence, kind, payload, Utc::now());

        state.ring.push_back(envelope.clone());
        while state.ring.len() > state.ring_capacity {
            state.ring.pop_front();
        }

        let mut dead = Vec::new();
        for (&id, sub) in state.subscribers.iter() {
            match sub.main_tx.try_send(envelope.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let error_envelope =
                        StreamEnvelope::error(sequence, "subscriber buffer overflowed; resubscribe", Utc::now());
                    let _ = sub.terminal_tx.send(error_envelope);
                    dead.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Receiver dropped without calling unsubscribe.
                    dead.push(id);
                }
            }
        }
        for id in dead {
            state.subscribers.remove(&id);
        }

        sequence
    }

    /// `Subscribe(options) -> (channel, unsubscribe)`. The
    /// subscriber is registered in the same critical section the replay set
    /// is computed from, so no publish in between can be missed or
    /// duplicated.
    pub async fn subscribe(&self, last_seen_sequence: Option<u64>) -> Result<Subscription> {
        let mut state = self.inner.state.lock().await;
        if state.subscribers.len() >= self.inner.max_subscribers {
            return Err(Error::SubscriberLimit);
        }

        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let (main_tx, main_rx) = mpsc::channel(self.inner.subscriber_buffer_size);
        let (terminal_tx, terminal_rx) = mpsc::unbounded_channel();
        state.subscribers.insert(id, Subscriber { main_tx, terminal_tx });

        let floor = last_seen_sequence.unwrap_or(0);
        let replay = state.ring.iter().filter(|e| e.sequence > floor).cloned().collect();

        Ok(Subscription {
            replay,
            main_rx,
            terminal_rx,
            hub: self.inner.clone(),
            id,
        })
    }

    /// `Resume(lastSeenSequence) -> [missed envelopes]` without creating a
    /// new subscription; used by transports that re-fetch replay without
    /// opening a fresh live stream.
    pub async fn resume(&self, last_seen_sequence: u64) -> Vec<StreamEnvelope> {
        let state = self.inner.state.lock().await;
        state.ring.iter().filter(|e| e.sequence > last_seen_sequence).cloned().collect()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.state.lock().await.subscribers.len()
    }

    /// Closes every subscriber with a terminal error envelope (used on
    /// subsystem shutdown).
    pub async fn close_all(&self, reason: &str) {
        let mut state = self.inner.state.lock().await;
        let sequence = state.next_sequence;
        for (_, sub) in state.subscribers.drain() {
            let _ = sub.terminal_tx.send(StreamEnvelope::error(sequence, reason, Utc::now()));
        }
    }
}

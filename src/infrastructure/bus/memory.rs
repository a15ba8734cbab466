//! In-process implementation of the message bus port.
//!
//! Semantics mirror what the pipeline expects from its broker: topic
//! routing into named per-consumer queues, priority delivery (higher
//! first, publish order within a priority), bounded queue depth, a
//! per-message TTL, and queues that outlive their consumer so a
//! re-subscribing worker drains what accumulated while it was away.

use crate::domain::errors::BusError;
use crate::domain::ports::{Delivery, MessageBus};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, Receiver};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

const DEFAULT_MAX_DEPTH: usize = 10_000;
const DEFAULT_TTL: Duration = Duration::from_secs(3600);
const PREFETCH: usize = 10;

struct Queued {
    priority: u8,
    seq: u64,
    enqueued_at: Instant,
    delivery: Delivery,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Queued {}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: highest priority first, then oldest sequence.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueState {
    name: String,
    heap: Mutex<BinaryHeap<Queued>>,
    notify: Notify,
}

impl QueueState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        }
    }
}

/// Topic-exchange message bus backed by in-process queues.
pub struct MemoryBus {
    // topic -> queues bound to it
    bindings: Mutex<HashMap<String, Vec<Arc<QueueState>>>>,
    queues: Mutex<HashMap<String, Arc<QueueState>>>,
    seq: AtomicU64,
    max_depth: usize,
    ttl: Duration,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_DEPTH, DEFAULT_TTL)
    }

    pub fn with_limits(max_depth: usize, ttl: Duration) -> Self {
        Self {
            bindings: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            max_depth,
            ttl,
        }
    }

    /// Number of messages currently queued for `queue` (for tests).
    pub async fn queue_depth(&self, queue: &str) -> usize {
        let queues = self.queues.lock().await;
        match queues.get(queue) {
            Some(state) => state.heap.lock().await.len(),
            None => 0,
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, body: Vec<u8>, priority: u8) -> Result<(), BusError> {
        let bound = {
            let bindings = self.bindings.lock().await;
            bindings.get(topic).cloned().unwrap_or_default()
        };

        if bound.is_empty() {
            debug!(topic = %topic, "No queues bound; message dropped");
            return Ok(());
        }

        for queue in bound {
            let mut heap = queue.heap.lock().await;
            if heap.len() >= self.max_depth {
                // Mirror broker max-length behavior: the queue sheds
                // the new message rather than growing without bound.
                warn!(queue = %queue.name, depth = heap.len(), "Queue full; message dropped");
                continue;
            }
            heap.push(Queued {
                priority,
                seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
                enqueued_at: Instant::now(),
                delivery: Delivery {
                    topic: topic.to_string(),
                    priority,
                    body: body.clone(),
                },
            });
            drop(heap);
            queue.notify.notify_one();
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str, topic: &str) -> Result<Receiver<Delivery>, BusError> {
        let state = {
            let mut queues = self.queues.lock().await;
            queues
                .entry(queue.to_string())
                .or_insert_with(|| Arc::new(QueueState::new(queue)))
                .clone()
        };

        {
            let mut bindings = self.bindings.lock().await;
            let bound = bindings.entry(topic.to_string()).or_default();
            if !bound.iter().any(|q| Arc::ptr_eq(q, &state)) {
                bound.push(state.clone());
            }
        }

        // Pump task: pop in priority order, forward into a bounded
        // channel whose capacity acts as the consumer prefetch. Ends
        // when the consumer drops the receiver.
        let (tx, rx) = mpsc::channel(PREFETCH);
        let ttl = self.ttl;
        tokio::spawn(async move {
            loop {
                let next = {
                    let mut heap = state.heap.lock().await;
                    heap.pop()
                };
                match next {
                    Some(item) => {
                        if item.enqueued_at.elapsed() > ttl {
                            debug!(queue = %state.name, "Expired message discarded");
                            continue;
                        }
                        let Queued {
                            priority,
                            seq,
                            enqueued_at,
                            delivery,
                        } = item;
                        if let Err(returned) = tx.send(delivery).await {
                            // Consumer went away; requeue so the next
                            // subscriber gets the message.
                            let mut heap = state.heap.lock().await;
                            heap.push(Queued {
                                priority,
                                seq,
                                enqueued_at,
                                delivery: returned.0,
                            });
                            drop(heap);
                            state.notify.notify_one();
                            break;
                        }
                    }
                    None => {
                        state.notify.notified().await;
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_binding_is_dropped() {
        let bus = MemoryBus::new();
        bus.publish("signals.tech", b"x".to_vec(), 7).await.unwrap();
        assert_eq!(bus.queue_depth("fusion.signals.tech").await, 0);
    }

    #[tokio::test]
    async fn test_fanout_to_multiple_queues() {
        let bus = MemoryBus::new();
        let mut a = bus
            .subscribe("risk.execution.report", "execution.report")
            .await
            .unwrap();
        let mut b = bus
            .subscribe("observer.execution.report", "execution.report")
            .await
            .unwrap();

        bus.publish("execution.report", b"fill".to_vec(), 8)
            .await
            .unwrap();

        assert_eq!(a.recv().await.unwrap().body, b"fill");
        assert_eq!(b.recv().await.unwrap().body, b"fill");
    }

    #[tokio::test]
    async fn test_priority_ordering_within_queue() {
        let bus = MemoryBus::new();
        let mut rx = bus.subscribe("w.t", "t").await.unwrap();

        // Saturate the prefetch window with filler so later messages
        // are still in the heap when the high-priority one arrives.
        for i in 0..PREFETCH + 2 {
            bus.publish("t", format!("low-{}", i).into_bytes(), 2)
                .await
                .unwrap();
        }
        bus.publish("t", b"high".to_vec(), 9).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..PREFETCH + 3 {
            seen.push(String::from_utf8(rx.recv().await.unwrap().body).unwrap());
        }

        // "high" overtakes whatever had not yet been pumped into the
        // prefetch channel.
        let high_pos = seen.iter().position(|m| m == "high").unwrap();
        assert!(
            high_pos < seen.len() - 1,
            "high-priority message did not overtake: {:?}",
            seen
        );
    }

    #[tokio::test]
    async fn test_fifo_within_same_priority() {
        let bus = MemoryBus::new();
        let mut rx = bus.subscribe("w.orders", "trade.order").await.unwrap();

        for i in 0..5 {
            bus.publish("trade.order", vec![i], 9).await.unwrap();
        }
        for i in 0..5u8 {
            assert_eq!(rx.recv().await.unwrap().body, vec![i]);
        }
    }

    #[tokio::test]
    async fn test_queue_survives_consumer() {
        let bus = MemoryBus::new();
        let rx = bus.subscribe("w.t", "t").await.unwrap();
        drop(rx);

        // Give the pump task a beat to notice the dropped receiver.
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.publish("t", b"while away".to_vec(), 5).await.unwrap();

        let mut rx = bus.subscribe("w.t", "t").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().body, b"while away");
    }

    #[tokio::test]
    async fn test_depth_cap_sheds_new_messages() {
        let bus = MemoryBus::with_limits(3, DEFAULT_TTL);
        // Bind the queue, then walk away so nothing drains it.
        let rx = bus.subscribe("w.t", "t").await.unwrap();
        drop(rx);
        tokio::time::sleep(Duration::from_millis(10)).await;

        for i in 0..10u8 {
            bus.publish("t", vec![i], 5).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(bus.queue_depth("w.t").await, 3);
    }
}

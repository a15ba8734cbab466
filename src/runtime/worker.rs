use crate::domain::errors::ProtocolError;
use crate::domain::messages::Envelope;
use crate::domain::ports::{Delivery, MessageBus};
use crate::domain::repositories::WorkerConfigRepository;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Number of in-flight deliveries a worker will accept before the
/// bus-side queue backs up.
const PREFETCH: usize = 10;

/// A pipeline worker.
///
/// Implementations own their collaborators (bus handle, repositories,
/// gateway) and expose their message handling as ordinary async
/// methods; the runner only sequences them.
#[async_trait]
pub trait Worker: Send {
    /// Internal event type fed by child tasks (e.g. gateway order
    /// updates). Workers without one use the default `()` and no
    /// source.
    type Event: Send + 'static;

    fn name(&self) -> &str;

    /// Worker class recorded alongside persisted configuration.
    fn worker_type(&self) -> &str {
        "worker"
    }

    /// Store holding persisted per-worker configuration, when the
    /// worker has one. Loaded state is applied via [`Worker::configure`]
    /// before setup.
    fn config_store(&self) -> Option<Arc<dyn WorkerConfigRepository>> {
        None
    }

    /// Apply persisted configuration. Unknown keys are ignored.
    async fn configure(&mut self, _config: serde_json::Value) -> Result<()> {
        Ok(())
    }

    /// Worker-specific setup, run once before subscriptions are
    /// bound. Failures abort start.
    async fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Topics to bind. Each gets a durable queue `<name>.<topic>`.
    fn subscriptions(&self) -> Vec<String>;

    /// Handle one decoded message. Errors are logged, not propagated.
    async fn handle(&mut self, topic: &str, envelope: Envelope) -> Result<()>;

    /// Interval between periodic ticks; `None` for purely
    /// event-driven workers.
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    /// Periodic work. Errors are logged; the loop sleeps and retries.
    async fn tick(&mut self) -> Result<()> {
        Ok(())
    }

    /// Hand over the internal event receiver, if the worker has one.
    /// Called once after setup.
    fn take_event_source(&mut self) -> Option<mpsc::Receiver<Self::Event>> {
        None
    }

    /// React to one internal event. Errors are logged, not
    /// propagated.
    async fn on_event(&mut self, _event: Self::Event) -> Result<()> {
        Ok(())
    }

    /// Worker-specific cleanup; runs on every exit path.
    async fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Handle to a spawned worker task.
pub struct WorkerHandle {
    pub name: String,
    pub task: JoinHandle<Result<()>>,
}

/// Spawn a worker onto the runtime with a shared shutdown signal.
pub fn spawn_worker<W>(
    worker: W,
    bus: Arc<dyn MessageBus>,
    shutdown: watch::Receiver<bool>,
) -> WorkerHandle
where
    W: Worker + 'static,
{
    let name = worker.name().to_string();
    let task = tokio::spawn(run_worker(worker, bus, shutdown));
    WorkerHandle { name, task }
}

/// Drive a worker through its full lifecycle. Returns when shutdown
/// is signalled (or all subscription feeds close); cleanup runs on
/// every exit path.
pub async fn run_worker<W>(
    mut worker: W,
    bus: Arc<dyn MessageBus>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    W: Worker,
{
    let name = worker.name().to_string();

    // Persisted configuration is applied before setup; the store
    // being unreachable is not fatal, the worker runs on its static
    // config.
    if let Some(store) = worker.config_store() {
        match store.load_state(&name).await {
            Ok(Some(config)) => {
                info!(worker = %name, "Applying persisted configuration");
                if let Err(e) = worker.configure(config).await {
                    error!(worker = %name, error = %e, "Persisted configuration invalid, aborting start");
                    let _ = worker.cleanup().await;
                    return Err(e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(worker = %name, error = %e, "Could not load persisted configuration"),
        }
    }

    if let Err(e) = worker.setup().await {
        error!(worker = %name, error = %e, "Worker setup failed, aborting start");
        let _ = worker.cleanup().await;
        return Err(e);
    }

    // Fan every subscription into one channel so the main loop stays
    // a single select. The channel capacity bounds prefetch.
    let (feed_tx, mut feed_rx) = mpsc::channel::<Delivery>(PREFETCH);
    let mut forwarders: Vec<JoinHandle<()>> = Vec::new();

    for topic in worker.subscriptions() {
        let queue = format!("{}.{}", name, topic);
        let mut sub = match bus.subscribe(&queue, &topic).await {
            Ok(sub) => sub,
            Err(e) => {
                error!(worker = %name, topic = %topic, error = %e, "Subscription failed");
                for f in &forwarders {
                    f.abort();
                }
                let _ = worker.cleanup().await;
                return Err(e.into());
            }
        };
        let tx = feed_tx.clone();
        forwarders.push(tokio::spawn(async move {
            while let Some(delivery) = sub.recv().await {
                if tx.send(delivery).await.is_err() {
                    break;
                }
            }
        }));
        info!(worker = %name, queue = %format!("{}.{}", name, topic), "Subscribed");
    }
    drop(feed_tx);

    let tick_interval = worker.tick_interval();
    // Sleep first, then work: the first tick fires one full interval
    // after start.
    let mut ticker = {
        let period = tick_interval.unwrap_or(Duration::from_secs(3600));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    };

    let mut events = worker.take_event_source();
    let mut feed_open = true;

    info!(worker = %name, worker_type = worker.worker_type(), "Worker started");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(worker = %name, "Shutdown signal received");
                    break;
                }
            }
            delivery = feed_rx.recv(), if feed_open => {
                match delivery {
                    Some(delivery) => dispatch(&mut worker, &name, delivery).await,
                    None => {
                        feed_open = false;
                        // Event-driven workers have nothing left to do
                        // once every feed is gone.
                        if tick_interval.is_none() && events.is_none() {
                            info!(worker = %name, "All subscriptions closed, stopping");
                            break;
                        }
                    }
                }
            }
            maybe_event = recv_or_pending(&mut events) => {
                match maybe_event {
                    Some(event) => {
                        if let Err(e) = worker.on_event(event).await {
                            error!(worker = %name, error = %e, "Internal event handler failed");
                        }
                    }
                    None => events = None,
                }
            }
            _ = ticker.tick(), if tick_interval.is_some() => {
                if let Err(e) = worker.tick().await {
                    // Periodic failures are recoverable: log, sleep,
                    // retry on the next tick.
                    error!(worker = %name, error = %e, "Periodic tick failed");
                }
            }
        }
    }

    for forwarder in &forwarders {
        forwarder.abort();
    }
    for forwarder in forwarders {
        let _ = forwarder.await;
    }

    if let Err(e) = worker.cleanup().await {
        warn!(worker = %name, error = %e, "Worker cleanup reported an error");
    }
    info!(worker = %name, "Worker stopped");
    Ok(())
}

async fn recv_or_pending<E>(events: &mut Option<mpsc::Receiver<E>>) -> Option<E> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn dispatch<W: Worker>(worker: &mut W, name: &str, delivery: Delivery) {
    let envelope = match Envelope::decode(&delivery.body) {
        Ok(envelope) => envelope,
        Err(ProtocolError::UnknownType(tag)) => {
            warn!(worker = %name, topic = %delivery.topic, tag = %tag, "Dropping message with unknown type tag");
            return;
        }
        Err(e) => {
            warn!(worker = %name, topic = %delivery.topic, error = %e, "Dropping undecodable message");
            return;
        }
    };

    let correlation = envelope.correlation_id.clone().unwrap_or_default();
    debug!(
        worker = %name,
        topic = %delivery.topic,
        source = %envelope.source_worker,
        correlation = %correlation,
        "Message received"
    );

    if let Err(e) = worker.handle(&delivery.topic, envelope).await {
        error!(
            worker = %name,
            topic = %delivery.topic,
            correlation = %correlation,
            error = %e,
            "Handler failed; message dropped"
        );
    }
}

/// Publish helper used by worker implementations; stamps the worker
/// name, serializes, and forwards to the bus.
pub async fn publish(
    bus: &dyn MessageBus,
    source_worker: &str,
    topic: &str,
    priority: u8,
    mut envelope: Envelope,
) -> Result<()> {
    envelope.source_worker = source_worker.to_string();
    let body = envelope.encode()?;
    bus.publish(topic, body, priority).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::messages::{MarketData, Payload};
    use crate::infrastructure::bus::MemoryBus;
    use serde_json::Map;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingWorker {
        name: String,
        handled: Arc<AtomicUsize>,
        ticked: Arc<AtomicUsize>,
        cleaned: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Worker for CountingWorker {
        type Event = ();

        fn name(&self) -> &str {
            &self.name
        }

        fn subscriptions(&self) -> Vec<String> {
            vec!["ticks.raw".to_string()]
        }

        async fn handle(&mut self, _topic: &str, _envelope: Envelope) -> Result<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn tick_interval(&self) -> Option<Duration> {
            Some(Duration::from_millis(20))
        }

        async fn tick(&mut self) -> Result<()> {
            self.ticked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn cleanup(&mut self) -> Result<()> {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn market_data_envelope() -> Envelope {
        Envelope::new(
            "collector",
            Payload::MarketData(MarketData {
                exchange: "binance".to_string(),
                symbol: "BTC/USDT".to_string(),
                data: Map::new(),
            }),
        )
    }

    #[tokio::test]
    async fn test_worker_handles_messages_and_ticks() {
        let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
        let handled = Arc::new(AtomicUsize::new(0));
        let ticked = Arc::new(AtomicUsize::new(0));
        let cleaned = Arc::new(AtomicUsize::new(0));

        let worker = CountingWorker {
            name: "counter".to_string(),
            handled: handled.clone(),
            ticked: ticked.clone(),
            cleaned: cleaned.clone(),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_worker(worker, bus.clone(), shutdown_rx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let body = market_data_envelope().encode().unwrap();
        bus.publish("ticks.raw", body, 5).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown_tx.send(true).unwrap();
        handle.task.await.unwrap().unwrap();

        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert!(ticked.load(Ordering::SeqCst) >= 1);
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    struct ConfigurableWorker {
        store: Arc<crate::infrastructure::mock::MockWorkerConfigRepository>,
        applied: Arc<tokio::sync::Mutex<Option<serde_json::Value>>>,
    }

    #[async_trait]
    impl Worker for ConfigurableWorker {
        type Event = ();

        fn name(&self) -> &str {
            "configurable"
        }

        fn worker_type(&self) -> &str {
            "test"
        }

        fn config_store(&self) -> Option<Arc<dyn WorkerConfigRepository>> {
            Some(self.store.clone())
        }

        async fn configure(&mut self, config: serde_json::Value) -> Result<()> {
            *self.applied.lock().await = Some(config);
            Ok(())
        }

        fn subscriptions(&self) -> Vec<String> {
            Vec::new()
        }

        async fn handle(&mut self, _topic: &str, _envelope: Envelope) -> Result<()> {
            Ok(())
        }

        fn tick_interval(&self) -> Option<Duration> {
            Some(Duration::from_secs(3600))
        }
    }

    #[tokio::test]
    async fn test_persisted_config_applied_before_start() {
        let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
        let store = Arc::new(crate::infrastructure::mock::MockWorkerConfigRepository::default());
        store
            .save_state("configurable", "test", &serde_json::json!({"interval": 5}))
            .await
            .unwrap();

        let applied = Arc::new(tokio::sync::Mutex::new(None));
        let worker = ConfigurableWorker {
            store,
            applied: applied.clone(),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_worker(worker, bus, shutdown_rx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();
        handle.task.await.unwrap().unwrap();

        let applied = applied.lock().await;
        assert_eq!(applied.as_ref().unwrap()["interval"], 5);
    }

    #[tokio::test]
    async fn test_undecodable_message_is_dropped_not_fatal() {
        let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
        let handled = Arc::new(AtomicUsize::new(0));

        let worker = CountingWorker {
            name: "drops".to_string(),
            handled: handled.clone(),
            ticked: Arc::new(AtomicUsize::new(0)),
            cleaned: Arc::new(AtomicUsize::new(0)),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_worker(worker, bus.clone(), shutdown_rx);
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.publish("ticks.raw", b"not json at all".to_vec(), 5)
            .await
            .unwrap();
        let body = market_data_envelope().encode().unwrap();
        bus.publish("ticks.raw", body, 5).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        shutdown_tx.send(true).unwrap();
        handle.task.await.unwrap().unwrap();

        // The garbage frame is dropped; the valid one still lands.
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }
}

//! SIEM forwarder — batched, compressed, circuit-broken delivery.
//!
//! Events arrive on a bounded queue from the audit emitter, accumulate into
//! batches (size or interval, whichever first), and are dispatched to every
//! configured destination independently. Each destination send runs behind
//! its own circuit breaker and retry policy; a batch that exhausts its
//! retries is appended to the durable fallback queue. A background sweep
//! replays fallback entries once the destination recovers.
//!
//! Delivery is at-least-once: consumers deduplicate on `event_id`.

pub mod adapter;
pub mod datadog;
pub mod fallback;
pub mod file;
pub mod splunk;

pub use adapter::{HealthStatus, SiemAdapter};
pub use datadog::DatadogAdapter;
pub use fallback::{FallbackEntry, FallbackQueue};
pub use file::FileAdapter;
pub use splunk::SplunkAdapter;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, EMITTER_FALLBACK_DESTINATION};
use crate::config::{FailsafeConfig, SiemConfig, SiemDestinationConfig};
use crate::failsafe::{CircuitState, CircuitStats, Failsafe};
use crate::{Error, Result};

/// One destination with its failure isolation.
struct Destination {
    adapter: Arc<dyn SiemAdapter>,
    failsafe: Failsafe,
}

/// Per-destination snapshot for the health surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DestinationSnapshot {
    /// Destination id
    pub id: String,
    /// Breaker state label
    pub circuit: &'static str,
    /// Closed→Open transitions
    pub trips: u64,
}

/// Build adapters for every configured destination.
pub fn build_adapters(config: &SiemConfig) -> Result<Vec<Arc<dyn SiemAdapter>>> {
    let mut adapters: Vec<Arc<dyn SiemAdapter>> = Vec::new();
    for dest in &config.destinations {
        match dest {
            SiemDestinationConfig::Splunk {
                id,
                url,
                token,
                index,
                source,
                sourcetype,
            } => {
                adapters.push(Arc::new(SplunkAdapter::new(
                    id.clone(),
                    url,
                    token.clone(),
                    index.clone(),
                    source.clone(),
                    sourcetype.clone(),
                    config.request_timeout,
                    config.compression_threshold_bytes,
                )?));
            }
            SiemDestinationConfig::Datadog {
                id,
                site,
                api_key,
                service,
                tags,
            } => {
                adapters.push(Arc::new(DatadogAdapter::new(
                    id.clone(),
                    site,
                    api_key.clone(),
                    service.clone(),
                    tags,
                    config.request_timeout,
                    config.compression_threshold_bytes,
                )?));
            }
            SiemDestinationConfig::File { id, path } => {
                adapters.push(Arc::new(FileAdapter::new(
                    id.clone(),
                    path.clone(),
                    100 * 1024 * 1024,
                )));
            }
        }
    }
    Ok(adapters)
}

/// The forwarder. Construct with [`SiemForwarder::new`], hand
/// [`SiemForwarder::sender`] to the audit emitter, then [`spawn`](Self::spawn).
pub struct SiemForwarder {
    config: SiemConfig,
    destinations: Arc<Vec<Destination>>,
    fallback: Arc<FallbackQueue>,
    replay_interval: Duration,
    tx: mpsc::Sender<AuditEvent>,
    rx: Option<mpsc::Receiver<AuditEvent>>,
}

impl SiemForwarder {
    /// Create the forwarder and its bounded ingress queue.
    #[must_use]
    pub fn new(
        config: SiemConfig,
        failsafe: &FailsafeConfig,
        adapters: Vec<Arc<dyn SiemAdapter>>,
        fallback: Arc<FallbackQueue>,
        replay_interval: Duration,
    ) -> Self {
        let destinations = adapters
            .into_iter()
            .map(|adapter| Destination {
                failsafe: Failsafe::new(adapter.id(), failsafe),
                adapter,
            })
            .collect();
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            config,
            destinations: Arc::new(destinations),
            fallback,
            replay_interval,
            tx,
            rx: Some(rx),
        }
    }

    /// Ingress sender for the audit emitter.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<AuditEvent> {
        self.tx.clone()
    }

    /// Breaker snapshots for the health surface.
    #[must_use]
    pub fn destination_snapshots(&self) -> Vec<DestinationSnapshot> {
        self.destinations
            .iter()
            .map(|d| {
                let stats: CircuitStats = d.failsafe.circuit_breaker.stats();
                DestinationSnapshot {
                    id: d.adapter.id().to_string(),
                    circuit: stats.state.as_str(),
                    trips: stats.trips,
                }
            })
            .collect()
    }

    /// Start the batch loop and the replay sweep.
    ///
    /// # Panics
    ///
    /// Panics if called twice; the ingress receiver can only be taken once.
    pub fn spawn(&mut self, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
        let rx = self.rx.take().expect("SiemForwarder::spawn called twice");
        let worker = Worker {
            config: self.config.clone(),
            destinations: Arc::clone(&self.destinations),
            fallback: Arc::clone(&self.fallback),
        };

        // Replay sweep is its own task so a slow replay never delays batches.
        let replayer = worker.clone();
        let replay_interval = self.replay_interval;
        let mut replay_shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(replay_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => replayer.replay_once().await,
                    _ = replay_shutdown.recv() => break,
                }
            }
        });

        let batch_shutdown = shutdown.subscribe();
        tokio::spawn(async move { worker.run(rx, batch_shutdown).await })
    }
}

#[derive(Clone)]
struct Worker {
    config: SiemConfig,
    destinations: Arc<Vec<Destination>>,
    fallback: Arc<FallbackQueue>,
}

impl Worker {
    /// Batch loop: accumulate until `batch_size` or `batch_interval`, then
    /// dispatch. On shutdown, drain the queue and issue a final flush.
    async fn run(&self, mut rx: mpsc::Receiver<AuditEvent>, mut shutdown: broadcast::Receiver<()>) {
        let mut batch: Vec<AuditEvent> = Vec::with_capacity(self.config.batch_size);
        let mut ticker = tokio::time::interval(self.config.batch_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(event) => {
                        batch.push(event);
                        if batch.len() >= self.config.batch_size {
                            self.dispatch(std::mem::take(&mut batch)).await;
                            ticker.reset();
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.dispatch(std::mem::take(&mut batch)).await;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        // Graceful drain: whatever is still queued goes out in final batches.
        while let Ok(event) = rx.try_recv() {
            batch.push(event);
            if batch.len() >= self.config.batch_size {
                self.dispatch(std::mem::take(&mut batch)).await;
            }
        }
        if !batch.is_empty() {
            self.dispatch(batch).await;
        }
        info!("SIEM forwarder drained and stopped");
    }

    /// Send one batch to every destination independently.
    async fn dispatch(&self, batch: Vec<AuditEvent>) {
        if self.destinations.is_empty() {
            debug!(events = batch.len(), "No SIEM destinations configured, dropping batch");
            return;
        }

        let sends = self.destinations.iter().map(|dest| {
            let batch = &batch;
            async move {
                let result = dest
                    .failsafe
                    .call("siem_send", || dest.adapter.send_batch(batch))
                    .await;
                if let Err(e) = result {
                    warn!(
                        destination = dest.adapter.id(),
                        events = batch.len(),
                        error = %e,
                        "Batch delivery failed, appending to fallback queue"
                    );
                    if let Err(fe) = self
                        .fallback
                        .append(dest.adapter.id(), batch, &e.to_string())
                        .await
                    {
                        warn!(error = %fe, "Fallback append failed, batch lost for this destination");
                    }
                }
            }
        });
        futures::future::join_all(sends).await;
    }

    /// One replay sweep over the fallback files.
    async fn replay_once(&self) {
        let files = match self.fallback.files_with_entries().await {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "Fallback scan failed");
                return;
            }
        };

        for (path, entries) in files {
            let total = entries.len();
            let mut remaining = Vec::new();
            for entry in entries {
                if !self.replay_entry(&entry).await {
                    remaining.push(entry);
                }
            }

            let outcome = if remaining.is_empty() {
                self.fallback.remove_file(&path).await
            } else if remaining.len() < total {
                self.fallback.rewrite_file(&path, &remaining).await
            } else {
                Ok(())
            };
            if let Err(e) = outcome {
                warn!(file = %path.display(), error = %e, "Fallback file maintenance failed");
            }
        }
    }

    /// Re-attempt one entry. Returns `true` when it can be dropped.
    async fn replay_entry(&self, entry: &FallbackEntry) -> bool {
        if entry.destination == EMITTER_FALLBACK_DESTINATION {
            // Diverted before any dispatch: deliver to every destination.
            let mut all_ok = true;
            for dest in self.destinations.iter() {
                if !self.try_replay_send(dest, &entry.events).await {
                    all_ok = false;
                }
            }
            return all_ok || self.destinations.is_empty();
        }

        match self
            .destinations
            .iter()
            .find(|d| d.adapter.id() == entry.destination)
        {
            Some(dest) => self.try_replay_send(dest, &entry.events).await,
            // Destination no longer configured: nothing left to deliver to.
            None => true,
        }
    }

    async fn try_replay_send(&self, dest: &Destination, events: &[AuditEvent]) -> bool {
        // While the circuit is not closed, a cheap health probe gates the
        // replay attempt so recovery does not burn the half-open probe on a
        // large batch.
        if dest.failsafe.circuit_breaker.state() != CircuitState::Closed
            && !dest.adapter.health_check().await.is_healthy()
        {
            return false;
        }

        match dest
            .failsafe
            .call("siem_replay", || dest.adapter.send_batch(events))
            .await
        {
            Ok(()) => {
                debug!(destination = dest.adapter.id(), events = events.len(), "Fallback batch replayed");
                true
            }
            Err(Error::CircuitOpen { .. }) => false,
            Err(e) => {
                debug!(destination = dest.adapter.id(), error = %e, "Fallback replay attempt failed");
                false
            }
        }
    }
}

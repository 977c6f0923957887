use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::anomaly::AnomalyEngine;
use crate::config::Config;
use crate::consumer::{ConsumeError, MessageSource, StreamConsumer};
use crate::event::{Alert, TelemetryEvent};
use crate::hub::{BroadcastHub, StatsSnapshot};
use crate::server::{AppState, HealthMetrics, Keepalive, Server};
use crate::store::EventStore;

/// Agent wires the pipeline together: consumer, anomaly engine, event
/// store, broadcast hub and the HTTP server.
///
/// Subscribers always see an event's `sensor_event` frame before that
/// event's alerts. Alerts are persisted and broadcast by a separate worker,
/// so they are ordered only relative to their own event: a later event's
/// `sensor_event` may arrive before an earlier event's alerts.
pub struct Agent<St: EventStore, S: MessageSource> {
    cfg: Config,
    health: Arc<HealthMetrics>,
    store: Arc<St>,
    engine: Arc<AnomalyEngine>,
    hub: Arc<BroadcastHub>,
    server: Server,
    source: Option<S>,
    consumer: Option<StreamConsumer<S>>,
    driver: Option<JoinHandle<()>>,
    alert_worker: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    /// Cancelled once the driver loop exits for any reason.
    done: CancellationToken,
    cancel: CancellationToken,
}

impl<St: EventStore, S: MessageSource> Agent<St, S> {
    /// Creates a new Agent, initializing metrics, engine and hub.
    pub fn new(cfg: Config, store: Arc<St>, source: S) -> Result<Self> {
        let health = Arc::new(HealthMetrics::new().context("creating health metrics")?);

        let engine = Arc::new(
            AnomalyEngine::new(cfg.anomaly.thresholds, cfg.anomaly.window_size)
                .context("creating anomaly engine")?,
        );

        let hub = Arc::new(BroadcastHub::new(
            cfg.hub.mailbox_capacity,
            Some(Arc::clone(&health)),
        ));

        let server = Server::new(&cfg.server.addr);

        Ok(Self {
            cfg,
            health,
            store,
            engine,
            hub,
            server,
            source: Some(source),
            consumer: None,
            driver: None,
            alert_worker: None,
            local_addr: None,
            done: CancellationToken::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn engine(&self) -> &Arc<AnomalyEngine> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<St> {
        &self.store
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Address the HTTP server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Token cancelled when the pipeline stops processing, either on
    /// shutdown or because the consumer ended.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Start all components and begin processing.
    pub async fn start(&mut self) -> Result<()> {
        let Some(source) = self.source.take() else {
            anyhow::bail!("agent already started");
        };

        // 0. Start the HTTP server first so probes respond during startup.
        let state = Arc::new(AppState {
            metrics: Arc::clone(&self.health),
            hub: Arc::clone(&self.hub),
            engine: Arc::clone(&self.engine),
            keepalive: Keepalive::from(&self.cfg.hub),
            max_message_size: self.cfg.hub.max_message_size,
        });
        let local_addr = self
            .server
            .start(state)
            .await
            .context("starting http server")?;
        self.local_addr = Some(local_addr);

        info!(
            window_size = self.cfg.anomaly.window_size,
            thresholds = ?self.engine.thresholds(),
            mailbox_capacity = self.cfg.hub.mailbox_capacity,
            "engine and hub ready",
        );

        // 1. Connect the consumer. A broker that cannot be reached aborts startup.
        let mut consumer = StreamConsumer::new(
            source,
            self.cfg.pipeline.event_channel_capacity,
            self.cfg.pipeline.error_channel_capacity,
            Some(Arc::clone(&self.health)),
        )
        .with_handoff_timeout(self.cfg.pipeline.shutdown_timeout);
        let events = consumer
            .take_events()
            .context("consumer event channel already taken")?;
        let errors = consumer
            .take_errors()
            .context("consumer error channel already taken")?;

        consumer
            .start(&self.cancel)
            .await
            .context("connecting to broker")?;
        info!(
            topics = ?self.cfg.broker.topics,
            group_id = %self.cfg.broker.group_id,
            "stream consumer started",
        );
        self.consumer = Some(consumer);

        // 2. Alert channel between the driver and the alert worker.
        let (alert_tx, alert_rx) = mpsc::channel(self.cfg.pipeline.alert_channel_capacity);

        // 3. Driver loop.
        self.driver = Some(self.spawn_driver(events, alert_tx));

        // 4. Alert worker.
        self.alert_worker = Some(self.spawn_alert_worker(alert_rx));

        // 5. Background monitors.
        self.spawn_stats_publisher();
        self.spawn_error_reporter(errors);
        if let Some(ttl) = self.cfg.anomaly.window_ttl {
            self.spawn_window_sweeper(ttl);
        }

        info!(addr = %local_addr, "agent fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    ///
    /// Events already read from the broker finish persistence and broadcast,
    /// bounded by `pipeline.shutdown_timeout`.
    pub async fn stop(&mut self) -> Result<()> {
        // Stop pulling; closes the event channel so the driver drains.
        if let Some(consumer) = &mut self.consumer {
            consumer.stop().await;
        }

        let driver = self.driver.take();
        let worker = self.alert_worker.take();
        let aborts: Vec<_> = driver
            .iter()
            .chain(worker.iter())
            .map(JoinHandle::abort_handle)
            .collect();

        let drain = async {
            for task in driver.into_iter().chain(worker) {
                if let Err(e) = task.await {
                    if !e.is_cancelled() {
                        error!(error = %e, "pipeline task panicked");
                    }
                }
            }
        };

        let timeout = self.cfg.pipeline.shutdown_timeout;
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(?timeout, "shutdown timeout elapsed, abandoning in-flight events");
            for handle in aborts {
                handle.abort();
            }
        }

        // Signal background monitors to stop.
        self.cancel.cancel();
        self.done.cancel();

        // Disconnect every subscriber.
        self.hub.close_all();

        self.server.stop().await?;

        info!("agent stopped");

        Ok(())
    }

    /// Spawn the loop that persists, analyzes and broadcasts each event.
    fn spawn_driver(
        &self,
        mut events: mpsc::Receiver<TelemetryEvent>,
        alerts: mpsc::Sender<Alert>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let engine = Arc::clone(&self.engine);
        let hub = Arc::clone(&self.hub);
        let health = Arc::clone(&self.health);
        let done = self.done.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let start = Instant::now();
                let event = Arc::new(event);

                // A failed write still goes out live.
                let event_id = match store.write(&event).await {
                    Ok(id) => {
                        health.events_persisted.inc();
                        Some(id)
                    }
                    Err(e) => {
                        warn!(
                            machine_id = %event.machine_id,
                            error = %e,
                            "persisting event failed",
                        );
                        health
                            .persistence_errors
                            .with_label_values(&["event", e.kind()])
                            .inc();
                        None
                    }
                };

                let raised = engine.analyze(Arc::clone(&event));

                hub.publish_event(&event);

                for alert in raised {
                    health
                        .alerts_raised
                        .with_label_values(&[alert.alert_type.as_str()])
                        .inc();
                    if alerts.send(alert.with_event_id(event_id)).await.is_err() {
                        warn!("alert worker gone, dropping alert");
                    }
                }

                health
                    .event_processing_duration
                    .observe(start.elapsed().as_secs_f64());
            }

            info!("driver loop drained");
            done.cancel();
        })
    }

    /// Spawn the worker that persists alerts and then broadcasts them.
    fn spawn_alert_worker(&self, mut alerts: mpsc::Receiver<Alert>) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let hub = Arc::clone(&self.hub);
        let health = Arc::clone(&self.health);

        tokio::spawn(async move {
            while let Some(alert) = alerts.recv().await {
                if let Err(e) = store.write_alert(&alert).await {
                    warn!(
                        machine_id = %alert.machine_id,
                        alert_type = %alert.alert_type,
                        error = %e,
                        "persisting alert failed",
                    );
                    health
                        .persistence_errors
                        .with_label_values(&["alert", e.kind()])
                        .inc();
                }

                hub.publish_alert(&alert);
            }

            info!("alert worker drained");
        })
    }

    /// Spawn the periodic aggregate publisher.
    fn spawn_stats_publisher(&self) {
        let cancel = self.cancel.clone();
        let store = Arc::clone(&self.store);
        let hub = Arc::clone(&self.hub);
        let engine = Arc::clone(&self.engine);
        let health = Arc::clone(&self.health);
        let interval = self.cfg.stats.interval;
        let window =
            chrono::Duration::from_std(self.cfg.stats.window).unwrap_or(chrono::Duration::hours(1));

        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        health.machine_windows.set(engine.machine_count() as f64);

                        let since = Utc::now() - window;
                        match store.aggregate(None, since).await {
                            Ok(stats) => {
                                hub.publish_stats(&StatsSnapshot {
                                    system_stats: stats,
                                    connected_clients: hub.client_count(),
                                    timestamp: Utc::now(),
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "aggregating stats failed");
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawn the consumer error reporter.
    fn spawn_error_reporter(&self, mut errors: mpsc::Receiver<ConsumeError>) {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);

        tokio::spawn(async move {
            loop {
                let err = tokio::select! {
                    _ = cancel.cancelled() => return,
                    err = errors.recv() => match err {
                        Some(err) => err,
                        None => return,
                    },
                };

                match err {
                    ConsumeError::Broker { error, fatal } => {
                        let severity = if fatal { "fatal" } else { "transient" };
                        health.broker_errors.with_label_values(&[severity]).inc();
                        if fatal {
                            error!(error = %error, "fatal broker error, consumer stopped");
                        } else {
                            warn!(error = %error, "broker error");
                        }
                    }
                    other => {
                        health
                            .events_invalid
                            .with_label_values(&[other.reason()])
                            .inc();
                        warn!(reason = other.reason(), error = %other, "dropped invalid message");
                    }
                }
            }
        });
    }

    /// Spawn the idle machine window sweeper.
    fn spawn_window_sweeper(&self, ttl: Duration) {
        let cancel = self.cancel.clone();
        let engine = Arc::clone(&self.engine);
        let health = Arc::clone(&self.health);
        let interval = self.cfg.anomaly.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let evicted = engine.evict_idle(ttl);
                        if evicted > 0 {
                            info!(evicted, ?ttl, "evicted idle machine windows");
                        }
                        health.machine_windows.set(engine.machine_count() as f64);
                    }
                }
            }
        });
    }
}

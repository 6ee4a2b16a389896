//! Container event reconciliation
//!
//! The [`Listener`] keeps the gateway's routing table in step with the
//! container source: a full resync at startup (and after every reconnect),
//! then one incremental mutation per lifecycle event.

use crate::container::{ContainerEvent, ContainerSource, EventAction, EventStream};
use crate::error::GatewayError;
use crate::gateway::Gateway;
use anyhow::Context;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reconnect timing for the event stream
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

/// Translates container lifecycle events into routing table mutations
pub struct Listener {
    source: Arc<dyn ContainerSource>,
    gateway: Arc<Gateway>,
    workers: Arc<Semaphore>,
    backoff: BackoffConfig,
}

impl Listener {
    /// `workers` bounds how many events are handled concurrently
    pub fn new(gateway: Arc<Gateway>, workers: usize) -> Self {
        Self {
            source: Arc::clone(gateway.source()),
            gateway,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            backoff: BackoffConfig::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Rebuild the routing table from the running containers
    pub async fn init(&self) -> Result<usize, GatewayError> {
        self.gateway.flush();
        self.gateway.load().await
    }

    /// Subscribe to events, resync, then consume events in the background.
    ///
    /// Subscribing happens before the resync so that events raised while the
    /// table loads are applied afterwards instead of lost. Failing to
    /// subscribe is an error; a failed resync is only logged.
    pub async fn start(self: Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<JoinHandle<()>> {
        let events = self
            .source
            .events()
            .await
            .context("Failed to subscribe to container events")?;

        if let Err(e) = self.init().await {
            warn!(error = %e, "Initial routing table load failed");
        }

        info!("Listening for container events");
        Ok(tokio::spawn(self.run(events, shutdown_rx)))
    }

    async fn run(self: Arc<Self>, mut events: EventStream, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if !self.consume(&mut events, &mut shutdown_rx).await {
                break;
            }

            match self.reconnect(&mut shutdown_rx).await {
                Some(stream) => events = stream,
                None => break,
            }
        }

        info!("Event listener shutting down");
    }

    /// Read events until the stream ends. Returns false on shutdown.
    async fn consume(self: &Arc<Self>, events: &mut EventStream, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        loop {
            tokio::select! {
                item = events.next() => match item {
                    Some(Ok(event)) => self.dispatch(event, shutdown_rx).await,
                    Some(Err(e)) => {
                        warn!(error = %e, "Container event stream failed");
                        return true;
                    }
                    None => {
                        warn!("Container event stream ended");
                        return true;
                    }
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return false;
                    }
                }
            }
        }
    }

    /// Re-subscribe with exponential backoff, then resync since events may
    /// have been missed. Returns `None` on shutdown.
    async fn reconnect(&self, shutdown_rx: &mut watch::Receiver<bool>) -> Option<EventStream> {
        let mut delay = self.backoff.initial;

        loop {
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting to container events");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return None;
                    }
                    continue;
                }
            }

            match self.source.events().await {
                Ok(stream) => {
                    match self.init().await {
                        Ok(count) => info!(containers = count, "Reconnected to container events"),
                        Err(e) => warn!(error = %e, "Routing table resync failed after reconnect"),
                    }
                    return Some(stream);
                }
                Err(e) => {
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "Failed to resubscribe to container events");
                    delay = (delay * 2).min(self.backoff.max);
                }
            }
        }
    }

    /// Hand an event to its own task once a worker slot is free
    async fn dispatch(self: &Arc<Self>, event: ContainerEvent, shutdown_rx: &watch::Receiver<bool>) {
        if event.is_keepalive() || event.action() == EventAction::Ignore {
            return;
        }

        if *shutdown_rx.borrow() {
            return;
        }

        let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
            return;
        };

        let listener = Arc::clone(self);
        tokio::spawn(async move {
            listener.handle_event(&event).await;
            drop(permit);
        });
    }

    /// Apply one lifecycle event to the routing table
    pub async fn handle_event(&self, event: &ContainerEvent) {
        if event.is_keepalive() {
            return;
        }

        match event.action() {
            EventAction::Start => match self.source.inspect(&event.id).await {
                Ok(container) => {
                    self.gateway.remove(&container);
                    match self.gateway.add(&container) {
                        Ok(()) => {}
                        Err(e @ GatewayError::AlreadyExists { .. }) => {
                            debug!(container_id = %event.id, error = %e, "Container already routed")
                        }
                        Err(e) => warn!(container_id = %event.id, error = %e, "Failed to add container"),
                    }
                }
                Err(e) => debug!(container_id = %event.id, error = %e, "Failed to inspect started container"),
            },
            EventAction::Remove => match self.source.inspect(&event.id).await {
                Ok(container) => {
                    self.gateway.remove(&container);
                }
                Err(e) => {
                    debug!(container_id = %event.id, error = %e, "Inspect failed, removing by id");
                    self.gateway.remove_by_id(&event.id);
                }
            },
            EventAction::Ignore => {}
        }
    }
}

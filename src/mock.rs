//! In-memory container source for tests (`test-util` feature)

use crate::container::{ContainerEvent, ContainerMetadata, ContainerSource, EventStream};
use crate::error::ContainerError;
use async_trait::async_trait;
use futures::StreamExt;
use hyper::body::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

type EventSender = mpsc::UnboundedSender<Result<ContainerEvent, ContainerError>>;

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    /// Ids listed as running that cannot be inspected
    ghosts: Vec<String>,
    logs: HashMap<String, Bytes>,
    exec_output: HashMap<String, Bytes>,
    exec_calls: Vec<(String, Vec<String>)>,
    log_requests: Vec<(String, String)>,
    subscribers: Vec<EventSender>,
}

struct MockContainer {
    metadata: ContainerMetadata,
    running: bool,
}

/// A scripted [`ContainerSource`].
///
/// Every call to [`ContainerSource::events`] opens a new subscription;
/// [`MockSource::emit`] delivers to all open subscriptions and
/// [`MockSource::close_events`] ends them, as a daemon restart would.
#[derive(Default)]
pub struct MockSource {
    state: Mutex<MockState>,
    fail_listing: AtomicBool,
    fail_inspect: AtomicBool,
    fail_events: AtomicBool,
    subscriptions: AtomicUsize,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_running(&self, metadata: ContainerMetadata) {
        self.insert(metadata, true);
    }

    pub fn insert_stopped(&self, metadata: ContainerMetadata) {
        self.insert(metadata, false);
    }

    fn insert(&self, metadata: ContainerMetadata, running: bool) {
        self.state
            .lock()
            .containers
            .insert(metadata.id.clone(), MockContainer { metadata, running });
    }

    /// Mark a container as no longer running. It can still be inspected.
    pub fn stop(&self, id: &str) {
        if let Some(container) = self.state.lock().containers.get_mut(id) {
            container.running = false;
        }
    }

    /// Forget a container entirely; inspecting it fails with `NotFound`
    pub fn destroy(&self, id: &str) {
        self.state.lock().containers.remove(id);
    }

    /// List an id as running without any inspectable container behind it
    pub fn list_ghost(&self, id: &str) {
        self.state.lock().ghosts.push(id.to_string());
    }

    pub fn set_logs(&self, id: &str, logs: impl Into<Bytes>) {
        self.state.lock().logs.insert(id.to_string(), logs.into());
    }

    pub fn set_exec_output(&self, id: &str, output: impl Into<Bytes>) {
        self.state.lock().exec_output.insert(id.to_string(), output.into());
    }

    /// Commands run through `exec`, by container id
    pub fn exec_calls(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().exec_calls.clone()
    }

    /// `(container id, tail)` for every `logs` call
    pub fn log_requests(&self) -> Vec<(String, String)> {
        self.state.lock().log_requests.clone()
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    pub fn fail_inspect(&self, fail: bool) {
        self.fail_inspect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_events(&self, fail: bool) {
        self.fail_events.store(fail, Ordering::SeqCst);
    }

    /// Total number of event subscriptions ever opened
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Deliver an event to every open subscription. Returns how many received it.
    pub fn emit(&self, event: ContainerEvent) -> usize {
        self.broadcast(Ok(event))
    }

    /// Deliver a stream error to every open subscription
    pub fn emit_error(&self, message: &str) -> usize {
        self.broadcast(Err(ContainerError::Stream(message.to_string())))
    }

    fn broadcast(&self, item: Result<ContainerEvent, ContainerError>) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|tx| !tx.is_closed());

        let mut delivered = 0;
        for tx in &state.subscribers {
            let item = match &item {
                Ok(event) => Ok(event.clone()),
                Err(e) => Err(ContainerError::Stream(e.to_string())),
            };
            if tx.send(item).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// End every open event stream
    pub fn close_events(&self) {
        self.state.lock().subscribers.clear();
    }

    fn container(&self, id: &str) -> Result<ContainerMetadata, ContainerError> {
        self.state
            .lock()
            .containers
            .get(id)
            .map(|c| c.metadata.clone())
            .ok_or_else(|| ContainerError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl ContainerSource for MockSource {
    async fn list_running(&self) -> Result<Vec<String>, ContainerError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(ContainerError::Api("listing unavailable".to_string()));
        }

        let state = self.state.lock();
        let mut ids: Vec<String> = state
            .containers
            .values()
            .filter(|c| c.running)
            .map(|c| c.metadata.id.clone())
            .collect();
        ids.sort();
        ids.extend(state.ghosts.iter().cloned());
        Ok(ids)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerMetadata, ContainerError> {
        if self.fail_inspect.load(Ordering::SeqCst) {
            return Err(ContainerError::Api("inspect unavailable".to_string()));
        }
        self.container(id)
    }

    async fn events(&self) -> Result<EventStream, ContainerError> {
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(ContainerError::Api("events unavailable".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().subscribers.push(tx);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn logs(&self, id: &str, tail: &str) -> Result<Bytes, ContainerError> {
        self.container(id)?;

        let mut state = self.state.lock();
        state.log_requests.push((id.to_string(), tail.to_string()));
        Ok(state.logs.get(id).cloned().unwrap_or_default())
    }

    async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<Bytes, ContainerError> {
        self.container(id)?;

        let mut state = self.state.lock();
        let output = state.exec_output.get(id).cloned().unwrap_or_default();
        state.exec_calls.push((id.to_string(), cmd));
        Ok(output)
    }
}

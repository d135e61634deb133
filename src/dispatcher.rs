//! Event dispatching: a poll loop that pulls events off the RPC connection
//! and fans them out to per-name queues or registered handlers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex as SyncMutex;
use regex::Regex;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};

use crate::error::{Result, Sl4aError};
use crate::rpc_client::RpcClient;

/// Sentinel event name used to unwind the poll loop on session teardown.
pub const SHUTDOWN_EVENT: &str = "EventDispatcherShutdown";

/// The default number of seconds a pop/wait call blocks for.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// The number of concurrent poll/handler workers the dispatcher allows.
const MAX_WORKERS: usize = 32;

/// One event received from the agent.
#[derive(Debug, Clone)]
pub struct Event {
    /// The event's name, as reported by the agent.
    pub name: String,
    /// The agent-side timestamp the event was raised at.
    pub time: i64,
    /// The event's payload.
    pub data: Value,
}

/// A callback invoked with every event of a given name, instead of
/// queuing it for `pop_event`/`pop_events`.
pub type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// A dispatcher's lifecycle. Transitions are one-way: `New -> Started ->
/// Closed`. Handlers may only be registered and polling may only begin
/// while `New`; once `Closed`, the dispatcher is inert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    New,
    Started,
    Closed,
}

struct State {
    lifecycle: Lifecycle,
    poll_task: Option<JoinHandle<()>>,
}

/// Dispatches events for one SL4A session.
pub struct EventDispatcher {
    serial: String,
    rpc_client: Arc<RpcClient>,
    event_wait_ms: u64,
    event_rpc_timeout: Duration,
    state: Mutex<State>,
    queues: SyncMutex<HashMap<String, VecDeque<Event>>>,
    handlers: SyncMutex<HashMap<String, Handler>>,
    notify: Notify,
    tasks: Mutex<JoinSet<()>>,
    workers: Arc<Semaphore>,
}

impl EventDispatcher {
    /// Creates a dispatcher bound to the given session's RPC client.
    ///
    /// `event_wait_ms` is the poll duration passed to the agent's
    /// `eventWait` RPC; `event_rpc_timeout` is the RPC-level timeout
    /// wrapped around each of those calls.
    ///
    /// Handlers may be registered, but polling does not begin until
    /// [`EventDispatcher::start`] is called.
    pub fn new(
        serial: impl Into<String>,
        rpc_client: Arc<RpcClient>,
        event_wait_ms: u64,
        event_rpc_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            serial: serial.into(),
            rpc_client,
            event_wait_ms,
            event_rpc_timeout,
            state: Mutex::new(State {
                lifecycle: Lifecycle::New,
                poll_task: None,
            }),
            queues: SyncMutex::new(HashMap::new()),
            handlers: SyncMutex::new(HashMap::new()),
            notify: Notify::new(),
            tasks: Mutex::new(JoinSet::new()),
            workers: Arc::new(Semaphore::new(MAX_WORKERS)),
        })
    }

    /// Registers a handler for `event_name`. Events of that name are
    /// delivered to the handler as they arrive, instead of being queued.
    ///
    /// Must be called before [`EventDispatcher::start`]; at most one
    /// handler may be registered per event name.
    pub async fn register_handler(
        &self,
        event_name: impl Into<String>,
        handler: Handler,
    ) -> Result<()> {
        let lifecycle = self.state.lock().await.lifecycle;
        if lifecycle != Lifecycle::New {
            return Err(Sl4aError::IllegalState(
                "handlers can only be registered before the dispatcher is started",
            ));
        }
        let event_name = event_name.into();
        let mut handlers = self.handlers.lock();
        if handlers.contains_key(&event_name) {
            return Err(Sl4aError::Duplicate(event_name));
        }
        handlers.insert(event_name, handler);
        Ok(())
    }

    /// Starts the background poll loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.lifecycle != Lifecycle::New {
            return Err(Sl4aError::IllegalState(
                "dispatcher has already been started or closed",
            ));
        }
        state.lifecycle = Lifecycle::Started;
        let dispatcher = self.clone();
        state.poll_task = Some(tokio::spawn(async move { dispatcher.poll_loop().await }));
        Ok(())
    }

    async fn poll_loop(self: Arc<Self>) {
        loop {
            {
                let state = self.state.lock().await;
                if state.lifecycle != Lifecycle::Started {
                    return;
                }
            }
            match self.poll_once().await {
                Ok(None) => continue,
                Ok(Some(event)) if event.name == SHUTDOWN_EVENT => {
                    debug!(serial = %self.serial, "received shutdown signal");
                    return;
                }
                Ok(Some(event)) => self.route(event),
                Err(Sl4aError::Connection(_)) if !self.rpc_client.is_alive() => {
                    warn!(serial = %self.serial, "closing due to closed session");
                    return;
                }
                Err(e) => {
                    warn!(serial = %self.serial, error = %e, "closing due to error");
                    return;
                }
            }
        }
    }

    async fn poll_once(&self) -> Result<Option<Event>> {
        let value = self
            .rpc_client
            .rpc(
                "eventWait",
                vec![serde_json::json!(self.event_wait_ms)],
                Some(self.event_rpc_timeout),
                3,
            )
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        let name = match value.get("name").and_then(|v| v.as_str()) {
            Some(n) => n.to_string(),
            None => {
                error!(event = %value, "received malformed event");
                return Ok(None);
            }
        };
        let time = value.get("time").and_then(|v| v.as_i64()).unwrap_or(0);
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        Ok(Some(Event { name, time, data }))
    }

    fn route(self: &Arc<Self>, event: Event) {
        let handler = self.handlers.lock().get(&event.name).cloned();
        match handler {
            Some(handler) => {
                debug!(event = event.name, "dispatching to registered handler");
                self.spawn_handler(handler, event);
            }
            None => {
                debug!(event = event.name, "queuing event");
                self.queues
                    .lock()
                    .entry(event.name.clone())
                    .or_default()
                    .push_back(event);
                self.notify.notify_waiters();
            }
        }
    }

    fn spawn_handler(self: &Arc<Self>, handler: Handler, event: Event) {
        let workers = self.workers.clone();
        let dispatcher = self.clone();
        let fut = async move {
            let _permit = workers.acquire_owned().await;
            handler(event).await;
        };
        // Best-effort: if the task tracker lock is contended this falls
        // back to a detached spawn rather than blocking the poll loop.
        if let Ok(mut tasks) = dispatcher.tasks.try_lock() {
            tasks.spawn(fut);
        } else {
            tokio::spawn(fut);
        }
    }

    fn try_pop(&self, event_name: &str) -> Option<Event> {
        self.queues.lock().get_mut(event_name).and_then(VecDeque::pop_front)
    }

    /// Pops the oldest queued event of `event_name`, blocking up to
    /// `timeout` if none is available yet. `None` timeout blocks forever;
    /// `Some(Duration::ZERO)` raises [`Sl4aError::EmptyQueue`] immediately
    /// if nothing is queued.
    pub async fn pop_event(&self, event_name: &str, timeout: Option<Duration>) -> Result<Event> {
        self.require_started().await?;
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            if let Some(event) = self.try_pop(event_name) {
                return Ok(event);
            }
            match deadline {
                None => self.notify.notified().await,
                Some(d) => {
                    let remaining = d.saturating_duration_since(tokio::time::Instant::now());
                    if remaining.is_zero() {
                        return Err(Sl4aError::EmptyQueue(format!(
                            "no event named {event_name} within the requested timeout"
                        )));
                    }
                    let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
                }
            }
        }
    }

    /// Waits for an event of `event_name` satisfying `predicate`.
    ///
    /// Events of the same name that don't match are discarded as they're
    /// examined, unless `consume_ignored_events` is `false`, in which case
    /// they're peeked and pushed back onto the queue once the search ends
    /// (whether it ends in a match or a timeout).
    pub async fn wait_for_event(
        &self,
        event_name: &str,
        mut predicate: impl FnMut(&Event) -> bool,
        timeout: Duration,
        consume_ignored_events: bool,
    ) -> Result<Event> {
        self.require_started().await?;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut ignored = Vec::new();
        loop {
            match self.pop_event(event_name, Some(Duration::from_secs(1))).await {
                Ok(event) => {
                    if !consume_ignored_events {
                        ignored.push(event.clone());
                    }
                    if predicate(&event) {
                        self.requeue(event_name, ignored);
                        return Ok(event);
                    }
                }
                Err(Sl4aError::EmptyQueue(_)) => {}
                Err(e) => {
                    self.requeue(event_name, ignored);
                    return Err(e);
                }
            }
            if tokio::time::Instant::now() > deadline {
                self.requeue(event_name, ignored);
                return Err(Sl4aError::EmptyQueue(format!(
                    "timeout after {timeout:?} waiting for event: {event_name}"
                )));
            }
        }
    }

    fn requeue(&self, event_name: &str, ignored: Vec<Event>) {
        if ignored.is_empty() {
            return;
        }
        let mut queues = self.queues.lock();
        let queue = queues.entry(event_name.to_string()).or_default();
        for event in ignored {
            queue.push_back(event);
        }
        self.notify.notify_waiters();
    }

    /// Pops one event from each queue whose name matches `regex_pattern`,
    /// waiting up to `timeout` for at least one match to appear. Results
    /// are sorted by timestamp, ascending.
    pub async fn pop_events(
        &self,
        regex_pattern: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Vec<Event>> {
        self.require_started().await?;
        let regex = Regex::new(regex_pattern)
            .map_err(|_| Sl4aError::Protocol("invalid event name pattern"))?;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut results;
        loop {
            results = self.match_and_pop(&regex);
            if !results.is_empty() || tokio::time::Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(poll_interval).await;
        }
        if results.is_empty() {
            error!(pattern = regex_pattern, "timeout waiting for matching event");
            return Err(Sl4aError::EmptyQueue(format!(
                "timeout after {timeout:?} waiting for event matching: {regex_pattern}"
            )));
        }
        results.sort_by_key(|event| event.time);
        Ok(results)
    }

    fn match_and_pop(&self, regex: &Regex) -> Vec<Event> {
        let mut queues = self.queues.lock();
        let mut results = Vec::new();
        for (name, queue) in queues.iter_mut() {
            if regex.is_match(name) {
                if let Some(event) = queue.pop_front() {
                    results.push(event);
                }
            }
        }
        results
    }

    /// Returns and removes every currently queued event of `event_name`.
    pub async fn pop_all(&self, event_name: &str) -> Result<Vec<Event>> {
        self.require_started().await?;
        let mut queues = self.queues.lock();
        Ok(queues
            .get_mut(event_name)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default())
    }

    /// Unconditionally clears every queued event of `event_name`.
    pub fn clear_events(&self, event_name: &str) {
        if let Some(queue) = self.queues.lock().get_mut(event_name) {
            queue.clear();
        }
    }

    /// Clears every queue and every cached event.
    pub fn clear_all_events(&self) {
        self.queues.lock().clear();
    }

    async fn require_started(&self) -> Result<()> {
        if self.state.lock().await.lifecycle != Lifecycle::Started {
            return Err(Sl4aError::IllegalState(
                "dispatcher needs to be started before use",
            ));
        }
        Ok(())
    }

    /// Stops the poll loop, waits for outstanding handler tasks to
    /// finish, and clears all queues.
    ///
    /// Should only be called after the owning session's RPC client has
    /// issued `closeSl4aSession`. Idempotent: closing an already-closed
    /// dispatcher is a no-op.
    pub async fn close(&self) {
        let poll_task = {
            let mut state = self.state.lock().await;
            if state.lifecycle != Lifecycle::Started {
                return;
            }
            state.lifecycle = Lifecycle::Closed;
            state.poll_task.take()
        };
        self.notify.notify_waiters();
        if let Some(task) = poll_task {
            let _ = task.await;
        }
        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
        self.clear_all_events();
    }
}

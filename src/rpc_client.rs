//! The connection pool and RPC call discipline for a single SL4A session.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::connection::{Connection, SOCKET_TIMEOUT};
use crate::error::{Result, Sl4aError};
use crate::port::Ports;

/// The default maximum number of connections a client may open at once.
pub const DEFAULT_MAX_CONNECTIONS: usize = 15;

/// The default number of attempts an RPC call makes before giving up.
pub const DEFAULT_RETRIES: u32 = 3;

/// The default backoff between checkout attempts against a full pool.
const DEFAULT_CHECKOUT_BACKOFF: Duration = Duration::from_millis(10);

/// Creates a new connection for the session this client belongs to.
pub type ConnectionFactory = Arc<dyn Fn(i64) -> BoxFuture<'static, Result<Connection>> + Send + Sync>;

/// Invoked with the ports of a connection that just failed, so the owning
/// session can kick off diagnostics.
pub type ErrorCallback = Arc<dyn Fn(Ports) -> BoxFuture<'static, ()> + Send + Sync>;

struct Pool {
    free: SyncMutex<VecDeque<Arc<Connection>>>,
    /// Connections currently checked out by an in-flight `rpc()` call,
    /// keyed by a per-checkout id so `terminate()` can find and close them
    /// even while they're in use.
    checked_out: SyncMutex<HashMap<u64, Arc<Connection>>>,
    next_id: AtomicU64,
    /// Kept in lockstep with `free.len() + checked_out.len()`. Reserved
    /// before a connection is actually created so concurrent callers can't
    /// overshoot the cap.
    total: AtomicUsize,
}

impl Pool {
    fn new() -> Self {
        Self {
            free: SyncMutex::new(VecDeque::new()),
            checked_out: SyncMutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            total: AtomicUsize::new(0),
        }
    }
}

/// An RPC client capable of processing multiple RPCs concurrently over a
/// pool of connections to one SL4A session.
pub struct RpcClient {
    serial: String,
    uid: AtomicI64,
    pool: Pool,
    max_connections: usize,
    checkout_backoff: Duration,
    retries: u32,
    default_timeout: Duration,
    create_connection: ConnectionFactory,
    on_error: ErrorCallback,
    alive: AtomicBool,
}

impl RpcClient {
    /// Creates a new client, eagerly opening the first connection to learn
    /// the session's UID.
    pub async fn new(
        uid: i64,
        serial: impl Into<String>,
        on_error: ErrorCallback,
        create_connection: ConnectionFactory,
        max_connections: Option<usize>,
    ) -> Result<Arc<Self>> {
        Self::new_with_backoff(
            uid,
            serial,
            on_error,
            create_connection,
            max_connections,
            DEFAULT_CHECKOUT_BACKOFF,
        )
        .await
    }

    /// Like [`RpcClient::new`], but with an explicit checkout backoff
    /// instead of the default.
    pub async fn new_with_backoff(
        uid: i64,
        serial: impl Into<String>,
        on_error: ErrorCallback,
        create_connection: ConnectionFactory,
        max_connections: Option<usize>,
        checkout_backoff: Duration,
    ) -> Result<Arc<Self>> {
        Self::new_with_config(
            uid,
            serial,
            on_error,
            create_connection,
            max_connections,
            checkout_backoff,
            DEFAULT_RETRIES,
            SOCKET_TIMEOUT,
        )
        .await
    }

    /// Like [`RpcClient::new_with_backoff`], additionally setting the
    /// default retry count and per-call timeout used by
    /// [`RpcClient::call`]/[`RpcClient::call_with_timeout`].
    #[allow(clippy::too_many_arguments)]
    pub async fn new_with_config(
        uid: i64,
        serial: impl Into<String>,
        on_error: ErrorCallback,
        create_connection: ConnectionFactory,
        max_connections: Option<usize>,
        checkout_backoff: Duration,
        retries: u32,
        default_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let first = create_connection(uid).await?;
        let adopted_uid = first.uid();
        let pool = Pool::new();
        pool.free.lock().push_back(Arc::new(first));
        pool.total.store(1, Ordering::SeqCst);

        Ok(Arc::new(Self {
            serial: serial.into(),
            uid: AtomicI64::new(adopted_uid),
            pool,
            max_connections: max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            checkout_backoff,
            retries: retries.max(1),
            default_timeout,
            create_connection,
            on_error,
            alive: AtomicBool::new(true),
        }))
    }

    /// The session UID this client's connections were adopted into.
    pub fn uid(&self) -> i64 {
        self.uid.load(Ordering::SeqCst)
    }

    /// Whether the client has not yet been terminated.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn checkout(&self) -> Result<(u64, Arc<Connection>)> {
        loop {
            if !self.is_alive() {
                return Err(Sl4aError::Terminated);
            }

            if let Some(conn) = self.pool.free.lock().pop_front() {
                return Ok(self.track_checkout(conn));
            }

            let current = self.pool.total.load(Ordering::SeqCst);
            if current < self.max_connections {
                if self
                    .pool
                    .total
                    .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    match (self.create_connection)(self.uid()).await {
                        Ok(conn) => {
                            if !self.is_alive() {
                                let _ = conn.close().await;
                                self.pool.total.fetch_sub(1, Ordering::SeqCst);
                                return Err(Sl4aError::Terminated);
                            }
                            return Ok(self.track_checkout(Arc::new(conn)));
                        }
                        Err(e) => {
                            self.pool.total.fetch_sub(1, Ordering::SeqCst);
                            return Err(e);
                        }
                    }
                }
                continue;
            }

            tokio::time::sleep(self.checkout_backoff).await;
        }
    }

    fn track_checkout(&self, connection: Arc<Connection>) -> (u64, Arc<Connection>) {
        let id = self.pool.next_id.fetch_add(1, Ordering::SeqCst);
        self.pool.checked_out.lock().insert(id, connection.clone());
        (id, connection)
    }

    async fn release(&self, id: u64, connection: Arc<Connection>) {
        self.pool.checked_out.lock().remove(&id);
        // Re-queuing under the same lock `terminate()` drains from, and
        // only while still alive, closes the race where a connection
        // checked out just before termination would otherwise come back
        // to a pool that `terminate()` has already drained.
        let should_close = {
            let mut free = self.pool.free.lock();
            if self.alive.load(Ordering::SeqCst) {
                free.push_back(connection.clone());
                false
            } else {
                true
            }
        };
        if should_close {
            let _ = connection.close().await;
        }
    }

    fn discard(&self, id: u64) {
        self.pool.checked_out.lock().remove(&id);
        self.pool.total.fetch_sub(1, Ordering::SeqCst);
    }

    /// Sends an RPC to the agent and waits for its result.
    ///
    /// Retries up to `retries` times on an empty response (the agent is
    /// slow to answer, not dead). A timed-out connection is closed and
    /// dropped from the pool rather than returned to it.
    pub async fn rpc(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Option<Duration>,
        retries: u32,
    ) -> Result<Value> {
        if !self.is_alive() {
            return Err(Sl4aError::Terminated);
        }
        let (checkout_id, connection) = self.checkout().await?;
        let ticket = connection.next_ticket();
        if let Some(t) = timeout {
            connection.set_timeout(t).await;
        }
        let request = serde_json::to_string(&serde_json::json!({
            "id": ticket,
            "method": method,
            "params": params,
        }))?;

        let mut response = String::new();
        let mut timed_out = false;
        let mut call_error: Option<Sl4aError> = None;

        for attempt in 1..=retries.max(1) {
            match connection.send_request(&request).await {
                Ok(()) => {}
                Err(e) => {
                    if self.is_alive() {
                        warn!(%method, error = %e, "device disconnected during rpc call");
                        (self.on_error)(connection.ports()).await;
                    }
                    call_error = Some(Sl4aError::Connection(e.to_string()));
                    break;
                }
            }

            match connection.get_response(timeout.unwrap_or(SOCKET_TIMEOUT)).await {
                Ok(resp) if resp.is_empty() => {
                    if attempt < retries {
                        warn!(%method, attempt, "no response for rpc method");
                        continue;
                    }
                    (self.on_error)(connection.ports()).await;
                    call_error = Some(Sl4aError::Protocol("no response from server"));
                }
                Ok(resp) => {
                    response = resp;
                }
                Err(Sl4aError::RpcTimeout(msg)) => {
                    timed_out = true;
                    warn!(%method, ticket, "rpc timed out after {msg}");
                    let _ = connection.close().await;
                    call_error = Some(Sl4aError::RpcTimeout(msg));
                }
                Err(e) => {
                    call_error = Some(e);
                }
            }
            break;
        }

        if timed_out {
            self.discard(checkout_id);
        } else {
            if timeout.is_some() {
                connection.set_timeout(SOCKET_TIMEOUT).await;
            }
            self.release(checkout_id, connection).await;
        }

        if let Some(e) = call_error {
            return Err(e);
        }

        let result = Connection::parse_response(&response)?;
        if let Some(error_value) = result.get("error") {
            if !error_value.is_null() {
                let api_error = match error_value {
                    Value::Object(map) => Sl4aError::Api {
                        message: map
                            .get("message")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        code: map.get("code").and_then(|v| v.as_i64()).unwrap_or(-1),
                        data: map.get("data").cloned().unwrap_or(Value::Null),
                        rpc_name: method.to_string(),
                    },
                    other => Sl4aError::Api {
                        message: other.to_string(),
                        code: -1,
                        data: Value::Null,
                        rpc_name: method.to_string(),
                    },
                };
                warn!(error = %api_error, "rpc returned an error");
                return Err(api_error);
            }
        }
        let response_id = result.get("id").and_then(|v| v.as_u64());
        if response_id != Some(ticket) {
            tracing::error!(%method, ?response_id, ticket, "mismatched rpc id");
            return Err(Sl4aError::Protocol("mismatched api id"));
        }
        Ok(result.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Convenience wrapper around [`RpcClient::rpc`] using this client's
    /// configured retry count and default timeout.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.rpc(method, params, Some(self.default_timeout), self.retries).await
    }

    /// Convenience wrapper with an explicit per-call timeout.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        self.rpc(method, params, Some(timeout), self.retries).await
    }

    /// Closes every connection, free or checked out, and marks the client
    /// dead. Further `rpc` calls will fail fast.
    ///
    /// Connections checked out by an in-flight `rpc()` call are closed
    /// here too, not just leaked back to their caller: once this returns,
    /// both the free and checked-out sets are empty.
    pub async fn terminate(&self) {
        let mut connections: Vec<Arc<Connection>> = {
            let mut free = self.pool.free.lock();
            self.alive.store(false, Ordering::SeqCst);
            free.drain(..).collect()
        };

        let checked_out: Vec<Arc<Connection>> =
            self.pool.checked_out.lock().drain().map(|(_, c)| c).collect();
        if !checked_out.is_empty() {
            warn!(
                count = checked_out.len(),
                "connections are still checked out; closing them now during termination"
            );
        }
        connections.extend(checked_out);

        for connection in &connections {
            debug!(ports = %connection.ports(), "closing connection");
        }
        for connection in connections.drain(..) {
            let _ = connection.close().await;
        }
        self.pool.total.store(0, Ordering::SeqCst);
    }

    /// The device serial this client's session lives on, for logging.
    pub fn serial(&self) -> &str {
        &self.serial
    }
}

/// A handle that issues RPC calls on a bounded worker pool so a caller can
/// fire off a lengthy call and keep doing other work.
///
/// The worker count is capped at `max(max_connections - 2, 1)`, mirroring
/// the underlying connection pool's own headroom so background calls can't
/// starve synchronous ones.
pub struct AsyncRpcClient {
    client: Arc<RpcClient>,
    semaphore: Arc<Semaphore>,
}

impl AsyncRpcClient {
    /// Wraps an [`RpcClient`] with a bounded-concurrency async façade.
    pub fn new(client: Arc<RpcClient>) -> Self {
        let workers = (client.max_connections.saturating_sub(2)).max(1);
        Self {
            client,
            semaphore: Arc::new(Semaphore::new(workers)),
        }
    }

    /// Spawns an RPC call on the worker pool and returns a handle to its
    /// result.
    pub fn rpc(
        &self,
        method: impl Into<String>,
        params: Vec<Value>,
    ) -> tokio::task::JoinHandle<Result<Value>> {
        let client = self.client.clone();
        let semaphore = self.semaphore.clone();
        let method = method.into();
        tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("async rpc semaphore should never be closed");
            client.call(&method, params).await
        })
    }
}

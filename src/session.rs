//! Session lifecycle: port forwarding, first-connection UID adoption, and
//! coordinated teardown of the RPC client and event dispatcher.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::adb::Adb;
use crate::connection::{Connection, UNKNOWN_UID};
use crate::dispatcher::EventDispatcher;
use crate::error::{Result, Sl4aError};
use crate::port::Ports;
use crate::rpc_client::{ConnectionFactory, ErrorCallback, RpcClient};
use crate::Sl4aConfig;

/// Resolves a hinted device port to the port an agent server is actually
/// listening on, starting a new server if necessary.
pub type ObtainServerPort = Arc<dyn Fn(u16) -> BoxFuture<'static, Result<u16>> + Send + Sync>;

struct SessionState {
    adb: Arc<dyn Adb>,
    server_port: SyncMutex<u16>,
    host_port: u16,
    obtain_server_port: ObtainServerPort,
    handshake_timeout: std::time::Duration,
}

impl SessionState {
    /// Forwards `server_port` to the host, retrying with an OS-assigned
    /// port if the hinted one can't be bound.
    async fn create_forwarded_port(&self, server_port: u16, hinted_port: u16) -> Result<u16> {
        let mut hint = hinted_port;
        if hint == 0 && self.adb.version_number().await? < 37 {
            return Err(Sl4aError::Start(
                "adb does not support automatic port forwarding; upgrade to 1.0.37 or newer"
                    .to_string(),
            ));
        }
        loop {
            match self.adb.tcp_forward(hint, server_port).await {
                Ok(port) => return Ok(port),
                Err(Sl4aError::Adb(msg)) if msg.contains("cannot bind listener") => {
                    warn!(
                        hint,
                        server_port, %msg, "unable to forward to device port, trying a random port"
                    );
                    hint = 0;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn create_rpc_connection(self: &Arc<Self>, uid: i64) -> Result<Connection> {
        let hinted_server_port = *self.server_port.lock();
        let resolved_server_port = (self.obtain_server_port)(hinted_server_port).await?;
        *self.server_port.lock() = resolved_server_port;

        let forwarded_port = self
            .create_forwarded_port(resolved_server_port, 0)
            .await?;
        let ports = Ports::new(self.host_port, forwarded_port, resolved_server_port);
        let connection =
            Connection::connect(self.adb.clone(), ports, uid, self.handshake_timeout).await?;
        connection.open().await?;
        Ok(connection)
    }
}

/// Tracks the state of one SL4A session: its RPC connection pool and, if
/// created, its event dispatcher.
pub struct Sl4aSession {
    state: Arc<SessionState>,
    uid: AtomicI64,
    terminate_lock: Mutex<()>,
    terminated: AtomicBool,
    on_error_callback: ErrorCallback,
    rpc_client: Arc<RpcClient>,
    event_dispatcher: Mutex<Option<Arc<EventDispatcher>>>,
    event_wait_ms: u64,
    event_rpc_timeout: std::time::Duration,
}

impl Sl4aSession {
    /// Creates a new session: forwards a port to the device, opens the
    /// first connection, and adopts its UID.
    pub async fn create(
        adb: Arc<dyn Adb>,
        host_port: u16,
        device_port: u16,
        obtain_server_port: ObtainServerPort,
        on_error_callback: ErrorCallback,
        max_connections: Option<usize>,
        config: &Sl4aConfig,
    ) -> Result<Arc<Self>> {
        let state = Arc::new(SessionState {
            adb: adb.clone(),
            server_port: SyncMutex::new(device_port),
            host_port,
            obtain_server_port,
            handshake_timeout: config.handshake_timeout,
        });

        let factory_state = state.clone();
        let factory: ConnectionFactory = Arc::new(move |uid: i64| {
            let factory_state = factory_state.clone();
            Box::pin(async move { factory_state.create_rpc_connection(uid).await })
        });

        let error_state_callback = on_error_callback.clone();
        let rpc_client = RpcClient::new_with_config(
            UNKNOWN_UID,
            adb.serial().to_string(),
            error_state_callback,
            factory,
            max_connections,
            config.checkout_backoff,
            config.retries,
            config.rpc_timeout,
        )
        .await?;

        Ok(Arc::new(Self {
            state,
            uid: AtomicI64::new(rpc_client.uid()),
            terminate_lock: Mutex::new(()),
            terminated: AtomicBool::new(false),
            on_error_callback,
            rpc_client,
            event_dispatcher: Mutex::new(None),
            event_wait_ms: config.event_wait_ms,
            event_rpc_timeout: config.event_rpc_timeout,
        }))
    }

    /// The session's UID, adopted from the first connection's handshake.
    pub fn uid(&self) -> i64 {
        self.uid.load(Ordering::SeqCst)
    }

    /// The device-side port the agent's server is listening on.
    pub fn server_port(&self) -> u16 {
        *self.state.server_port.lock()
    }

    /// Whether the session has not yet been terminated.
    pub fn is_alive(&self) -> bool {
        !self.terminated.load(Ordering::SeqCst)
    }

    /// This session's RPC client.
    pub fn rpc_client(&self) -> &Arc<RpcClient> {
        &self.rpc_client
    }

    /// Returns this session's event dispatcher, creating it on first use.
    pub async fn event_dispatcher(&self) -> Arc<EventDispatcher> {
        let mut slot = self.event_dispatcher.lock().await;
        if let Some(dispatcher) = slot.as_ref() {
            return dispatcher.clone();
        }
        let dispatcher = EventDispatcher::new(
            self.state.adb.serial().to_string(),
            self.rpc_client.clone(),
            self.event_wait_ms,
            self.event_rpc_timeout,
        );
        *slot = Some(dispatcher.clone());
        dispatcher
    }

    /// Runs the full diagnostic chain for a connection failure on this
    /// session.
    pub async fn diagnose_failure(&self, ports: Ports) {
        (self.on_error_callback)(ports).await;
    }

    /// Terminates the session: closes the RPC session, stops the event
    /// dispatcher, and tears down the connection pool, in that order.
    ///
    /// Returns after every event still in flight has been handled.
    /// Idempotent: terminating an already-terminated session is a no-op.
    pub async fn terminate(&self) {
        let _guard = self.terminate_lock.lock().await;
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        debug!(uid = self.uid(), "terminating session");

        match self.rpc_client.call("closeSl4aSession", vec![]).await {
            Ok(_) => {}
            Err(Sl4aError::Terminated) => {}
            Err(e) => warn!(error = %e, "error closing sl4a session"),
        }
        // Marked after closeSl4aSession so the rpc client doesn't treat
        // its own call as happening against a dead session.
        self.terminated.store(true, Ordering::SeqCst);

        if let Some(dispatcher) = self.event_dispatcher.lock().await.as_ref() {
            dispatcher.close().await;
        }
        self.rpc_client.terminate().await;
    }
}

//! The process-wide registry of SL4A managers, one per device serial, plus
//! agent lifecycle (install check, service start/stop) and server-port
//! discovery.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tracing::warn;

use crate::adb::{self, Adb};
use crate::error::{Result, Sl4aError};
use crate::port::Ports;
use crate::reporter::{ErrorReporter, ReportContext};
use crate::session::Sl4aSession;
use crate::Sl4aConfig;

static MANAGERS: OnceLock<SyncMutex<HashMap<String, Arc<Sl4aManager>>>> = OnceLock::new();

fn registry() -> &'static SyncMutex<HashMap<String, Arc<Sl4aManager>>> {
    MANAGERS.get_or_init(|| SyncMutex::new(HashMap::new()))
}

/// Returns the manager for this device, creating it if this is the first
/// time the serial has been seen.
///
/// There is exactly one manager per device serial, process-wide, since
/// two managers racing to install/start/stop the same on-device agent
/// would corrupt each other's bookkeeping.
pub fn get_or_create_manager(adb: Arc<dyn Adb>, config: Sl4aConfig) -> Arc<Sl4aManager> {
    let mut managers = registry().lock();
    if let Some(existing) = managers.get(adb.serial()) {
        warn!(
            serial = adb.serial(),
            "attempted to create a second manager for an already-managed device"
        );
        return existing.clone();
    }
    let manager = Sl4aManager::new(adb.clone(), config);
    managers.insert(adb.serial().to_string(), manager.clone());
    manager
}

/// A manager for SL4A sessions on a given Android device.
///
/// The on-device agent is a single process that can host multiple RPC
/// servers; this type tracks each server connection over ADB and can
/// gracefully tear the whole agent down during cleanup.
pub struct Sl4aManager {
    self_ref: Weak<Self>,
    adb: Arc<dyn Adb>,
    config: Sl4aConfig,
    discovered_ports: SyncMutex<HashSet<u16>>,
    sessions: Mutex<HashMap<i64, Arc<Sl4aSession>>>,
    started: AtomicBool,
    error_reporter: Arc<ErrorReporter>,
}

impl Sl4aManager {
    fn new(adb: Arc<dyn Adb>, config: Sl4aConfig) -> Arc<Self> {
        let name = format!("SL4A {}", adb.serial());
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            error_reporter: Arc::new(ErrorReporter::new(
                name,
                config.reporter_max_reports,
                config.reporter_drain_poll,
            )),
            adb,
            config,
            discovered_ports: SyncMutex::new(HashSet::new()),
            sessions: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
        })
    }

    /// The device-side ports actually in use by a live session, as
    /// opposed to [`Sl4aManager::discovered_ports`] which also includes
    /// ports found during discovery that were never claimed by a session.
    pub async fn ports_in_use(&self) -> HashSet<u16> {
        self.sessions
            .lock()
            .await
            .values()
            .map(|s| s.server_port())
            .collect()
    }

    /// Diagnoses all potential known reasons the agent can fail.
    ///
    /// Assumes the failure happened during an RPC call, which the probe
    /// chain uses as its starting assumption about ADB/device state. The
    /// owning session is identified by matching `ports.server_port`
    /// against a tracked session, since the failure only carries the
    /// connection's ports, not the session itself.
    pub async fn diagnose_failure(&self, ports: Ports) {
        let sessions = self.sessions.lock().await;
        let owner = sessions.values().find(|s| s.server_port() == ports.server_port);
        let (session_registered, session_uid) = match owner {
            Some(session) => (true, session.uid()),
            None => (false, crate::connection::UNKNOWN_UID),
        };
        let known_ports: Vec<u16> = sessions.values().map(|s| s.server_port()).collect();
        let ctx = ReportContext {
            adb: self.adb.as_ref(),
            known_ports: &known_ports,
            session_registered,
            session_server_port: ports.server_port,
            session_uid,
            ports,
        };
        self.error_reporter.create_error_report(ctx).await;
    }

    fn all_ports_command(&self, is_root: bool) -> &'static str {
        if is_root {
            adb::ROOT_FIND_PORT_CMD
        } else {
            warn!(
                serial = self.adb.serial(),
                "device cannot be put into root mode; agent connections cannot be verified"
            );
            adb::USER_FIND_PORT_CMD
        }
    }

    async fn all_ports(&self) -> Result<Vec<u16>> {
        let is_root = if self.adb.is_root().await? {
            true
        } else {
            self.adb.ensure_root().await?
        };
        let output = self.adb.shell(self.all_ports_command(is_root)).await?;
        Ok(output
            .split_whitespace()
            .filter_map(|p| p.parse::<u16>().ok())
            .collect())
    }

    /// Returns the next open, listening port belonging to the agent that
    /// hasn't already been claimed, or `None` if there isn't one yet.
    async fn open_listening_port(&self) -> Result<Option<u16>> {
        let candidates = self.all_ports().await?;
        let mut discovered = self.discovered_ports.lock();
        for port in candidates {
            if discovered.insert(port) {
                return Ok(Some(port));
            }
        }
        Ok(None)
    }

    /// Launches an agent RPC server hinting at `device_port`, and waits
    /// for it to come up, returning the port it's actually listening on.
    pub async fn start_sl4a_server(&self, device_port: u16) -> Result<u16> {
        self.adb.shell(&adb::launch_server_cmd(device_port)).await?;

        let deadline = tokio::time::Instant::now() + self.config.discovery_timeout;
        loop {
            if let Some(port) = self.open_listening_port().await? {
                return Ok(port);
            }
            if tokio::time::Instant::now() >= deadline {
                let known = self.discovered_ports.lock().clone();
                return Err(Sl4aError::Connection(format!(
                    "unable to find a valid open port for a new server connection; \
                     expected port: {device_port}, open ports: {known:?}"
                )));
            }
            tokio::time::sleep(self.config.discovery_poll_interval).await;
        }
    }

    /// Returns `server_port` if it's already claimed by a live session,
    /// otherwise starts a new server hinting at it.
    pub async fn obtain_sl4a_server(&self, server_port: u16) -> Result<u16> {
        if self.ports_in_use().await.contains(&server_port) {
            Ok(server_port)
        } else {
            self.start_sl4a_server(server_port).await
        }
    }

    /// Whether the agent package is installed on the device.
    pub async fn is_agent_installed(&self) -> Result<bool> {
        let path = self
            .adb
            .shell(&format!("pm path {}", adb::AGENT_PKG_NAME))
            .await
            .unwrap_or_default();
        Ok(!path.trim().is_empty())
    }

    /// Starts the agent's scripting service, verifying it's installed
    /// and clearing out any servers left running from a previous,
    /// unrelated manager.
    pub async fn start_agent_service(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.is_agent_installed().await? {
            return Err(Sl4aError::NotInstalled(format!(
                "agent is not installed on device {}",
                self.adb.serial()
            )));
        }
        let running = self
            .adb
            .shell(&format!("(ps | grep \"S {}\") || true", adb::AGENT_PKG_NAME))
            .await?;
        if !running.trim().is_empty() {
            self.adb
                .shell(&format!("kill -9 $(pidof {})", adb::AGENT_PKG_NAME))
                .await?;
        }
        self.adb
            .shell("settings put global hidden_api_blacklist_exemptions \"*\"")
            .await?;
        self.adb.shell(adb::START_SERVICE_CMD).await?;
        Ok(())
    }

    /// Creates a new session, starting the agent service and a new
    /// server if one isn't already running on `server_port`.
    pub async fn create_session(
        self: &Arc<Self>,
        max_connections: Option<usize>,
        client_port: u16,
        server_port: Option<u16>,
    ) -> Result<Arc<Sl4aSession>> {
        let server_port = match server_port {
            Some(port) => port,
            None => {
                let sessions = self.sessions.lock().await;
                match sessions.keys().min() {
                    Some(&uid) => sessions[&uid].server_port(),
                    None => 0,
                }
            }
        };
        let max_connections = Some(max_connections.unwrap_or(self.config.max_connections));
        self.start_agent_service().await?;

        // Closures handed to the session capture only a `Weak` back-reference:
        // the manager's session map holds a strong `Arc<Sl4aSession>`, and a
        // strong manager reference here would close that into a cycle.
        let weak_for_ports = self.self_ref.clone();
        let obtain_server_port: crate::session::ObtainServerPort = Arc::new(move |hint: u16| {
            let weak = weak_for_ports.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(manager) => manager.obtain_sl4a_server(hint).await,
                    None => Err(Sl4aError::Terminated),
                }
            })
        });
        let weak_for_errors = self.self_ref.clone();
        let on_error: crate::rpc_client::ErrorCallback = Arc::new(move |ports: Ports| {
            let weak = weak_for_errors.clone();
            Box::pin(async move {
                if let Some(manager) = weak.upgrade() {
                    manager.diagnose_failure(ports).await;
                }
            })
        });

        let session = Sl4aSession::create(
            self.adb.clone(),
            client_port,
            server_port,
            obtain_server_port,
            on_error,
            max_connections,
            &self.config,
        )
        .await?;
        self.sessions.lock().await.insert(session.uid(), session.clone());
        Ok(session)
    }

    /// Force-stops the agent package.
    pub async fn stop_service(&self) {
        if let Err(e) = self
            .adb
            .shell(&format!("am force-stop {}", adb::AGENT_PKG_NAME))
            .await
        {
            warn!(error = %e, "failed to stop agent package");
        }
        self.started.store(false, Ordering::SeqCst);
    }

    /// Terminates every session, then closes every server the agent has
    /// open, managed or not.
    pub async fn terminate_all_sessions(&self) {
        self.error_reporter.finalize().await;
        let sessions: Vec<Arc<Sl4aSession>> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.terminate().await;
        }
        self.close_all_ports().await;
    }

    async fn close_all_ports(&self) {
        let discovered: HashSet<u16> = self.discovered_ports.lock().clone();
        let live = self.all_ports().await.unwrap_or_default();
        let all_ports: HashSet<u16> = discovered.union(&live.into_iter().collect()).copied().collect();
        for port in &all_ports {
            if let Err(e) = self.adb.shell(&adb::close_server_cmd(*port)).await {
                warn!(port, error = %e, "failed to close agent server");
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.discovery_timeout;
        loop {
            match self.open_listening_port().await {
                Ok(None) => break,
                Ok(Some(_)) if tokio::time::Instant::now() >= deadline => {
                    warn!(serial = self.adb.serial(), "unable to close all unmanaged servers");
                    break;
                }
                Ok(Some(_)) => tokio::time::sleep(self.config.discovery_poll_interval).await,
                Err(_) => break,
            }
        }
        self.discovered_ports.lock().clear();
    }

    /// The device serial this manager is bound to.
    pub fn serial(&self) -> &str {
        self.adb.serial()
    }
}

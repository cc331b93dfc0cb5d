//! Relay Engine
//!
//! The `Relay` owns the listening socket, the accept loop, and the shared
//! fault flag. Each accepted client is paired with a fresh outbound
//! connection to the target and served by two pump tasks, one per direction.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::pump;
use super::registry::ConnectionRegistry;
use crate::config::{Config, RelaySettings};
use crate::Result;

/// How often `stop` re-checks the registry while draining
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Fault-injecting TCP relay.
///
/// Forwards bytes between clients and a fixed target endpoint. The
/// target-to-client direction can be switched into drop mode at any time via
/// [`Relay::set_blocked`]; while engaged, bytes arriving from the target are
/// read and destroyed instead of forwarded, so acknowledgments sent during
/// that window are permanently lost.
pub struct Relay {
    requested_port: u16,
    target_host: String,
    target_port: u16,
    settings: RelaySettings,
    blocked: Arc<AtomicBool>,
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    bound_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: Arc<AtomicBool>,
}

impl Relay {
    /// Create a relay with default settings.
    ///
    /// A `listen_port` of 0 asks the OS for any free port; query the actual
    /// port with [`Relay::listen_port`] after a successful [`Relay::start`].
    pub fn new(listen_port: u16, target_host: impl Into<String>, target_port: u16) -> Self {
        Self::with_settings(
            listen_port,
            target_host,
            target_port,
            RelaySettings::default(),
        )
    }

    /// Create a relay with explicit settings
    pub fn with_settings(
        listen_port: u16,
        target_host: impl Into<String>,
        target_port: u16,
        settings: RelaySettings,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let start_blocked = settings.start_blocked;

        Self {
            requested_port: listen_port,
            target_host: target_host.into(),
            target_port,
            settings,
            blocked: Arc::new(AtomicBool::new(start_blocked)),
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown_tx,
            bound_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a relay from configuration
    pub fn from_config(config: &Config) -> Self {
        Self::with_settings(
            config.listener.port,
            config.target.host.clone(),
            config.target.port,
            config.relay.clone(),
        )
    }

    /// Bind the listening socket and start accepting connections.
    ///
    /// Returns once the socket is bound, so the resolved port is available
    /// immediately; accepting continues on a background task until `stop`.
    /// Calling `start` a second time is an error and never re-binds.
    pub async fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            bail!("Relay has been stopped");
        }
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("Relay already started");
        }

        let listener = match TcpListener::bind(("0.0.0.0", self.requested_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                // Leave the relay restartable after a failed bind
                self.started.store(false, Ordering::SeqCst);
                return Err(e).with_context(|| {
                    format!("Failed to bind listener on port {}", self.requested_port)
                });
            }
        };

        let local_addr = listener
            .local_addr()
            .context("Failed to resolve bound listener address")?;
        *self.bound_addr.lock().unwrap() = Some(local_addr);

        info!(
            "Relay listening on {}, forwarding to {}:{}",
            local_addr, self.target_host, self.target_port
        );

        let handle = tokio::spawn(accept_loop(
            listener,
            self.target_host.clone(),
            self.target_port,
            self.settings.clone(),
            Arc::clone(&self.blocked),
            Arc::clone(&self.registry),
            self.shutdown_tx.clone(),
            Arc::clone(&self.stopped),
        ));
        *self.accept_task.lock().unwrap() = Some(handle);

        Ok(())
    }

    /// Tear the relay down.
    ///
    /// Closes the listening socket, cancels every pump, and waits up to the
    /// configured `shutdown_timeout` for active connections to drain before
    /// clearing the registry. Safe to call repeatedly, and safe to call when
    /// `start` never ran or failed.
    pub async fn stop(&self) {
        // The stopped flag must be visible before the broadcast goes out;
        // spawn_connection_pair relies on that ordering.
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Relay stop called again, nothing to do");
            return;
        }

        info!("Stopping relay");

        // Wakes the accept loop (which drops the listener, closing the
        // socket) and every pump task.
        let _ = self.shutdown_tx.send(());

        let handle = self.accept_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .is_err()
            {
                warn!("Accept loop did not stop in time, aborting it");
                abort.abort();
            }
        }

        let deadline = Instant::now() + self.settings.shutdown_timeout;
        while !self.registry.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let remaining = self.registry.snapshot();
        if !remaining.is_empty() {
            warn!(
                "Shutdown timeout reached with {} connections still tracked",
                remaining.len()
            );
            for info in &remaining {
                warn!(
                    "  connection {} from {} not drained",
                    info.id, info.client_addr
                );
            }
        }
        self.registry.clear();

        info!("Relay stopped");
    }

    /// The bound listen port, or `None` if `start` has not completed
    pub fn listen_port(&self) -> Option<u16> {
        self.bound_addr.lock().unwrap().map(|addr| addr.port())
    }

    /// The full bound listen address, or `None` if `start` has not completed
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock().unwrap()
    }

    /// Engage or clear drop mode on the target-to-client direction.
    ///
    /// Takes effect immediately for all current and future connections; a
    /// chunk already in flight is unaffected, chunks read after the toggle
    /// follow the new state.
    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::Relaxed);
        info!(
            "Upstream drop mode {}",
            if blocked { "engaged" } else { "cleared" }
        );
    }

    /// Current drop mode state
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Relaxed)
    }

    /// Number of currently active connection pairs
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }
}

/// Accept clients until the shutdown signal fires.
///
/// Each accepted client gets an outbound connection to the target; if that
/// connect fails the client is closed and the loop keeps accepting. Accept
/// errors are logged per iteration and never kill the loop. The listener is
/// dropped (closing the socket) when the loop exits.
#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    target_host: String,
    target_port: u16,
    settings: RelaySettings,
    blocked: Arc<AtomicBool>,
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    stopped: Arc<AtomicBool>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            accept_result = listener.accept() => match accept_result {
                Ok((client, client_addr)) => {
                    debug!("Accepted connection from {}", client_addr);

                    let target = match TcpStream::connect(
                        (target_host.as_str(), target_port)
                    ).await {
                        Ok(target) => target,
                        Err(e) => {
                            warn!(
                                "Failed to connect to target {}:{} for client {}: {}",
                                target_host, target_port, client_addr, e
                            );
                            drop(client);
                            continue;
                        }
                    };

                    spawn_connection_pair(
                        client,
                        client_addr,
                        target,
                        &settings,
                        &blocked,
                        &registry,
                        &shutdown_tx,
                        &stopped,
                    );
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    // Per-iteration failure, keep accepting
                }
            },
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("Accept loop stopped");
}

/// Register a paired connection and launch its two pump tasks.
///
/// Registration happens before either pump starts, and both pumps subscribe
/// to the shutdown channel before being spawned, so a concurrent `stop` is
/// guaranteed to observe and cancel the pair. Whichever pump exits first
/// signals the pair channel; the peer pump then exits too, and between them
/// every socket half is dropped exactly once.
#[allow(clippy::too_many_arguments)]
fn spawn_connection_pair(
    client: TcpStream,
    client_addr: SocketAddr,
    target: TcpStream,
    settings: &RelaySettings,
    blocked: &Arc<AtomicBool>,
    registry: &Arc<ConnectionRegistry>,
    shutdown_tx: &broadcast::Sender<()>,
    stopped: &Arc<AtomicBool>,
) {
    let target_addr = match target.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(
                "Target connection for {} lost before pairing: {}",
                client_addr, e
            );
            return;
        }
    };

    // Subscribe before the stopped check: if stop() has not flipped the flag
    // yet at the moment we observe it, its broadcast comes after these
    // receivers exist and the pumps will see it.
    let downstream_shutdown_rx = shutdown_tx.subscribe();
    let upstream_shutdown_rx = shutdown_tx.subscribe();

    let conn_id = registry.insert(client_addr, target_addr);

    if stopped.load(Ordering::SeqCst) {
        debug!(
            "Relay stopping, closing freshly paired connection from {}",
            client_addr
        );
        registry.remove(conn_id);
        return;
    }

    let (client_rd, client_wr) = client.into_split();
    let (target_rd, target_wr) = target.into_split();
    let (pair_tx, _) = broadcast::channel(2);

    // Downstream pump: client -> target
    {
        let pair_tx = pair_tx.clone();
        let pair_rx = pair_tx.subscribe();
        let registry = Arc::clone(registry);
        let buffer_size = settings.buffer_size;

        tokio::spawn(async move {
            let outcome = pump::run_downstream(
                client_rd,
                target_wr,
                buffer_size,
                pair_rx,
                downstream_shutdown_rx,
            )
            .await;
            debug!(
                "Downstream pump for connection {} finished: {} bytes forwarded ({:?})",
                conn_id, outcome.bytes_forwarded, outcome.end
            );
            let _ = pair_tx.send(());
            registry.remove(conn_id);
        });
    }

    // Upstream pump: target -> client, subject to drop mode
    {
        let pair_rx = pair_tx.subscribe();
        let registry = Arc::clone(registry);
        let blocked = Arc::clone(blocked);
        let buffer_size = settings.buffer_size;
        let drop_poll_interval = settings.drop_poll_interval;

        tokio::spawn(async move {
            let outcome = pump::run_upstream(
                target_rd,
                client_wr,
                buffer_size,
                blocked,
                drop_poll_interval,
                pair_rx,
                upstream_shutdown_rx,
            )
            .await;
            debug!(
                "Upstream pump for connection {} finished: {} bytes forwarded, {} discarded ({:?})",
                conn_id, outcome.bytes_forwarded, outcome.bytes_discarded, outcome.end
            );
            let _ = pair_tx.send(());
            registry.remove(conn_id);
        });
    }

    info!(
        "Connection {} established: {} <-> {}",
        conn_id, client_addr, target_addr
    );
}

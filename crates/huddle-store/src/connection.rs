//! Connection lifecycle for the remote backend.
//!
//! - Opens command, publish and subscribe connections concurrently
//! - Any connection-level failure drops all three and schedules a reconnect
//! - Backoff is `min(attempt * step, cap)`; past `max_attempts` the manager
//!   settles into [`ConnectivityState::Fallback`] until the process restarts
//! - Failures never propagate: they only move the connectivity state

use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use huddle_core::{BackendError, ConnectivityState, HuddleSettings};
use huddle_telemetry::MetricsRecorder;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{CommandConnection, Connector, PublishConnection, SubscribeConnection};
use crate::retry::{RetryPolicy, RetryState};

/// Backend chosen for a single operation.
pub enum Route {
    Remote(Lease<dyn CommandConnection>),
    Local,
}

/// A connection handed out for one operation, tagged with the connect
/// generation it was opened in. Errors are reported against that generation
/// so a late failure on a replaced connection cannot tear down its successor.
pub struct Lease<T: ?Sized> {
    conn: Arc<T>,
    generation: u64,
}

impl<T: ?Sized> Lease<T> {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl<T: ?Sized> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.conn
    }
}

struct Connections {
    generation: u64,
    command: Arc<dyn CommandConnection>,
    publisher: Arc<dyn PublishConnection>,
    subscriber: Arc<dyn SubscribeConnection>,
}

impl Connections {
    fn lease<T: ?Sized>(&self, conn: &Arc<T>) -> Lease<T> {
        Lease {
            conn: Arc::clone(conn),
            generation: self.generation,
        }
    }
}

/// Owns the three remote connections and the authoritative connectivity flag.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    connect_timeout: Duration,
    retry: Mutex<RetryState>,
    connections: RwLock<Option<Connections>>,
    state_tx: watch::Sender<ConnectivityState>,
    reconnecting: AtomicBool,
    generations: AtomicU64,
    shutdown: CancellationToken,
    metrics: Arc<MetricsRecorder>,
}

impl ConnectionManager {
    /// Create the manager and begin connecting in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        connector: Arc<dyn Connector>,
        settings: &HuddleSettings,
        metrics: Arc<MetricsRecorder>,
    ) -> Arc<Self> {
        Self::with_policy(
            connector,
            RetryPolicy::from_settings(settings),
            settings.connect_timeout(),
            metrics,
        )
    }

    pub fn with_policy(
        connector: Arc<dyn Connector>,
        policy: RetryPolicy,
        connect_timeout: Duration,
        metrics: Arc<MetricsRecorder>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectivityState::Connecting);
        let manager = Arc::new(Self {
            connector,
            policy,
            connect_timeout,
            retry: Mutex::new(RetryState::default()),
            connections: RwLock::new(None),
            state_tx,
            reconnecting: AtomicBool::new(false),
            generations: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            metrics,
        });
        info!(endpoint = %manager.connector.endpoint(), "connecting to remote backend");
        manager.spawn_supervisor(true);
        manager
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Receiver that observes every connectivity transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectivityState> {
        self.state_tx.subscribe()
    }

    /// Failed connect attempts since the last successful connect.
    pub fn retry_attempts(&self) -> u32 {
        self.retry.lock().attempts()
    }

    /// Wait until the manager leaves `Connecting` or `limit` elapses.
    pub async fn wait_settled(&self, limit: Duration) -> ConnectivityState {
        let mut rx = self.state_tx.subscribe();
        let settled = tokio::time::timeout(
            limit,
            rx.wait_for(|state| *state != ConnectivityState::Connecting),
        )
        .await;
        match settled {
            Ok(Ok(state)) => *state,
            _ => self.state(),
        }
    }

    /// Pick the backend for one operation.
    pub fn route(&self) -> Route {
        match self.connections.read().as_ref() {
            Some(conns) => Route::Remote(conns.lease(&conns.command)),
            None => Route::Local,
        }
    }

    pub fn publisher(&self) -> Option<Lease<dyn PublishConnection>> {
        self.connections
            .read()
            .as_ref()
            .map(|conns| conns.lease(&conns.publisher))
    }

    pub fn subscriber(&self) -> Option<Lease<dyn SubscribeConnection>> {
        self.connections
            .read()
            .as_ref()
            .map(|conns| conns.lease(&conns.subscriber))
    }

    /// Record a failed remote operation on a connection from `generation`.
    ///
    /// Connection-level errors drop the open connections and start the
    /// reconnect loop, unless those connections have already been replaced.
    /// Other errors only count toward metrics.
    pub fn report_error(
        self: &Arc<Self>,
        operation: &'static str,
        generation: u64,
        err: &BackendError,
    ) {
        self.metrics.increment("connection.operation_errors", 1);
        if !err.is_connection_error() {
            return;
        }
        let dropped = {
            let mut slot = self.connections.write();
            match slot.as_ref() {
                Some(conns) if conns.generation == generation => slot.take().is_some(),
                Some(_) => {
                    debug!(operation, generation, "error on replaced connection ignored");
                    false
                }
                None => false,
            }
        };
        if !dropped || self.shutdown.is_cancelled() {
            return;
        }
        warn!(
            operation,
            error = %err,
            kind = err.error_kind(),
            "remote connection lost, serving from fallback"
        );
        self.set_state(ConnectivityState::Connecting);
        self.spawn_supervisor(false);
    }

    /// Stop reconnecting and drop every open connection.
    ///
    /// In-flight operations holding a connection finish on it; everything
    /// after this call is served locally.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let closed = self.connections.write().take();
        if closed.is_some() {
            info!(endpoint = %self.connector.endpoint(), "remote connections closed");
        }
        self.set_state(ConnectivityState::Fallback);
    }

    fn set_state(&self, next: ConnectivityState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            debug!(from = previous.as_str(), to = next.as_str(), "connectivity changed");
        }
    }

    fn spawn_supervisor(self: &Arc<Self>, immediate: bool) {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let manager = Arc::clone(self);
        drop(tokio::spawn(async move {
            if !manager.supervise(immediate).await {
                manager.reconnecting.store(false, Ordering::Release);
            }
        }));
    }

    /// Connect loop. Returns `true` once connected, with the reconnect flag
    /// already released; `false` when out of budget or shut down.
    async fn supervise(&self, mut immediate: bool) -> bool {
        loop {
            if !immediate {
                let attempt = self.retry.lock().record_failure();
                let Some(delay) = self.policy.delay_for(attempt) else {
                    warn!(
                        attempts = attempt,
                        max_attempts = self.policy.max_attempts,
                        "reconnect budget exhausted, staying in fallback mode"
                    );
                    self.set_state(ConnectivityState::Fallback);
                    return false;
                };
                debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                tokio::select! {
                    _ = self.shutdown.cancelled() => return false,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            immediate = false;

            self.set_state(ConnectivityState::Connecting);
            self.metrics.increment("connection.attempts", 1);
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                result = self.open_all() => result,
            };

            match result {
                Ok(mut conns) => {
                    conns.generation = self.generations.fetch_add(1, Ordering::AcqRel) + 1;
                    self.retry.lock().reset();
                    {
                        let mut slot = self.connections.write();
                        if self.shutdown.is_cancelled() {
                            return false;
                        }
                        // Released under the lock so an error reported on
                        // these connections can start the next loop.
                        self.reconnecting.store(false, Ordering::Release);
                        *slot = Some(conns);
                        self.set_state(ConnectivityState::Connected);
                    }
                    info!(endpoint = %self.connector.endpoint(), "remote backend connected");
                    return true;
                }
                Err(e) => {
                    self.metrics.increment("connection.failures", 1);
                    warn!(
                        endpoint = %self.connector.endpoint(),
                        error = %e,
                        kind = e.error_kind(),
                        "remote backend connect failed"
                    );
                }
            }
        }
    }

    async fn open_all(&self) -> Result<Connections, BackendError> {
        let limit = self.connect_timeout;
        let (command, publisher, subscriber) = tokio::try_join!(
            bounded(limit, self.connector.command()),
            bounded(limit, self.connector.publisher()),
            bounded(limit, self.connector.subscriber()),
        )?;
        Ok(Connections {
            generation: 0,
            command,
            publisher,
            subscriber,
        })
    }
}

async fn bounded<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| BackendError::Timeout(limit))?
}

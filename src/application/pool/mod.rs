//! Bounded pool of reusable rendering sessions over one engine process.
//!
//! The pool owns at most one engine handle and up to `max_sessions`
//! sessions on it. All shared state lives behind a single mutex that is only
//! held for synchronous scans and updates, never across an await point.
//! Sessions leave the pool by value inside a [`SessionLease`], so a session can
//! never be handed to two callers at once; dropping the lease puts it back.

mod health;

#[cfg(test)]
pub(crate) mod fake;

use std::{
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use thiserror::Error;
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, info, warn};

use crate::application::engine::{Engine, EngineError, EngineLauncher, EngineSession};
use crate::util::lock::mutex_lock;

pub use health::HealthReport;

const SOURCE: &str = "application::pool";

pub const DEFAULT_MAX_SESSIONS: usize = 4;
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
pub const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const PING_TIMEOUT: Duration = Duration::from_secs(5);
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) const METRIC_POOL_ACQUIRE_MS: &str = "mermaid_render_pool_acquire_ms";
pub(crate) const METRIC_POOL_ACTIVE: &str = "mermaid_render_pool_active_sessions";
pub(crate) const METRIC_POOL_INVALIDATIONS: &str = "mermaid_render_pool_invalidations_total";

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_sessions: usize,
    pub acquire_timeout: Duration,
    pub poll_interval: Duration,
    pub idle_timeout: Duration,
    pub health_interval: Duration,
    pub ping_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            acquire_timeout: ACQUIRE_TIMEOUT,
            poll_interval: ACQUIRE_POLL_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            ping_timeout: PING_TIMEOUT,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("no rendering session became free within {waited:?}")]
    Exhausted { waited: Duration },
    #[error("session pool is shutting down")]
    ShuttingDown,
    #[error("failed to launch rendering engine: {0}")]
    Launch(#[source] EngineError),
    #[error("failed to open rendering session: {0}")]
    Session(#[source] EngineError),
}

/// Read-only snapshot for the health surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub engine_connected: bool,
    pub total_sessions: usize,
    pub active_sessions: usize,
}

type LaunchFuture = Shared<BoxFuture<'static, Result<(Arc<dyn Engine>, u64), EngineError>>>;

struct EngineSlot {
    engine: Arc<dyn Engine>,
    generation: u64,
}

struct SessionSlot {
    id: u64,
    generation: u64,
    /// `None` while lent out or still being opened.
    session: Option<Box<dyn EngineSession>>,
    in_use: bool,
    last_released_at: Instant,
}

#[derive(Default)]
struct PoolState {
    engine: Option<EngineSlot>,
    launching: Option<LaunchFuture>,
    sessions: Vec<SessionSlot>,
    generation: u64,
    next_session_id: u64,
    shutting_down: bool,
}

impl PoolState {
    fn active(&self) -> usize {
        self.sessions.iter().filter(|slot| slot.in_use).count()
    }

    /// Detach the engine and every tracked session for asynchronous teardown.
    fn take_all(&mut self) -> (Option<Arc<dyn Engine>>, Vec<Box<dyn EngineSession>>) {
        let engine = self.engine.take().map(|slot| slot.engine);
        let sessions = self
            .sessions
            .drain(..)
            .filter_map(|slot| slot.session)
            .collect();
        (engine, sessions)
    }
}

struct PoolInner {
    launcher: Arc<dyn EngineLauncher>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    released: Notify,
}

/// Process-wide owner of the engine handle and its sessions.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

enum Acquisition {
    Idle(u64, Box<dyn EngineSession>),
    Create(SlotReservation),
    Wait,
}

impl SessionPool {
    pub fn new(launcher: Arc<dyn EngineLauncher>, config: PoolConfig) -> Self {
        let config = PoolConfig {
            max_sessions: config.max_sessions.max(1),
            ..config
        };
        Self {
            inner: Arc::new(PoolInner {
                launcher,
                config,
                state: Mutex::new(PoolState::default()),
                released: Notify::new(),
            }),
        }
    }

    /// Wait for a free session, launching the engine or opening a new session as needed.
    pub async fn acquire(&self) -> Result<SessionLease, PoolError> {
        let started_at = Instant::now();
        let deadline = started_at + self.inner.config.acquire_timeout;

        loop {
            let (engine, generation) = self.ensure_engine().await?;

            let acquisition = {
                let mut state = mutex_lock(&self.inner.state, SOURCE, "acquire.scan");
                if state.shutting_down {
                    return Err(PoolError::ShuttingDown);
                }
                let idle = state.sessions.iter().position(|slot| {
                    slot.generation == generation && !slot.in_use && slot.session.is_some()
                });
                if let Some(index) = idle {
                    let slot = &mut state.sessions[index];
                    match slot.session.take() {
                        Some(session) => {
                            slot.in_use = true;
                            Acquisition::Idle(slot.id, session)
                        }
                        None => Acquisition::Wait,
                    }
                } else if state.sessions.len() < self.inner.config.max_sessions {
                    state.next_session_id += 1;
                    let id = state.next_session_id;
                    state.sessions.push(SessionSlot {
                        id,
                        generation,
                        session: None,
                        in_use: true,
                        last_released_at: Instant::now(),
                    });
                    Acquisition::Create(SlotReservation {
                        inner: Arc::clone(&self.inner),
                        id,
                        armed: true,
                    })
                } else {
                    Acquisition::Wait
                }
            };

            match acquisition {
                Acquisition::Idle(id, session) => {
                    return Ok(self.lease(id, generation, session, started_at, "idle"));
                }
                Acquisition::Create(mut reservation) => {
                    let session = engine.new_session().await.map_err(|err| {
                        warn!(
                            target = SOURCE,
                            op = "pool::acquire",
                            result = "session_error",
                            error = %err,
                            "Failed to open rendering session"
                        );
                        PoolError::Session(err)
                    })?;
                    reservation.armed = false;
                    return Ok(self.lease(reservation.id, generation, session, started_at, "new"));
                }
                Acquisition::Wait => {
                    let now = Instant::now();
                    if now >= deadline {
                        let waited = now.duration_since(started_at);
                        warn!(
                            target = SOURCE,
                            op = "pool::acquire",
                            result = "exhausted",
                            waited_ms = waited.as_millis() as u64,
                            max_sessions = self.inner.config.max_sessions,
                            "No rendering session became free in time"
                        );
                        return Err(PoolError::Exhausted { waited });
                    }
                    let nap = self.inner.config.poll_interval.min(deadline - now);
                    tokio::select! {
                        _ = self.inner.released.notified() => {}
                        _ = tokio::time::sleep(nap) => {}
                    }
                }
            }
        }
    }

    /// Return a lease to the pool. Equivalent to dropping it.
    pub fn release(&self, lease: SessionLease) {
        drop(lease);
    }

    pub fn status(&self) -> PoolStatus {
        let state = mutex_lock(&self.inner.state, SOURCE, "status");
        PoolStatus {
            engine_connected: state
                .engine
                .as_ref()
                .is_some_and(|slot| slot.engine.is_connected()),
            total_sessions: state.sessions.len(),
            active_sessions: state.active(),
        }
    }

    /// Stop accepting acquisitions, give in-flight leases a grace period, then close everything.
    pub async fn shutdown(&self) {
        {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "shutdown.begin");
            state.shutting_down = true;
        }
        self.inner.released.notify_waiters();

        let deadline = Instant::now() + self.inner.config.shutdown_grace;
        loop {
            let active = mutex_lock(&self.inner.state, SOURCE, "shutdown.drain").active();
            let now = Instant::now();
            if active == 0 {
                break;
            }
            if now >= deadline {
                warn!(
                    target = SOURCE,
                    op = "pool::shutdown",
                    active_sessions = active,
                    "Grace period elapsed with sessions still in use; force closing"
                );
                break;
            }
            let nap = self.inner.config.poll_interval.min(deadline - now);
            tokio::select! {
                _ = self.inner.released.notified() => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }

        let (engine, sessions) = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "shutdown.take");
            state.launching = None;
            state.take_all()
        };
        let closed = sessions.len();
        teardown(engine, sessions).await;
        gauge!(METRIC_POOL_ACTIVE).set(0.0);
        info!(
            target = SOURCE,
            op = "pool::shutdown",
            sessions_closed = closed,
            "Session pool shut down"
        );
    }

    /// Return the live engine, launching one if needed. Concurrent callers share one launch.
    async fn ensure_engine(&self) -> Result<(Arc<dyn Engine>, u64), PoolError> {
        let launch = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "ensure_engine");
            if state.shutting_down {
                return Err(PoolError::ShuttingDown);
            }
            let stale_generation = match state.engine.as_ref() {
                Some(slot) if slot.engine.is_connected() => {
                    return Ok((Arc::clone(&slot.engine), slot.generation));
                }
                Some(slot) => Some(slot.generation),
                None => None,
            };
            if let Some(generation) = stale_generation {
                let detached = state.take_all();
                drop(state);
                PoolInner::discard(detached, generation, "engine_disconnected");
                state = mutex_lock(&self.inner.state, SOURCE, "ensure_engine.relaunch");
            }
            match state.launching.as_ref() {
                Some(launch) => launch.clone(),
                None => {
                    let launch = PoolInner::launch(&self.inner);
                    state.launching = Some(launch.clone());
                    launch
                }
            }
        };

        launch.await.map_err(PoolError::Launch)
    }

    fn lease(
        &self,
        id: u64,
        generation: u64,
        session: Box<dyn EngineSession>,
        started_at: Instant,
        origin: &'static str,
    ) -> SessionLease {
        let waited = started_at.elapsed();
        histogram!(METRIC_POOL_ACQUIRE_MS).record(waited.as_secs_f64() * 1000.0);
        let active = mutex_lock(&self.inner.state, SOURCE, "lease").active();
        gauge!(METRIC_POOL_ACTIVE).set(active as f64);
        debug!(
            target = SOURCE,
            op = "pool::acquire",
            result = origin,
            session_id = id,
            waited_ms = waited.as_millis() as u64,
            active_sessions = active,
            "Rendering session acquired"
        );
        SessionLease {
            inner: Arc::clone(&self.inner),
            id,
            generation,
            session: Some(session),
            discard: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn invalidate_for_test(&self) {
        let generation = mutex_lock(&self.inner.state, SOURCE, "test")
            .engine
            .as_ref()
            .map(|slot| slot.generation);
        if let Some(generation) = generation {
            self.inner.invalidate(generation, "test");
        }
    }
}

impl PoolInner {
    fn launch(inner: &Arc<PoolInner>) -> LaunchFuture {
        let inner = Arc::clone(inner);
        async move {
            let started_at = Instant::now();
            let result = inner.launcher.launch().await;
            let mut state = mutex_lock(&inner.state, SOURCE, "launch.complete");
            state.launching = None;
            match result {
                Ok(engine) => {
                    state.generation += 1;
                    let generation = state.generation;
                    state.engine = Some(EngineSlot {
                        engine: Arc::clone(&engine),
                        generation,
                    });
                    drop(state);
                    PoolInner::watch_disconnect(
                        Arc::downgrade(&inner),
                        Arc::clone(&engine),
                        generation,
                    );
                    info!(
                        target = SOURCE,
                        op = "pool::launch",
                        result = "ok",
                        generation,
                        elapsed_ms = started_at.elapsed().as_millis() as u64,
                        "Rendering engine launched"
                    );
                    Ok((engine, generation))
                }
                Err(err) => {
                    drop(state);
                    warn!(
                        target = SOURCE,
                        op = "pool::launch",
                        result = "error",
                        elapsed_ms = started_at.elapsed().as_millis() as u64,
                        error = %err,
                        "Rendering engine failed to launch"
                    );
                    Err(err)
                }
            }
        }
        .boxed()
        .shared()
    }

    fn watch_disconnect(inner: Weak<PoolInner>, engine: Arc<dyn Engine>, generation: u64) {
        tokio::spawn(async move {
            engine.closed().await;
            if let Some(inner) = inner.upgrade() {
                inner.invalidate(generation, "engine_disconnected");
            }
        });
    }

    /// Drop the engine handle and every session if `generation` is still current.
    fn invalidate(&self, generation: u64, reason: &'static str) {
        let detached = {
            let mut state = mutex_lock(&self.state, SOURCE, "invalidate");
            match state.engine.as_ref() {
                Some(slot) if slot.generation == generation => state.take_all(),
                _ => return,
            }
        };
        PoolInner::discard(detached, generation, reason);
        self.released.notify_waiters();
    }

    fn discard(
        (engine, sessions): (Option<Arc<dyn Engine>>, Vec<Box<dyn EngineSession>>),
        generation: u64,
        reason: &'static str,
    ) {
        counter!(METRIC_POOL_INVALIDATIONS).increment(1);
        warn!(
            target = SOURCE,
            op = "pool::invalidate",
            reason,
            generation,
            sessions_dropped = sessions.len(),
            "Session pool invalidated; next acquisition relaunches the engine"
        );
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(teardown(engine, sessions));
        }
    }

    fn return_session(
        &self,
        id: u64,
        generation: u64,
        session: Box<dyn EngineSession>,
        discard: bool,
    ) {
        let mut state = mutex_lock(&self.state, SOURCE, "release");
        let position = state
            .sessions
            .iter()
            .position(|slot| slot.id == id && slot.generation == generation);

        match position {
            Some(index) if !discard => {
                let slot = &mut state.sessions[index];
                slot.session = Some(session);
                slot.in_use = false;
                slot.last_released_at = Instant::now();
                gauge!(METRIC_POOL_ACTIVE).set(state.active() as f64);
                drop(state);
                self.released.notify_one();
            }
            Some(index) => {
                state.sessions.remove(index);
                gauge!(METRIC_POOL_ACTIVE).set(state.active() as f64);
                drop(state);
                debug!(
                    target = SOURCE,
                    op = "pool::release",
                    session_id = id,
                    "Discarding broken session"
                );
                close_detached(session);
                self.released.notify_one();
            }
            None => {
                drop(state);
                debug!(
                    target = SOURCE,
                    op = "pool::release",
                    session_id = id,
                    result = "untracked",
                    "Released session is no longer tracked; closing it"
                );
                close_detached(session);
            }
        }
    }

    fn forget_slot(&self, id: u64) {
        let mut state = mutex_lock(&self.state, SOURCE, "forget_slot");
        state.sessions.retain(|slot| slot.id != id);
        drop(state);
        self.released.notify_one();
    }
}

/// Close every session before stopping the engine that owns them.
async fn teardown(engine: Option<Arc<dyn Engine>>, sessions: Vec<Box<dyn EngineSession>>) {
    let closes = sessions.into_iter().map(|mut session| async move {
        match tokio::time::timeout(SESSION_CLOSE_TIMEOUT, session.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(target = SOURCE, error = %err, "Session close failed"),
            Err(_) => debug!(target = SOURCE, "Session close timed out"),
        }
    });
    futures::future::join_all(closes).await;
    if let Some(engine) = engine {
        engine.shutdown().await;
    }
}

fn close_detached(mut session: Box<dyn EngineSession>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            if let Err(err) = session.close().await {
                debug!(target = SOURCE, error = %err, "Detached session close failed");
            }
        });
    }
}

/// Reserved slot for a session being opened; frees the slot if the open is abandoned.
struct SlotReservation {
    inner: Arc<PoolInner>,
    id: u64,
    armed: bool,
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if self.armed {
            self.inner.forget_slot(self.id);
        }
    }
}

/// Exclusive use of one pooled session. Dropping the lease releases it exactly once.
pub struct SessionLease {
    inner: Arc<PoolInner>,
    id: u64,
    generation: u64,
    session: Option<Box<dyn EngineSession>>,
    discard: bool,
}

impl SessionLease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session(&mut self) -> &mut dyn EngineSession {
        self.session
            .as_deref_mut()
            .expect("lease holds its session until dropped")
    }

    /// Close the session on release instead of returning it to the idle set.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.inner
                .return_session(self.id, self.generation, session, self.discard);
        }
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("discard", &self.discard)
            .finish()
    }
}

//! Periodic idle eviction and engine liveness checks.

use std::sync::Arc;

use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info};

use super::{SOURCE, SessionPool};
use crate::util::lock::mutex_lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HealthReport {
    pub evicted: usize,
    /// `None` when no engine was running at check time.
    pub engine_alive: Option<bool>,
}

impl SessionPool {
    /// Evict sessions idle past the threshold (keeping at least one) and ping the engine.
    ///
    /// A failed ping drops the engine handle and every session; the next
    /// acquisition relaunches. The ping itself is not retried.
    pub async fn health_check(&self) -> HealthReport {
        let now = Instant::now();
        let idle_timeout = self.inner.config.idle_timeout;

        let (evicted, engine) = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "health_check.evict");
            let mut remaining = state.sessions.len();
            let mut evicted = Vec::new();
            state.sessions.retain_mut(|slot| {
                let stale = !slot.in_use
                    && now.saturating_duration_since(slot.last_released_at) > idle_timeout;
                if stale && remaining > 1 {
                    remaining -= 1;
                    if let Some(session) = slot.session.take() {
                        evicted.push(session);
                    }
                    return false;
                }
                true
            });
            let engine = state
                .engine
                .as_ref()
                .map(|slot| (Arc::clone(&slot.engine), slot.generation));
            (evicted, engine)
        };

        let evicted_count = evicted.len();
        for mut session in evicted {
            if let Err(err) = session.close().await {
                debug!(target = SOURCE, error = %err, "Evicted session close failed");
            }
        }
        if evicted_count > 0 {
            info!(
                target = SOURCE,
                op = "pool::health_check",
                evicted = evicted_count,
                "Evicted idle rendering sessions"
            );
        }

        let engine_alive = match engine {
            Some((engine, generation)) => {
                let alive = matches!(
                    tokio::time::timeout(self.inner.config.ping_timeout, engine.ping()).await,
                    Ok(Ok(()))
                );
                if !alive {
                    self.inner.invalidate(generation, "ping_failed");
                }
                Some(alive)
            }
            None => None,
        };

        HealthReport {
            evicted: evicted_count,
            engine_alive,
        }
    }

    /// Run [`SessionPool::health_check`] on the configured interval until aborted.
    pub fn spawn_health_monitor(&self) -> JoinHandle<()> {
        let pool = self.clone();
        let period = pool.inner.config.health_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                pool.health_check().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::application::pool::{PoolConfig, fake::FakeLauncher};

    fn pool(launcher: &Arc<FakeLauncher>) -> SessionPool {
        SessionPool::new(
            launcher.clone(),
            PoolConfig {
                max_sessions: 3,
                idle_timeout: Duration::from_secs(60),
                ..PoolConfig::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_idle_sessions_but_keeps_one() {
        let launcher = FakeLauncher::new();
        let pool = pool(&launcher);
        let leases = futures::future::join_all((0..3).map(|_| pool.acquire())).await;
        drop(leases);
        assert_eq!(pool.status().total_sessions, 3);

        tokio::time::advance(Duration::from_secs(61)).await;
        let report = pool.health_check().await;

        assert_eq!(report.evicted, 2);
        assert_eq!(report.engine_alive, Some(true));
        assert_eq!(pool.status().total_sessions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recently_used_and_leased_sessions_survive() {
        let launcher = FakeLauncher::new();
        let pool = pool(&launcher);
        let held = pool.acquire().await.expect("lease");
        let idle = pool.acquire().await.expect("lease");
        drop(idle);

        tokio::time::advance(Duration::from_secs(30)).await;
        let report = pool.health_check().await;

        assert_eq!(report.evicted, 0);
        assert_eq!(pool.status().total_sessions, 2);
        drop(held);
    }

    #[tokio::test]
    async fn failed_ping_invalidates_pool() {
        let launcher = FakeLauncher::new();
        let pool = pool(&launcher);
        pool.release(pool.acquire().await.expect("lease"));

        launcher.last_engine().expect("engine").fail_pings();
        let report = pool.health_check().await;

        assert_eq!(report.engine_alive, Some(false));
        assert_eq!(pool.status().total_sessions, 0);
        assert!(!pool.status().engine_connected);

        pool.release(pool.acquire().await.expect("relaunch"));
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test]
    async fn failed_ping_closes_sessions_before_stopping_engine() {
        let launcher = FakeLauncher::new();
        let pool = pool(&launcher);
        let leases = futures::future::join_all((0..3).map(|_| pool.acquire())).await;
        drop(leases);
        let engine = launcher.last_engine().expect("engine");

        engine.fail_pings();
        pool.health_check().await;
        for _ in 0..50 {
            if engine.was_shut_down() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert!(engine.was_shut_down());
        assert_eq!(launcher.sessions_closed(), 3);
    }

    #[tokio::test]
    async fn check_without_engine_reports_none() {
        let launcher = FakeLauncher::new();
        let report = pool(&launcher).health_check().await;
        assert_eq!(report, HealthReport::default());
        assert_eq!(launcher.launches(), 0);
    }
}

// Timed lock refresh for long-running jobs
// Keeps a lock alive at half-TTL cadence while the owning job stays
// active, releasing it and notifying the owner the moment it stops

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use tranca_common::{LockError, LockName};
use tranca_persistence::LockStore;

/// Longest the scheduler waits for a liveness probe to answer
const MAX_PROBE_WAIT: Duration = Duration::from_millis(1000);

/// Owner-side view of a refreshed lock
///
/// `is_active` is polled at half-TTL cadence. `lock_released` fires exactly
/// once when the refresh cycle ends for any reason; after it the lock must
/// be considered lost.
#[async_trait]
pub trait JobLockRefreshCallback: Send + Sync {
    /// Whether the owning job still needs the lock
    async fn is_active(&self) -> bool;

    /// The lock is no longer being refreshed (released, lost, or the
    /// process is going down)
    async fn lock_released(&self);
}

/// Registry entry for an active refresh cycle
#[derive(Clone, Debug)]
pub struct ScheduledRefresh {
    /// Holder token the cycle refreshes with
    pub token: String,
}

/// Timed refresh scheduler
///
/// One lightweight task per refreshed lock. Cycles stop cooperatively:
/// `shutdown()` flips a flag and wakes sleeping cycles; there is no cancel
/// API.
pub struct RefreshScheduler {
    store: Arc<dyn LockStore>,
    /// Active cycles keyed by lock name
    active: Arc<DashMap<String, ScheduledRefresh>>,
    shutdown: Arc<AtomicBool>,
    /// Set by the embedder when the host process is terminating
    host_terminating: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl RefreshScheduler {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self::with_host_terminating(store, Arc::new(AtomicBool::new(false)))
    }

    /// Create a scheduler that also observes an embedder-owned termination
    /// flag in addition to its own shutdown flag
    pub fn with_host_terminating(
        store: Arc<dyn LockStore>,
        host_terminating: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            active: Arc::new(DashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            host_terminating,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Number of live refresh cycles
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Whether `name` currently has a live refresh cycle
    pub fn is_scheduled(&self, name: &LockName) -> bool {
        self.active.contains_key(name.as_str())
    }

    /// Registry entry for `name`, if a cycle is live
    pub fn scheduled(&self, name: &LockName) -> Option<ScheduledRefresh> {
        self.active.get(name.as_str()).map(|entry| entry.value().clone())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Begin refreshing `name` every `ttl / 2` until the callback reports
    /// inactive, the lock is lost, or the scheduler shuts down
    ///
    /// One cycle per lock name; scheduling a second one is an error. The
    /// first refresh happens one delay after this call.
    pub fn schedule(
        &self,
        name: &LockName,
        token: &str,
        ttl: Duration,
        callback: Arc<dyn JobLockRefreshCallback>,
    ) -> Result<(), LockError> {
        if self.is_shut_down() {
            return Err(LockError::IllegalState(
                "refresh scheduler is shut down".to_string(),
            ));
        }

        let delay = ttl / 2;
        if delay.is_zero() {
            return Err(LockError::IllegalArgument(format!(
                "ttl {:?} is too short to refresh",
                ttl
            )));
        }

        match self.active.entry(name.as_str().to_string()) {
            Entry::Occupied(_) => {
                return Err(LockError::IllegalState(format!(
                    "lock '{}' already has a refresh cycle",
                    name
                )));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ScheduledRefresh {
                    token: token.to_string(),
                });
            }
        }

        debug!(
            name = %name,
            token = %token,
            delay_ms = delay.as_millis() as u64,
            "Scheduled lock refresh"
        );

        let cycle = RefreshCycle {
            store: self.store.clone(),
            active: self.active.clone(),
            shutdown: self.shutdown.clone(),
            host_terminating: self.host_terminating.clone(),
            wake: self.wake.clone(),
            name: name.clone(),
            token: token.to_string(),
            ttl,
            delay,
            probe_wait: delay.min(MAX_PROBE_WAIT),
            callback,
        };
        tokio::spawn(cycle.run());

        Ok(())
    }

    /// Flip the shutdown flag and wake sleeping cycles
    ///
    /// Cycles observing the flag notify their callbacks without touching
    /// the store; the locks lapse by TTL on their own.
    pub fn shutdown(&self) {
        if self
            .shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        info!(active = self.active_count(), "Refresh scheduler shutting down");
        self.wake.notify_waiters();
    }
}

/// One lock's refresh loop, detached from the scheduler that spawned it
struct RefreshCycle {
    store: Arc<dyn LockStore>,
    active: Arc<DashMap<String, ScheduledRefresh>>,
    shutdown: Arc<AtomicBool>,
    host_terminating: Arc<AtomicBool>,
    wake: Arc<Notify>,
    name: LockName,
    token: String,
    ttl: Duration,
    delay: Duration,
    probe_wait: Duration,
    callback: Arc<dyn JobLockRefreshCallback>,
}

impl RefreshCycle {
    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) || self.host_terminating.load(Ordering::SeqCst)
    }

    async fn run(self) {
        loop {
            {
                // Create the wake future before checking the flag so a
                // shutdown between the check and the await is not lost
                let wake = self.wake.notified();
                if self.stopping() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    _ = wake => {}
                }
            }

            if self.stopping() {
                debug!(name = %self.name, "Refresh cycle observed shutdown");
                break;
            }

            // Probe the job in its own task so a wedged callback cannot
            // wedge the cycle
            let mut probe = {
                let callback = self.callback.clone();
                tokio::spawn(async move { callback.is_active().await })
            };

            let is_active = match timeout(self.probe_wait, &mut probe).await {
                Ok(Ok(active)) => active,
                Ok(Err(join_err)) if join_err.is_panic() => {
                    error!(
                        name = %self.name,
                        "Liveness callback panicked; releasing the lock"
                    );
                    self.fail_safe_release().await;
                    return;
                }
                Ok(Err(_)) => {
                    debug!(name = %self.name, "Liveness probe cancelled");
                    break;
                }
                Err(_) => {
                    probe.abort();
                    error!(
                        name = %self.name,
                        wait_ms = self.probe_wait.as_millis() as u64,
                        "Liveness callback did not answer in time; releasing the lock"
                    );
                    self.fail_safe_release().await;
                    return;
                }
            };

            if !is_active {
                debug!(name = %self.name, token = %self.token, "Job inactive; releasing lock");
                self.release_quietly().await;
                self.finish().await;
                return;
            }

            match self.store.refresh(&self.name, &self.token, self.ttl).await {
                Ok(()) => {
                    debug!(name = %self.name, token = %self.token, "Lock refreshed");
                }
                Err(err) => {
                    warn!(
                        name = %self.name,
                        token = %self.token,
                        error = %err,
                        "Lock refresh failed; stopping cycle"
                    );
                    self.finish().await;
                    return;
                }
            }
        }

        // Shutdown path: notify without store operations
        self.finish().await;
    }

    /// A defective callback must not keep the lock for the rest of the
    /// TTL; release it and notify
    async fn fail_safe_release(self) {
        self.release_quietly().await;
        self.finish().await;
    }

    /// Release without treating an already-gone record as a failure
    async fn release_quietly(&self) {
        match self.store.release(&self.name, &self.token).await {
            Ok(()) => {}
            Err(LockError::Missing { .. }) => {}
            Err(err) => {
                warn!(
                    name = %self.name,
                    token = %self.token,
                    error = %err,
                    "Best-effort lock release failed"
                );
            }
        }
    }

    /// Drop the registry entry and notify the owner exactly once
    ///
    /// The notification runs in its own task so a panicking callback is
    /// contained.
    async fn finish(self) {
        self.active.remove(self.name.as_str());

        let callback = self.callback.clone();
        let handle = tokio::spawn(async move { callback.lock_released().await });
        if let Err(join_err) = handle.await {
            if join_err.is_panic() {
                error!(name = %self.name, "Lock released notification panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use tranca_persistence::InMemoryLockStore;

    use super::*;

    struct CountingCallback {
        active: AtomicBool,
        probes: AtomicU32,
        released: AtomicU32,
    }

    impl CountingCallback {
        fn new(active: bool) -> Arc<Self> {
            Arc::new(Self {
                active: AtomicBool::new(active),
                probes: AtomicU32::new(0),
                released: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl JobLockRefreshCallback for CountingCallback {
        async fn is_active(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.active.load(Ordering::SeqCst)
        }

        async fn lock_released(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn name(s: &str) -> LockName {
        LockName::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_schedule_rejects_unusable_ttl() {
        let scheduler = RefreshScheduler::new(Arc::new(InMemoryLockStore::new()));
        let callback = CountingCallback::new(true);

        let err = scheduler
            .schedule(&name("a.b"), "token", Duration::from_nanos(1), callback)
            .unwrap_err();
        assert!(matches!(err, LockError::IllegalArgument(_)));
        assert_eq!(scheduler.active_count(), 0);
    }

    #[tokio::test]
    async fn test_schedule_rejects_duplicates() {
        let scheduler = RefreshScheduler::new(Arc::new(InMemoryLockStore::new()));

        scheduler
            .schedule(
                &name("a.b"),
                "token",
                Duration::from_secs(60),
                CountingCallback::new(true),
            )
            .unwrap();
        assert!(scheduler.is_scheduled(&name("a.b")));
        assert_eq!(scheduler.scheduled(&name("a.b")).unwrap().token, "token");

        let err = scheduler
            .schedule(
                &name("a.b"),
                "other",
                Duration::from_secs(60),
                CountingCallback::new(true),
            )
            .unwrap_err();
        assert!(matches!(err, LockError::IllegalState(_)));
    }

    #[tokio::test]
    async fn test_schedule_refused_after_shutdown() {
        let scheduler = RefreshScheduler::new(Arc::new(InMemoryLockStore::new()));
        scheduler.shutdown();
        scheduler.shutdown();
        assert!(scheduler.is_shut_down());

        let err = scheduler
            .schedule(
                &name("a.b"),
                "token",
                Duration::from_secs(60),
                CountingCallback::new(true),
            )
            .unwrap_err();
        assert!(matches!(err, LockError::IllegalState(_)));
    }

    #[tokio::test]
    async fn test_inactive_job_releases_and_notifies_once() {
        let store = Arc::new(InMemoryLockStore::new());
        let scheduler = RefreshScheduler::new(store.clone());
        let lock = name("org.example.JobA");

        store
            .acquire(&lock, "token", Duration::from_millis(80))
            .await
            .unwrap();

        let callback = CountingCallback::new(false);
        scheduler
            .schedule(&lock, "token", Duration::from_millis(80), callback.clone())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(callback.released.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_scheduled(&lock));
        assert!(store.find(&lock).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_notifies_without_store_release() {
        let store = Arc::new(InMemoryLockStore::new());
        let scheduler = RefreshScheduler::new(store.clone());
        let lock = name("org.example.JobB");

        store
            .acquire(&lock, "token", Duration::from_secs(60))
            .await
            .unwrap();

        let callback = CountingCallback::new(true);
        scheduler
            .schedule(&lock, "token", Duration::from_secs(60), callback.clone())
            .unwrap();

        scheduler.shutdown();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(callback.released.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.active_count(), 0);
        // The record stays; it lapses by TTL
        assert!(store.find(&lock).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_host_terminating_flag_stops_cycles() {
        let store = Arc::new(InMemoryLockStore::new());
        let terminating = Arc::new(AtomicBool::new(false));
        let scheduler = RefreshScheduler::with_host_terminating(store.clone(), terminating.clone());
        let lock = name("org.example.JobC");

        store
            .acquire(&lock, "token", Duration::from_millis(60))
            .await
            .unwrap();

        let callback = CountingCallback::new(true);
        scheduler
            .schedule(&lock, "token", Duration::from_millis(60), callback.clone())
            .unwrap();

        terminating.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(callback.released.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.active_count(), 0);
    }
}

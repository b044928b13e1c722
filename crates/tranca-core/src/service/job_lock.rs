// Transactional and manual job locks
// Serializes jobs across nodes with named, token-guarded, TTL-bounded
// locks backed by a shared store

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

use tranca_common::{LockError, LockName, generate_token};
use tranca_persistence::LockStore;

use crate::service::refresh::{JobLockRefreshCallback, RefreshScheduler};
use crate::service::transaction::{TransactionContext, TransactionRunner};

/// Lock service configuration
#[derive(Debug, Clone, Copy)]
pub struct JobLockConfig {
    /// Wait between acquisition attempts (default: 20 ms)
    pub retry_wait: Duration,
    /// Acquisition attempts before giving up (default: 10)
    pub retry_count: u32,
}

impl Default for JobLockConfig {
    fn default() -> Self {
        Self {
            retry_wait: Duration::from_millis(20),
            retry_count: 10,
        }
    }
}

/// Locks held by one transaction, kept in name order
#[derive(Default)]
struct TxnLockState {
    held: BTreeSet<LockName>,
}

/// Job lock service
///
/// Locks are identified by [`LockName`] and guarded by an opaque holder
/// token. Transactional locks use the transaction id as their token and
/// are released by commit and rollback hooks; manual locks hand the token
/// to the caller, who releases or refreshes explicitly. Every lock lapses
/// by TTL, which is the only recovery path after a crash.
#[derive(Clone)]
pub struct JobLockService {
    config: JobLockConfig,
    store: Arc<dyn LockStore>,
    runner: Arc<TransactionRunner>,
    scheduler: Arc<RefreshScheduler>,
    /// Ordered lock state per open transaction, keyed by transaction id
    txn_locks: Arc<DashMap<String, TxnLockState>>,
}

impl JobLockService {
    pub fn new(store: Arc<dyn LockStore>, runner: Arc<TransactionRunner>) -> Self {
        Self::with_config(store, runner, JobLockConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn LockStore>,
        runner: Arc<TransactionRunner>,
        config: JobLockConfig,
    ) -> Self {
        let scheduler = Arc::new(RefreshScheduler::new(store.clone()));
        Self::with_scheduler(store, runner, config, scheduler)
    }

    /// Build a service around an externally owned refresh scheduler
    pub fn with_scheduler(
        store: Arc<dyn LockStore>,
        runner: Arc<TransactionRunner>,
        config: JobLockConfig,
        scheduler: Arc<RefreshScheduler>,
    ) -> Self {
        Self {
            config,
            store,
            runner,
            scheduler,
            txn_locks: Arc::new(DashMap::new()),
        }
    }

    pub fn scheduler(&self) -> &Arc<RefreshScheduler> {
        &self.scheduler
    }

    /// Take a lock bound to the given transaction with the default retry
    /// policy
    pub async fn get_transactional_lock(
        &self,
        ctx: &Arc<TransactionContext>,
        name: &LockName,
        ttl: Duration,
    ) -> Result<(), LockError> {
        self.get_transactional_lock_with_retry(
            ctx,
            name,
            ttl,
            self.config.retry_wait,
            self.config.retry_count,
        )
        .await
    }

    /// Take a lock bound to the given transaction
    ///
    /// The transaction id is the holder token; commit releases the held
    /// locks and rollback releases them best-effort. Locks must be taken
    /// in ascending name order: a request that sorts below a lock already
    /// held gets a single attempt instead of the full retry budget, so
    /// out-of-order contention fails fast instead of waiting.
    pub async fn get_transactional_lock_with_retry(
        &self,
        ctx: &Arc<TransactionContext>,
        name: &LockName,
        ttl: Duration,
        retry_wait: Duration,
        retry_count: u32,
    ) -> Result<(), LockError> {
        if !ctx.is_active() {
            return Err(LockError::IllegalState(
                "transactional lock requested outside an active transaction".to_string(),
            ));
        }
        let token = ctx.id().to_string();
        self.bind_transaction(ctx)?;

        let (already_held, in_order) = {
            let state = self.txn_locks.get(&token).ok_or_else(|| {
                LockError::IllegalState(format!("no lock state for transaction '{}'", token))
            })?;
            let already_held = state.held.contains(name);
            let in_order = state.held.last().map(|max| name > max).unwrap_or(true);
            (already_held, in_order)
        };

        if already_held {
            return self.refresh_in_txn(name, &token, ttl).await;
        }

        let attempts = if in_order {
            retry_count
        } else {
            debug!(name = %name, txn = %token, "Out-of-order lock request; single attempt");
            1
        };

        self.acquire_with_retry(name, &token, ttl, retry_wait, attempts)
            .await?;

        if let Some(mut state) = self.txn_locks.get_mut(&token) {
            state.held.insert(name.clone());
        }
        Ok(())
    }

    /// Take a lock outside any transaction, returning the holder token
    pub async fn get_lock(&self, name: &LockName, ttl: Duration) -> Result<String, LockError> {
        self.get_lock_with_retry(name, ttl, self.config.retry_wait, self.config.retry_count)
            .await
    }

    /// Take a manual lock with an explicit retry policy
    pub async fn get_lock_with_retry(
        &self,
        name: &LockName,
        ttl: Duration,
        retry_wait: Duration,
        retry_count: u32,
    ) -> Result<String, LockError> {
        let token = generate_token();
        self.acquire_with_retry(name, &token, ttl, retry_wait, retry_count)
            .await?;
        Ok(token)
    }

    /// Take a manual lock and keep it refreshed while `callback` reports
    /// the job active
    ///
    /// If the refresh cannot be scheduled the fresh lock is released again
    /// before the error is returned.
    pub async fn get_lock_with_callback(
        &self,
        name: &LockName,
        ttl: Duration,
        callback: Arc<dyn JobLockRefreshCallback>,
    ) -> Result<String, LockError> {
        let token = self.get_lock(name, ttl).await?;
        if let Err(err) = self.scheduler.schedule(name, &token, ttl, callback) {
            if let Err(release_err) = self.release_lock(&token, name).await {
                warn!(
                    name = %name,
                    token = %token,
                    error = %release_err,
                    "Failed to release lock after scheduling failure"
                );
            }
            return Err(err);
        }
        Ok(token)
    }

    /// Push the expiry of a held manual lock out by `ttl` from now
    pub async fn refresh_lock(
        &self,
        token: &str,
        name: &LockName,
        ttl: Duration,
    ) -> Result<(), LockError> {
        let result = self
            .runner
            .run_in_transaction(|_| {
                let store = self.store.clone();
                let name = name.clone();
                let token = token.to_string();
                async move { store.refresh(&name, &token, ttl).await }
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(
                err @ (LockError::Missing { .. }
                | LockError::HeldByOther { .. }
                | LockError::Held { .. }),
            ) => {
                debug!(name = %name, token = %token, error = %err, "Lock refresh denied");
                Err(LockError::Acquisition {
                    name: name.clone(),
                    token: token.to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Attach a refresh cycle to a lock that was taken without one
    pub fn refresh_lock_with_callback(
        &self,
        token: &str,
        name: &LockName,
        ttl: Duration,
        callback: Arc<dyn JobLockRefreshCallback>,
    ) -> Result<(), LockError> {
        self.scheduler.schedule(name, token, ttl, callback)
    }

    /// Release a manual lock
    ///
    /// Fails if the lock is no longer held by `token`.
    pub async fn release_lock(&self, token: &str, name: &LockName) -> Result<(), LockError> {
        let result = self
            .runner
            .run_in_transaction(|_| {
                let store = self.store.clone();
                let name = name.clone();
                let token = token.to_string();
                async move { store.release(&name, &token).await }
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(
                err @ (LockError::Missing { .. }
                | LockError::HeldByOther { .. }
                | LockError::Held { .. }),
            ) => {
                debug!(name = %name, token = %token, error = %err, "Lock release denied");
                Err(LockError::Acquisition {
                    name: name.clone(),
                    token: token.to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Release a manual lock, reporting whether it was still held
    ///
    /// `false` means the lock had already lapsed or was taken by another
    /// holder; store failures still propagate.
    pub async fn release_lock_verify(
        &self,
        token: &str,
        name: &LockName,
    ) -> Result<bool, LockError> {
        let result = self
            .runner
            .run_in_transaction(|_| {
                let store = self.store.clone();
                let name = name.clone();
                let token = token.to_string();
                async move { store.release(&name, &token).await }
            })
            .await;
        match result {
            Ok(()) => Ok(true),
            Err(LockError::Missing { .. }) | Err(LockError::HeldByOther { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Stop the refresh scheduler; held locks lapse by TTL
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    /// Register this service with the transaction so held locks are
    /// cleaned up on commit and rollback. Idempotent per transaction.
    fn bind_transaction(&self, ctx: &Arc<TransactionContext>) -> Result<(), LockError> {
        match self.txn_locks.entry(ctx.id().to_string()) {
            Entry::Occupied(_) => return Ok(()),
            Entry::Vacant(vacant) => {
                vacant.insert(TxnLockState::default());
            }
        }

        let txn_id = ctx.id().to_string();
        let store = self.store.clone();
        let runner = self.runner.clone();
        let txn_locks = self.txn_locks.clone();
        ctx.on_pre_commit(move || {
            Box::pin(async move {
                Self::release_held_on_commit(store, runner, txn_locks, txn_id).await
            })
        })?;

        let txn_id = ctx.id().to_string();
        let store = self.store.clone();
        let txn_locks = self.txn_locks.clone();
        ctx.on_post_rollback(move || {
            Box::pin(async move {
                Self::release_held_on_rollback(store, txn_locks, txn_id).await;
            })
        })?;

        Ok(())
    }

    /// Refresh a lock this transaction already holds instead of acquiring
    /// it again
    async fn refresh_in_txn(
        &self,
        name: &LockName,
        token: &str,
        ttl: Duration,
    ) -> Result<(), LockError> {
        let result = self
            .runner
            .run_in_transaction(|_| {
                let store = self.store.clone();
                let name = name.clone();
                let token = token.to_string();
                async move { store.refresh(&name, &token, ttl).await }
            })
            .await;
        match result {
            Ok(()) => {
                debug!(name = %name, txn = %token, "Transactional lock refreshed");
                Ok(())
            }
            Err(
                err @ (LockError::Missing { .. }
                | LockError::HeldByOther { .. }
                | LockError::Held { .. }),
            ) => {
                debug!(name = %name, txn = %token, error = %err, "Transactional lock lost");
                Err(LockError::Acquisition {
                    name: name.clone(),
                    token: token.to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Bounded acquisition loop
    ///
    /// Only a held lock is worth waiting for; every other failure
    /// propagates immediately. Exhausting the budget yields
    /// [`LockError::Acquisition`].
    async fn acquire_with_retry(
        &self,
        name: &LockName,
        token: &str,
        ttl: Duration,
        retry_wait: Duration,
        retry_count: u32,
    ) -> Result<(), LockError> {
        let max_attempts = retry_count.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .runner
                .run_in_transaction(|_| {
                    let store = self.store.clone();
                    let name = name.clone();
                    let token = token.to_string();
                    async move { store.acquire(&name, &token, ttl).await }
                })
                .await;
            match result {
                Ok(()) => {
                    debug!(name = %name, token = %token, attempt, "Lock acquired");
                    return Ok(());
                }
                Err(LockError::Held { .. }) if attempt < max_attempts => {
                    debug!(name = %name, attempt, "Lock busy; waiting to retry");
                    tokio::time::sleep(retry_wait).await;
                }
                Err(LockError::Held { .. }) => {
                    if let Ok(Some(record)) = self.store.find(name).await {
                        warn!(
                            name = %name,
                            holder = %record.token,
                            attempts = max_attempts,
                            "Gave up acquiring lock"
                        );
                    }
                    return Err(LockError::Acquisition {
                        name: name.clone(),
                        token: token.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Release every lock the transaction holds, lowest name first, inside
    /// one retried unit of work. A denied release surfaces as
    /// [`LockError::Acquisition`] and fails the commit, leaving the
    /// remaining locks to lapse by TTL.
    async fn release_held_on_commit(
        store: Arc<dyn LockStore>,
        runner: Arc<TransactionRunner>,
        txn_locks: Arc<DashMap<String, TxnLockState>>,
        txn_id: String,
    ) -> Result<(), LockError> {
        let result = runner
            .run_in_transaction(|_| {
                let store = store.clone();
                let txn_locks = txn_locks.clone();
                let txn_id = txn_id.clone();
                async move {
                    loop {
                        let next = txn_locks
                            .get(&txn_id)
                            .and_then(|state| state.held.iter().next().cloned());
                        let Some(name) = next else {
                            break;
                        };
                        match store.release(&name, &txn_id).await {
                            Ok(()) => {}
                            Err(
                                err @ (LockError::Missing { .. }
                                | LockError::HeldByOther { .. }
                                | LockError::Held { .. }),
                            ) => {
                                debug!(
                                    name = %name,
                                    txn = %txn_id,
                                    error = %err,
                                    "Commit-time release denied"
                                );
                                return Err(LockError::Acquisition {
                                    name: name.clone(),
                                    token: txn_id.clone(),
                                });
                            }
                            Err(err) => return Err(err),
                        }
                        if let Some(mut state) = txn_locks.get_mut(&txn_id) {
                            state.held.remove(&name);
                        }
                        debug!(name = %name, txn = %txn_id, "Released transactional lock on commit");
                    }
                    Ok(())
                }
            })
            .await;

        if result.is_ok() {
            txn_locks.remove(&txn_id);
        }
        result
    }

    /// Best-effort release after rollback; failures only log because the
    /// locks lapse by TTL anyway
    async fn release_held_on_rollback(
        store: Arc<dyn LockStore>,
        txn_locks: Arc<DashMap<String, TxnLockState>>,
        txn_id: String,
    ) {
        let Some((_, state)) = txn_locks.remove(&txn_id) else {
            return;
        };
        for name in state.held {
            match store.release(&name, &txn_id).await {
                Ok(()) => {
                    debug!(name = %name, txn = %txn_id, "Released transactional lock on rollback");
                }
                Err(err) => {
                    warn!(
                        name = %name,
                        txn = %txn_id,
                        error = %err,
                        "Failed to release lock during rollback; it will lapse by expiry"
                    );
                }
            }
        }
    }
}

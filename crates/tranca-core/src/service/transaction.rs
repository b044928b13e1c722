// Explicit transaction scope and retrying runner
// A unit of work runs against a fresh context; commit fires pre-commit
// hooks, rollback fires post-rollback hooks, and transient concurrency
// conflicts rerun the whole unit

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use tranca_common::{LockError, generate_token};

/// Transaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Work may run and hooks may be registered
    Active,
    /// Pre-commit hooks ran to completion
    Committed,
    /// The transaction was abandoned and post-rollback hooks ran
    RolledBack,
}

// Atomic state representation
const STATE_ACTIVE: u8 = 0;
const STATE_COMMITTED: u8 = 1;
const STATE_ROLLED_BACK: u8 = 2;

impl TransactionState {
    fn from_u8(v: u8) -> Self {
        match v {
            STATE_COMMITTED => TransactionState::Committed,
            STATE_ROLLED_BACK => TransactionState::RolledBack,
            _ => TransactionState::Active,
        }
    }
}

/// Options for a single transaction
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionOptions {
    /// Mark the unit of work as read-only; hooks still fire
    pub read_only: bool,
}

/// Hook fired before commit; a failure aborts the commit
pub type PreCommitHook = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), LockError>> + Send>;

/// Hook fired after rollback; best-effort
pub type PostRollbackHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// An explicit transaction scope carrying lifecycle hooks
///
/// The runner hands a context to each unit of work. The context id is a
/// GUID and doubles as the holder token for transactional locks.
pub struct TransactionContext {
    id: String,
    options: TransactionOptions,
    state: AtomicU8,
    pre_commit: parking_lot::Mutex<Vec<PreCommitHook>>,
    post_rollback: parking_lot::Mutex<Vec<PostRollbackHook>>,
}

impl TransactionContext {
    /// Begin a fresh transaction scope
    pub fn begin(options: TransactionOptions) -> Arc<TransactionContext> {
        let ctx = Arc::new(TransactionContext {
            id: generate_token(),
            options,
            state: AtomicU8::new(STATE_ACTIVE),
            pre_commit: parking_lot::Mutex::new(Vec::new()),
            post_rollback: parking_lot::Mutex::new(Vec::new()),
        });
        debug!(txn = %ctx.id, "Transaction started");
        ctx
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> TransactionOptions {
        self.options
    }

    pub fn state(&self) -> TransactionState {
        TransactionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Register a hook fired once before commit
    ///
    /// Fails once the transaction has completed.
    pub fn on_pre_commit<F>(&self, hook: F) -> Result<(), LockError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<(), LockError>> + Send + 'static,
    {
        if !self.is_active() {
            return Err(LockError::IllegalState(format!(
                "transaction '{}' already completed",
                self.id
            )));
        }
        self.pre_commit.lock().push(Box::new(hook));
        Ok(())
    }

    /// Register a hook fired once after rollback
    pub fn on_post_rollback<F>(&self, hook: F) -> Result<(), LockError>
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        if !self.is_active() {
            return Err(LockError::IllegalState(format!(
                "transaction '{}' already completed",
                self.id
            )));
        }
        self.post_rollback.lock().push(Box::new(hook));
        Ok(())
    }

    /// Run pre-commit hooks in registration order and mark the transaction
    /// committed. A failing hook rolls the transaction back instead and its
    /// error becomes the commit error.
    pub async fn commit(&self) -> Result<(), LockError> {
        if !self.is_active() {
            return Err(LockError::IllegalState(format!(
                "transaction '{}' already completed",
                self.id
            )));
        }

        let hooks = std::mem::take(&mut *self.pre_commit.lock());
        for hook in hooks {
            if let Err(err) = hook().await {
                warn!(txn = %self.id, error = %err, "Pre-commit hook failed; rolling back");
                self.run_post_rollback_hooks().await;
                return Err(err);
            }
        }

        self.state.store(STATE_COMMITTED, Ordering::SeqCst);
        debug!(txn = %self.id, "Transaction committed");
        Ok(())
    }

    /// Mark the transaction rolled back and run post-rollback hooks.
    /// A no-op once the transaction has completed.
    pub async fn rollback(&self) {
        if !self.is_active() {
            return;
        }
        self.run_post_rollback_hooks().await;
        debug!(txn = %self.id, "Transaction rolled back");
    }

    async fn run_post_rollback_hooks(&self) {
        // Completed before the hooks run so late registrations are refused
        self.state.store(STATE_ROLLED_BACK, Ordering::SeqCst);
        let hooks = std::mem::take(&mut *self.post_rollback.lock());
        for hook in hooks {
            hook().await;
        }
    }
}

/// Retry policy for the transaction runner
#[derive(Debug, Clone)]
pub struct TransactionRetryConfig {
    /// Times a unit of work is re-executed after a transient conflict
    /// (default: 20)
    pub max_retries: u32,
    /// Wait before the first re-execution, growing linearly per attempt
    /// (default: 100 ms)
    pub min_retry_wait: Duration,
    /// Upper bound for the wait between re-executions (default: 2 s)
    pub max_retry_wait: Duration,
}

impl Default for TransactionRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 20,
            min_retry_wait: Duration::from_millis(100),
            max_retry_wait: Duration::from_secs(2),
        }
    }
}

/// Runs units of work inside explicit transactions, retrying transient
/// concurrency conflicts with a linear backoff
pub struct TransactionRunner {
    config: TransactionRetryConfig,
}

impl Default for TransactionRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionRunner {
    /// Create a runner with the default retry policy
    pub fn new() -> Self {
        Self::with_config(TransactionRetryConfig::default())
    }

    /// Create a runner with a custom retry policy
    pub fn with_config(config: TransactionRetryConfig) -> Self {
        Self { config }
    }

    /// Run `work` in a fresh transaction and commit it
    ///
    /// Only [`LockError::ConcurrencyConflict`] triggers a re-execution;
    /// every other error rolls back and propagates unchanged.
    pub async fn run_in_transaction<T, F, Fut>(&self, work: F) -> Result<T, LockError>
    where
        F: Fn(Arc<TransactionContext>) -> Fut,
        Fut: Future<Output = Result<T, LockError>>,
    {
        self.run_with_options(TransactionOptions::default(), work)
            .await
    }

    /// Run `work` with explicit transaction options
    pub async fn run_with_options<T, F, Fut>(
        &self,
        options: TransactionOptions,
        work: F,
    ) -> Result<T, LockError>
    where
        F: Fn(Arc<TransactionContext>) -> Fut,
        Fut: Future<Output = Result<T, LockError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let ctx = TransactionContext::begin(options);

            let result = match work(ctx.clone()).await {
                Ok(value) => ctx.commit().await.map(|()| value),
                Err(err) => {
                    ctx.rollback().await;
                    Err(err)
                }
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt <= self.config.max_retries => {
                    let wait =
                        (self.config.min_retry_wait * attempt).min(self.config.max_retry_wait);
                    debug!(
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "Retrying transaction after transient conflict"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

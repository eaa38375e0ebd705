use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::{
    sync::{Mutex, OwnedMutexGuard},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use super::{
    backoff::Backoff,
    entities::{Entity, EntityKey, EntityKind},
    NorthboundTransport, TransportError,
};

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("Gave up on {} after {} attempts! Last error: {}", .key, .attempts, .last)]
    RetriesExhausted {
        key: String,
        attempts: u32,
        last: TransportError,
    },
    #[error("Couldn't apply {}! {}", .0, .1)]
    Permanent(String, TransportError),
    #[error("The database client is shutting down!")]
    Cancelled,
}

impl DbError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DbError::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindStats {
    pub ensure_calls: u64,
    pub writes: u64,
    pub noops: u64,
    pub delete_calls: u64,
    pub deletes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbStats(BTreeMap<EntityKind, KindStats>);

impl DbStats {
    pub fn kind(&self, kind: EntityKind) -> KindStats {
        self.0.get(&kind).copied().unwrap_or_default()
    }

    pub fn total(&self) -> KindStats {
        self.0.values().fold(KindStats::default(), |total, stats| KindStats {
            ensure_calls: total.ensure_calls + stats.ensure_calls,
            writes: total.writes + stats.writes,
            noops: total.noops + stats.noops,
            delete_calls: total.delete_calls + stats.delete_calls,
            deletes: total.deletes + stats.deletes,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbClientOptions {
    pub backoff: Backoff,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for DbClientOptions {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Level triggered front of the northbound database: every operation is an
/// idempotent read-compare-write, serialized per entity key.
pub struct DbClient {
    transport: Arc<dyn NorthboundTransport>,
    options: DbClientOptions,
    locks: StdMutex<HashMap<EntityKey, Arc<Mutex<()>>>>,
    stats: StdMutex<DbStats>,
    in_flight: AtomicUsize,
    cancel: CancellationToken,
    /// fired once an operation exhausted its retries
    failed: CancellationToken,
}

impl DbClient {
    pub fn new(
        transport: Arc<dyn NorthboundTransport>,
        options: DbClientOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            options,
            locks: StdMutex::new(HashMap::new()),
            stats: StdMutex::new(DbStats::default()),
            in_flight: AtomicUsize::new(0),
            cancel,
            failed: CancellationToken::new(),
        }
    }

    /// Makes the database object described by `entity` exist with exactly
    /// these fields. Returns `true` if anything had to be written.
    pub async fn ensure(&self, entity: impl Into<Entity>) -> Result<bool, DbError> {
        let entity = entity.into();
        let key = entity.key();
        let _operation = self.begin()?;
        let _guard = self.lock_key(&key).await;

        self.record(key.kind(), |stats| stats.ensure_calls += 1);

        let current = self
            .with_retries(&key, self.options.read_timeout, || self.transport.fetch(&key))
            .await?;

        if current.as_ref() == Some(&entity) {
            self.record(key.kind(), |stats| stats.noops += 1);
            return Ok(false);
        }

        self.with_retries(&key, self.options.write_timeout, || self.transport.apply(&entity))
            .await?;

        self.record(key.kind(), |stats| stats.writes += 1);

        debug!("Ensured {key}");

        Ok(true)
    }

    /// Removes the object and everything living in it. Returns `true` if it
    /// existed.
    pub async fn delete(&self, key: &EntityKey) -> Result<bool, DbError> {
        let _operation = self.begin()?;
        let guard = self.lock_key(key).await;

        self.record(key.kind(), |stats| stats.delete_calls += 1);

        let current = self
            .with_retries(key, self.options.read_timeout, || self.transport.fetch(key))
            .await?;

        if current.is_none() {
            return Ok(false);
        }

        self.with_retries(key, self.options.write_timeout, || self.transport.remove(key))
            .await?;

        self.record(key.kind(), |stats| stats.deletes += 1);

        drop(guard);
        self.forget_lock(key);

        debug!("Deleted {key}");

        Ok(true)
    }

    /// Every object of `kind`, ordered by key.
    pub async fn list(&self, kind: EntityKind) -> Result<Vec<Entity>, DbError> {
        let _operation = self.begin()?;
        let label = format!("{kind} listing");

        let mut entities = self
            .with_retries(&label, self.options.read_timeout, || self.transport.list(kind))
            .await?;

        entities.sort_by_key(|entity| entity.key());

        Ok(entities)
    }

    pub fn stats(&self) -> DbStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    /// Cancelled once some operation ran out of retries.
    pub fn failure_token(&self) -> CancellationToken {
        self.failed.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Waits for in-flight operations to finish, giving up at `deadline`.
    /// New operations are refused once the cancellation token fired.
    pub async fn close(&self, deadline: Duration) -> bool {
        let started = Instant::now();

        while self.in_flight() > 0 {
            if started.elapsed() >= deadline {
                warn!(
                    "Closing the database client with {} operations still in flight!",
                    self.in_flight()
                );
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        info!("Database client closed!");

        true
    }

    fn begin(&self) -> Result<OperationGuard<'_>, DbError> {
        if self.cancel.is_cancelled() {
            return Err(DbError::Cancelled);
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);

        Ok(OperationGuard(&self.in_flight))
    }

    async fn lock_key(&self, key: &EntityKey) -> OwnedMutexGuard<()> {
        let lock = match self.locks.lock() {
            Ok(mut locks) => locks.entry(key.clone()).or_default().clone(),
            Err(poisoned) => poisoned.into_inner().entry(key.clone()).or_default().clone(),
        };

        lock.lock_owned().await
    }

    fn forget_lock(&self, key: &EntityKey) {
        if let Ok(mut locks) = self.locks.lock() {
            // somebody else might be queued on it already
            if locks.get(key).map(|lock| Arc::strong_count(lock) == 1).unwrap_or(false) {
                locks.remove(key);
            }
        }
    }

    fn record(&self, kind: EntityKind, update: impl FnOnce(&mut KindStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(stats.0.entry(kind).or_default());
        }
    }

    async fn with_retries<T, F, Fut>(
        &self,
        label: &(dyn std::fmt::Display + Sync),
        timeout: Duration,
        mut operation: F,
    ) -> Result<T, DbError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let backoff = self.options.backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = match tokio::time::timeout(timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Transient(format!("timed out after {timeout:?}"))),
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_transient() {
                return Err(DbError::Permanent(label.to_string(), error));
            }

            if backoff.is_exhausted(attempt) {
                error!("Giving up on {label} after {attempt} attempts: {error}");
                self.failed.cancel();

                return Err(DbError::RetriesExhausted {
                    key: label.to_string(),
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = backoff.delay(attempt);

            warn!("{error} ({label}), retrying in {delay:?}...");

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(DbError::Cancelled),
                _ = tokio::time::sleep(delay) => (),
            }
        }
    }
}

struct OperationGuard<'a>(&'a AtomicUsize);

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

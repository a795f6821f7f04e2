//! Deduplicating, cancellable fetch orchestration.
//!
//! [`FetchCoordinator::resolve`] is the single entry point for "give me the
//! bytes of this image". It answers from the memory tier when it can.
//! Otherwise it makes sure exactly one fetch per [`CacheKey`] is in flight,
//! however many callers ask for that key at once. A fetch tries the disk
//! tier before the transport.
//!
//! ## Per-key lifecycle
//!
//! ```text
//! Idle ──resolve (miss)──▶ Pending ──transport ok──▶ Resolved  (bytes written to the store)
//!                            │    └──transport err─▶ Failed    (nothing written)
//!                            └──────cancel_all─────▶ Cancelled
//! ```
//!
//! A disk-tier hit resolves the fetch without touching the transport. Every
//! terminal state drops the key back to `Idle`; the next `resolve` checks the
//! store again and, on a miss, starts a fresh fetch.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::key::{CacheKey, Credentials};
use crate::store::Store;
use crate::transport::{FetchRequest, NetworkError, Transport};

/// Why a [`resolve`](FetchCoordinator::resolve) call produced no bytes.
#[derive(Debug, Error, Clone)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// The fetch was abandoned via [`cancel_all`](FetchCoordinator::cancel_all).
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Returns `true` if the fetch was abandoned rather than failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

type Outcome = Result<Bytes, FetchError>;

/// In-flight fetch state shared by every caller waiting on one key.
struct PendingFetch {
    key: CacheKey,
    outcome: watch::Sender<Option<Outcome>>,
    task: Mutex<Option<AbortHandle>>,
}

impl PendingFetch {
    fn new(key: CacheKey) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            key,
            outcome,
            task: Mutex::new(None),
        }
    }

    fn subscribe(&self) -> watch::Receiver<Option<Outcome>> {
        self.outcome.subscribe()
    }

    /// Publishes `outcome` unless one was already published.
    fn settle(&self, outcome: Outcome) -> bool {
        self.outcome.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    fn cancel(&self) {
        if self.settle(Err(FetchError::Cancelled)) {
            debug!(key = %self.key, "pending fetch cancelled");
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

struct Shared {
    store: Arc<Store>,
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<CacheKey, Arc<PendingFetch>>>,
}

impl Shared {
    /// Drops `flight` from the registry if it is still the registered fetch for its key.
    fn retire(&self, flight: &Arc<PendingFetch>) {
        let mut pending = self.pending.lock();
        if pending
            .get(&flight.key)
            .is_some_and(|current| Arc::ptr_eq(current, flight))
        {
            pending.remove(&flight.key);
        }
    }
}

/// Settles and retires a fetch however its task ends: completion, abort or panic.
struct FlightGuard {
    shared: Arc<Shared>,
    flight: Arc<PendingFetch>,
    outcome: Option<Outcome>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        // Retire before settling so a woken waiter that immediately resolves
        // again never finds this finished fetch still registered.
        self.shared.retire(&self.flight);
        let outcome = self.outcome.take().unwrap_or(Err(FetchError::Cancelled));
        self.flight.settle(outcome);
    }
}

async fn drive(shared: Arc<Shared>, flight: Arc<PendingFetch>, request: FetchRequest) {
    let mut guard = FlightGuard {
        shared,
        flight,
        outcome: None,
    };
    let store = Arc::clone(&guard.shared.store);
    let key = guard.flight.key.clone();

    if let Some(bytes) = store.load(&key).await {
        debug!(key = %key, url = %request.url, "served from disk tier");
        guard.outcome = Some(Ok(bytes));
        return;
    }

    let outcome = match guard.shared.transport.fetch(&request).await {
        Ok(bytes) => {
            debug!(key = %key, url = %request.url, size = bytes.len(), "fetch complete");
            store.save(&key, bytes.clone()).await;
            Ok(bytes)
        }
        Err(e) => {
            warn!(key = %key, url = %request.url, error = %e, "fetch failed");
            Err(FetchError::Network(e))
        }
    };
    guard.outcome = Some(outcome);
}

/// Resolves image requests against a [`Store`], fetching misses through a
/// [`Transport`] with at most one fetch in flight per key.
///
/// Cloning is cheap; clones share the store, the transport and the
/// pending-fetch registry.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use imcache::coordinator::FetchCoordinator;
/// use imcache::store::Store;
/// use imcache::transport::HttpTransport;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let coordinator = FetchCoordinator::new(
///         Arc::new(Store::with_capacity(128)),
///         Arc::new(HttpTransport::new()),
///     );
///     let bytes = coordinator.resolve("http://127.0.0.1:8080/logo.png", None).await?;
///     println!("{} bytes", bytes.len());
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct FetchCoordinator {
    shared: Arc<Shared>,
}

impl fmt::Debug for FetchCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchCoordinator")
            .field("store", &self.shared.store)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl FetchCoordinator {
    /// Creates a coordinator over `store` that fetches misses with `transport`.
    pub fn new(store: Arc<Store>, transport: Arc<dyn Transport>) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                transport,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the backing store.
    pub fn store(&self) -> &Arc<Store> {
        &self.shared.store
    }

    /// Returns the bytes for `url` fetched with `credentials`.
    ///
    /// Served from memory on a hit. On a miss the caller joins the fetch
    /// already in flight for the same key, or starts one. All callers of one
    /// fetch see the same outcome. Dropping the returned future abandons
    /// only this caller's wait; the shared fetch continues.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Network`]: the transport failed; nothing was cached.
    /// - [`FetchError::Cancelled`]: [`cancel_all`](Self::cancel_all) ran
    ///   while the fetch was pending.
    pub async fn resolve(
        &self,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Bytes, FetchError> {
        let key = CacheKey::derive(url, credentials);

        let mut outcome = {
            // The memory check and the registry decision happen under one lock
            // so two misses on the same key cannot both start a fetch. The
            // disk tier is consulted by the fetch task, off this lock.
            let mut pending = self.shared.pending.lock();
            if let Some(bytes) = self.shared.store.get_in_memory(&key) {
                return Ok(bytes);
            }

            match pending.get(&key) {
                Some(flight) => {
                    debug!(key = %key, url = %url, "joining in-flight fetch");
                    flight.subscribe()
                }
                None => {
                    debug!(key = %key, url = %url, "cache miss; starting fetch");
                    let flight = Arc::new(PendingFetch::new(key.clone()));
                    let outcome = flight.subscribe();
                    let request = FetchRequest::new(url, credentials.cloned());
                    let task = tokio::spawn(drive(
                        Arc::clone(&self.shared),
                        Arc::clone(&flight),
                        request,
                    ));
                    *flight.task.lock() = Some(task.abort_handle());
                    pending.insert(key, flight);
                    outcome
                }
            }
        };

        match outcome.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone().unwrap_or(Err(FetchError::Cancelled)),
            // Sender gone without an outcome; only possible if the flight was dropped unsettled.
            Err(_) => Err(FetchError::Cancelled),
        }
    }

    /// Cancels every pending fetch.
    ///
    /// Waiters are resolved with [`FetchError::Cancelled`] immediately and the
    /// fetch tasks are aborted. A fetch that already finished its transport
    /// read may still populate the store. Returns the number of fetches
    /// cancelled; calling this with nothing pending is a no-op.
    pub fn cancel_all(&self) -> usize {
        let cancelled: Vec<_> = self
            .shared
            .pending
            .lock()
            .drain()
            .map(|(_, flight)| flight)
            .collect();

        for flight in &cancelled {
            flight.cancel();
        }
        if !cancelled.is_empty() {
            info!(cancelled = cancelled.len(), "cancelled all pending fetches");
        }
        cancelled.len()
    }

    /// Number of keys with a fetch in flight.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Number of callers currently waiting on the fetch for `key`.
    #[cfg(test)]
    fn waiter_count(&self, key: &CacheKey) -> usize {
        self.shared
            .pending
            .lock()
            .get(key)
            .map_or(0, |flight| flight.outcome.receiver_count())
    }
}

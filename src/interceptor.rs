use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{error, info};

use crate::disk::DiskCache;
use crate::error::OnceError;
use crate::identity::Identity;
use crate::record::Invocation;

/// The engine's time source. Injected so tests can replay fixed timelines.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The shared handle all callers of one asynchronous identity await.
type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T, OnceError>>>;

/// Routes every intercepted call of one wrapped instance either to its
/// cached record or to a freshly created one.
///
/// The identity cache is the single shared mutable resource. Slot creation
/// is atomic under the lock (first writer wins); the computation itself
/// runs outside the lock so long or asynchronous work never blocks other
/// identities.
pub struct Interceptor {
    cache: Mutex<FxHashMap<Identity, Entry>>,
    /// Not-yet-memoized property values, keyed by getter identity.
    properties: Mutex<FxHashMap<Identity, Box<dyn Any + Send + Sync>>>,
    disk: DiskCache,
    clock: Clock,
    cancel: watch::Sender<bool>,
}

struct Entry {
    info: Arc<Invocation>,
    /// `Arc<OnceCell<Result<T, OnceError>>>` for synchronous calls,
    /// `SharedOutcome<T>` for asynchronous ones.
    handle: Box<dyn Any + Send + Sync>,
}

impl Interceptor {
    pub(crate) fn new(disk: DiskCache, clock: Clock, cancel: watch::Sender<bool>) -> Self {
        Self {
            cache: Mutex::new(FxHashMap::default()),
            properties: Mutex::new(FxHashMap::default()),
            disk,
            clock,
            cancel,
        }
    }

    /// Executes a synchronous operation, or replays its cached outcome.
    pub fn call<T, F>(&self, id: Identity, execute: F) -> Result<T, OnceError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> anyhow::Result<T>,
    {
        let (info, cell) = self.sync_slot::<T>(id);
        cell.get_or_init(|| self.run_sync(&info, execute)).clone()
    }

    /// Like [`call`](Self::call), but consults the disk cache tier first
    /// and persists a successful result for later process runs.
    pub fn call_cached<T, F>(&self, id: Identity, execute: F) -> Result<T, OnceError>
    where
        T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
        F: FnOnce() -> anyhow::Result<T>,
    {
        let (info, cell) = self.sync_slot::<T>(id);
        cell.get_or_init(|| {
            let uid = info.id().uid();
            let begin = (self.clock)();
            if let Some(value) = self.disk.load::<T>(&uid) {
                info!(task = %info, "uses cached result");
                info.replayed(begin, (self.clock)());
                return Ok(value);
            }
            let outcome = self.run_sync(&info, execute);
            if let Ok(value) = &outcome {
                self.disk.store(&uid, value);
            }
            outcome
        })
        .clone()
    }

    /// Executes an asynchronous operation at most once.
    ///
    /// The work is spawned onto the runtime; every caller (the creator and
    /// all joiners) awaits the same shared handle, racing the container-wide
    /// cancellation signal. Cancellation releases the waiters while the
    /// spawned execution still settles and determines the cached outcome.
    pub async fn call_async<T, F, Fut>(&self, id: Identity, execute: F) -> Result<T, OnceError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (info, shared) = self.async_slot(id, |info| self.launch(info, execute));
        self.join(&info, shared).await
    }

    /// Like [`call_async`](Self::call_async), with the disk cache tier in
    /// front of the execution. The result is persisted only after the
    /// underlying operation settles successfully.
    pub async fn call_cached_async<T, F, Fut>(
        &self,
        id: Identity,
        execute: F,
    ) -> Result<T, OnceError>
    where
        T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (info, shared) = self.async_slot(id, |info| self.launch_cached(info, execute));
        self.join(&info, shared).await
    }

    /// Updates a property's pending value.
    ///
    /// Allowed, and repeatable, as long as the paired getter has not been
    /// memoized yet; a read freezes the value permanently. No record is
    /// created for the write itself.
    pub fn set<T>(&self, property: Identity, value: T) -> Result<(), OnceError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let getter = property.getter_identity();
        let cache = self.cache.lock();
        if cache.contains_key(&getter) {
            return Err(OnceError::SetAfterFirstGet {
                property: property.to_string(),
            });
        }
        self.properties.lock().insert(getter, Box::new(value));
        Ok(())
    }

    /// Reads a property, memoizing its current pending value (or the
    /// default if it was never set).
    pub fn get<T>(&self, property: Identity, default: impl FnOnce() -> T) -> Result<T, OnceError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let slot = property.clone();
        self.call(property, || {
            Ok(match self
                .properties
                .lock()
                .get(&slot)
                .and_then(|value| value.downcast_ref::<T>())
            {
                Some(value) => value.clone(),
                None => default(),
            })
        })
    }

    /// A snapshot of every record this instance has created, for the
    /// timeline reporter.
    pub fn invocations(&self) -> Vec<Arc<Invocation>> {
        self.cache.lock().values().map(|entry| entry.info.clone()).collect()
    }

    /// Reserve-or-fetch for synchronous calls. The slot is created
    /// atomically under the lock; the cell's initialization happens after
    /// the lock is released.
    fn sync_slot<T>(&self, id: Identity) -> (Arc<Invocation>, Arc<OnceCell<Result<T, OnceError>>>)
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut cache = self.cache.lock();
        let entry = cache.entry(id).or_insert_with_key(|id| Entry {
            info: Arc::new(Invocation::new(id.clone())),
            handle: Box::new(Arc::new(OnceCell::<Result<T, OnceError>>::new())),
        });
        let cell = entry
            .handle
            .downcast_ref::<Arc<OnceCell<Result<T, OnceError>>>>()
            .expect("wrong entry type")
            .clone();
        (entry.info.clone(), cell)
    }

    /// Reserve-or-fetch for asynchronous calls. `launch` runs only for the
    /// caller that wins the creation race; everyone else receives a clone
    /// of the winner's shared handle.
    fn async_slot<T>(
        &self,
        id: Identity,
        launch: impl FnOnce(Arc<Invocation>) -> SharedOutcome<T>,
    ) -> (Arc<Invocation>, SharedOutcome<T>)
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get(&id) {
            let shared = entry
                .handle
                .downcast_ref::<SharedOutcome<T>>()
                .expect("wrong entry type")
                .clone();
            return (entry.info.clone(), shared);
        }
        let info = Arc::new(Invocation::new(id.clone()));
        let shared = launch(info.clone());
        cache.insert(
            id,
            Entry {
                info: info.clone(),
                handle: Box::new(shared.clone()),
            },
        );
        (info, shared)
    }

    fn run_sync<T, F>(&self, info: &Arc<Invocation>, execute: F) -> Result<T, OnceError>
    where
        T: Clone,
        F: FnOnce() -> anyhow::Result<T>,
    {
        info!(task = %info, "started");
        info.start((self.clock)());
        settle(info, (self.clock)(), execute())
    }

    fn launch<T, F, Fut>(&self, info: Arc<Invocation>, execute: F) -> SharedOutcome<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let clock = self.clock.clone();
        let task = {
            let info = info.clone();
            tokio::spawn(async move {
                info!(task = %info, "started");
                info.start(clock());
                let result = execute().await;
                settle(&info, clock(), result)
            })
        };
        supervise(info, self.clock.clone(), task)
    }

    fn launch_cached<T, F, Fut>(&self, info: Arc<Invocation>, execute: F) -> SharedOutcome<T>
    where
        T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let clock = self.clock.clone();
        let disk = self.disk.clone();
        let task = {
            let info = info.clone();
            tokio::spawn(async move {
                let uid = info.id().uid();
                let begin = clock();
                if let Some(value) = disk.load::<T>(&uid) {
                    info!(task = %info, "uses cached result");
                    info.replayed(begin, clock());
                    return Ok(value);
                }
                info!(task = %info, "started");
                info.start(clock());
                let result = execute().await;
                let outcome = settle(&info, clock(), result);
                if let Ok(value) = &outcome {
                    disk.store(&uid, value);
                }
                outcome
            })
        };
        supervise(info, self.clock.clone(), task)
    }

    /// Awaits the shared handle, racing the cancellation signal.
    async fn join<T>(
        &self,
        info: &Arc<Invocation>,
        shared: SharedOutcome<T>,
    ) -> Result<T, OnceError>
    where
        T: Clone,
    {
        let mut cancelled = self.cancel.subscribe();
        tokio::select! {
            biased;
            outcome = shared => outcome,
            _ = cancelled.wait_for(|cancel| *cancel) => Err(OnceError::Cancelled {
                target: info.to_string(),
            }),
        }
    }
}

/// Records the terminal transition and wraps failures so they can be
/// cached and replayed.
fn settle<T>(
    info: &Arc<Invocation>,
    now: DateTime<Utc>,
    result: anyhow::Result<T>,
) -> Result<T, OnceError> {
    match result {
        Ok(value) => {
            info.succeed(now);
            info!(task = %info, "succeeded");
            Ok(value)
        }
        Err(cause) => {
            let cause = Arc::new(cause);
            info.fail(now, cause.clone());
            error!(task = %info, cause = %cause, "failed");
            Err(OnceError::InvocationFailed {
                target: info.to_string(),
                cause,
            })
        }
    }
}

/// Turns a spawned execution into the shared handle callers await. A panic
/// inside the task becomes a cached failure instead of poisoning the slot.
fn supervise<T>(
    info: Arc<Invocation>,
    clock: Clock,
    task: tokio::task::JoinHandle<Result<T, OnceError>>,
) -> SharedOutcome<T>
where
    T: Clone + Send + Sync + 'static,
{
    async move {
        match task.await {
            Ok(outcome) => outcome,
            Err(err) => {
                let cause = Arc::new(anyhow::Error::new(err));
                info.fail(clock(), cause.clone());
                Err(OnceError::InvocationFailed {
                    target: info.to_string(),
                    cause,
                })
            }
        }
    }
    .boxed()
    .shared()
}

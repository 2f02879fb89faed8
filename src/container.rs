use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tokio::sync::watch;

use crate::contract::Contract;
use crate::disk::DiskCache;
use crate::error::OnceError;
use crate::interceptor::{Clock, Interceptor};

/// The handle a wrapper routes its calls through.
///
/// Cheap to clone so wrapper methods can move it into the closures they
/// hand to the interceptor.
#[derive(Clone)]
pub struct Engine(Arc<Interceptor>);

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Deref for Engine {
    type Target = Interceptor;

    fn deref(&self) -> &Interceptor {
        &self.0
    }
}

/// The entry point of the engine.
///
/// An explicitly constructed value passed down to wherever instances are
/// wrapped; there is no ambient default container. Wrapping verifies the
/// type's contract (once per type per container) and wires a fresh
/// interceptor to the container's clock, cache directory, and cancellation
/// signal.
pub struct Container {
    cancel: watch::Sender<bool>,
    clock: Clock,
    cache_dir: PathBuf,
    verified: Mutex<FxHashSet<&'static str>>,
}

impl Container {
    pub fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            cancel,
            clock: Arc::new(Utc::now),
            cache_dir: PathBuf::from(".cache"),
            verified: Mutex::new(FxHashSet::default()),
        }
    }

    /// Where the disk cache tier stores its entries.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Overrides the time source, mainly for tests.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Wraps a type instance: verifies its contract, then hands a fresh
    /// [`Engine`] to the decorator constructor.
    ///
    /// Fails with a configuration error, before any call can happen, if the
    /// contract rejects the type.
    pub fn wrap<W>(
        &self,
        contract: &Contract,
        build: impl FnOnce(Engine) -> W,
    ) -> Result<W, OnceError> {
        {
            let mut verified = self.verified.lock();
            if !verified.contains(contract.type_name()) {
                contract.verify()?;
                verified.insert(contract.type_name());
            }
        }
        let interceptor = Interceptor::new(
            DiskCache::new(self.cache_dir.clone()),
            self.clock.clone(),
            self.cancel.clone(),
        );
        Ok(build(Engine(Arc::new(interceptor))))
    }

    /// Triggers the container-wide cancellation signal. Every waiter on an
    /// in-flight asynchronous call is released; the executions themselves
    /// still settle and determine the cached outcomes.
    pub fn cancel_all(&self) {
        self.cancel.send_replace(true);
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, TimeDelta, Utc};

use crate::identity::Identity;

/// The lifecycle of one memoized call.
///
/// Derived from which of the record's fields are set: no begin timestamp
/// means `Pending`, a begin without an end means `InProgress`, an end means
/// `Done` unless an error was captured, in which case `Failed`. Terminal
/// states are permanent.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(match self {
            State::Pending => "Pending",
            State::InProgress => "InProgress",
            State::Done => "Done",
            State::Failed => "Failed",
        })
    }
}

/// The record of one memoized call.
///
/// Exactly one record exists per identity per wrapped instance. It is
/// created when the identity is first requested and mutated only by the
/// execution that owns it; every field transitions at most once.
pub struct Invocation {
    id: Identity,
    begin: OnceLock<DateTime<Utc>>,
    end: OnceLock<DateTime<Utc>>,
    error: OnceLock<Arc<anyhow::Error>>,
    replayed_from_disk: AtomicBool,
}

impl Invocation {
    pub(crate) fn new(id: Identity) -> Self {
        Self {
            id,
            begin: OnceLock::new(),
            end: OnceLock::new(),
            error: OnceLock::new(),
            replayed_from_disk: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &Identity {
        &self.id
    }

    pub fn begin(&self) -> Option<DateTime<Utc>> {
        self.begin.get().copied()
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end.get().copied()
    }

    /// The original error raised by the underlying operation, if any.
    pub fn error(&self) -> Option<&Arc<anyhow::Error>> {
        self.error.get()
    }

    pub fn failed(&self) -> bool {
        self.error.get().is_some()
    }

    /// Whether the result was restored from the disk cache tier instead of
    /// being computed.
    pub fn replayed_from_disk(&self) -> bool {
        self.replayed_from_disk.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> State {
        match (self.begin.get(), self.end.get()) {
            (None, _) => State::Pending,
            (Some(_), None) => State::InProgress,
            (Some(_), Some(_)) => {
                if self.failed() {
                    State::Failed
                } else {
                    State::Done
                }
            }
        }
    }

    /// Wall-clock time between begin and end, once both are known.
    pub fn duration(&self) -> Option<TimeDelta> {
        match (self.begin(), self.end()) {
            (Some(begin), Some(end)) => Some(end - begin),
            _ => None,
        }
    }

    pub(crate) fn start(&self, now: DateTime<Utc>) {
        let _ = self.begin.set(now);
    }

    pub(crate) fn succeed(&self, now: DateTime<Utc>) {
        let _ = self.end.set(now);
    }

    pub(crate) fn fail(&self, now: DateTime<Utc>, cause: Arc<anyhow::Error>) {
        let _ = self.error.set(cause);
        let _ = self.end.set(now);
    }

    /// Marks the record as settled directly from a disk-cache entry. This
    /// is the only path that lands in `Done` without passing `InProgress`.
    pub(crate) fn replayed(&self, begin: DateTime<Utc>, end: DateTime<Utc>) {
        self.replayed_from_disk.store(true, Ordering::Relaxed);
        let _ = self.begin.set(begin);
        let _ = self.end.set(end);
    }
}

impl Display for Invocation {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&self.id, f)
    }
}

//! Timer substrate that drives dispatcher ticks and retry backoff

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

use crate::error::{Error, Result};

/// Callback invoked on every interval of a periodic timer.
pub type PeriodicCallback = Box<dyn FnMut() + Send + 'static>;

/// Identifier of a registered periodic timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl TimerId {
    fn next(counter: &AtomicU64) -> Self {
        Self(counter.fetch_add(1, Ordering::Relaxed))
    }
}

/// Periodic callbacks and delays.
///
/// One scheduler drives one dispatcher; construct the dispatcher with the
/// scheduler that should own its ticks.
pub trait Scheduler: Send + Sync + 'static {
    /// Invoke `callback` every `interval` until cancelled.
    fn register_periodic(&self, interval: Duration, callback: PeriodicCallback) -> TimerId;

    /// Stop a periodic timer. Safe to call from inside its own callback.
    fn cancel_periodic(&self, id: TimerId);

    /// A future that completes after `duration`.
    fn delay(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

impl<S: Scheduler + ?Sized> Scheduler for Arc<S> {
    fn register_periodic(&self, interval: Duration, callback: PeriodicCallback) -> TimerId {
        (**self).register_periodic(interval, callback)
    }

    fn cancel_periodic(&self, id: TimerId) {
        (**self).cancel_periodic(id)
    }

    fn delay(&self, duration: Duration) -> BoxFuture<'static, ()> {
        (**self).delay(duration)
    }
}

/// Scheduler backed by a tokio runtime.
///
/// Each periodic timer is a spawned task ticking on `tokio::time::interval`.
/// The first callback runs one interval after registration.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
    timers: Arc<Mutex<HashMap<TimerId, AbortHandle>>>,
    next_id: Arc<AtomicU64>,
}

impl TokioScheduler {
    /// Schedule on the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Schedule on the runtime of the current context.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| Error::Runtime(e.to_string()))
    }

    /// Number of live periodic timers.
    pub fn active_timers(&self) -> usize {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Scheduler for TokioScheduler {
    fn register_periodic(&self, interval: Duration, mut callback: PeriodicCallback) -> TimerId {
        let id = TimerId::next(&self.next_id);
        let task = self.handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval() completes its first tick immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                callback();
            }
        });
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, task.abort_handle());
        trace!(?id, ?interval, "registered periodic timer");
        id
    }

    fn cancel_periodic(&self, id: TimerId) {
        let removed = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(task) = removed {
            task.abort();
            trace!(?id, "cancelled periodic timer");
        }
    }

    fn delay(&self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }
}

#[derive(Default)]
struct ManualState {
    timers: HashMap<TimerId, PeriodicCallback>,
    // checked out by advance() while their callbacks run
    firing: HashSet<TimerId>,
    cancelled: HashSet<TimerId>,
    delays: Vec<Duration>,
}

/// Scheduler driven by the caller.
///
/// Nothing happens until [`ManualScheduler::advance`] is called, which fires
/// every registered periodic callback exactly once. Delays complete
/// immediately and are recorded. Use it to embed the dispatcher in a foreign
/// event loop, or to step it deterministically.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    state: Arc<Mutex<ManualState>>,
    next_id: Arc<AtomicU64>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire every registered periodic callback once. Returns how many fired.
    pub fn advance(&self) -> usize {
        let mut due: Vec<(TimerId, PeriodicCallback)> = {
            let mut state = self.lock();
            let due: Vec<_> = state.timers.drain().collect();
            state.firing = due.iter().map(|(id, _)| *id).collect();
            due
        };
        // callbacks run unlocked so they can register or cancel timers
        for (_, callback) in due.iter_mut() {
            callback();
        }
        let fired = due.len();
        let mut state = self.lock();
        state.firing.clear();
        for (id, callback) in due {
            if !state.cancelled.remove(&id) {
                state.timers.insert(id, callback);
            }
        }
        fired
    }

    /// Number of registered periodic timers.
    pub fn active_timers(&self) -> usize {
        self.lock().timers.len()
    }

    /// Every delay requested so far, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.lock().delays.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("active_timers", &self.active_timers())
            .finish()
    }
}

impl Scheduler for ManualScheduler {
    fn register_periodic(&self, _interval: Duration, callback: PeriodicCallback) -> TimerId {
        let id = TimerId::next(&self.next_id);
        self.lock().timers.insert(id, callback);
        id
    }

    fn cancel_periodic(&self, id: TimerId) {
        let mut state = self.lock();
        if state.timers.remove(&id).is_none() && state.firing.contains(&id) {
            state.cancelled.insert(id);
        }
    }

    fn delay(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.lock().delays.push(duration);
        future::ready(()).boxed()
    }
}

//! Callback dispatch with per-handler isolation.
//!
//! Handlers are registered per [`DataType`] and run in registration
//! order. A handler that returns an error or panics is logged and counted;
//! the remaining handlers still see the event.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio_util::task::TaskTracker;

use crate::domain::streaming::{DataType, RealtimeEvent};
use crate::infrastructure::metrics;

/// Error type returned by callbacks.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

type ImmediateFn = dyn Fn(&RealtimeEvent) -> Result<(), HandlerError> + Send + Sync;
type ScheduledFn =
    dyn Fn(RealtimeEvent) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync;

// =============================================================================
// Callback
// =============================================================================

/// A user callback.
#[derive(Clone)]
pub enum Callback {
    /// Runs inline on the dispatch worker. Keep it short.
    Immediate(Arc<ImmediateFn>),
    /// Spawned as its own task for each event.
    Scheduled(Arc<ScheduledFn>),
}

impl Callback {
    /// Wrap a synchronous handler.
    pub fn immediate<F>(f: F) -> Self
    where
        F: Fn(&RealtimeEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self::Immediate(Arc::new(f))
    }

    /// Wrap an async handler.
    pub fn scheduled<F, Fut>(f: F) -> Self
    where
        F: Fn(RealtimeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self::Scheduled(Arc::new(move |event| f(event).boxed()))
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate(_) => f.write_str("Callback::Immediate"),
            Self::Scheduled(_) => f.write_str("Callback::Scheduled"),
        }
    }
}

/// Handle returned by registration, used to remove the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

impl CallbackId {
    /// Numeric value of the id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb-{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct Registration {
    id: CallbackId,
    callback: Callback,
}

// =============================================================================
// Dispatch Outcome
// =============================================================================

/// Result of dispatching one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Immediate handlers that completed successfully.
    pub completed: usize,
    /// Immediate handlers that errored or panicked.
    pub failed: usize,
    /// Scheduled handlers spawned.
    pub scheduled: usize,
}

// =============================================================================
// Callback Dispatcher
// =============================================================================

/// Maps data types to callbacks and delivers events.
pub struct CallbackDispatcher {
    handlers: RwLock<HashMap<DataType, Vec<Registration>>>,
    next_id: AtomicU64,
    failures: Arc<AtomicU64>,
    tracker: TaskTracker,
}

impl Default for CallbackDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CallbackDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackDispatcher")
            .field("handlers", &self.total_handlers())
            .field("failures", &self.failure_count())
            .finish_non_exhaustive()
    }
}

impl CallbackDispatcher {
    /// Create a dispatcher with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            failures: Arc::new(AtomicU64::new(0)),
            tracker: TaskTracker::new(),
        }
    }

    /// Register a callback for a data type.
    pub fn register(&self, data_type: DataType, callback: Callback) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(data_type)
            .or_default()
            .push(Registration { id, callback });

        tracing::debug!(data_type = %data_type, callback_id = %id, "Callback registered");
        id
    }

    /// Remove a callback. Returns `false` if it was not registered.
    pub fn unregister(&self, data_type: DataType, id: CallbackId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(&data_type) else {
            return false;
        };

        let before = list.len();
        list.retain(|r| r.id != id);
        let removed = list.len() != before;

        if list.is_empty() {
            handlers.remove(&data_type);
        }
        if removed {
            tracing::debug!(data_type = %data_type, callback_id = %id, "Callback removed");
        }
        removed
    }

    /// Number of callbacks registered for a data type.
    #[must_use]
    pub fn handler_count(&self, data_type: DataType) -> usize {
        self.handlers.read().get(&data_type).map_or(0, Vec::len)
    }

    /// Total callbacks across all data types.
    #[must_use]
    pub fn total_handlers(&self) -> usize {
        self.handlers.read().values().map(Vec::len).sum()
    }

    /// Handler failures (errors and panics) since creation.
    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Deliver an event to every callback registered for its data type.
    ///
    /// Immediate callbacks run before this returns. Scheduled callbacks are
    /// spawned and tracked; see [`Self::drain`].
    pub fn dispatch(&self, event: RealtimeEvent) -> DispatchOutcome {
        let data_type = event.data_type();

        // Snapshot so handlers can (un)register without deadlocking.
        let registrations = match self.handlers.read().get(&data_type) {
            Some(list) => list.clone(),
            None => return DispatchOutcome::default(),
        };

        let started = Instant::now();
        let mut outcome = DispatchOutcome::default();

        for registration in registrations {
            match registration.callback {
                Callback::Immediate(handler) => {
                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&event)));
                    match result {
                        Ok(Ok(())) => outcome.completed += 1,
                        Ok(Err(e)) => {
                            tracing::error!(
                                data_type = %data_type,
                                symbol = %event.symbol(),
                                callback_id = %registration.id,
                                error = %e,
                                "Callback returned an error"
                            );
                            self.record_failure(data_type);
                            outcome.failed += 1;
                        }
                        Err(panic) => {
                            tracing::error!(
                                data_type = %data_type,
                                symbol = %event.symbol(),
                                callback_id = %registration.id,
                                panic = panic_message(panic.as_ref()),
                                "Callback panicked"
                            );
                            self.record_failure(data_type);
                            outcome.failed += 1;
                        }
                    }
                }
                Callback::Scheduled(handler) => {
                    self.spawn_scheduled(registration.id, &handler, event.clone());
                    outcome.scheduled += 1;
                }
            }
        }

        metrics::record_dispatch_duration(data_type, started.elapsed());
        outcome
    }

    /// Wait for every in-flight scheduled callback to finish.
    ///
    /// The dispatcher stays usable afterwards.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Number of scheduled callbacks still running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    fn spawn_scheduled(&self, id: CallbackId, handler: &Arc<ScheduledFn>, event: RealtimeEvent) {
        let data_type = event.data_type();
        let failures = Arc::clone(&self.failures);

        // Building the future runs user code too, so it sits inside the guard.
        let fut = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event)));

        self.tracker.spawn(async move {
            let result = match fut {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(panic) => Err(panic),
            };

            let failed = match result {
                Ok(Ok(())) => false,
                Ok(Err(e)) => {
                    tracing::error!(
                        data_type = %data_type,
                        callback_id = %id,
                        error = %e,
                        "Scheduled callback returned an error"
                    );
                    true
                }
                Err(panic) => {
                    tracing::error!(
                        data_type = %data_type,
                        callback_id = %id,
                        panic = panic_message(panic.as_ref()),
                        "Scheduled callback panicked"
                    );
                    true
                }
            };

            if failed {
                failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_handler_failure(data_type);
            }
        });
    }

    fn record_failure(&self, data_type: DataType) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        metrics::record_handler_failure(data_type);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

// =============================================================================
// Tests
// =============================================================================

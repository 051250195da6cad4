use super::value::{AsyncError, AsyncValue};
use crate::arena::{SourceId, SourceMetadata, source_arena_insert, source_arena_remove};
use crate::effect::{Effect, effect, schedule_flush};
use crate::executor;
use crate::node::{NodeKind, Reactive};
use futures::channel::oneshot;
use futures::future::LocalBoxFuture;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Computed whose derivation suspends.
///
/// Driven by an internal effect: whenever a dependency read in the
/// factory's synchronous prefix changes, a new generation starts and the
/// factory is invoked again. A generation that is superseded before it
/// settles is discarded entirely; its result never reaches the state.
///
/// The observable [`AsyncValue`] keeps the previous successful value
/// through reloads and failures, so consumers can render stale data
/// rather than a spinner.
///
/// # Example
/// ```ignore
/// let user_id = signal(1_u32);
///
/// let id = user_id.clone();
/// let user = async_computed(move || {
///     // Synchronous prefix: dependencies are recorded HERE.
///     let id = id.get();
///     async move { fetch_user(id).await }.boxed_local()
/// });
///
/// user_id.set(2); // restarts; a still-running fetch for user 1 is discarded
/// ```
pub struct AsyncComputed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    inner: Arc<AsyncInner<T>>,
    driver: Effect,
}

pub(super) struct AsyncInner<T> {
    source: SourceId,
    state: RwLock<AsyncValue<T>>,
    generation: AtomicU64,
    settled: AtomicU64,
    waiters: Mutex<Vec<oneshot::Sender<Result<T, AsyncError>>>>,
    disposed: AtomicBool,
}

/// Create an async computed from a factory closure.
///
/// The factory is the synchronous tracked prefix: signal and computed
/// reads inside it record dependencies; the future it returns runs with
/// NO tracking. Use [`untrack`](crate::untrack)-free reads in the
/// factory and pass the values into the future.
///
/// The factory runs once immediately (a spawner must be installed on
/// this thread, see [`set_spawner`](crate::set_spawner) and
/// [`LocalRuntime`](crate::LocalRuntime)) and again on every dependency
/// change and [`refresh`](AsyncComputed::refresh).
pub fn async_computed<T, F>(mut factory: F) -> AsyncComputed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: FnMut() -> LocalBoxFuture<'static, Result<T, AsyncError>> + Send + 'static,
{
    let inner = AsyncInner::new();

    let driver_inner = Arc::clone(&inner);
    let driver = effect(move || {
        let Some(generation) = driver_inner.begin_generation() else {
            return;
        };

        // Synchronous prefix: dependency capture happens inside this
        // call, against this driver effect.
        let future = factory();

        let task_inner = Arc::clone(&driver_inner);
        executor::spawn(async move {
            let result = future.await;
            task_inner.settle(generation, result);
        });
    });

    AsyncComputed { inner, driver }
}

impl<T> AsyncInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub(super) fn new() -> Arc<Self> {
        Arc::new(Self {
            source: source_arena_insert(SourceMetadata::new()),
            state: RwLock::new(AsyncValue::Loading),
            generation: AtomicU64::new(0),
            settled: AtomicU64::new(0),
            waiters: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        })
    }

    /// Start a new generation and move the state to loading, keeping the
    /// previous successful value visible. Returns None once disposed.
    pub(super) fn begin_generation(&self) -> Option<u64> {
        if self.disposed.load(Ordering::Acquire) {
            return None;
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let mut state = self.state.write();
        let next = match &*state {
            AsyncValue::Data(value)
            | AsyncValue::LoadingWithPrevious(value)
            | AsyncValue::ErrorWithPrevious(_, value) => {
                AsyncValue::LoadingWithPrevious(value.clone())
            }
            AsyncValue::Loading | AsyncValue::Error(_) => AsyncValue::Loading,
        };
        let changed = *state != next;
        *state = next;
        drop(state);

        if changed {
            self.notify();
        }
        Some(generation)
    }

    /// Record the outcome of `generation`.
    ///
    /// A stale or post-dispose result is discarded without touching the
    /// state. Returns false when the caller should stop producing
    /// results for this generation (streams use this to end their loop).
    pub(super) fn settle(&self, generation: u64, result: Result<T, AsyncError>) -> bool {
        if self.disposed.load(Ordering::Acquire) {
            return false;
        }
        if self.generation.load(Ordering::Acquire) != generation {
            cov_mark::hit!(stale_generation_discarded);
            return false;
        }

        self.settled.store(generation, Ordering::Release);

        let next = {
            let state = self.state.read();
            match &result {
                Ok(value) => AsyncValue::Data(value.clone()),
                Err(error) => match state.latest() {
                    Some(previous) => {
                        AsyncValue::ErrorWithPrevious(error.clone(), previous.clone())
                    }
                    None => AsyncValue::Error(error.clone()),
                },
            }
        };

        let changed = {
            let mut state = self.state.write();
            if *state != next {
                *state = next;
                true
            } else {
                false
            }
        };
        if changed {
            self.notify();
        }

        for waiter in self.waiters.lock().drain(..) {
            let _ = waiter.send(result.clone());
        }
        true
    }

    fn notify(&self) {
        self.source.bump_version();
        self.source.mark_subscribers_dirty();
        schedule_flush();
    }

    fn in_flight(&self) -> bool {
        self.generation.load(Ordering::Acquire) != self.settled.load(Ordering::Acquire)
    }
}

impl<T> Drop for AsyncInner<T> {
    fn drop(&mut self) {
        source_arena_remove(self.source);
    }
}

impl<T> AsyncComputed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub(super) fn from_parts(inner: Arc<AsyncInner<T>>, driver: Effect) -> Self {
        Self { inner, driver }
    }

    /// Read the current state, recording a dependency edge if a
    /// subscriber is currently evaluating.
    pub fn value(&self) -> AsyncValue<T> {
        self.inner.source.track_read();
        self.inner.state.read().clone()
    }

    /// Read the current state without recording a dependency.
    pub fn peek_value(&self) -> AsyncValue<T> {
        self.inner.state.read().clone()
    }

    /// Whether a computation is currently in flight.
    pub fn is_loading(&self) -> bool {
        self.inner.state.read().is_loading()
    }

    /// Await the latest settled generation.
    ///
    /// Resolves with the data (or rejects with the error) of the
    /// generation that settles next - or immediately, if nothing is in
    /// flight. Rejects with [`AsyncError::Disposed`] if the computed is
    /// disposed first.
    pub fn future(&self) -> impl Future<Output = Result<T, AsyncError>> + 'static {
        let (sender, receiver) = oneshot::channel();

        if self.inner.disposed.load(Ordering::Acquire) {
            let _ = sender.send(Err(AsyncError::Disposed));
        } else if self.inner.in_flight() {
            self.inner.waiters.lock().push(sender);
        } else {
            match &*self.inner.state.read() {
                AsyncValue::Data(value) => {
                    let _ = sender.send(Ok(value.clone()));
                }
                AsyncValue::Error(error) | AsyncValue::ErrorWithPrevious(error, _) => {
                    let _ = sender.send(Err(error.clone()));
                }
                // Not yet driven; resolve with the next settle
                AsyncValue::Loading | AsyncValue::LoadingWithPrevious(_) => {
                    self.inner.waiters.lock().push(sender);
                }
            }
        }

        async move { receiver.await.unwrap_or(Err(AsyncError::Disposed)) }
    }

    /// Manually start a new generation without a dependency change.
    pub fn refresh(&self) {
        if self.inner.disposed.load(Ordering::Acquire) {
            return;
        }
        self.driver.invalidate();
    }

    /// Stop the driving effect and release the state.
    ///
    /// Any in-flight generation becomes stale and its result is
    /// discarded; pending [`future`](AsyncComputed::future) awaiters
    /// reject with [`AsyncError::Disposed`]. Idempotent. Reads after
    /// dispose see `Loading`.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Orphan whatever is still running
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.driver.stop();
        self.inner.waiters.lock().clear();
        *self.inner.state.write() = AsyncValue::Loading;
    }

    /// Whether [`dispose`](AsyncComputed::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}

impl<T> Clone for AsyncComputed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            driver: self.driver,
        }
    }
}

impl<T> Reactive for AsyncComputed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn kind(&self) -> NodeKind {
        NodeKind::AsyncComputed
    }
}

//! Task spawning for async derivations.
//!
//! The graph itself never polls futures. When an
//! [`async_computed`](crate::async_computed) or
//! [`stream_computed`](crate::stream_computed) restarts, it hands the
//! new future to the spawner installed on the current thread and moves
//! on; completion re-enters the graph through an ordinary notification.
//!
//! Two ways to install a spawner:
//!
//! - [`set_spawner`] adapts any single-threaded executor the host
//!   already runs (a UI event loop, `tokio::task::LocalSet`,
//!   `wasm_bindgen_futures`, ...).
//! - [`LocalRuntime`] bundles a `futures` [`LocalPool`] with the slot,
//!   for programs and tests that have no host loop. Tests drive it
//!   deterministically with [`LocalRuntime::run_until_stalled`].
//!
//! The slot is thread-local on purpose: graphs on different threads are
//! independent, and futures produced by async derivations are not
//! required to be `Send`.

use futures::executor::{LocalPool, LocalSpawner};
use futures::future::LocalBoxFuture;
use futures::task::LocalSpawnExt;
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

type SpawnFn = Rc<dyn Fn(LocalBoxFuture<'static, ()>)>;

thread_local! {
    static SPAWNER: RefCell<Option<SpawnFn>> = const { RefCell::new(None) };
}

/// Install the async spawner for this thread.
///
/// Replaces any previously installed spawner. In-flight tasks already
/// handed to the old spawner are unaffected.
pub fn set_spawner<F>(spawn: F)
where
    F: Fn(LocalBoxFuture<'static, ()>) + 'static,
{
    SPAWNER.with(|slot| {
        *slot.borrow_mut() = Some(Rc::new(spawn));
    });
}

/// Remove the spawner installed on this thread.
pub fn clear_spawner() {
    SPAWNER.with(|slot| {
        slot.borrow_mut().take();
    });
}

/// Hand a driver task to the installed spawner.
///
/// Panics if no spawner is installed on this thread; async derivations
/// cannot make progress without one, and failing loudly at the restart
/// site beats a computation that silently never resolves.
pub(crate) fn spawn<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    let spawner = SPAWNER.with(|slot| slot.borrow().clone());
    match spawner {
        Some(spawn) => spawn(Box::pin(future)),
        None => panic!(
            "no async spawner installed on this thread; \
             call set_spawner() or create a LocalRuntime before using async derivations"
        ),
    }
}

/// A self-contained single-threaded runtime for async derivations.
///
/// Creating one installs its spawner on the current thread. Drive it
/// with [`run_until_stalled`](LocalRuntime::run_until_stalled) (runs
/// every spawned task as far as it can get without blocking) or
/// [`block_on`](LocalRuntime::block_on).
///
/// # Example
/// ```ignore
/// let mut rt = LocalRuntime::new();
/// let user = async_computed(move || { /* ... */ });
/// rt.run_until_stalled();
/// assert!(matches!(user.value(), AsyncValue::Data(_)));
/// ```
pub struct LocalRuntime {
    pool: LocalPool,
}

impl LocalRuntime {
    /// Create a runtime and install its spawner on this thread.
    pub fn new() -> Self {
        let pool = LocalPool::new();
        let spawner: LocalSpawner = pool.spawner();
        set_spawner(move |future| {
            if let Err(error) = spawner.spawn_local(future) {
                tracing::warn!(?error, "spawn after runtime shutdown; task dropped");
            }
        });
        Self { pool }
    }

    /// Run every spawned task until none can make further progress.
    pub fn run_until_stalled(&mut self) {
        self.pool.run_until_stalled();
    }

    /// Run `future` to completion, driving spawned tasks as needed.
    pub fn block_on<F: Future>(&mut self, future: F) -> F::Output {
        self.pool.run_until(future)
    }
}

impl Default for LocalRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LocalRuntime {
    fn drop(&mut self) {
        clear_spawner();
    }
}

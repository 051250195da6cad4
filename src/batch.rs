use crate::arena::SourceId;
use crate::effect::{flush_effects, schedule_flush};
use crate::hash::FastHashBuilder;
use indexmap::IndexSet;
use std::cell::{Cell, RefCell};

// Thread-local batch depth counter. While > 0, signal writes stage
// instead of committing and effect processing is deferred.
thread_local! {
    static BATCH_DEPTH: Cell<usize> = const { Cell::new(0) };
}

// Commit thunks for signals staged during the current batch, in write
// order. Each signal registers itself at most once per batch.
thread_local! {
    static STAGED_COMMITS: RefCell<Vec<Box<dyn FnOnce()>>> = const { RefCell::new(Vec::new()) };
}

// Collector installed by `trigger`: sources read while it is active are
// recorded here and force-notified afterwards.
thread_local! {
    static TRIGGER_COLLECT: RefCell<Option<IndexSet<SourceId, FastHashBuilder>>> =
        const { RefCell::new(None) };
}

/// Check if a batch is currently open on this thread.
///
/// While true, signal writes stage their value and effects wait for the
/// outermost batch exit.
pub(crate) fn is_batch_active() -> bool {
    BATCH_DEPTH.with(Cell::get) > 0
}

/// Register a commit thunk to run at the outermost batch exit.
pub(crate) fn register_commit(commit: Box<dyn FnOnce()>) {
    STAGED_COMMITS.with(|staged| staged.borrow_mut().push(commit));
}

/// Record `source` in the active trigger collector, if any.
pub(crate) fn collect_triggered(source: SourceId) {
    TRIGGER_COLLECT.with(|collector| {
        if let Some(set) = collector.borrow_mut().as_mut() {
            set.insert(source);
        }
    });
}

/// RAII guard so a panicking batch body still commits what it staged
/// before the panic, and the effect queue still flushes, before the
/// panic continues to the caller.
struct BatchGuard;

impl Drop for BatchGuard {
    fn drop(&mut self) {
        end_batch();
    }
}

/// Run a closure with signal writes coalesced.
///
/// Every write inside the closure is staged; at the outermost batch exit
/// the staged values are committed in write order and the effect queue
/// is flushed once, so each affected effect runs at most once no matter
/// how many of its dependencies changed. A signal set and then reverted
/// to its original value within the batch notifies nobody.
///
/// Nested calls coalesce into the outermost batch. If the closure
/// panics, writes staged before the panic are still committed and
/// flushed, then the panic propagates.
///
/// # Example
/// ```ignore
/// let first = signal("Ada".to_string());
/// let last = signal("Lovelace".to_string());
/// // an effect reading both runs once, not twice:
/// batch(|| {
///     first.set("Grace".to_string());
///     last.set("Hopper".to_string());
/// });
/// ```
pub fn batch<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    start_batch();
    let _guard = BatchGuard;
    f()
}

/// Open a batch explicitly.
///
/// The closure form [`batch`] is preferred; this two-call form exists
/// for regions that cannot be expressed as a single callback. Every
/// `start_batch` must be paired with an [`end_batch`].
pub fn start_batch() {
    BATCH_DEPTH.with(|depth| depth.set(depth.get() + 1));
}

/// Close a batch opened with [`start_batch`].
///
/// Closing the outermost batch commits all staged writes in write order
/// and flushes the effect queue once. Unbalanced calls are ignored.
pub fn end_batch() {
    let depth = BATCH_DEPTH.with(|depth| {
        let next = depth.get().saturating_sub(1);
        depth.set(next);
        next
    });

    if depth == 0 {
        let staged = STAGED_COMMITS.with(|staged| staged.take());
        for commit in staged {
            commit();
        }
        flush_effects();
    }
}

/// Force-notify the subscribers of every source read inside `f`.
///
/// Used to manually re-assert reactivity after out-of-band mutation of
/// values held by signals (the reads in `f` identify which ones). Each
/// collected source gets its version bumped and its subscribers marked;
/// a subscriber depending on several of them still runs only once in
/// the following flush.
///
/// # Example
/// ```ignore
/// let items = signal(vec![1, 2, 3]);
/// // ...contents mutated through interior mutability...
/// trigger(|| {
///     items.get();
/// });
/// ```
pub fn trigger<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    struct CollectorGuard {
        previous: Option<IndexSet<SourceId, FastHashBuilder>>,
    }

    impl Drop for CollectorGuard {
        fn drop(&mut self) {
            TRIGGER_COLLECT.with(|collector| *collector.borrow_mut() = self.previous.take());
        }
    }

    let previous = TRIGGER_COLLECT
        .with(|collector| collector.borrow_mut().replace(IndexSet::default()));
    let guard = CollectorGuard { previous };

    let result = f();

    let collected = TRIGGER_COLLECT
        .with(|collector| collector.borrow_mut().take())
        .unwrap_or_default();
    drop(guard);

    for source in collected {
        source.bump_version();
        source.mark_subscribers_dirty();
    }
    schedule_flush();

    result
}

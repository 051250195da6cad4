use crate::arena::{
    SourceId, SourceMetadata, current_subscriber, source_arena_insert, source_arena_remove,
};
use crate::batch;
use crate::effect::schedule_flush;
use crate::node::{NodeKind, Reactive};
use parking_lot::{Mutex, RwLock};
use std::fmt::Debug;
use std::sync::Arc;

/// Mutable reactive cell holding a value.
///
/// Reading a signal inside an effect or computed records a dependency
/// edge, so the reader re-runs when the value changes. Writes compare
/// with `PartialEq` first: assigning an equal value is a no-op.
///
/// Outside a [`batch`](crate::batch) a write notifies subscribers
/// immediately; inside one the value is staged and committed once at the
/// outermost batch exit, so a write-then-revert within a batch never
/// wakes anybody.
///
/// Handles are cheap clones sharing one cell. The cell lives as long as
/// any handle does; dropping the last handle severs all subscriber edges
/// and releases the node.
///
/// # Example
/// ```ignore
/// let count = signal(0);
///
/// let count2 = count.clone();
/// effect(move || println!("count = {}", count2.get()));
///
/// count.set(1);            // prints "count = 1"
/// count.update(|n| n + 1); // prints "count = 2"
/// count.set(2);            // equal value: prints nothing
/// ```
pub struct Signal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    inner: Arc<SignalInner<T>>,
}

struct SignalInner<T> {
    source: SourceId,

    /// Committed value, the one subscribers have been notified about.
    current: RwLock<T>,

    /// Value staged by a write inside an open batch. Committed (or
    /// discarded, if it round-tripped back to `current`) at batch exit.
    pending: Mutex<Option<T>>,
}

/// Create a signal holding `initial`. Shorthand for [`Signal::new`].
pub fn signal<T>(initial: T) -> Signal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    Signal::new(initial)
}

impl<T> Signal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a new signal with the given initial value.
    pub fn new(initial: T) -> Self {
        let source = source_arena_insert(SourceMetadata::new());
        Self {
            inner: Arc::new(SignalInner {
                source,
                current: RwLock::new(initial),
                pending: Mutex::new(None),
            }),
        }
    }

    /// Read the value, recording a dependency edge if a subscriber is
    /// currently evaluating.
    ///
    /// Tracked reads always see the committed snapshot: a value staged
    /// inside an open batch is invisible here until the batch exits, so
    /// derivations can never cache state the graph was never notified
    /// about. Use [`peek`](Signal::peek) to read your own staged write
    /// back.
    pub fn get(&self) -> T {
        self.inner.source.track_read();
        self.inner.current.read().clone()
    }

    /// Read the value without recording a dependency, regardless of any
    /// active subscriber.
    ///
    /// Returns the latest assigned value: inside an open batch that is
    /// the staged write, outside it the committed one.
    pub fn peek(&self) -> T {
        self.latest()
    }

    /// Assign a new value.
    ///
    /// Equal values (by `PartialEq`) are ignored. Outside a batch the
    /// write commits and notifies immediately; inside a batch it is
    /// staged until the outermost exit.
    pub fn set(&self, value: T) {
        self.guard_read_write_cycle();

        if batch::is_batch_active() {
            let mut pending = self.inner.pending.lock();
            let first_stage = pending.is_none();
            *pending = Some(value);
            drop(pending);

            if first_stage {
                let inner = Arc::clone(&self.inner);
                batch::register_commit(Box::new(move || inner.commit()));
            }
        } else {
            if *self.inner.current.read() == value {
                cov_mark::hit!(write_equal_skipped);
                return;
            }
            *self.inner.current.write() = value;
            self.inner.source.bump_version();
            self.inner.source.mark_subscribers_dirty();
            schedule_flush();
        }
    }

    /// Compute a new value from the current one and assign it.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let next = f(&self.latest());
        self.set(next);
    }

    /// Assign a new value and return the previous one.
    ///
    /// The returned value is whatever a read would have seen just before
    /// the write. The write itself behaves exactly like [`Signal::set`].
    pub fn replace(&self, value: T) -> T {
        let previous = self.latest();
        self.set(value);
        previous
    }

    /// Force subscriber notification without a value change.
    ///
    /// Used when the contents of the held value were mutated out of band
    /// (say, interior mutability inside `T`) and reactivity needs a
    /// manual nudge. Bumps the version so version-checked consumers see
    /// a change; the equality short-circuit of ordinary writes is not
    /// affected.
    pub fn trigger(&self) {
        self.inner.source.bump_version();
        self.inner.source.mark_subscribers_dirty();
        schedule_flush();
    }

    /// Whether any effect or computed currently subscribes to this
    /// signal.
    pub fn has_subscribers(&self) -> bool {
        self.inner.source.has_subscribers()
    }

    fn latest(&self) -> T {
        if let Some(staged) = self.inner.pending.lock().as_ref() {
            return staged.clone();
        }
        self.inner.current.read().clone()
    }

    /// An effect that writes a signal it also reads would wake itself
    /// forever. Treat the read as untracked and warn, so the loop is
    /// broken at the cost of one stale subscription.
    fn guard_read_write_cycle(&self) {
        if let Some(subscriber) = current_subscriber() {
            if subscriber.has_dep(self.inner.source) {
                tracing::warn!(
                    source = ?self.inner.source,
                    subscriber = ?subscriber,
                    "effect both reads and writes the same signal; \
                     treating the read as untracked to avoid an infinite loop"
                );
                subscriber.remove_dep(self.inner.source);
                self.inner.source.remove_subscriber(subscriber);
            }
        }
    }
}

impl<T> SignalInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Commit a staged write at batch exit.
    ///
    /// A staged value equal to the committed one means the batch ended
    /// where it started; nobody is notified.
    fn commit(&self) {
        let Some(staged) = self.pending.lock().take() else {
            return;
        };
        if *self.current.read() == staged {
            cov_mark::hit!(revert_write_skipped);
            return;
        }
        *self.current.write() = staged;
        self.source.bump_version();
        self.source.mark_subscribers_dirty();
    }
}

impl<T> Clone for Signal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Drop for SignalInner<T> {
    fn drop(&mut self) {
        source_arena_remove(self.source);
    }
}

impl<T> Debug for Signal<T>
where
    T: Clone + PartialEq + Debug + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("value", &self.peek())
            .field("has_subscribers", &self.has_subscribers())
            .finish()
    }
}

impl<T> Reactive for Signal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn kind(&self) -> NodeKind {
        NodeKind::Signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::effect;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn get_and_set() {
        let s = signal(0);
        assert_eq!(s.get(), 0);

        s.set(42);
        assert_eq!(s.get(), 42);
    }

    #[test]
    fn update_and_replace() {
        let s = signal(10);
        s.update(|v| v + 5);
        assert_eq!(s.get(), 15);

        let old = s.replace(99);
        assert_eq!(old, 15);
        assert_eq!(s.get(), 99);
    }

    #[test]
    fn equal_write_is_a_noop() {
        cov_mark::check!(write_equal_skipped);

        let s = signal(5);
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();

        let s2 = s.clone();
        let _effect = effect(move || {
            s2.get();
            runs_clone.fetch_add(1, Ordering::Relaxed);
        });

        s.set(5);
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn clone_shares_state() {
        let a = signal(0);
        let b = a.clone();

        a.set(42);
        assert_eq!(b.get(), 42);

        b.set(100);
        assert_eq!(a.get(), 100);
    }

    #[test]
    fn peek_does_not_subscribe() {
        let s = signal(0);
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();

        let s2 = s.clone();
        let _effect = effect(move || {
            s2.peek();
            runs_clone.fetch_add(1, Ordering::Relaxed);
        });

        assert!(!s.has_subscribers());

        s.set(1);
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn trigger_notifies_without_change() {
        let s = signal(vec![1, 2]);
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();

        let s2 = s.clone();
        let _effect = effect(move || {
            s2.get();
            runs_clone.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(runs.load(Ordering::Relaxed), 1);

        s.trigger();
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn read_write_cycle_is_broken() {
        let s = signal(0);
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();

        let s2 = s.clone();
        let _effect = effect(move || {
            let v = s2.get();
            runs_clone.fetch_add(1, Ordering::Relaxed);
            if v < 10 {
                s2.set(v + 1);
            }
        });

        // The self-write untracked the read, so the effect settled
        // instead of looping forever.
        assert!(runs.load(Ordering::Relaxed) < 10);
    }
}

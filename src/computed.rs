use crate::arena::{
    SourceId, SourceMetadata, SubscriberId, SubscriberMetadata, current_subscriber,
    source_arena_insert, source_arena_remove, subscriber_arena_insert, subscriber_arena_remove,
    update_if_necessary,
};
use crate::node::{NodeKind, Reactive};
use parking_lot::RwLock;
use std::sync::Arc;

/// Lazily cached derivation over other reactive nodes.
///
/// A computed is both a subscriber (of the sources its derivation reads)
/// and a source (to its own readers). It is lazy: marking it stale costs
/// nothing, and re-evaluation happens on the next read, never during a
/// flush.
///
/// Staleness is resolved in two steps. A read first verifies whether any
/// recorded dependency actually changed version since the last run; a
/// write that round-tripped back to the original value leaves versions
/// untouched downstream, so nothing recomputes. If a dependency did
/// change, the derivation re-runs with the previous cached value as
/// input - and if the new result equals the old one, the computed's own
/// version is not bumped, so readers further downstream stay asleep.
///
/// # Example
/// ```ignore
/// let celsius = signal(0.0_f64);
///
/// let c = celsius.clone();
/// let fahrenheit = computed(move |_| c.get() * 9.0 / 5.0 + 32.0);
///
/// assert_eq!(fahrenheit.get(), 32.0);
/// celsius.set(100.0);
/// assert_eq!(fahrenheit.get(), 212.0);
/// ```
pub struct Computed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    inner: Arc<ComputedInner<T>>,
}

struct ComputedInner<T> {
    /// Output side: what readers of this computed subscribe to.
    source: SourceId,

    /// Input side: the node that owns the derivation's dependency edges.
    subscriber: SubscriberId,

    /// Cached result. None until the first evaluation.
    value: Arc<RwLock<Option<T>>>,
}

/// Create a computed from a derivation closure.
///
/// The closure receives the previous cached value (`None` on the first
/// run) to support incremental-update patterns. It does not run here;
/// the first [`get`](Computed::get) evaluates it.
pub fn computed<T, F>(f: F) -> Computed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: FnMut(Option<&T>) -> T + Send + 'static,
{
    Computed::new(f)
}

impl<T> Computed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a new computed. See [`computed`].
    pub fn new<F>(mut f: F) -> Self
    where
        F: FnMut(Option<&T>) -> T + Send + 'static,
    {
        let source = source_arena_insert(SourceMetadata::new());
        let value: Arc<RwLock<Option<T>>> = Arc::new(RwLock::new(None));

        // The recompute thunk lives in the subscriber arena and is run
        // through the same path as an effect body, with this node
        // installed as the active subscriber. Bumping the output version
        // only on a genuinely different result is the bail-out that
        // keeps downstream readers asleep.
        let value_for_thunk = Arc::clone(&value);
        let thunk: Box<dyn FnMut() + Send> = Box::new(move || {
            let previous = value_for_thunk.read().clone();
            let next = f(previous.as_ref());
            let changed = previous.as_ref() != Some(&next);
            *value_for_thunk.write() = Some(next);
            if changed {
                source.bump_version();
            } else {
                cov_mark::hit!(computed_bailout_equal);
            }
        });

        let subscriber = subscriber_arena_insert(SubscriberMetadata::new_computed(thunk, source));
        source.set_producer(subscriber);

        Self {
            inner: Arc::new(ComputedInner {
                source,
                subscriber,
                value,
            }),
        }
    }

    /// Read the computed value, recording a dependency edge if a
    /// subscriber is currently evaluating.
    ///
    /// O(1) when the cache is fresh. A stale cache is verified against
    /// dependency versions and recomputed only if something really
    /// changed. A panic in the derivation propagates to this caller and
    /// leaves the node stale, so a later read retries cleanly.
    pub fn get(&self) -> T {
        self.refresh();
        self.inner.source.track_read();
        self.inner
            .value
            .read()
            .clone()
            .expect("computed value present after refresh")
    }

    /// Read the computed value without recording a dependency.
    ///
    /// Still refreshes a stale cache; only the edge to the current
    /// subscriber is omitted.
    pub fn peek(&self) -> T {
        self.refresh();
        self.inner
            .value
            .read()
            .clone()
            .expect("computed value present after refresh")
    }

    /// Whether any effect or computed currently subscribes to this
    /// computed's output.
    pub fn has_subscribers(&self) -> bool {
        self.inner.source.has_subscribers()
    }

    fn refresh(&self) {
        // A derivation reading itself would recurse forever; serve the
        // cached value instead.
        if current_subscriber() == Some(self.inner.subscriber) {
            return;
        }
        update_if_necessary(self.inner.subscriber);
    }
}

impl<T> Clone for Computed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Drop for ComputedInner<T> {
    fn drop(&mut self) {
        self.subscriber.clear_deps();
        subscriber_arena_remove(self.subscriber);
        source_arena_remove(self.source);
    }
}

impl<T> Reactive for Computed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn kind(&self) -> NodeKind {
        NodeKind::Computed
    }
}

use crate::arena::{
    ActiveSubscriberGuard, NodeState, SubscriberId, SubscriberMetadata, current_subscriber,
    has_pending_effects, remove_from_pending, subscriber_arena_insert, subscriber_arena_remove,
    take_pending_effects, update_if_necessary,
};
use crate::arena::subscriber_arena::SubscriberKind;
use crate::node::{NodeKind, Reactive};
use std::cell::Cell;

// Thread-local re-entrancy guard for the flusher. Writes performed while
// a flush (or a subscriber evaluation) is underway are queued and picked
// up by the outer fixed-point loop instead of recursing.
thread_local! {
    static FLUSHING: Cell<bool> = const { Cell::new(false) };
}

/// Flush the pending effect queue now if nothing defers it.
///
/// Deferred while a batch is open (the batch exit flushes), while a
/// subscriber is evaluating (the surrounding flush loop picks the queue
/// back up), and while a flush is already running on this thread.
pub(crate) fn schedule_flush() {
    if crate::batch::is_batch_active() || current_subscriber().is_some() {
        return;
    }
    flush_effects();
}

/// Process all pending effects immediately.
///
/// Writes outside a batch call this automatically, so it is rarely
/// needed directly; it is useful after marking nodes by hand or from a
/// host event loop integration.
///
/// Uses fixed-point iteration: effects that dirty further effects while
/// running (by writing signals) are processed in the same flush, each at
/// most once per queue drain. Within one drain, effects run in creation
/// order, so an outer effect runs before effects it created.
///
/// Returns the number of effects that actually ran.
pub fn flush_effects() -> usize {
    struct FlushGuard;
    impl Drop for FlushGuard {
        fn drop(&mut self) {
            FLUSHING.with(|f| f.set(false));
        }
    }

    let already = FLUSHING.with(|f| f.replace(true));
    if already {
        return 0;
    }
    let _guard = FlushGuard;

    let mut total = 0;
    loop {
        let mut pending = take_pending_effects();
        if pending.is_empty() {
            break;
        }
        pending.sort_unstable_by_key(|id| id.created().unwrap_or(u64::MAX));

        tracing::trace!(count = pending.len(), "flushing effects");

        for id in pending {
            if id.state() != NodeState::Clean && update_if_necessary(id) {
                total += 1;
            }
        }
    }
    total
}

/// Run a subscriber's closure with a fresh dependency set.
///
/// This is the single evaluation path shared by effects and computeds:
/// 1. Sever the previous run's dependency edges (both sides).
/// 2. Install this node as the active subscriber (RAII, panic-safe).
/// 3. Run the closure; source reads re-record edges as they happen.
///
/// Effects are set Clean before the body runs so a write inside the body
/// can legitimately re-mark them. Computeds are set Clean by their own
/// thunk only after a successful evaluation, so a panicking derivation
/// stays Dirty and the next read retries.
pub(crate) fn run_node(id: SubscriberId) {
    let Some(kind) = id.kind() else {
        return;
    };

    remove_from_pending(id);
    if kind == SubscriberKind::Effect {
        id.set_state(NodeState::Clean);
    }

    id.clear_deps();

    {
        let _guard = ActiveSubscriberGuard::new(Some(id));
        id.run_callback();
    }

    // Skipped when the closure unwinds: a panicking derivation stays
    // Dirty so the next read recomputes instead of trusting a torn cache.
    if kind == SubscriberKind::Computed {
        id.set_state(NodeState::Clean);
    }
}

/// Run a closure without tracking dependencies.
///
/// Reads inside the closure record no edges, so the surrounding effect
/// or computed will not re-run when those sources change. Nesting is
/// fine; the previous tracking context is restored on exit, even on
/// panic.
///
/// # Example
/// ```ignore
/// let visible = signal(true);
/// let log_count = signal(0);
///
/// effect(move || {
///     if visible.get() {
///         // read without subscribing: changing log_count alone
///         // must not re-run this effect
///         let n = untrack(|| log_count.get());
///         println!("visible ({n} logs so far)");
///     }
/// });
/// ```
pub fn untrack<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ActiveSubscriberGuard::new(None);
    f()
}

/// Eager side effect that re-runs when its dependencies change.
///
/// The body runs synchronously at creation, recording every source it
/// reads. When any recorded source commits a change the effect re-runs:
/// immediately for a bare write, once at batch exit for writes inside a
/// batch (however many sources changed).
///
/// Dependencies are dynamic: each run records exactly what it read, so a
/// branch not taken this run is not subscribed and cannot wake the
/// effect.
///
/// Dropping the handle does NOT stop the effect; its lifetime is owned
/// by its subscriptions. Call [`Effect::stop`] (or stop an owning
/// [`EffectScope`](crate::EffectScope)) to end it.
///
/// # Example
/// ```ignore
/// let name = signal("world".to_string());
/// let greeter = effect(move || println!("hello {}", name.get()));
///
/// name.set("signals".to_string()); // prints "hello signals"
/// greeter.stop();
/// name.set("nobody".to_string()); // prints nothing
/// ```
#[derive(Clone, Copy, Debug)]
pub struct Effect {
    id: SubscriberId,
    created: u64,
}

/// Create an effect. The body runs once, synchronously, before this
/// returns.
///
/// If an [`effect_scope`](crate::effect_scope) setup closure is
/// currently executing on this thread, the new effect is captured by
/// that scope.
pub fn effect<F>(f: F) -> Effect
where
    F: FnMut() + Send + 'static,
{
    let id = subscriber_arena_insert(SubscriberMetadata::new_effect(Box::new(f)));
    let created = id.created().unwrap_or(0);

    let handle = Effect { id, created };
    crate::scope::register_with_current_scope(handle);

    run_node(id);
    // A body that writes signals leaves their effects queued; when the
    // creation happens outside any batch or flush, drain them now.
    schedule_flush();
    handle
}

impl Effect {
    /// Stop this effect permanently.
    ///
    /// Severs every dependency edge (after which no source lists this
    /// effect as a subscriber), removes it from the pending queue, and
    /// releases its storage. Idempotent: stopping twice, or stopping
    /// after an owning scope already did, is a no-op.
    pub fn stop(&self) {
        stop_effect(self.id, self.created);
    }

    /// Whether this effect has been stopped.
    pub fn is_stopped(&self) -> bool {
        !self.is_live()
    }

    /// Force this effect to re-run even though no dependency changed.
    pub fn invalidate(&self) {
        if self.is_live() {
            crate::arena::mark_effect_pending(self.id);
            schedule_flush();
        }
    }

    fn is_live(&self) -> bool {
        self.id
            .with(|meta| meta.created == self.created)
            .unwrap_or(false)
    }

    pub(crate) fn id(&self) -> SubscriberId {
        self.id
    }

    pub(crate) fn created(&self) -> u64 {
        self.created
    }
}

impl Reactive for Effect {
    fn kind(&self) -> NodeKind {
        NodeKind::Effect
    }
}

/// Stop an effect by id, validating the creation token first.
///
/// Slab slots are recycled, so a stale handle could otherwise stop an
/// unrelated node that happens to occupy the same index.
pub(crate) fn stop_effect(id: SubscriberId, created: u64) {
    let valid = id
        .with(|meta| meta.kind == SubscriberKind::Effect && meta.created == created)
        .unwrap_or(false);
    if !valid {
        return;
    }

    remove_from_pending(id);
    id.clear_deps();
    subscriber_arena_remove(id);
}

/// Whether any effect is queued and waiting for a flush.
pub fn is_flush_pending() -> bool {
    has_pending_effects()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::signal;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn effect_runs_once_at_creation() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();

        let _effect = effect(move || {
            runs_clone.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn effect_reruns_on_write() {
        let s = signal(0);
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();

        let s2 = s.clone();
        let _effect = effect(move || {
            s2.get();
            runs_clone.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(runs.load(Ordering::Relaxed), 1);

        s.set(1);
        assert_eq!(runs.load(Ordering::Relaxed), 2);

        s.set(2);
        assert_eq!(runs.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn stop_severs_subscriptions_and_is_idempotent() {
        let s = signal(0);
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();

        let s2 = s.clone();
        let eff = effect(move || {
            s2.get();
            runs_clone.fetch_add(1, Ordering::Relaxed);
        });

        assert!(s.has_subscribers());

        eff.stop();
        assert!(!s.has_subscribers());
        assert!(eff.is_stopped());

        s.set(1);
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        // Second stop is a no-op
        eff.stop();
    }

    #[test]
    fn untrack_suppresses_dependency_recording() {
        let tracked = signal(0);
        let ignored = signal(0);
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();

        let tracked2 = tracked.clone();
        let ignored2 = ignored.clone();
        let _effect = effect(move || {
            tracked2.get();
            untrack(|| ignored2.get());
            runs_clone.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(runs.load(Ordering::Relaxed), 1);

        ignored.set(5);
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        tracked.set(5);
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn untrack_nests_and_restores() {
        let outer = signal(0);
        let inner = signal(0);
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();

        let outer2 = outer.clone();
        let inner2 = inner.clone();
        let _effect = effect(move || {
            runs_clone.fetch_add(1, Ordering::Relaxed);
            untrack(|| {
                untrack(|| inner2.get());
                inner2.get();
            });
            // Tracking context is restored after the nested untracks
            outer2.get();
        });

        inner.set(1);
        assert_eq!(runs.load(Ordering::Relaxed), 1);

        outer.set(1);
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn writes_inside_effect_body_are_deferred() {
        let input = signal(0);
        let doubled = signal(0);
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();

        let input2 = input.clone();
        let doubled2 = doubled.clone();
        let _forward = effect(move || {
            let v = input2.get();
            doubled2.set(v * 2);
        });

        let doubled3 = doubled.clone();
        let _observer = effect(move || {
            doubled3.get();
            runs_clone.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(runs.load(Ordering::Relaxed), 1);

        input.set(4);
        assert_eq!(doubled.peek(), 8);
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn creation_time_writes_flush_immediately() {
        let out = signal(0);
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();

        let out2 = out.clone();
        let _observer = effect(move || {
            out2.get();
            runs_clone.fetch_add(1, Ordering::Relaxed);
        });

        let out3 = out.clone();
        let _writer = effect(move || {
            out3.set(7);
        });

        // The write performed during the writer's initial run reached
        // the observer without waiting for another notification
        assert_eq!(out.get(), 7);
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn invalidate_forces_rerun() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();

        let eff = effect(move || {
            runs_clone.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(runs.load(Ordering::Relaxed), 1);
        eff.invalidate();
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }
}

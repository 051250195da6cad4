use crate::effect::{Effect, stop_effect};
use crate::node::{NodeKind, Reactive};
use papaya::HashMap as PapayaHashMap;
use parking_lot::RwLock;
use std::cell::Cell;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

// Global scope registry: ScopeId -> owned children, in creation order.
// Scope ids are never recycled, so a stale handle can at worst miss.
static SCOPES: LazyLock<PapayaHashMap<u64, ScopeEntry>> = LazyLock::new(PapayaHashMap::new);

static SCOPE_SEQ: AtomicU64 = AtomicU64::new(1);

// Thread-local scope whose setup closure is currently executing. This is
// the ownership analogue of the active-subscriber slot: it decides who
// OWNS a new effect, not who depends on it.
thread_local! {
    static CURRENT_SCOPE: Cell<Option<u64>> = const { Cell::new(None) };
}

struct ScopeEntry {
    children: RwLock<Vec<ScopeChild>>,
}

#[derive(Clone, Copy)]
enum ScopeChild {
    Effect { id: crate::arena::SubscriberId, created: u64 },
    Scope(u64),
}

/// RAII guard installing a scope as the capture target, restoring the
/// previous one on drop (panic included).
struct CurrentScopeGuard {
    previous: Option<u64>,
}

impl CurrentScopeGuard {
    fn new(scope: Option<u64>) -> Self {
        let previous = CURRENT_SCOPE.with(|current| current.replace(scope));
        Self { previous }
    }
}

impl Drop for CurrentScopeGuard {
    fn drop(&mut self) {
        CURRENT_SCOPE.with(|current| current.set(self.previous));
    }
}

/// Capture a freshly created effect into the scope whose setup closure
/// is currently executing, if any.
pub(crate) fn register_with_current_scope(effect: Effect) {
    let Some(scope) = CURRENT_SCOPE.with(Cell::get) else {
        return;
    };
    let guard = SCOPES.pin();
    if let Some(entry) = guard.get(&scope) {
        entry.children.write().push(ScopeChild::Effect {
            id: effect.id(),
            created: effect.created(),
        });
    }
}

/// Ownership group for bulk-stopping effects.
///
/// Every [`effect`](crate::effect) and nested [`effect_scope`] created
/// during the synchronous execution of the setup closure is owned by the
/// scope. [`EffectScope::stop`] stops all of them transitively.
///
/// Only synchronous creation counts: an effect created later, say inside
/// a callback the setup merely registered, belongs to nobody. Effects
/// captured by reference from outside the setup closure are likewise
/// untouched by `stop`.
///
/// # Example
/// ```ignore
/// let ticks = signal(0);
///
/// let ticks2 = ticks.clone();
/// let scope = effect_scope(move || {
///     let t = ticks2.clone();
///     effect(move || println!("tick {}", t.get()));
/// });
///
/// ticks.set(1);  // prints
/// scope.stop();
/// ticks.set(2);  // silent; the owned effect is gone
/// ```
#[derive(Clone, Copy, Debug)]
pub struct EffectScope {
    id: u64,
}

/// Run a setup closure, capturing every effect and nested scope it
/// creates synchronously into the returned scope.
pub fn effect_scope<F>(setup: F) -> EffectScope
where
    F: FnOnce(),
{
    let id = SCOPE_SEQ.fetch_add(1, Ordering::Relaxed);
    SCOPES.pin().insert(
        id,
        ScopeEntry {
            children: RwLock::new(Vec::new()),
        },
    );

    // A scope created inside another scope's setup is owned by it.
    if let Some(parent) = CURRENT_SCOPE.with(Cell::get) {
        let guard = SCOPES.pin();
        if let Some(entry) = guard.get(&parent) {
            entry.children.write().push(ScopeChild::Scope(id));
        }
    }

    {
        let _guard = CurrentScopeGuard::new(Some(id));
        setup();
    }

    EffectScope { id }
}

impl EffectScope {
    /// Stop every owned effect and nested scope, transitively.
    ///
    /// Idempotent: a second stop, or stopping a scope whose parent
    /// already stopped it, is a no-op.
    pub fn stop(&self) {
        stop_scope(self.id);
    }

    /// Whether this scope has been stopped.
    pub fn is_stopped(&self) -> bool {
        !SCOPES.pin().contains_key(&self.id)
    }
}

fn stop_scope(id: u64) {
    let children: Vec<ScopeChild> = {
        let guard = SCOPES.pin();
        let Some(entry) = guard.get(&id) else {
            return;
        };
        let children = std::mem::take(&mut *entry.children.write());
        guard.remove(&id);
        children
    };

    for child in children {
        match child {
            ScopeChild::Effect { id, created } => stop_effect(id, created),
            ScopeChild::Scope(nested) => stop_scope(nested),
        }
    }
}

impl Reactive for EffectScope {
    fn kind(&self) -> NodeKind {
        NodeKind::EffectScope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::effect;
    use crate::signal::signal;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn scope_stops_owned_effects() {
        let s = signal(0);
        let runs = Arc::new(AtomicUsize::new(0));

        let s2 = s.clone();
        let runs_clone = runs.clone();
        let scope = effect_scope(move || {
            let s3 = s2.clone();
            let r = runs_clone.clone();
            effect(move || {
                s3.get();
                r.fetch_add(1, Ordering::Relaxed);
            });
        });

        assert_eq!(runs.load(Ordering::Relaxed), 1);
        s.set(1);
        assert_eq!(runs.load(Ordering::Relaxed), 2);

        scope.stop();
        assert!(scope.is_stopped());
        assert!(!s.has_subscribers());

        s.set(2);
        assert_eq!(runs.load(Ordering::Relaxed), 2);

        // Idempotent
        scope.stop();
    }

    #[test]
    fn nested_scopes_stop_transitively() {
        let s = signal(0);
        let runs = Arc::new(AtomicUsize::new(0));

        let s2 = s.clone();
        let runs_clone = runs.clone();
        let outer = effect_scope(move || {
            let s3 = s2.clone();
            let r = runs_clone.clone();
            effect_scope(move || {
                let s4 = s3.clone();
                let r2 = r.clone();
                effect(move || {
                    s4.get();
                    r2.fetch_add(1, Ordering::Relaxed);
                });
            });
        });

        assert_eq!(runs.load(Ordering::Relaxed), 1);

        outer.stop();
        s.set(1);
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn effects_outside_setup_are_not_captured() {
        let s = signal(0);
        let runs = Arc::new(AtomicUsize::new(0));

        let scope = effect_scope(|| {});

        let s2 = s.clone();
        let runs_clone = runs.clone();
        let free = effect(move || {
            s2.get();
            runs_clone.fetch_add(1, Ordering::Relaxed);
        });

        scope.stop();

        // The free effect survives the scope
        s.set(1);
        assert_eq!(runs.load(Ordering::Relaxed), 2);

        free.stop();
    }

    #[test]
    fn stopping_effect_directly_then_scope_is_safe() {
        let s = signal(0);

        let s2 = s.clone();
        let captured: Arc<parking_lot::Mutex<Option<Effect>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let captured_clone = captured.clone();
        let scope = effect_scope(move || {
            let s3 = s2.clone();
            let eff = effect(move || {
                s3.get();
            });
            *captured_clone.lock() = Some(eff);
        });

        let eff = captured.lock().take().expect("effect captured");
        eff.stop();
        // Scope stop sees an already-stopped child and skips it
        scope.stop();
        assert!(eff.is_stopped());
    }
}

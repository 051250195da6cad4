// Subscriber arena - storage for the "subscriber" side of the graph
//
// Every node that evaluates a closure (an Effect's body, a Computed's
// derivation) owns one entry here. The entry carries:
// - deps: ordered map of source -> version observed at the last read,
//   rebuilt from scratch on every evaluation (this is what prunes edges
//   to branches that were not taken this run)
// - state: three-state Clean/Check/Dirty
// - callback: the closure run on re-evaluation, stored in the arena
// - created: monotonic sequence used for flush ordering and for
//   validating handles against recycled slab slots
//
// THREE-STATE SYSTEM:
// - Clean (0): up to date, nothing to do
// - Check (1): might be stale, verify dependency versions first
// - Dirty (2): definitely stale, must re-run
//
// States only upgrade during a propagation phase and reset to Clean
// after a successful run.

use crate::hash::FastHashBuilder;
use indexmap::{IndexMap, IndexSet};
use parking_lot::{Mutex, RwLock};
use slab::Slab;
use std::cell::Cell;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use super::source_arena::SourceId;

/// Reactive node states - uses u8 for AtomicU8 compatibility
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum NodeState {
    /// Up to date, use cached result
    Clean = 0,
    /// Might be stale, verify dependency versions first
    Check = 1,
    /// Definitely stale, must re-run
    Dirty = 2,
}

impl NodeState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => NodeState::Clean,
            1 => NodeState::Check,
            _ => NodeState::Dirty,
        }
    }
}

/// What kind of closure a subscriber entry runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SubscriberKind {
    /// Lazily pulled derivation; never run by the flusher
    Computed,
    /// Eager side effect; queued and run by the flusher
    Effect,
}

/// Global subscriber arena
static SUBSCRIBER_ARENA: RwLock<Slab<SubscriberMetadata>> = RwLock::new(Slab::new());

/// Monotonic creation sequence shared by all subscriber nodes.
static NODE_SEQ: AtomicU64 = AtomicU64::new(1);

// Pending effect queue. IndexSet gives O(1) dedup while preserving the
// order in which effects were first marked; the flusher re-sorts by
// creation sequence so outer effects run before effects they created.
static PENDING_EFFECTS: LazyLock<RwLock<IndexSet<SubscriberId, FastHashBuilder>>> =
    LazyLock::new(|| RwLock::new(IndexSet::default()));

// Thread-local subscriber currently evaluating. Reads of any source
// record dependency edges against this node.
thread_local! {
    static CURRENT_SUBSCRIBER: Cell<Option<SubscriberId>> = const { Cell::new(None) };
}

/// Get the subscriber currently evaluating on this thread (if any)
pub(crate) fn current_subscriber() -> Option<SubscriberId> {
    CURRENT_SUBSCRIBER.with(Cell::get)
}

fn set_current_subscriber(subscriber: Option<SubscriberId>) -> Option<SubscriberId> {
    CURRENT_SUBSCRIBER.with(|c| c.replace(subscriber))
}

/// RAII guard that restores the previous active subscriber when dropped.
/// Restoration happens even if the evaluated closure panics.
pub(crate) struct ActiveSubscriberGuard {
    previous: Option<SubscriberId>,
}

impl ActiveSubscriberGuard {
    /// Install `subscriber` as the active subscriber, remembering the
    /// previous one. `None` suspends dependency tracking (untrack).
    pub(crate) fn new(subscriber: Option<SubscriberId>) -> Self {
        let previous = set_current_subscriber(subscriber);
        Self { previous }
    }
}

impl Drop for ActiveSubscriberGuard {
    fn drop(&mut self) {
        set_current_subscriber(self.previous);
    }
}

/// Unique identifier for a subscriber node in the arena.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SubscriberId(u32);

impl SubscriberId {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// Access the subscriber metadata with a closure (read-only).
    ///
    /// Returns None if the subscriber has been removed (stale access).
    pub(crate) fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&SubscriberMetadata) -> R,
    {
        let arena = SUBSCRIBER_ARENA.read();
        arena.get(self.index()).map(f)
    }

    pub(crate) fn kind(self) -> Option<SubscriberKind> {
        self.with(|meta| meta.kind)
    }

    pub(crate) fn created(self) -> Option<u64> {
        self.with(|meta| meta.created)
    }

    pub(crate) fn output(self) -> Option<SourceId> {
        self.with(|meta| meta.output).flatten()
    }

    pub(crate) fn state(self) -> NodeState {
        self.with(SubscriberMetadata::state).unwrap_or(NodeState::Clean)
    }

    pub(crate) fn set_state(self, state: NodeState) {
        self.with(|meta| meta.set_state(state));
    }

    /// Upgrade state only (Clean -> Check -> Dirty, never downgrade).
    ///
    /// Returns true if the state was actually upgraded.
    pub(crate) fn upgrade_state(self, new_state: NodeState) -> bool {
        self.with(|meta| meta.upgrade_state(new_state))
            .unwrap_or(false)
    }

    /// Record a dependency edge to `source`, observed at `version`.
    ///
    /// Re-reading the same source in one run keeps a single edge with the
    /// latest observed version.
    pub(crate) fn record_dep(self, source: SourceId, version: u64) {
        self.with(|meta| {
            meta.deps.write().insert(source, version);
        });
    }

    /// Drop the edge to `source` without touching the source's side.
    ///
    /// Used when a source is being destroyed and is clearing itself out
    /// of its subscribers.
    pub(crate) fn remove_dep(self, source: SourceId) {
        self.with(|meta| {
            meta.deps.write().swap_remove(&source);
        });
    }

    /// Whether this subscriber read `source` during its last run.
    pub(crate) fn has_dep(self, source: SourceId) -> bool {
        self.with(|meta| meta.deps.read().contains_key(&source))
            .unwrap_or(false)
    }

    /// Snapshot of the dependency edges in the order they were recorded.
    pub(crate) fn deps_snapshot(self) -> Vec<(SourceId, u64)> {
        self.with(|meta| {
            meta.deps
                .read()
                .iter()
                .map(|(source, version)| (*source, *version))
                .collect()
        })
        .unwrap_or_default()
    }

    /// Sever every dependency edge, both sides.
    ///
    /// Called before a re-run (the run re-records what it actually reads)
    /// and when the subscriber is stopped or destroyed.
    pub(crate) fn clear_deps(self) {
        let deps: Vec<SourceId> = self
            .with(|meta| meta.deps.write().drain(..).map(|(source, _)| source).collect())
            .unwrap_or_default();
        for source in deps {
            source.remove_subscriber(self);
        }
    }

    /// Run the closure stored in the arena for this subscriber.
    ///
    /// The callback is taken out of the arena for the duration of the
    /// call so it may itself create nodes (which needs the arena write
    /// lock). A drop guard restores it even if the callback panics.
    pub(crate) fn run_callback(self) {
        struct CallbackGuard {
            subscriber: SubscriberId,
            callback: Option<Box<dyn FnMut() + Send>>,
        }

        impl CallbackGuard {
            fn run(&mut self) {
                if let Some(ref mut cb) = self.callback {
                    cb();
                }
            }
        }

        impl Drop for CallbackGuard {
            fn drop(&mut self) {
                if let Some(cb) = self.callback.take() {
                    let arena = SUBSCRIBER_ARENA.read();
                    if let Some(meta) = arena.get(self.subscriber.index()) {
                        *meta.callback.lock() = Some(cb);
                    }
                }
            }
        }

        let callback = {
            let arena = SUBSCRIBER_ARENA.read();
            arena
                .get(self.index())
                .and_then(|meta| meta.callback.lock().take())
        };
        // Arena lock released - the callback can create new nodes

        if let Some(cb) = callback {
            let mut guard = CallbackGuard {
                subscriber: self,
                callback: Some(cb),
            };
            guard.run();
            // Guard drops here, restoring the callback to the arena
        }
    }

    /// Mark this subscriber and everything downstream of it as Check.
    ///
    /// Only Clean nodes are touched; a node already Check or Dirty has
    /// already propagated. Effects entering Check are queued so the
    /// flusher verifies them.
    pub(crate) fn mark_check_recursive(self) {
        if self.state() != NodeState::Clean {
            return;
        }
        self.set_state(NodeState::Check);
        match self.kind() {
            Some(SubscriberKind::Effect) => {
                PENDING_EFFECTS.write().insert(self);
            }
            Some(SubscriberKind::Computed) => {
                if let Some(output) = self.output() {
                    output.mark_subscribers_check();
                }
            }
            None => {}
        }
    }
}

/// Metadata for one subscriber node.
pub(crate) struct SubscriberMetadata {
    pub(crate) kind: SubscriberKind,

    /// Three-state Clean/Check/Dirty
    pub(crate) state: AtomicU8,

    /// Creation sequence; doubles as a handle-validation token because
    /// slab slots are recycled.
    pub(crate) created: u64,

    /// Output source for Computed nodes (None for effects).
    pub(crate) output: Option<SourceId>,

    /// The closure run on (re-)evaluation. For effects this is the user
    /// body; for computeds it is the recompute-and-compare thunk.
    pub(crate) callback: Mutex<Option<Box<dyn FnMut() + Send>>>,

    /// Dependency edges: source -> version observed at last read, in
    /// read order. Rebuilt on every evaluation.
    pub(crate) deps: RwLock<IndexMap<SourceId, u64, FastHashBuilder>>,
}

impl SubscriberMetadata {
    /// Metadata for an effect. Starts Clean; the initial run happens
    /// explicitly at creation.
    pub(crate) fn new_effect(callback: Box<dyn FnMut() + Send>) -> Self {
        Self {
            kind: SubscriberKind::Effect,
            state: AtomicU8::new(NodeState::Clean as u8),
            created: NODE_SEQ.fetch_add(1, Ordering::Relaxed),
            output: None,
            callback: Mutex::new(Some(callback)),
            deps: RwLock::new(IndexMap::with_hasher(FastHashBuilder)),
        }
    }

    /// Metadata for a computed. Starts Dirty so the first read computes.
    pub(crate) fn new_computed(callback: Box<dyn FnMut() + Send>, output: SourceId) -> Self {
        Self {
            kind: SubscriberKind::Computed,
            state: AtomicU8::new(NodeState::Dirty as u8),
            created: NODE_SEQ.fetch_add(1, Ordering::Relaxed),
            output: Some(output),
            callback: Mutex::new(Some(callback)),
            deps: RwLock::new(IndexMap::with_hasher(FastHashBuilder)),
        }
    }

    pub(crate) fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Upgrade state only, via compare_exchange so racing upgrades can
    /// never downgrade a node.
    pub(crate) fn upgrade_state(&self, new_state: NodeState) -> bool {
        let target = new_state as u8;
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current >= target {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }
}

/// Insert subscriber metadata into the arena and return its ID
pub(crate) fn subscriber_arena_insert(metadata: SubscriberMetadata) -> SubscriberId {
    let mut arena = SUBSCRIBER_ARENA.write();
    let entry = arena.vacant_entry();
    let key = entry.key();
    entry.insert(metadata);
    SubscriberId::new(key as u32)
}

/// Remove a subscriber from the arena
pub(crate) fn subscriber_arena_remove(id: SubscriberId) -> Option<SubscriberMetadata> {
    let mut arena = SUBSCRIBER_ARENA.write();
    if arena.contains(id.index()) {
        Some(arena.remove(id.index()))
    } else {
        None
    }
}

/// Mark an effect Dirty and queue it for the next flush.
///
/// Returns true if the effect was newly queued.
pub(crate) fn mark_effect_pending(id: SubscriberId) -> bool {
    id.upgrade_state(NodeState::Dirty);
    PENDING_EFFECTS.write().insert(id)
}

/// Atomically drain the pending effect queue.
///
/// drain(..) preserves the IndexSet's allocation across flushes.
pub(crate) fn take_pending_effects() -> Vec<SubscriberId> {
    PENDING_EFFECTS.write().drain(..).collect()
}

/// Whether any effect is waiting for a flush.
pub(crate) fn has_pending_effects() -> bool {
    !PENDING_EFFECTS.read().is_empty()
}

/// Remove an effect from the pending queue (used when it is stopped).
pub(crate) fn remove_from_pending(id: SubscriberId) {
    PENDING_EFFECTS.write().swap_remove(&id);
}

/// Bring a subscriber up to date if its state demands it.
///
/// This is the pull half of the three-state system:
/// - Clean: nothing to do.
/// - Check: refresh each recorded dependency in read order and compare
///   versions. The walk stops at the first real change; if none changed
///   the node is verified Clean without running.
/// - Dirty: re-run.
///
/// Returns true if the node's closure actually ran.
pub(crate) fn update_if_necessary(id: SubscriberId) -> bool {
    match id.state() {
        NodeState::Clean => false,

        NodeState::Check => {
            let mut changed = false;
            for (source, seen) in id.deps_snapshot() {
                source.refresh();
                match source.version() {
                    Some(version) if version != seen => {
                        cov_mark::hit!(check_found_changed_dep);
                        changed = true;
                        break;
                    }
                    // A destroyed source cannot have produced a new value
                    _ => {}
                }
            }
            if !changed {
                cov_mark::hit!(check_verified_clean);
                id.set_state(NodeState::Clean);
                return false;
            }
            id.set_state(NodeState::Dirty);
            run_node(id);
            true
        }

        NodeState::Dirty => {
            run_node(id);
            true
        }
    }
}

// Import run_node for use in update_if_necessary
use crate::effect::run_node;

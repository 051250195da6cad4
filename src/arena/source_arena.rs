// Source arena - storage for the "source" side of the reactive graph
//
// Every readable node (a Signal's cell, a Computed's output, an
// AsyncComputed's state) owns one entry here. The entry carries:
// - subscribers: the subscriber nodes that read this source last run
// - version: bumped on every committed value change, compared by
//   subscribers to decide whether a Check state must escalate to Dirty
// - producer: for Computed outputs, the subscriber node whose
//   re-evaluation refreshes this source on demand
//
// Dirty propagation is three-state (Clean/Check/Dirty): committing a
// source change marks direct subscribers Dirty and everything further
// downstream Check. Check is resolved lazily by version comparison.

use crate::hash::FastHashBuilder;
use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};
use slab::Slab;
use std::sync::atomic::{AtomicU64, Ordering};

use super::subscriber_arena::{self, SubscriberId, SubscriberKind, current_subscriber};

/// Global source arena - stores the read-side metadata of every reactive node
static SOURCE_ARENA: RwLock<Slab<SourceMetadata>> = RwLock::new(Slab::new());

/// Unique identifier for a source node in the arena.
///
/// This is a zero-cost wrapper around a slab index. When the owning
/// Signal/Computed is dropped it removes itself from the arena, making
/// this SourceId stale. Accessing a stale SourceId returns None.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SourceId(u32);

impl SourceId {
    /// Create a new SourceId from a raw index
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    /// Convert to usize for slab indexing
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// Access the source metadata with a closure (read-only)
    ///
    /// Returns None if the source has been removed (stale access).
    pub(crate) fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&SourceMetadata) -> R,
    {
        let arena = SOURCE_ARENA.read();
        arena.get(self.index()).map(f)
    }

    /// Current version of this source, or None for a stale id.
    pub(crate) fn version(self) -> Option<u64> {
        self.with(|meta| meta.version.load(Ordering::Acquire))
    }

    /// Bump the version counter.
    ///
    /// Called when a new value is committed, or by `trigger` to force a
    /// change to be observed without a genuine write.
    pub(crate) fn bump_version(self) {
        self.with(|meta| {
            meta.version.fetch_add(1, Ordering::AcqRel);
        });
    }

    /// Record a read of this source.
    ///
    /// If a subscriber is currently evaluating, a dependency edge is added
    /// in both directions, annotated with the version observed now. If a
    /// `trigger` collector is active, the source is recorded there too.
    pub(crate) fn track_read(self) {
        crate::batch::collect_triggered(self);

        if let Some(subscriber) = current_subscriber() {
            let Some(version) = self.version() else {
                return;
            };
            subscriber.record_dep(self, version);
            self.add_subscriber(subscriber);
        }
    }

    /// Add a subscriber to this source
    pub(crate) fn add_subscriber(self, subscriber: SubscriberId) {
        self.with(|meta| {
            meta.subscribers.write().insert(subscriber);
        });
    }

    /// Remove a subscriber from this source
    pub(crate) fn remove_subscriber(self, subscriber: SubscriberId) {
        self.with(|meta| {
            meta.subscribers.write().swap_remove(&subscriber);
        });
    }

    /// Execute a closure with the subscribers of this source.
    ///
    /// Passes a snapshot so the closure may freely mutate other nodes.
    pub(crate) fn with_subscribers<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&[SubscriberId]) -> R,
    {
        let snapshot: Option<Vec<SubscriberId>> =
            self.with(|meta| meta.subscribers.read().iter().copied().collect());
        snapshot.map(|subs| f(&subs))
    }

    /// Whether any subscriber currently holds an edge to this source.
    pub(crate) fn has_subscribers(self) -> bool {
        self.with(|meta| !meta.subscribers.read().is_empty())
            .unwrap_or(false)
    }

    /// The producer subscriber refreshing this source, if any.
    pub(crate) fn producer(self) -> Option<SubscriberId> {
        self.with(|meta| *meta.producer.lock()).flatten()
    }

    /// Register the producer for a Computed output.
    pub(crate) fn set_producer(self, producer: SubscriberId) {
        self.with(|meta| {
            *meta.producer.lock() = Some(producer);
        });
    }

    /// Ensure this source's value is fresh before a version comparison.
    ///
    /// Plain signals are always fresh. Computed outputs are refreshed by
    /// running their producer if it still has work recorded.
    pub(crate) fn refresh(self) {
        if let Some(producer) = self.producer() {
            subscriber_arena::update_if_necessary(producer);
        }
    }

    /// Notify subscribers that this source definitely changed.
    ///
    /// Direct subscribers are marked Dirty; effects among them enter the
    /// pending queue. Subscribers further downstream (reachable through a
    /// computed's output) are marked Check, to be verified lazily against
    /// dependency versions.
    pub(crate) fn mark_subscribers_dirty(self) {
        self.with_subscribers(|subscribers| {
            for &subscriber in subscribers {
                let Some(kind) = subscriber.kind() else {
                    continue;
                };
                match kind {
                    SubscriberKind::Effect => {
                        subscriber_arena::mark_effect_pending(subscriber);
                    }
                    SubscriberKind::Computed => {
                        subscriber.upgrade_state(super::NodeState::Dirty);
                        if let Some(output) = subscriber.output() {
                            output.mark_subscribers_check();
                        }
                    }
                }
            }
        });
    }

    /// Mark all subscribers of this source as Check, recursively.
    ///
    /// Stops at nodes that are already Check or Dirty; states never
    /// downgrade during a propagation phase, so revisiting is pointless.
    pub(crate) fn mark_subscribers_check(self) {
        self.with_subscribers(|subscribers| {
            if !subscribers.is_empty() {
                cov_mark::hit!(marking_subscribers_check);
            }
            for &subscriber in subscribers {
                subscriber.mark_check_recursive();
            }
        });
    }
}

/// Metadata for one source node.
#[derive(Debug)]
pub(crate) struct SourceMetadata {
    /// Version counter, bumped on every committed change. Starts at 1 so
    /// a freshly recorded edge always has a valid observed version.
    pub(crate) version: AtomicU64,

    /// Subscribers that read this source during their last evaluation.
    /// IndexSet keeps notification order deterministic (insertion order).
    pub(crate) subscribers: RwLock<IndexSet<SubscriberId, FastHashBuilder>>,

    /// Producer subscriber for Computed outputs (None for signals and
    /// async state cells, which are written rather than pulled).
    pub(crate) producer: Mutex<Option<SubscriberId>>,
}

impl SourceMetadata {
    pub(crate) fn new() -> Self {
        Self {
            version: AtomicU64::new(1),
            subscribers: RwLock::new(IndexSet::with_hasher(FastHashBuilder)),
            producer: Mutex::new(None),
        }
    }
}

impl Default for SourceMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Insert a source into the arena and return its ID
pub(crate) fn source_arena_insert(metadata: SourceMetadata) -> SourceId {
    let mut arena = SOURCE_ARENA.write();
    let entry = arena.vacant_entry();
    let key = entry.key();
    entry.insert(metadata);
    SourceId::new(key as u32)
}

/// Remove a source from the arena.
///
/// Severs the edge held by every remaining subscriber first, so no stale
/// SourceId lingers in a dependency map after the slot is recycled.
pub(crate) fn source_arena_remove(id: SourceId) -> Option<SourceMetadata> {
    id.with_subscribers(|subscribers| {
        for &subscriber in subscribers {
            subscriber.remove_dep(id);
        }
    });

    let mut arena = SOURCE_ARENA.write();
    if arena.contains(id.index()) {
        Some(arena.remove(id.index()))
    } else {
        None
    }
}

// Arena-based storage for reactive node metadata
//
// This module provides two separate arenas:
// - Source arena: the read side (subscribers, version counter, producer)
// - Subscriber arena: the evaluation side (dependency edges, state,
//   callback, creation sequence)
//
// A Signal owns a source entry; an Effect owns a subscriber entry; a
// Computed owns one of each. The arenas are global statics guarded by
// RwLock; SourceId and SubscriberId are lightweight newtypes indexing
// into the slabs, which sidesteps ownership cycles in the graph.

// Note: subscriber_arena is declared first because source_arena depends
// on SubscriberId
pub mod subscriber_arena;

pub mod source_arena;

pub(crate) use subscriber_arena::{
    ActiveSubscriberGuard, NodeState, SubscriberMetadata, current_subscriber, has_pending_effects,
    mark_effect_pending, remove_from_pending, subscriber_arena_insert, subscriber_arena_remove,
    take_pending_effects, update_if_necessary,
};

pub(crate) use subscriber_arena::SubscriberId;

pub(crate) use source_arena::{SourceMetadata, source_arena_insert, source_arena_remove};

pub(crate) use source_arena::SourceId;

#![deny(missing_docs)]

//! Fine-grained reactive state propagation.
//!
//! A dependency graph of mutable cells and derivations that re-runs
//! exactly the work a change requires: no diffing, no redundant
//! recomputation, no glitches from half-propagated updates.
//!
//! # Quick Start
//!
//! ```ignore
//! use glint::{batch, computed, effect, signal};
//!
//! let price = signal(10_u32);
//! let quantity = signal(2_u32);
//!
//! let p = price.clone();
//! let q = quantity.clone();
//! let total = computed(move |_| p.get() * q.get());
//!
//! let t = total.clone();
//! effect(move || println!("total: {}", t.get())); // prints "total: 20"
//!
//! batch(|| {
//!     price.set(7);
//!     quantity.set(3);
//! }); // prints "total: 21" - once, not twice
//! ```
//!
//! # Core Types
//!
//! - [`Signal`] - Mutable reactive cell. Writes are equality-checked and
//!   batched; subscribers re-run only on genuine change.
//! - [`Computed`] - Lazily cached derivation. Verified against
//!   dependency versions before recomputing, and downstream stays
//!   asleep when a recomputation produces an equal result.
//! - [`Effect`] - Eager side effect, re-run when its dynamically
//!   recorded dependencies change. [`Effect::stop`] ends it.
//! - [`EffectScope`] - Ownership group; stopping it stops every effect
//!   created during its setup closure.
//! - [`batch`] (and the explicit [`start_batch`]/[`end_batch`] pair) -
//!   Coalesce writes; effects run once at the outermost exit.
//! - [`AsyncComputed`] - Derivation whose body suspends; dependencies
//!   are captured in the synchronous prefix and stale in-flight
//!   generations are discarded by generation counter.
//!
//! # Dependency tracking
//!
//! Reads record edges against the subscriber currently evaluating on
//! this thread; edges are rebuilt from scratch every run, so a branch
//! not taken this run is not subscribed ("lazy branches"). [`untrack`]
//! suspends recording for a nested read. [`trigger`] force-notifies
//! after out-of-band mutation.
//!
//! # Threading model
//!
//! One logical thread of control per graph: all propagation is
//! synchronous and re-entrant (nested batches, nested untrack, effects
//! creating effects), with the ambient tracking context held
//! thread-locally. The async layer suspends only after dependency
//! capture completes, and cancellation is stale-result discard, never
//! interruption.

// Internal modules
pub(crate) mod arena;
mod asynk;
mod batch;
mod computed;
mod effect;
mod executor;
mod hash;
mod node;
mod scope;
mod signal;
mod watch;

// Core types
pub use computed::{Computed, computed};
pub use effect::{Effect, effect};
pub use scope::{EffectScope, effect_scope};
pub use signal::{Signal, signal};

// Scheduling
pub use batch::{batch, end_batch, start_batch, trigger};
pub use effect::{flush_effects, is_flush_pending, untrack};

// Introspection
pub use node::{NodeKind, Reactive, is_computed, is_effect, is_effect_scope, is_signal};

// UI bridge
pub use watch::{ErrorHandler, Watcher};

// Async layer
pub use asynk::{
    AsyncComputed, AsyncError, AsyncValue, RetryPolicy, async_computed, combine_async, retry,
    retry_sync, stream_computed,
};
pub use executor::{LocalRuntime, clear_spawner, set_spawner};

#[cfg(test)]
mod tests;

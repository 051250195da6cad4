//! Async reactive derivations.
//!
//! An async derivation is a computed whose body suspends. The tracked
//! region is the SYNCHRONOUS PREFIX ONLY: the factory closure runs with
//! dependency tracking installed, and the future it returns runs
//! untracked. Read every input you depend on in the factory, before
//! constructing the future; a signal read after the first suspension
//! point records nothing, by design. The factory/future type split
//! exists to make that boundary impossible to miss.
//!
//! Restarts are cancelled by generation, not interruption: when an input
//! changes while a computation is in flight, the old future keeps
//! running but its eventual result is compared against the generation
//! counter and silently discarded.

mod computed;
mod retry;
mod stream;
mod value;

pub use computed::{AsyncComputed, async_computed};
pub use retry::{RetryPolicy, retry, retry_sync};
pub use stream::stream_computed;
pub use value::{AsyncError, AsyncValue, combine_async};

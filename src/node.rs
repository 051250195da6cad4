//! Type introspection for reactive nodes.
//!
//! Heterogeneous collections and adapter layers sometimes hold reactive
//! handles behind generics or trait objects; these predicates recover
//! which primitive they are dealing with without downcasting.

/// What kind of reactive primitive a handle is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Mutable reactive source cell
    Signal,
    /// Lazily cached derivation
    Computed,
    /// Eager side effect
    Effect,
    /// Ownership group for effects
    EffectScope,
    /// Async derivation driven by an internal effect
    AsyncComputed,
}

/// Implemented by every reactive handle type.
pub trait Reactive {
    /// The kind of reactive primitive this handle refers to.
    fn kind(&self) -> NodeKind;
}

/// Whether `node` is a [`Signal`](crate::Signal).
pub fn is_signal<N: Reactive + ?Sized>(node: &N) -> bool {
    node.kind() == NodeKind::Signal
}

/// Whether `node` is a [`Computed`](crate::Computed).
pub fn is_computed<N: Reactive + ?Sized>(node: &N) -> bool {
    node.kind() == NodeKind::Computed
}

/// Whether `node` is an [`Effect`](crate::Effect).
pub fn is_effect<N: Reactive + ?Sized>(node: &N) -> bool {
    node.kind() == NodeKind::Effect
}

/// Whether `node` is an [`EffectScope`](crate::EffectScope).
pub fn is_effect_scope<N: Reactive + ?Sized>(node: &N) -> bool {
    node.kind() == NodeKind::EffectScope
}

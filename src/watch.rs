//! UI bridge: observe a reactive selection through a plain callback.
//!
//! A [`Watcher`] is what a rendering layer registers to be told "this
//! part of the state changed, redraw". It is an effect under the hood,
//! but with one difference that matters for fan-out: a panicking
//! listener is caught and routed to an error handler instead of tearing
//! down the notification pass, so one faulty subscriber cannot starve
//! the others.
//!
//! The handler is injected per watcher rather than installed as a
//! process-wide hook, which keeps graphs in different tests (or
//! different subsystems) from stepping on each other.

use crate::effect::{Effect, effect};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Handler invoked with the payload of a panicking watch listener.
pub type ErrorHandler = Arc<dyn Fn(&(dyn Any + Send)) + Send + Sync>;

/// Best-effort text of a panic payload, for logging.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

fn default_error_handler() -> ErrorHandler {
    Arc::new(|payload| {
        tracing::error!(message = panic_message(payload), "watch listener panicked");
    })
}

/// A running subscription: re-evaluates a selection whenever its
/// dependencies change and hands the result to a listener.
///
/// # Example
/// ```ignore
/// let title = signal("untitled".to_string());
///
/// let t = title.clone();
/// let watcher = Watcher::new(move || t.get(), |value| {
///     render_titlebar(value);
/// });
///
/// title.set("draft 2".to_string()); // listener runs with "draft 2"
/// watcher.stop();
/// ```
pub struct Watcher {
    effect: Effect,
}

impl Watcher {
    /// Watch `select`, invoking `listener` with each result (including
    /// the initial one, synchronously).
    ///
    /// Listener panics are logged via `tracing` and swallowed; see
    /// [`Watcher::with_error_handler`] to route them elsewhere.
    pub fn new<V, S, L>(select: S, listener: L) -> Self
    where
        V: 'static,
        S: FnMut() -> V + Send + 'static,
        L: FnMut(&V) + Send + 'static,
    {
        Self::with_error_handler(select, listener, default_error_handler())
    }

    /// Like [`Watcher::new`], but panicking listeners are reported to
    /// `handler` instead of the default `tracing` logger.
    ///
    /// Only the listener is shielded. The selection is part of the
    /// graph: if it panics, the panic propagates like any computed or
    /// effect body failure.
    pub fn with_error_handler<V, S, L>(mut select: S, mut listener: L, handler: ErrorHandler) -> Self
    where
        V: 'static,
        S: FnMut() -> V + Send + 'static,
        L: FnMut(&V) + Send + 'static,
    {
        let effect = effect(move || {
            let value = select();
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(&value))) {
                handler(&*payload);
            }
        });
        Self { effect }
    }

    /// Stop watching. Idempotent.
    pub fn stop(&self) {
        self.effect.stop();
    }

    /// Whether this watcher has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.effect.is_stopped()
    }
}

use crate::watch::panic_message;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use thiserror::Error;

/// Error produced by an async derivation.
///
/// Cloneable so it can sit in shared state and be handed to every
/// awaiter of the same failed generation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AsyncError {
    /// Failure reported by the async computation itself.
    #[error("{0}")]
    Message(Arc<str>),

    /// The combiner or computation panicked.
    #[error("async computation panicked: {0}")]
    Panicked(Arc<str>),

    /// The owning [`AsyncComputed`](crate::AsyncComputed) was disposed
    /// before this generation settled.
    #[error("async computed disposed")]
    Disposed,
}

impl AsyncError {
    /// Build a `Message` error from anything displayable.
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self::Message(Arc::from(message.to_string().as_str()))
    }
}

impl From<String> for AsyncError {
    fn from(message: String) -> Self {
        Self::Message(Arc::from(message.as_str()))
    }
}

impl From<&str> for AsyncError {
    fn from(message: &str) -> Self {
        Self::Message(Arc::from(message))
    }
}

/// Observable state of an async derivation.
///
/// `LoadingWithPrevious` and `ErrorWithPrevious` carry the last
/// successful value so consumers can keep showing stale data while a
/// refresh is in flight or after it failed.
#[derive(Debug, Clone, PartialEq)]
pub enum AsyncValue<T> {
    /// Computation in flight, no earlier value available.
    Loading,
    /// Latest generation settled successfully.
    Data(T),
    /// Latest generation failed, no earlier value available.
    Error(AsyncError),
    /// Computation in flight; an earlier value is still available.
    LoadingWithPrevious(T),
    /// Latest generation failed; an earlier value is still available.
    ErrorWithPrevious(AsyncError, T),
}

impl<T> AsyncValue<T> {
    /// The current settled value, if the latest generation succeeded.
    pub fn data(&self) -> Option<&T> {
        match self {
            AsyncValue::Data(value) => Some(value),
            _ => None,
        }
    }

    /// The freshest value available, settled or stale.
    pub fn latest(&self) -> Option<&T> {
        match self {
            AsyncValue::Data(value)
            | AsyncValue::LoadingWithPrevious(value)
            | AsyncValue::ErrorWithPrevious(_, value) => Some(value),
            AsyncValue::Loading | AsyncValue::Error(_) => None,
        }
    }

    /// The error, if the latest generation failed.
    pub fn error(&self) -> Option<&AsyncError> {
        match self {
            AsyncValue::Error(error) | AsyncValue::ErrorWithPrevious(error, _) => Some(error),
            _ => None,
        }
    }

    /// Whether a computation is currently in flight.
    pub fn is_loading(&self) -> bool {
        matches!(
            self,
            AsyncValue::Loading | AsyncValue::LoadingWithPrevious(_)
        )
    }

    /// Map the carried values, preserving the state shape.
    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> AsyncValue<U> {
        match self {
            AsyncValue::Loading => AsyncValue::Loading,
            AsyncValue::Data(value) => AsyncValue::Data(f(value)),
            AsyncValue::Error(error) => AsyncValue::Error(error),
            AsyncValue::LoadingWithPrevious(value) => AsyncValue::LoadingWithPrevious(f(value)),
            AsyncValue::ErrorWithPrevious(error, value) => {
                AsyncValue::ErrorWithPrevious(error, f(value))
            }
        }
    }
}

/// Combine several async values into one.
///
/// Loading wins over error wins over data: if any input is (re)loading
/// the result is `Loading`; otherwise the first error is propagated;
/// otherwise the combiner runs over the settled values. A panicking
/// combiner is captured into `Error` rather than unwinding into the
/// caller.
///
/// # Example
/// ```ignore
/// let total = combine_async(&[subtotal, shipping], |parts| {
///     parts.iter().copied().sum::<u32>()
/// });
/// ```
pub fn combine_async<T, R, F>(inputs: &[AsyncValue<T>], combiner: F) -> AsyncValue<R>
where
    F: FnOnce(&[&T]) -> R,
{
    if inputs.iter().any(AsyncValue::is_loading) {
        return AsyncValue::Loading;
    }
    if let Some(error) = inputs.iter().find_map(AsyncValue::error) {
        return AsyncValue::Error(error.clone());
    }

    let mut values = Vec::with_capacity(inputs.len());
    for input in inputs {
        match input.data() {
            Some(value) => values.push(value),
            None => return AsyncValue::Loading,
        }
    }

    match catch_unwind(AssertUnwindSafe(|| combiner(&values))) {
        Ok(result) => AsyncValue::Data(result),
        Err(payload) => AsyncValue::Error(AsyncError::Panicked(Arc::from(panic_message(
            payload.as_ref(),
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loading_takes_precedence_over_error() {
        let inputs = [
            AsyncValue::Error(AsyncError::msg("boom")),
            AsyncValue::LoadingWithPrevious(1),
            AsyncValue::Data(2),
        ];
        let combined = combine_async(&inputs, |values| values.iter().copied().sum::<i32>());
        assert_eq!(combined, AsyncValue::Loading);
    }

    #[test]
    fn first_error_propagates() {
        let inputs = [
            AsyncValue::Data(1),
            AsyncValue::Error(AsyncError::msg("first")),
            AsyncValue::ErrorWithPrevious(AsyncError::msg("second"), 3),
        ];
        let combined = combine_async(&inputs, |values| values.iter().copied().sum::<i32>());
        assert_eq!(combined, AsyncValue::Error(AsyncError::msg("first")));
    }

    #[test]
    fn all_data_runs_combiner() {
        let inputs = [AsyncValue::Data(1), AsyncValue::Data(2), AsyncValue::Data(3)];
        let combined = combine_async(&inputs, |values| values.iter().copied().sum::<i32>());
        assert_eq!(combined, AsyncValue::Data(6));
    }

    #[test]
    fn panicking_combiner_becomes_error() {
        let inputs = [AsyncValue::Data(1)];
        let combined: AsyncValue<i32> = combine_async(&inputs, |_| panic!("combiner bug"));
        assert!(matches!(combined, AsyncValue::Error(AsyncError::Panicked(_))));
    }

    #[test]
    fn latest_prefers_any_carried_value() {
        assert_eq!(AsyncValue::Data(5).latest(), Some(&5));
        assert_eq!(AsyncValue::LoadingWithPrevious(4).latest(), Some(&4));
        assert_eq!(
            AsyncValue::ErrorWithPrevious(AsyncError::msg("x"), 3).latest(),
            Some(&3)
        );
        assert_eq!(AsyncValue::<i32>::Loading.latest(), None);
    }
}

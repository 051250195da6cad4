use super::computed::{AsyncComputed, AsyncInner};
use super::value::AsyncError;
use crate::effect::effect;
use crate::executor;
use futures::StreamExt;
use futures::stream::LocalBoxStream;
use std::sync::Arc;

/// Create an async computed driven by a stream.
///
/// Like [`async_computed`](super::async_computed), but the factory
/// returns a stream and every item it yields settles the state in turn:
/// the computed holds the most recent item. The factory call is the
/// synchronous tracked prefix; when a dependency read there changes, the
/// old stream is abandoned (its remaining items belong to a stale
/// generation and are discarded) and the factory runs again - automatic
/// resubscription.
///
/// # Example
/// ```ignore
/// let topic = signal("news".to_string());
///
/// let t = topic.clone();
/// let feed = stream_computed(move || {
///     let topic = t.get();
///     subscribe_to(topic).boxed_local()
/// });
/// // topic.set(...) drops the old subscription and opens a new one
/// ```
pub fn stream_computed<T, F>(mut factory: F) -> AsyncComputed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: FnMut() -> LocalBoxStream<'static, Result<T, AsyncError>> + Send + 'static,
{
    let inner = AsyncInner::new();

    let driver_inner = Arc::clone(&inner);
    let driver = effect(move || {
        let Some(generation) = driver_inner.begin_generation() else {
            return;
        };

        // Synchronous tracked prefix
        let mut stream = factory();

        let task_inner = Arc::clone(&driver_inner);
        executor::spawn(async move {
            while let Some(item) = stream.next().await {
                if !task_inner.settle(generation, item) {
                    // Superseded or disposed: stop consuming the stream
                    break;
                }
            }
        });
    });

    AsyncComputed::from_parts(inner, driver)
}

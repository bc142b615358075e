//! Producers running as tokio tasks.

use crate::{channel, BufferingPolicy, Channel, Continuation};
use std::future::Future;


/// Create a channel fed by a producer running as a tokio task
///
/// `build` is called immediately with the producer half of the channel, and the future it
/// returns is spawned. When that future completes, the channel is finished, unless the producer
/// already terminated it. If the channel is cancelled first, the task is aborted at its next
/// await point.
///
/// The channel's termination callback is used to abort the task, so the producer should not
/// replace it.
///
/// Must be called from within a tokio runtime.
pub fn spawn<T, E, F, Fut>(policy: BufferingPolicy, build: F) -> Channel<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
    F: FnOnce(Continuation<T, E>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (channel, continuation) = channel(policy);
    let producer = build(continuation.clone());
    let task_continuation = continuation.clone();
    let task = tokio::spawn(async move {
        producer.await;
        trace!("spawned producer returned, finishing channel");
        task_continuation.finish();
    });

    // if the channel terminated before the callback is installed, it is never called. the task
    // then either already returned, or its next send fails.
    let abort = task.abort_handle();
    continuation.set_on_termination(move |termination| {
        if termination.is_cancelled() {
            trace!("channel cancelled, aborting spawned producer");
            abort.abort();
        }
    });
    channel
}

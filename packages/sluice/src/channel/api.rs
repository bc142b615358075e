// exposed API of channels

use self::future::*;
use super::{
    error::*,
    core::{OnTermination, Storage},
};
use std::sync::atomic::Ordering::Relaxed;

pub use super::core::{BufferingPolicy, YieldResult, Termination};


// ==== helper functions for adapting core API to exposed API ====


// 1. increment storage producer count.
// 2. clone another handle to the storage.
fn clone_producer<T, E>(storage: &Storage<T, E>) -> Storage<T, E> {
    storage.producer_count().fetch_add(1, Relaxed);
    storage.clone()
}

// 1. decrement storage producer count.
// 2. if the count was lowered to 0 and the channel is still open, cancel the channel if
//    cancel_on_drop is true, or finish it otherwise.
fn drop_producer<T, E>(storage: &Storage<T, E>, cancel_on_drop: bool) {
    let prev_producer_count = storage.producer_count().fetch_sub(1, Relaxed);
    if prev_producer_count == 1 && !storage.is_terminated() {
        if cancel_on_drop {
            trace!("last continuation dropped without finishing, cancelling channel");
            storage.cancel(None);
        } else {
            storage.finish(None);
        }
    }
}

// 1. increment storage consumer count.
// 2. clone another handle to the storage.
fn clone_consumer<T, E>(storage: &Storage<T, E>) -> Storage<T, E> {
    storage.consumer_count().fetch_add(1, Relaxed);
    storage.clone()
}

// 1. decrement storage consumer count.
// 2. if the count was lowered to 0, cancel the channel, releasing anything still buffered.
fn drop_consumer<T, E>(storage: &Storage<T, E>) {
    let prev_consumer_count = storage.consumer_count().fetch_sub(1, Relaxed);
    if prev_consumer_count == 1 {
        trace!("last channel handle dropped, cancelling channel");
        storage.cancel(None);
    }
}

// box a termination callback.
fn on_termination<E, F>(f: F) -> OnTermination<E>
where
    F: for<'a> FnOnce(Termination<'a, E>) + Send + 'static,
{
    Box::new(f)
}


// ==== the exposed API ====


/// Create a channel
///
/// Returns the consumer half, which is iterated to receive elements, and the producer half,
/// which is used to send elements and terminate the channel. `E` is the type of error the
/// producer may fail the channel with.
pub fn channel<T, E>(policy: BufferingPolicy) -> (Channel<T, E>, Continuation<T, E>) {
    let storage_1 = Storage::new(policy);
    let storage_2 = storage_1.clone();
    let channel = Channel(storage_1);
    let continuation = Continuation { storage: storage_2, cancel_on_drop: true };
    (channel, continuation)
}


/// Producer handle to a channel
///
/// Cheap to clone, and every clone addresses the same channel. All methods are safe to call
/// concurrently from any thread and never block.
///
/// When the last `Continuation` of a channel is dropped without the channel having terminated,
/// the channel is cancelled, or finished if [`cancel_on_drop`](Self::set_cancel_on_drop) was
/// turned off for that handle. Consumers are therefore never left waiting on a forgotten
/// producer.
pub struct Continuation<T, E> {
    storage: Storage<T, E>,
    cancel_on_drop: bool,
}

impl<T, E> Continuation<T, E> {
    /// Send a message on this channel
    ///
    /// If a consumer is waiting, the message is handed to it directly. Otherwise it is buffered,
    /// unless the buffer is full, in which case it is handed back as
    /// [`YieldResult::Dropped`]. This never blocks.
    ///
    /// Errors once the channel has terminated, so producer loops can stop on `?` without polling
    /// a flag.
    pub fn send(&self, msg: T) -> Result<YieldResult<T>, SendError<T>> {
        self.storage.send(msg).map_err(|msg| SendError { msg, cause: CancelledError })
    }

    /// Send a message, or fail the channel with an error
    ///
    /// `Ok` is sent like [`send`](Self::send). `Err` is passed to [`fail`](Self::fail) and
    /// reported as [`YieldResult::Terminated`].
    pub fn send_result(&self, result: Result<T, E>) -> Result<YieldResult<T>, SendError<T>> {
        match result {
            Ok(msg) => self.send(msg),
            Err(error) => {
                self.fail(error);
                Ok(YieldResult::Terminated)
            }
        }
    }

    /// Finish the channel gracefully
    ///
    /// The consumer receives every message already sent, then observes the end of the channel.
    /// Has no effect if the channel has already terminated.
    pub fn finish(&self) {
        self.storage.finish(None);
    }

    /// Finish the channel with an error
    ///
    /// The consumer receives every message already sent, then observes
    /// [`NextError::Failed`]. Has no effect if the channel has already terminated.
    pub fn fail(&self, error: E) {
        self.storage.finish(Some(error));
    }

    /// Cancel the channel
    ///
    /// Undelivered messages are discarded, and the consumer observes [`NextError::Cancelled`].
    pub fn cancel(&self) {
        self.storage.cancel(None);
    }

    /// Cancel the channel with an error
    ///
    /// Like [`cancel`](Self::cancel), except the consumer observes [`NextError::Failed`] with
    /// the given error. The termination callback still reports [`Termination::Cancelled`].
    pub fn cancel_with(&self, error: E) {
        self.storage.cancel(Some(error));
    }

    /// Set the callback to run when the channel terminates
    ///
    /// The callback runs exactly once, on whichever thread terminates the channel, before the
    /// consumer observes the terminal outcome. It replaces any previously set callback. If the
    /// channel has already terminated, the callback is dropped without being called.
    pub fn set_on_termination<F>(&self, f: F)
    where
        F: for<'a> FnOnce(Termination<'a, E>) + Send + 'static,
    {
        self.storage.set_on_termination(on_termination(f));
    }

    /// Whether the channel has finished, failed, or been cancelled
    ///
    /// Once this returns true, every [`send`](Self::send) fails.
    pub fn is_terminated(&self) -> bool {
        self.storage.is_terminated()
    }

    /// Set whether dropping the last `Continuation` cancels an unterminated channel
    ///
    /// Defaults to true. If set to false, the channel is finished instead. Clones inherit the
    /// property from the handle they were cloned from, but changing it for one handle does not
    /// change it for the others. Only the handle dropped last is consulted.
    pub fn set_cancel_on_drop(&mut self, cancel_on_drop: bool) -> &mut Self {
        self.cancel_on_drop = cancel_on_drop;
        self
    }

    /// Ownership-chaining version of [`set_cancel_on_drop`](Self::set_cancel_on_drop)
    pub fn with_cancel_on_drop(mut self, cancel_on_drop: bool) -> Self {
        self.cancel_on_drop = cancel_on_drop;
        self
    }
}

impl<T, E> Clone for Continuation<T, E> {
    fn clone(&self) -> Self {
        Continuation {
            storage: clone_producer(&self.storage),
            cancel_on_drop: self.cancel_on_drop,
        }
    }
}

impl<T, E> Drop for Continuation<T, E> {
    fn drop(&mut self) {
        drop_producer(&self.storage, self.cancel_on_drop);
    }
}


/// Consumer handle to a channel
///
/// Elements are received through an [`Iter`]. Only one iterator may be waiting for an element
/// at a time: polling a second iterator's [`next`](Iter::next) while another one is parked
/// panics.
///
/// Any holder of a `Channel` can tear it down with [`cancel`](Self::cancel). Dropping the last
/// `Channel` (and the last [`Iter`]) also cancels it.
pub struct Channel<T, E>(Storage<T, E>);

impl<T, E> Channel<T, E> {
    /// Create an iterator over the channel's elements
    pub fn iter(&self) -> Iter<T, E> {
        Iter {
            consumer: self.0.consumer_id(),
            channel: self.clone(),
            started: false,
            done: false,
        }
    }

    /// Cancel the channel
    ///
    /// Undelivered messages are discarded, the termination callback reports
    /// [`Termination::Cancelled`], and the consumer observes [`NextError::Cancelled`].
    pub fn cancel(&self) {
        self.0.cancel(None);
    }

    /// Cancel the channel with an error
    ///
    /// Like [`cancel`](Self::cancel), except the consumer observes [`NextError::Failed`] with
    /// the given error.
    pub fn cancel_with(&self, error: E) {
        self.0.cancel(Some(error));
    }

    /// Whether the channel has finished, failed, or been cancelled
    ///
    /// Elements sent before termination may still be waiting to be received.
    pub fn is_terminated(&self) -> bool {
        self.0.is_terminated()
    }

    /// Number of elements sent but not yet received
    pub fn buffered(&self) -> usize {
        self.0.buffered()
    }
}

impl<T, E> Clone for Channel<T, E> {
    fn clone(&self) -> Self {
        Channel(clone_consumer(&self.0))
    }
}

impl<T, E> Drop for Channel<T, E> {
    fn drop(&mut self) {
        drop_consumer(&self.0);
    }
}


/// Iterator over a channel's elements
///
/// Receive with [`next`](Self::next), or, with the `futures` feature, as a `Stream`.
///
/// Dropping a pending [`Next`] future cancels the channel, which is how cancellation of the
/// consuming task propagates to the producer. Dropping an `Iter` that has received elements but
/// not yet observed the end of the channel cancels it too, so a consumer task aborted between
/// two receives does not leave buffered elements behind for someone else. An `Iter` that never
/// received anything can be dropped without affecting the channel.
pub struct Iter<T, E> {
    channel: Channel<T, E>,
    consumer: u64,
    // whether an element was received.
    started: bool,
    // whether the end of the channel, or its terminal error, was observed.
    done: bool,
}

impl<T, E> Iter<T, E> {
    /// Create a future to receive the next element
    ///
    /// See the API of [`Next`], as it is not only a future, but also provides additional methods,
    /// including the API for blocking on a receive operation or trying to receive immediately.
    pub fn next(&mut self) -> Next<'_, T, E> {
        Next { iter: self, resolved: false }
    }

    /// Block the current thread until the next element is received
    pub fn next_blocking(&mut self) -> Result<Option<T>, NextError<E>> {
        self.next().block()
    }

    /// The channel this iterator receives from
    pub fn channel(&self) -> &Channel<T, E> {
        &self.channel
    }

    // record a resolved receive.
    fn observe<R>(&mut self, result: &Result<Option<T>, R>) {
        match result {
            Ok(Some(_)) => self.started = true,
            _ => self.done = true,
        }
    }
}

impl<T, E> Drop for Iter<T, E> {
    fn drop(&mut self) {
        if self.channel.0.withdraw(self.consumer) {
            trace!("iterator dropped while parked, cancelling channel");
            self.channel.0.cancel(None);
        } else if self.started && !self.done {
            trace!("iterator abandoned mid-stream, cancelling channel");
            self.channel.0.cancel(None);
        }
    }
}

#[cfg(feature = "futures")]
impl<T, E> futures::Stream for Iter<T, E> {
    type Item = Result<T, NextError<E>>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context,
    ) -> std::task::Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return std::task::Poll::Ready(None);
        }
        this.channel.0
            .poll_next(this.consumer, cx)
            .map(|result| {
                this.observe(&result);
                result.transpose()
            })
    }
}

#[cfg(feature = "futures")]
impl<T, E> futures::stream::FusedStream for Iter<T, E> {
    fn is_terminated(&self) -> bool {
        self.done
    }
}


// future types for channels.
pub(crate) mod future {
    use super::*;
    use crate::channel::polling::{poll, Timeout, Withdraw};
    use std::{
        future::Future,
        pin::Pin,
        task::{Context, Poll},
        time::{Duration, Instant},
    };

    /// Future for receiving the next element of a channel
    ///
    /// Resolves to `Ok(None)` once the channel finished gracefully and every element sent before
    /// that has been received. Resolves to `Err` if the channel failed or was cancelled. Either
    /// terminal outcome is observed once: afterwards the channel resolves to `Ok(None)`.
    ///
    /// This future is not cancel-safe in the usual sense: dropping it while it is parked waiting
    /// for an element cancels the channel.
    pub struct Next<'a, T, E> {
        pub(super) iter: &'a mut Iter<T, E>,
        pub(super) resolved: bool,
    }

    fn map_try_next_result<T, E>(
        result: Option<Result<Option<T>, NextError<E>>>,
    ) -> Result<Option<T>, TryNextError<E>> {
        match result {
            Some(next_result) => next_result.map_err(TryNextError::from),
            None => Err(WouldBlockError.into()),
        }
    }

    impl<'a, T, E> Future for Next<'a, T, E> {
        type Output = Result<Option<T>, NextError<E>>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
            let this = self.get_mut();
            // for implementation of FusedFuture
            if this.resolved {
                return Poll::Pending;
            }
            let iter = &mut *this.iter;
            let polled = iter.channel.0.poll_next(iter.consumer, cx);
            if let Poll::Ready(result) = &polled {
                this.resolved = true;
                iter.observe(result);
            }
            polled
        }
    }

    impl<'a, T, E> Withdraw for Next<'a, T, E> {
        fn withdraw(&mut self) {
            self.iter.channel.0.withdraw(self.iter.consumer);
        }
    }

    impl<'a, T, E> Next<'a, T, E> {
        /// Block until this future resolves
        ///
        /// Calling this method counts as polling this future, and when this method returns, that
        /// counts as this future resolving. This method will panic if this future has already
        /// resolved.
        pub fn block(&mut self) -> Result<Option<T>, NextError<E>> {
            assert!(!self.is_terminated(), "Next.block called after terminated");
            match poll(self, Timeout::Never) {
                Some(result) => result,
                None => unreachable!("poll timed out with Timeout::Never"),
            }
        }

        /// Try to resolve this future immediately without blocking
        ///
        /// If this returns [`WouldBlockError`], the channel is left untouched and this future
        /// may be polled or blocked on again. This method will panic if this future has already
        /// resolved.
        pub fn try_now(&mut self) -> Result<Option<T>, TryNextError<E>> {
            assert!(!self.is_terminated(), "Next.try_now called after terminated");
            map_try_next_result(poll(self, Timeout::NonBlocking))
        }

        /// Block until this future resolves or a timeout elapses
        ///
        /// Timing out does not cancel the channel. This method will panic if this future has
        /// already resolved.
        pub fn block_timeout(&mut self, timeout: Duration) -> Result<Option<T>, TryNextError<E>> {
            assert!(!self.is_terminated(), "Next.block_timeout called after terminated");
            self.block_deadline(Instant::now() + timeout)
        }

        /// Block until this future resolves or the deadline is reached
        ///
        /// Timing out does not cancel the channel. This method will panic if this future has
        /// already resolved.
        pub fn block_deadline(&mut self, deadline: Instant) -> Result<Option<T>, TryNextError<E>> {
            assert!(!self.is_terminated(), "Next.block_deadline called after terminated");
            map_try_next_result(poll(self, Timeout::At(deadline)))
        }

        /// Whether this future has already resolved
        pub fn is_terminated(&self) -> bool {
            self.resolved
        }
    }

    #[cfg(feature = "futures")]
    impl<'a, T, E> futures::future::FusedFuture for Next<'a, T, E> {
        fn is_terminated(&self) -> bool {
            Self::is_terminated(self)
        }
    }

    impl<'a, T, E> Drop for Next<'a, T, E> {
        fn drop(&mut self) {
            // a parked consumer going away is how task cancellation reaches the channel
            if !self.resolved && self.iter.channel.0.withdraw(self.iter.consumer) {
                trace!("next future dropped while parked, cancelling channel");
                self.iter.channel.0.cancel(None);
            }
        }
    }
}


// ==== tests ====


#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker_ref;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg32;
    use std::{
        future::Future,
        pin::Pin,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
            Mutex,
        },
        task::Context,
        thread,
        time::Duration,
    };
    use thiserror::Error;
    use tokio::time::sleep;

    #[derive(Debug, Error, Clone, PartialEq, Eq)]
    #[error("simple error: {0}")]
    struct SimpleError(&'static str);

    // record every termination reason reported to the channel's callback.
    fn record_terminations(continuation: &Continuation<u32, SimpleError>)
        -> Arc<Mutex<Vec<String>>>
    {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_2 = Arc::clone(&log);
        continuation.set_on_termination(move |termination| {
            let entry = match termination {
                Termination::Finished(None) => "finished".to_owned(),
                Termination::Finished(Some(error)) => format!("failed: {}", error.0),
                Termination::Cancelled => "cancelled".to_owned(),
            };
            log_2.lock().unwrap().push(entry);
        });
        log
    }

    // send, retrying after a delay for as long as the buffer is full. returns number of retries.
    fn send_with_backoff(continuation: &Continuation<u32, SimpleError>, msg: u32, delay: Duration)
        -> usize
    {
        let mut msg = msg;
        let mut retries = 0;
        loop {
            match continuation.send(msg).unwrap() {
                YieldResult::Dropped(dropped) => {
                    msg = dropped;
                    retries += 1;
                    thread::sleep(delay);
                }
                _ => return retries,
            }
        }
    }

    #[test]
    fn basic_1000_test() {
        let (channel, continuation) = channel::<u32, SimpleError>(BufferingPolicy::Limited(500));

        let join_1 = thread::spawn(move || {
            for i in 1..=1000 {
                send_with_backoff(&continuation, i, Duration::from_millis(1));
                if i < 1000 && i % 100 == 0 {
                    thread::sleep(Duration::from_millis(50));
                }
            }
            continuation.finish();
        });
        let join_2 = thread::spawn(move || {
            let mut iter = channel.iter();
            for i in 1..=1000 {
                let j = iter.next().block_timeout(Duration::from_millis(500)).unwrap().unwrap();
                assert_eq!(i, j);
            }
            assert!(iter.next().block_timeout(Duration::from_millis(10)).unwrap().is_none());
        });
        join_1.join().unwrap();
        join_2.join().unwrap();
    }

    #[test]
    fn dropped_sends_retried_keep_order() {
        let (channel, continuation) = channel::<u32, SimpleError>(BufferingPolicy::Limited(4));

        let producer = thread::spawn(move || {
            let mut retries = 0;
            for i in 0..50 {
                retries += send_with_backoff(&continuation, i, Duration::from_millis(1));
            }
            continuation.finish();
            retries
        });

        let mut iter = channel.iter();
        let mut received = Vec::new();
        while let Some(msg) = iter.next_blocking().unwrap() {
            received.push(msg);
            thread::sleep(Duration::from_millis(2));
        }

        assert!(producer.join().unwrap() > 0);
        assert_eq!(received, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn stochastic_schedules_preserve_order() {
        for seed in 0..8 {
            let mut rng = Pcg32::seed_from_u64(seed);
            let bound = rng.gen_range(1..8);
            let producer_seed = rng.gen::<u64>();
            let (channel, continuation) =
                channel::<u32, SimpleError>(BufferingPolicy::Limited(bound));

            let producer = thread::spawn(move || {
                let mut rng = Pcg32::seed_from_u64(producer_seed);
                for i in 0..100 {
                    send_with_backoff(&continuation, i, Duration::from_micros(50));
                    if rng.gen_bool(0.2) {
                        thread::sleep(Duration::from_micros(rng.gen_range(0..300)));
                    }
                }
                continuation.fail(SimpleError("done"));
            });

            let mut iter = channel.iter();
            let mut received = Vec::new();
            let outcome = loop {
                match iter.next_blocking() {
                    Ok(Some(msg)) => received.push(msg),
                    other => break other,
                }
                if rng.gen_bool(0.2) {
                    thread::sleep(Duration::from_micros(rng.gen_range(0..300)));
                }
            };

            producer.join().unwrap();
            assert_eq!(received, (0..100).collect::<Vec<_>>(), "seed {}", seed);
            assert_eq!(outcome, Err(NextError::Failed(SimpleError("done"))), "seed {}", seed);
        }
    }

    #[tokio::test]
    async fn slow_producer_and_consumer_deliver_everything() {
        let (channel, continuation) = channel::<u32, SimpleError>(BufferingPolicy::Unbounded);

        let producer = tokio::spawn(async move {
            for i in 0..20 {
                continuation.send(i).unwrap();
                sleep(Duration::from_millis(20)).await;
            }
            continuation.finish();
        });

        let mut iter = channel.iter();
        let mut received = Vec::new();
        while let Some(msg) = iter.next().await.unwrap() {
            received.push(msg);
            sleep(Duration::from_millis(20)).await;
        }

        producer.await.unwrap();
        assert_eq!(received, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failure_follows_buffered_values() {
        let (channel, continuation) = channel::<u32, SimpleError>(BufferingPolicy::Unbounded);
        let log = record_terminations(&continuation);
        for i in 0..4 {
            continuation.send(i).unwrap();
        }
        continuation.fail(SimpleError("x"));

        let mut iter = channel.iter();
        let mut received = Vec::new();
        let outcome = loop {
            match iter.next().await {
                Ok(Some(msg)) => received.push(msg),
                other => break other,
            }
        };

        assert_eq!(received, vec![0, 1, 2, 3]);
        assert_eq!(outcome, Err(NextError::Failed(SimpleError("x"))));
        assert_eq!(iter.next().await, Ok(None));
        assert_eq!(*log.lock().unwrap(), vec!["failed: x"]);
        assert_eq!(
            continuation.send(4).unwrap_err(),
            SendError { msg: 4, cause: CancelledError },
        );
    }

    #[tokio::test]
    async fn cancel_reports_cancelled_before_consumer_resumes() {
        for error in [None, Some(SimpleError("gone"))] {
            let (channel, continuation) =
                channel::<u32, SimpleError>(BufferingPolicy::Unbounded);
            let log = record_terminations(&continuation);

            let consumer_channel = channel.clone();
            let consumer_log = Arc::clone(&log);
            let consumer = tokio::spawn(async move {
                let mut iter = consumer_channel.iter();
                let result = iter.next().await;
                consumer_log.lock().unwrap().push("resumed".to_owned());
                result
            });

            // let the consumer park
            sleep(Duration::from_millis(20)).await;
            match error.clone() {
                None => channel.cancel(),
                Some(error) => channel.cancel_with(error),
            }

            let expected = match error {
                None => Err(NextError::Cancelled(CancelledError)),
                Some(error) => Err(NextError::Failed(error)),
            };
            assert_eq!(consumer.await.unwrap(), expected);
            assert_eq!(*log.lock().unwrap(), vec!["cancelled", "resumed"]);
            assert!(continuation.send(1).is_err());
        }
    }

    #[tokio::test]
    async fn aborted_consumer_cancels_channel() {
        let (channel, continuation) = channel::<u32, SimpleError>(BufferingPolicy::Unbounded);
        let log = record_terminations(&continuation);
        let (seen_send, mut seen_recv) = tokio::sync::mpsc::unbounded_channel();

        let consumer_channel = channel.clone();
        let consumer = tokio::spawn(async move {
            let mut iter = consumer_channel.iter();
            while let Ok(Some(msg)) = iter.next().await {
                let _ = seen_send.send(msg);
            }
        });

        for i in 0..3 {
            continuation.send(i).unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(seen_recv.recv().await.unwrap());
        }
        // let the consumer park again before aborting it
        sleep(Duration::from_millis(20)).await;
        consumer.abort();
        assert!(consumer.await.unwrap_err().is_cancelled());

        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(*log.lock().unwrap(), vec!["cancelled"]);
        assert!(continuation.send(3).is_err());
        let mut iter = channel.iter();
        assert_eq!(iter.next().await, Err(NextError::Cancelled(CancelledError)));
    }

    #[test]
    fn cancel_discards_buffered_values() {
        let (channel, continuation) = channel::<u32, SimpleError>(BufferingPolicy::Unbounded);
        for i in 0..20 {
            continuation.send(i).unwrap();
        }
        let mut iter = channel.iter();
        for i in 0..3 {
            assert_eq!(iter.next_blocking(), Ok(Some(i)));
        }
        channel.cancel();
        assert_eq!(channel.buffered(), 0);
        assert_eq!(iter.next_blocking(), Err(NextError::Cancelled(CancelledError)));
        assert_eq!(iter.next_blocking(), Ok(None));
    }

    #[test]
    fn termination_callback_fires_once() {
        let (channel, continuation) = channel::<u32, SimpleError>(BufferingPolicy::Unbounded);
        let log = record_terminations(&continuation);
        continuation.finish();
        continuation.finish();
        continuation.fail(SimpleError("late"));
        continuation.cancel();
        channel.cancel();
        assert_eq!(*log.lock().unwrap(), vec!["finished"]);
    }

    #[test]
    fn cancel_then_finish_fires_callback_once() {
        let (channel, continuation) = channel::<u32, SimpleError>(BufferingPolicy::Unbounded);
        let log = record_terminations(&continuation);
        channel.cancel();
        continuation.finish();
        drop(continuation);
        assert_eq!(*log.lock().unwrap(), vec!["cancelled"]);
    }

    #[test]
    fn dropping_last_continuation_cancels() {
        let (channel, continuation) = channel::<u32, SimpleError>(BufferingPolicy::Unbounded);
        let log = record_terminations(&continuation);
        let continuation_2 = continuation.clone();
        drop(continuation);
        assert!(!channel.is_terminated());
        continuation_2.send(1).unwrap();
        drop(continuation_2);

        assert!(channel.is_terminated());
        assert_eq!(*log.lock().unwrap(), vec!["cancelled"]);
        let mut iter = channel.iter();
        assert_eq!(iter.next_blocking(), Err(NextError::Cancelled(CancelledError)));
    }

    #[test]
    fn dropping_last_continuation_can_finish() {
        let (channel, continuation) = channel::<u32, SimpleError>(BufferingPolicy::Unbounded);
        let continuation = continuation.with_cancel_on_drop(false);
        let log = record_terminations(&continuation);
        continuation.send(1).unwrap();
        drop(continuation);

        assert_eq!(*log.lock().unwrap(), vec!["finished"]);
        let mut iter = channel.iter();
        assert_eq!(iter.next_blocking(), Ok(Some(1)));
        assert_eq!(iter.next_blocking(), Ok(None));
    }

    #[test]
    fn dropping_last_channel_cancels() {
        let (channel, continuation) = channel::<u32, SimpleError>(BufferingPolicy::Unbounded);
        let log = record_terminations(&continuation);
        let iter = channel.iter();
        drop(channel);
        assert!(continuation.send(1).is_ok());
        drop(iter);
        assert_eq!(continuation.send(2).unwrap_err().msg, 2);
        assert_eq!(*log.lock().unwrap(), vec!["cancelled"]);
    }

    #[test]
    fn send_result_routes_errors_to_fail() {
        let (channel, continuation) = channel::<u32, SimpleError>(BufferingPolicy::Limited(8));
        assert_eq!(
            continuation.send_result(Ok(1)),
            Ok(YieldResult::Enqueued { remaining: Some(7) }),
        );
        assert_eq!(
            continuation.send_result(Err(SimpleError("bad"))),
            Ok(YieldResult::Terminated),
        );
        assert!(continuation.is_terminated());

        let mut iter = channel.iter();
        assert_eq!(iter.next_blocking(), Ok(Some(1)));
        assert_eq!(iter.next_blocking(), Err(NextError::Failed(SimpleError("bad"))));
    }

    #[test]
    fn timed_out_wait_does_not_cancel() {
        let (channel, continuation) = channel::<u32, SimpleError>(BufferingPolicy::Unbounded);
        let mut iter = channel.iter();
        assert_eq!(iter.next().try_now(), Err(TryNextError::WouldBlock(WouldBlockError)));
        assert_eq!(
            iter.next().block_timeout(Duration::from_millis(10)),
            Err(TryNextError::WouldBlock(WouldBlockError)),
        );
        assert!(!channel.is_terminated());

        continuation.send(5).unwrap();
        assert_eq!(iter.next().try_now(), Ok(Some(5)));
    }

    #[test]
    fn blocked_consumer_wakes_on_send_from_other_thread() {
        let (channel, continuation) = channel::<u32, SimpleError>(BufferingPolicy::Unbounded);
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            continuation.send(9).unwrap();
            continuation.finish();
        });
        let mut iter = channel.iter();
        assert_eq!(iter.next_blocking(), Ok(Some(9)));
        assert_eq!(iter.next_blocking(), Ok(None));
        producer.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "concurrent next")]
    fn concurrent_next_panics() {
        let (channel, _continuation) = channel::<u32, SimpleError>(BufferingPolicy::Unbounded);
        let mut cx = Context::from_waker(noop_waker_ref());
        let mut iter_1 = channel.iter();
        let mut iter_2 = channel.iter();
        let mut next_1 = iter_1.next();
        assert!(Pin::new(&mut next_1).poll(&mut cx).is_pending());
        let _ = Pin::new(&mut iter_2.next()).poll(&mut cx);
    }

    #[test]
    fn iterator_abandoned_mid_stream_cancels() {
        let (channel, continuation) = channel::<u32, SimpleError>(BufferingPolicy::Unbounded);
        continuation.send(1).unwrap();
        drop(channel.iter());
        assert!(!channel.is_terminated());

        // receiving and then walking away before the end is an abandoned consumer
        let mut iter = channel.iter();
        assert_eq!(iter.next().try_now(), Ok(Some(1)));
        assert_eq!(iter.next().try_now(), Err(TryNextError::WouldBlock(WouldBlockError)));
        assert!(!channel.is_terminated());
        drop(iter);
        assert!(channel.is_terminated());
        assert!(continuation.send(2).is_err());
    }

    #[test]
    fn iterator_dropped_after_the_end_leaves_outcome_alone() {
        let (channel, continuation) = channel::<u32, SimpleError>(BufferingPolicy::Unbounded);
        let log = record_terminations(&continuation);
        continuation.send(3).unwrap();
        continuation.finish();
        let mut iter = channel.iter();
        assert_eq!(iter.next_blocking(), Ok(Some(3)));
        assert_eq!(iter.next_blocking(), Ok(None));
        drop(iter);
        assert_eq!(channel.iter().next_blocking(), Ok(None));
        assert_eq!(*log.lock().unwrap(), vec!["finished"]);
    }

    #[tokio::test]
    async fn consumer_aborted_between_receives_cancels_channel() {
        let (channel, continuation) = channel::<u32, SimpleError>(BufferingPolicy::Unbounded);
        let log = record_terminations(&continuation);
        for i in 0..20 {
            continuation.send(i).unwrap();
        }
        let (seen_send, mut seen_recv) = tokio::sync::mpsc::unbounded_channel();

        let consumer_channel = channel.clone();
        let consumer = tokio::spawn(async move {
            let mut iter = consumer_channel.iter();
            while let Ok(Some(msg)) = iter.next().await {
                let _ = seen_send.send(msg);
                sleep(Duration::from_millis(50)).await;
            }
        });

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(seen_recv.recv().await.unwrap());
        }
        // the consumer is sleeping with elements still buffered, not parked
        assert!(channel.buffered() > 0);
        consumer.abort();
        assert!(consumer.await.unwrap_err().is_cancelled());

        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(*log.lock().unwrap(), vec!["cancelled"]);
        assert!(channel.is_terminated());
        assert_eq!(channel.buffered(), 0);
        assert_eq!(continuation.send(20).unwrap_err().msg, 20);
        let mut iter = channel.iter();
        assert_eq!(iter.next().await, Err(NextError::Cancelled(CancelledError)));
        assert_eq!(iter.next().await, Ok(None));
    }

    #[cfg(feature = "futures")]
    #[tokio::test]
    async fn iter_is_a_stream() {
        use futures::{stream::FusedStream, StreamExt};

        let (channel, continuation) = channel::<u32, SimpleError>(BufferingPolicy::Unbounded);
        continuation.send(0).unwrap();
        continuation.send(1).unwrap();
        continuation.fail(SimpleError("end"));

        let mut iter = channel.iter();
        let collected = (&mut iter).collect::<Vec<_>>().await;
        assert_eq!(collected, vec![Ok(0), Ok(1), Err(NextError::Failed(SimpleError("end")))]);
        assert!(iter.is_terminated());
    }

    #[test]
    fn callback_counts_are_exact_under_races() {
        for _ in 0..20 {
            let (channel, continuation) = channel::<u32, SimpleError>(BufferingPolicy::Unbounded);
            let calls = Arc::new(AtomicUsize::new(0));
            let calls_2 = Arc::clone(&calls);
            continuation.set_on_termination(move |_| {
                calls_2.fetch_add(1, Ordering::SeqCst);
            });

            let continuation_2 = continuation.clone();
            let finisher = thread::spawn(move || continuation_2.finish());
            let canceller = thread::spawn(move || channel.cancel());
            finisher.join().unwrap();
            canceller.join().unwrap();
            drop(continuation);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }
}

// minimal safe API for the channel. the exposed API is a convenience wrapper around this.

use super::error::{CancelledError, NextError};
use std::{
    collections::VecDeque,
    fmt::{self, Debug, Formatter},
    mem,
    sync::{
        atomic::{
            Ordering::Relaxed,
            AtomicU64,
        },
        Arc,
        Mutex,
        MutexGuard,
    },
    task::{Context, Poll, Waker},
};


/// How a channel buffers elements sent while no consumer is waiting for them
///
/// Fixed when the channel is created.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum BufferingPolicy {
    /// Buffer any number of elements
    #[default]
    Unbounded,
    /// Buffer at most this many elements, reporting further sends as
    /// [`Dropped`](YieldResult::Dropped) until the consumer catches up
    ///
    /// An element handed directly to a waiting consumer does not take up buffer space, even if
    /// the consumer stops waiting before picking it up. Such an element is still counted by
    /// [`Channel::buffered`](crate::Channel::buffered), which can therefore exceed the limit by
    /// one.
    Limited(usize),
}

/// Outcome of sending an element into an open channel
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum YieldResult<T> {
    /// The element was buffered or handed directly to the waiting consumer
    Enqueued {
        /// Free buffer slots after this send, or `None` for an unbounded channel
        remaining: Option<usize>,
    },
    /// The buffer was full, so the element was handed back without touching the channel
    ///
    /// Whether to retry, delay, or discard it is up to the producer.
    Dropped(T),
    /// The element terminated the channel instead of being delivered
    ///
    /// Returned by [`Continuation::send_result`](crate::Continuation::send_result) when given an
    /// error.
    Terminated,
}

impl<T> YieldResult<T> {
    /// Whether the element was accepted by the channel
    pub fn is_enqueued(&self) -> bool {
        matches!(self, YieldResult::Enqueued { .. })
    }
}

/// Why a channel terminated, as reported to its termination callback
pub enum Termination<'a, E> {
    /// The producer finished the channel, possibly with an error
    Finished(Option<&'a E>),
    /// The channel was cancelled, explicitly or by dropping handles
    Cancelled,
}

impl<'a, E> Termination<'a, E> {
    /// Whether this is [`Termination::Cancelled`]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Termination::Cancelled)
    }
}

impl<'a, E> Clone for Termination<'a, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, E> Copy for Termination<'a, E> {}

impl<'a, E: Debug> Debug for Termination<'a, E> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Termination::Finished(error) => f.debug_tuple("Finished").field(error).finish(),
            Termination::Cancelled => f.write_str("Cancelled"),
        }
    }
}

// boxed termination callback.
pub(crate) type OnTermination<E> = Box<dyn for<'a> FnOnce(Termination<'a, E>) + Send>;


// handle to a channel's storage.
pub(crate) struct Storage<T, E>(Arc<Shared<T, E>>);

// channel shared state.
struct Shared<T, E> {
    // mutex around lockable state.
    lockable: Mutex<Lockable<T, E>>,

    // continuation reference count.
    producer_count: AtomicU64,
    // channel reference count, including iterators.
    consumer_count: AtomicU64,
    // source of unique consumer ids.
    next_consumer: AtomicU64,
}

// channel lockable state.
struct Lockable<T, E> {
    // buffered elements, oldest at the front.
    elems: VecDeque<T>,
    policy: BufferingPolicy,
    // resumption slot for the single consumer.
    slot: Slot<T>,
    // begins as Status::Open. every other status is terminal and only moves forward:
    // Open -> Closing -> Closed -> Consumed.
    status: Status<E>,
    // taken in the same critical section that moves status away from Open, so it can only ever
    // be called once.
    on_termination: Option<OnTermination<E>>,
}

// resumption slot.
//
// - if Parked, elems is empty. producers hand elements to a parked consumer rather than buffer
//   them.
// - if Handoff, the element is older than anything in elems.
enum Slot<T> {
    // no consumer is parked.
    Vacant,
    // a consumer is parked waiting for an element or terminal outcome.
    Parked {
        consumer: u64,
        waker: Waker,
    },
    // an element was handed to the consumer which has not yet picked it up.
    Handoff(T),
}

// terminal status.
enum Status<E> {
    // sending is possible.
    Open,
    // terminated, but the outcome is not settled yet because the termination callback is still
    // running. consumers park as if open.
    Closing,
    // terminated with an outcome the consumer has not observed yet.
    Closed(Outcome<E>),
    // the consumer has observed the outcome.
    Consumed,
}

// settled terminal outcome.
enum Outcome<E> {
    Finished,
    Failed(E),
    Cancelled,
}

impl<T> Slot<T> {
    // if parked, unpark and return the waker.
    fn take_parked(&mut self) -> Option<Waker> {
        match mem::replace(self, Slot::Vacant) {
            Slot::Parked { waker, .. } => Some(waker),
            other => {
                *self = other;
                None
            }
        }
    }

    // if holding a handoff, take it.
    fn take_handoff(&mut self) -> Option<T> {
        match mem::replace(self, Slot::Vacant) {
            Slot::Handoff(elem) => Some(elem),
            other => {
                *self = other;
                None
            }
        }
    }
}

impl<E> Outcome<E> {
    fn into_result<T>(self) -> Result<Option<T>, NextError<E>> {
        match self {
            Outcome::Finished => Ok(None),
            Outcome::Failed(error) => Err(NextError::Failed(error)),
            Outcome::Cancelled => Err(CancelledError.into()),
        }
    }
}

impl<T, E> Lockable<T, E> {
    fn is_open(&self) -> bool {
        matches!(self.status, Status::Open)
    }

    // free buffer slots, or none if unbounded.
    fn remaining(&self) -> Option<usize> {
        match self.policy {
            BufferingPolicy::Unbounded => None,
            BufferingPolicy::Limited(bound) => Some(bound.saturating_sub(self.elems.len())),
        }
    }

    // buffer elem according to the policy.
    fn buffer(&mut self, elem: T) -> YieldResult<T> {
        if let BufferingPolicy::Limited(bound) = self.policy {
            debug_assert!(self.elems.len() <= bound);
            if self.elems.len() >= bound {
                return YieldResult::Dropped(elem);
            }
        }
        self.elems.push_back(elem);
        YieldResult::Enqueued { remaining: self.remaining() }
    }
}

impl<T, E> Storage<T, E> {
    // construct empty storage with producer and consumer counts of 1.
    pub(crate) fn new(policy: BufferingPolicy) -> Self {
        Storage(Arc::new(Shared {
            lockable: Mutex::new(Lockable {
                elems: VecDeque::new(),
                policy,
                slot: Slot::Vacant,
                status: Status::Open,
                on_termination: None,
            }),
            producer_count: AtomicU64::new(1),
            consumer_count: AtomicU64::new(1),
            next_consumer: AtomicU64::new(0),
        }))
    }

    // clone another handle to the storage.
    pub(crate) fn clone(&self) -> Self {
        Storage(Arc::clone(&self.0))
    }

    pub(crate) fn producer_count(&self) -> &AtomicU64 {
        &self.0.producer_count
    }

    pub(crate) fn consumer_count(&self) -> &AtomicU64 {
        &self.0.consumer_count
    }

    // allocate an id which identifies a consumer in the resumption slot.
    pub(crate) fn consumer_id(&self) -> u64 {
        self.0.next_consumer.fetch_add(1, Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Lockable<T, E>> {
        self.0.lockable.lock().unwrap()
    }

    // send an element.
    //
    // returns err with the element if the channel has terminated.
    pub(crate) fn send(&self, elem: T) -> Result<YieldResult<T>, T> {
        let mut guard = self.lock();
        let lock = &mut *guard;
        if !lock.is_open() {
            return Err(elem);
        }

        let (result, waker) = match mem::replace(&mut lock.slot, Slot::Vacant) {
            Slot::Parked { waker, .. } => {
                // a parked consumer should never coexist with buffered elems, but if it does, the
                // oldest elem goes first and the new one queues behind the rest.
                let (handoff, result) = match lock.elems.pop_front() {
                    Some(oldest) => (oldest, lock.buffer(elem)),
                    None => (elem, YieldResult::Enqueued { remaining: lock.remaining() }),
                };
                lock.slot = Slot::Handoff(handoff);
                (result, Some(waker))
            }
            slot => {
                lock.slot = slot;
                (lock.buffer(elem), None)
            }
        };
        drop(guard);

        if let Some(waker) = waker {
            waker.wake();
        }
        if let YieldResult::Dropped(_) = result {
            trace!("channel buffer full, handing sent element back");
        }
        Ok(result)
    }

    // finish the channel, failing it if error is some. no-op if already terminated.
    pub(crate) fn finish(&self, error: Option<E>) {
        let on_termination = {
            let mut lock = self.lock();
            if !lock.is_open() {
                return;
            }
            lock.status = Status::Closing;
            lock.on_termination.take()
        };
        trace!(failed = error.is_some(), "finishing channel");

        let settle = Settle {
            storage: self,
            outcome: Some(match error {
                Some(error) => Outcome::Failed(error),
                None => Outcome::Finished,
            }),
        };
        if let Some(on_termination) = on_termination {
            on_termination(Termination::Finished(settle.failure()));
        }
    }

    // cancel the channel, discarding undelivered elements. the terminal outcome is the error if
    // some, or cancellation otherwise, unless the channel had already terminated.
    pub(crate) fn cancel(&self, error: Option<E>) {
        let (discarded, handoff, on_termination, was_open) = {
            let mut lock = self.lock();
            let discarded = mem::take(&mut lock.elems);
            let handoff = lock.slot.take_handoff();
            let on_termination = lock.on_termination.take();
            let was_open = lock.is_open();
            if was_open {
                lock.status = Status::Closing;
            }
            (discarded, handoff, on_termination, was_open)
        };
        drop(discarded);
        drop(handoff);
        trace!(was_open, "cancelling channel");

        let settle = was_open.then(|| Settle {
            storage: self,
            outcome: Some(match error {
                Some(error) => Outcome::Failed(error),
                None => Outcome::Cancelled,
            }),
        });
        if let Some(on_termination) = on_termination {
            on_termination(Termination::Cancelled);
        }
        drop(settle);
    }

    // poll for the next element on behalf of the given consumer.
    //
    // - resolves to ok some with the oldest undelivered element, if there is one.
    // - otherwise, resolves to the settled terminal outcome the first time it is observed, and
    //   ok none after that.
    // - otherwise, parks the consumer and returns pending.
    //
    // panics if a different consumer is parked.
    pub(crate) fn poll_next(
        &self,
        consumer: u64,
        cx: &mut Context,
    ) -> Poll<Result<Option<T>, NextError<E>>> {
        let mut guard = self.lock();
        let lock = &mut *guard;

        if let Slot::Parked { consumer: parked, .. } = lock.slot {
            if parked != consumer {
                drop(guard);
                panic!(
                    "concurrent next on a single-consumer channel (consumer {} polled while \
                    consumer {} is parked)",
                    consumer, parked,
                );
            }
        }

        let ready = if let Some(elem) = lock.slot.take_handoff() {
            Some(Ok(Some(elem)))
        } else if let Some(elem) = lock.elems.pop_front() {
            Some(Ok(Some(elem)))
        } else {
            match mem::replace(&mut lock.status, Status::Consumed) {
                Status::Closed(outcome) => Some(outcome.into_result()),
                Status::Consumed => Some(Ok(None)),
                status @ (Status::Open | Status::Closing) => {
                    lock.status = status;
                    None
                }
            }
        };

        match ready {
            Some(result) => {
                let stale = lock.slot.take_parked();
                drop(guard);
                drop(stale);
                Poll::Ready(result)
            }
            None => {
                let stale = match &mut lock.slot {
                    Slot::Parked { waker, .. } if waker.will_wake(cx.waker()) => None,
                    slot => Some(mem::replace(slot, Slot::Parked {
                        consumer,
                        waker: cx.waker().clone(),
                    })),
                };
                drop(guard);
                drop(stale);
                Poll::Pending
            }
        }
    }

    // if the given consumer is parked, unpark it and return true.
    pub(crate) fn withdraw(&self, consumer: u64) -> bool {
        let mut lock = self.lock();
        match lock.slot {
            Slot::Parked { consumer: parked, .. } if parked == consumer => (),
            _ => return false,
        }
        let stale = lock.slot.take_parked();
        drop(lock);
        drop(stale);
        true
    }

    // install the termination callback, replacing any previous one. if the channel has already
    // terminated, the callback is dropped without being called.
    pub(crate) fn set_on_termination(&self, on_termination: OnTermination<E>) {
        let unused = {
            let mut lock = self.lock();
            if lock.is_open() {
                lock.on_termination.replace(on_termination)
            } else {
                Some(on_termination)
            }
        };
        drop(unused);
    }

    pub(crate) fn is_terminated(&self) -> bool {
        !self.lock().is_open()
    }

    // number of elements not yet delivered to the consumer.
    pub(crate) fn buffered(&self) -> usize {
        let lock = self.lock();
        lock.elems.len() + matches!(lock.slot, Slot::Handoff(_)) as usize
    }
}

// settles a terminal outcome when dropped, so the outcome is settled even if the termination
// callback panics.
struct Settle<'a, T, E> {
    storage: &'a Storage<T, E>,
    outcome: Option<Outcome<E>>,
}

impl<'a, T, E> Settle<'a, T, E> {
    fn failure(&self) -> Option<&E> {
        match &self.outcome {
            Some(Outcome::Failed(error)) => Some(error),
            _ => None,
        }
    }
}

impl<'a, T, E> Drop for Settle<'a, T, E> {
    fn drop(&mut self) {
        let Some(outcome) = self.outcome.take() else { return };
        let mut lock = self.storage.lock();
        debug_assert!(matches!(lock.status, Status::Closing));
        lock.status = Status::Closed(outcome);
        let waker = lock.slot.take_parked();
        drop(lock);
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}


// ==== tests ====

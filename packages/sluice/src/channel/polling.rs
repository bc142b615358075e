// internal future polling system for blocking on channel futures from synchronous code.
//
// design based on pollster crate, but with a timeout and a way to withdraw the future's waker
// when giving up.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Condvar, Mutex},
    task::{Context, Poll, Wake, Waker},
    time::Instant,
};


// `Future` that can withdraw the waker it left behind when it stops being polled before
// resolving, without otherwise affecting the channel.
pub(crate) trait Withdraw: Future {
    fn withdraw(&mut self);
}

// timeout for blocking on a future.
#[derive(Copy, Clone)]
pub(crate) enum Timeout {
    // never time out.
    Never,
    // time out at the given deadline.
    At(Instant),
    // time out if the future cannot be resolved without blocking.
    NonBlocking,
}

// poll the future until it resolves or the timeout is reached, in which case withdraw the
// future's waker and return none.
pub(crate) fn poll<F>(fut: &mut F, timeout: Timeout) -> Option<F::Output>
where
    F: Future + Withdraw + Unpin,
{
    let signal = Arc::new(Signal {
        state: Mutex::new(State::Empty),
        cond: Condvar::new(),
    });
    let waker = Waker::from(Arc::clone(&signal));
    let mut cx = Context::from_waker(&waker);
    let resolved = poll_inner(fut, &signal, &mut cx, timeout);
    if resolved.is_none() {
        fut.withdraw();
    }
    resolved
}

// poll the future with a context whose waker notifies signal, sleeping on signal between polls,
// until the future resolves or the timeout is reached.
fn poll_inner<F>(
    fut: &mut F,
    signal: &Signal,
    cx: &mut Context,
    timeout: Timeout,
) -> Option<F::Output>
where
    F: Future + Unpin,
{
    loop {
        if let Poll::Ready(output) = Pin::new(&mut *fut).poll(cx) {
            return Some(output);
        }

        let mut lock = signal.state.lock().unwrap();

        // woken between the poll and taking the lock: the element or outcome may already be
        // there, so poll again rather than sleep.
        if let State::Notified = *lock {
            *lock = State::Empty;
            continue;
        }

        debug_assert!(matches!(*lock, State::Empty));
        *lock = State::Waiting;
        match timeout {
            Timeout::Never =>
                while let State::Waiting = *lock {
                    lock = signal.cond.wait(lock).unwrap();
                },

            // giving up leaves the future's waker registered. the caller withdraws it.
            Timeout::At(deadline) =>
                while let State::Waiting = *lock {
                    let Some(duration) =
                        deadline.checked_duration_since(Instant::now())
                        else { return None };
                    let (lock_2, wait_result) = signal.cond.wait_timeout(lock, duration).unwrap();
                    lock = lock_2;
                    if wait_result.timed_out() && matches!(*lock, State::Waiting) {
                        return None;
                    }
                },

            // one poll only. the caller withdraws the waker.
            Timeout::NonBlocking => return None,
        }
        *lock = State::Empty;
    }
}

// waker-side state of a blocked poll.
enum State {
    Empty,
    Waiting,
    Notified,
}

// condvar woken by the future's waker.
struct Signal {
    state: Mutex<State>,
    cond: Condvar,
}

impl Wake for Signal {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let mut lock = self.state.lock().unwrap();
        match *lock {
            State::Notified => (),
            State::Empty => {
                *lock = State::Notified;
            }
            State::Waiting => {
                *lock = State::Empty;
                self.cond.notify_one();
            }
        }
    }
}

// implementation of the sluice channel.
//
// the architecture is a single mutex around all mutable state. it is as such:
//
// handles (Continuation, Channel, Iter) wrap around Arc<shared state>
//                                                   |
//          /----------------------------------------/
//          v
//       shared state
//          |
//          |------ reference counts of producer and consumer handles, used to implicitly cancel
//          |       (or finish) the channel when one side is dropped
//          |
//          \------ a mutex around the lockable state:
//                  |
//                  |------ a VecDeque of buffered elements, bounded or not per BufferingPolicy
//                  |
//                  |------ the resumption slot: empty, holding the waker of the single parked
//                  |       consumer, or holding an element handed to that consumer
//                  |
//                  |------ the terminal status, which only moves forward:
//                  |       open -> closing -> closed(outcome) -> consumed
//                  |
//                  \------ the termination callback, taken in the same critical section that
//                          leaves the open status, so it runs at most once
//
// no user code runs while the mutex is held: wakers are woken, callbacks are called, and
// discarded elements are dropped after releasing it. this is why termination happens in two
// steps: "closing" rejects sends while the callback runs outside the lock, then the outcome is
// settled and the consumer woken.
//
// the organization of these modules is as such:
//
//      core: The storage state machine. Safe, but panicky and inconvenient: it knows nothing of
//       ^    handle types and identifies consumers by id.
//       |
//      api: The exposed handles and futures. Does the reference counting, and turns a dropped
//       |   parked future into channel cancellation. The crate re-exports this API publically.
//       v
//      polling: Blocks a thread on a future, for synchronous consumers.
//
// there is also the error module, which contains the relevant error types, which is also
// re-exported publically.

pub(crate) mod error;
pub(crate) mod api;

mod polling;
mod core;

//! Cancellable single-consumer channel with typed failure.
//!
//! A [`channel`] bridges a producer, which may be synchronous code on any thread, into an
//! asynchronous (or blocking) consumer. The producer sends through a [`Continuation`] and ends
//! the channel by finishing it, failing it with an error of its chosen type, or cancelling it.
//! The consumer pulls elements through an [`Iter`] over the [`Channel`].
//!
//! ```
//! use sluice::{channel, BufferingPolicy, YieldResult};
//!
//! let (channel, continuation) = channel::<u32, std::io::Error>(BufferingPolicy::Limited(1));
//! assert!(continuation.send(1).unwrap().is_enqueued());
//! assert!(matches!(continuation.send(2).unwrap(), YieldResult::Dropped(2)));
//! continuation.finish();
//!
//! let mut iter = channel.iter();
//! assert_eq!(iter.next_blocking().unwrap(), Some(1));
//! assert_eq!(iter.next_blocking().unwrap(), None);
//! ```
//!
//! Backpressure is manual: under [`BufferingPolicy::Limited`], sends that would overflow the
//! buffer hand the element back as [`YieldResult::Dropped`] instead of blocking the producer.

#[macro_use]
extern crate tracing;

mod channel;
mod producer;

pub use crate::{
    channel::api::*,
    producer::spawn,
};

/// Error types
pub mod error {
    pub use crate::channel::error::*;
}

/// Future types
pub mod future {
    pub use crate::channel::api::future::*;
}

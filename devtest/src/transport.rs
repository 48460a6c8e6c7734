// Copyright 2026 Oxide Computer Company
//! The two ends of an ownership-transferring conduit.
//!
//! Block operations move between threads only through something that
//! implements these traits: the descriptor-backed [`channel`] used by the
//! reactor pipeline, or the condition-variable [`queue`] used by the queued
//! engine.  Workers are written once against the traits.
//!
//! [`channel`]: crate::channel
//! [`queue`]: crate::queue
use std::fmt;

/// Returned when sending into a conduit whose receiving side is gone.  The
/// item is handed back so that the caller still owns it.
#[derive(thiserror::Error, PartialEq, Eq)]
#[error("conduit closed")]
pub struct Closed<T>(pub T);

impl<T> Closed<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Closed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Closed(..)")
    }
}

/// Receiving side.  `recv` blocks until an item is available, and returns
/// `None` once every sender is gone and everything sent has been drained.
pub trait Source<T>: Send {
    fn recv(&self) -> Option<T>;
}

/// Sending side.  Dropping the last sender closes the conduit.
pub trait Sink<T>: Send {
    fn send(&self, item: T) -> Result<(), Closed<T>>;
}

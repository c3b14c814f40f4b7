//! A durable, crash-tolerant double-ended queue of opaque binary records,
//! backed by a directory of fixed-size segment files.
//!
//! Records are appended at the tail with [`Deque::offer`] or prepended at
//! the head with [`Deque::push`], and consumed from the head with
//! [`Deque::poll`]. Segment files are plain flat files or, with
//! [`SegmentBackend::MemoryMapped`], memory-mapped, so that a crashed
//! process can be recovered by rescanning the directory and handing each
//! record to a caller-supplied [`Truncator`].

pub mod buffer;
mod compress;
pub mod deque;
pub mod error;
pub mod header;
pub mod segment;
pub mod truncator;

pub use buffer::BufferHandle;
pub use deque::{Deque, DequeConfig};
pub use error::{Error, Result, TruncateError};
pub use segment::SegmentBackend;
pub use truncator::{AcceptAll, Truncator, TruncatorAction};

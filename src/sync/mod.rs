//! In-process locking primitives.
//!
//! - [`ContextLock`]: binary lock whose acquire can be abandoned through a
//!   [`Context`](crate::context::Context), with idempotent close
//! - [`MutexMap`]: keyed locks built on [`ContextLock`], used to allow at
//!   most one in-flight download per object key

mod context_lock;
mod mutex_map;

pub use context_lock::ContextLock;
pub use mutex_map::{KeyGuard, MutexMap};

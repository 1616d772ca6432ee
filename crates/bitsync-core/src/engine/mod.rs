//! Coordination Engine - the heart of bitsync
//!
//! This module implements the single-flight download coordinator with:
//! - Request deduplication per content hash
//! - Throttled multi-subscriber progress fan-out
//! - Aggregate speed measurement
//! - Per-hash cleanup on settlement and global teardown

mod coordinator;
mod listeners;
mod speed;
mod throttle;

pub use coordinator::*;
pub use listeners::{CompletionListener, ProgressListener, Subscription};

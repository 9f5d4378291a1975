//! Pulse scheduling core
//!
//! A cooperative task-scheduling core for single-threaded, frame-driven
//! host loops. Thousands of short-lived asynchronous operations are resumed
//! once per tick without per-operation heap allocation:
//! - Pooled completion sources track each operation's result/status behind a
//!   version token that guards against stale access after reuse
//!   (`source` module)
//! - A generic object pool recycles operation state through an intrusive
//!   free list (`pool` module)
//! - A per-tick cooperative runner advances every live operation exactly
//!   once, compacting finished slots in place (`runner` module)
//! - A bounded circular queue stages registrations that arrive while a tick
//!   is in progress (`queue` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use pulse_core::{poll_fn, Advance, Runner};
//!
//! let runner = Runner::new("update");
//! let mut remaining = 3;
//! runner.register(Box::new(poll_fn(move || {
//!     remaining -= 1;
//!     Ok(if remaining == 0 { Advance::Finished } else { Advance::Running })
//! })));
//!
//! // The host loop drives the runner once per frame.
//! while !runner.is_empty() {
//!     runner.tick();
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod ops;
pub mod pool;
pub mod queue;
pub mod runner;
pub mod source;

pub use ops::{poll_fn, Frames, PollFn};
pub use pool::{
    global_registry, Pool, PoolLink, PoolRegistry, PoolStat, Poolable, DEFAULT_POOL_CAPACITY,
};
pub use queue::{QueueError, RingQueue};
pub use runner::{set_fault_sink, Advance, Resumable, Runner, RunnerConfig};
pub use source::{
    CompletionSource, Fault, SimpleSource, SourceError, SourcePool, Status, Token,
};

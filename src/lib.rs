//! uniqueue - unique, priority-ordered FIFO queue backed by Redis
//!
//! A queue of distinct member identifiers with ten priority classes,
//! retrieved highest priority first and FIFO within a class:
//!
//! * no duplicates: re-inserting a member promotes it when the new priority
//!   is higher, and does nothing otherwise
//! * atomic pop: concurrent consumers never receive the same member twice
//! * no in-process state: arbitrarily many processes share a collection
//!   through Redis, which serializes all critical sections
//!
//! # Redis Schema
//!
//! ```text
//! {name}        → ZSET(score → member)   score = priority digit + 15-digit sequence
//! _{name}_seq   → string counter         INCR'd once per newly inserted member
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use uniqueue::{Priority, PriorityFifoSet, RedisConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = PriorityFifoSet::connect("tasks", RedisConfig::default()).await?;
//!
//! queue.insert(["low-1", "low-2"], Priority::default()).await?;
//! queue.insert(["rush"], Priority::new(2)?).await?;
//!
//! // Highest priority first, then insertion order
//! assert_eq!(queue.pop(10).await?, vec!["rush", "low-1", "low-2"]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod error;
pub mod queue;
pub mod score;
pub mod scripts;
pub mod util;

pub use connection::{
    HealthStatus, PoolMetrics, PoolMetricsSnapshot, RedisConfig, RedisPool, RetryPolicy,
};
pub use error::{QueueError, Result};
pub use queue::{PriorityFifoSet, DEFAULT_CHUNK_SIZE, MAX_POP_COUNT};
pub use score::{Priority, Score};
pub use scripts::QueueScripts;

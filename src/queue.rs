//! The queue handle: unique members, ten priority classes, FIFO within each
//!
//! A [`PriorityFifoSet`] is a value object over a connection pool; the
//! collection itself lives entirely in Redis and is created implicitly on
//! first insert. All mutating operations execute as a single atomic unit
//! against the store (a Lua script for inserts, a MULTI pipeline for pops),
//! so arbitrarily many processes can share one collection without in-process
//! coordination.

use crate::connection::{RedisConfig, RedisPool};
use crate::error::{QueueError, Result};
use crate::score::{self, Priority};
use crate::scripts::QueueScripts;
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::{debug, info};

/// Default number of (priority, member) pairs sent per script invocation.
pub const DEFAULT_CHUNK_SIZE: usize = 5_000;

/// Inclusive upper bound for a single `pop` call.
pub const MAX_POP_COUNT: usize = 25_000;

/// A named queue of distinct members, grouped into ten priority classes and
/// retrieved FIFO within each class.
///
/// * A member appears at most once. Re-inserting an existing member raises
///   its priority when the new class is higher (numerically lower) and is a
///   no-op otherwise; its position among earlier same-priority members never
///   changes.
/// * [`pop`](Self::pop) atomically removes and returns the members with the
///   smallest scores, so two concurrent consumers never receive the same
///   member.
///
/// # Redis key schema
///
/// ```text
/// {name}        → ZSET(score → member)    the queue itself
/// _{name}_seq   → INCR counter            insertion sequence source
/// ```
///
/// # Example
///
/// ```rust,no_run
/// use uniqueue::{Priority, PriorityFifoSet, RedisConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let queue = PriorityFifoSet::connect("crawl_frontier", RedisConfig::default()).await?;
///
/// queue.insert(["a", "b", "c"], Priority::default()).await?;
/// queue.insert(["urgent"], Priority::HIGHEST).await?;
///
/// assert_eq!(queue.pop(2).await?, vec!["urgent", "a"]);
/// # Ok(())
/// # }
/// ```
pub struct PriorityFifoSet {
    /// Collection name; also the sorted-set key
    name: String,

    /// Key of the per-collection insertion counter
    seq_key: String,

    /// Shared connection pool
    pool: Arc<RedisPool>,

    /// Cached Lua scripts
    scripts: Arc<QueueScripts>,
}

impl PriorityFifoSet {
    /// Connect to Redis and create a handle for the named collection.
    ///
    /// The collection needs no provisioning; it comes into existence with
    /// the first insert and persists in Redis independently of this handle.
    pub async fn connect(name: impl Into<String>, config: RedisConfig) -> Result<Self> {
        let pool = Arc::new(RedisPool::new(config).await?);
        Ok(Self::with_pool(name, pool))
    }

    /// Create a handle for the named collection over an existing pool.
    ///
    /// Handles are independent value objects; any number of them, for the
    /// same or different collections, can share one pool.
    pub fn with_pool(name: impl Into<String>, pool: Arc<RedisPool>) -> Self {
        let name = name.into();
        let seq_key = sequence_key(&name);
        info!("queue handle created for collection '{}'", name);
        Self {
            name,
            seq_key,
            pool,
            scripts: Arc::new(QueueScripts::new()),
        }
    }

    /// The collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pool this handle operates through.
    pub fn pool(&self) -> &Arc<RedisPool> {
        &self.pool
    }

    /// Insert members at the given priority, or promote them if present.
    ///
    /// Members absent from the collection are appended in iteration order at
    /// `priority`. Members already present are re-scored only when
    /// `priority` is higher (numerically lower) than their current class;
    /// equal or lower priorities leave them untouched. In both cases a
    /// member's position among same-priority members inserted before it is
    /// preserved.
    ///
    /// Batches are sent in chunks of [`DEFAULT_CHUNK_SIZE`]; use
    /// [`insert_chunked`](Self::insert_chunked) to control the chunk size.
    pub async fn insert<I, M>(&self, members: I, priority: Priority) -> Result<()>
    where
        I: IntoIterator<Item = M>,
        M: Into<String>,
    {
        self.insert_chunked(members, priority, DEFAULT_CHUNK_SIZE)
            .await
    }

    /// [`insert`](Self::insert) with an explicit chunk size.
    ///
    /// Each chunk is one atomic script invocation; chunking changes payload
    /// size per round trip, never the observable outcome. Cross-chunk
    /// atomicity is not guaranteed: a failure mid-batch leaves the chunks
    /// already sent applied. Callers needing whole-batch atomicity should
    /// pass a chunk size of at least the batch length.
    ///
    /// Duplicate members within one call are processed left to right, each
    /// occurrence seeing the effect of the previous ones.
    pub async fn insert_chunked<I, M>(
        &self,
        members: I,
        priority: Priority,
        chunk_size: usize,
    ) -> Result<()>
    where
        I: IntoIterator<Item = M>,
        M: Into<String>,
    {
        if chunk_size == 0 {
            return Err(QueueError::InvalidChunkSize);
        }

        let members: Vec<String> = members.into_iter().map(Into::into).collect();
        if members.is_empty() {
            return Ok(());
        }

        let script = self.scripts.upsert();
        let mut added_total: u64 = 0;
        let mut promoted_total: u64 = 0;

        for chunk in members.chunks(chunk_size) {
            let (added, promoted): (u64, u64) = self
                .pool
                .execute(|mut conn| {
                    let script = script.clone();
                    let zset = self.name.clone();
                    let seq_key = self.seq_key.clone();
                    let chunk = chunk.to_vec();
                    let priority = priority.get();
                    async move {
                        let mut invocation = script.prepare_invoke();
                        invocation.key(&zset).key(&seq_key);
                        for member in &chunk {
                            invocation.arg(priority).arg(member.as_str());
                        }
                        invocation.invoke_async(&mut conn).await
                    }
                })
                .await?;

            added_total += added;
            promoted_total += promoted;
        }

        debug!(
            "insert into '{}': {} submitted, {} added, {} promoted at priority {}",
            self.name,
            members.len(),
            added_total,
            promoted_total,
            priority
        );
        Ok(())
    }

    /// Atomically remove and return up to `count` members.
    ///
    /// Members come back in ascending score order: highest priority first,
    /// earliest inserted first within a class. The read and the removal run
    /// in one MULTI transaction, so no other caller can observe or remove
    /// the same members. A collection smaller than `count` is drained; an
    /// empty collection yields an empty vector.
    ///
    /// `count` must be in `1..=`[`MAX_POP_COUNT`]; violations are rejected
    /// before any store operation.
    pub async fn pop(&self, count: usize) -> Result<Vec<String>> {
        if count == 0 || count > MAX_POP_COUNT {
            return Err(QueueError::InvalidCount {
                count,
                max: MAX_POP_COUNT,
            });
        }

        let (members, _removed): (Vec<String>, u64) = self
            .pool
            .execute(|mut conn| {
                let zset = self.name.clone();
                async move {
                    let upper = count as isize - 1;
                    redis::pipe()
                        .atomic()
                        .zrange(&zset, 0, upper)
                        .zremrangebyrank(&zset, 0, upper)
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;

        debug!(
            "pop from '{}': {} requested, {} returned",
            self.name,
            count,
            members.len()
        );
        Ok(members)
    }

    /// Remove the listed members if present.
    ///
    /// Absent members are ignored; an empty input returns without touching
    /// the store.
    pub async fn delete<I, M>(&self, members: I) -> Result<()>
    where
        I: IntoIterator<Item = M>,
        M: Into<String>,
    {
        let members: Vec<String> = members.into_iter().map(Into::into).collect();
        if members.is_empty() {
            return Ok(());
        }

        let removed: u64 = self
            .pool
            .execute(|mut conn| {
                let zset = self.name.clone();
                let members = members.clone();
                async move { conn.zrem(&zset, &members).await }
            })
            .await?;

        debug!(
            "delete from '{}': {} submitted, {} removed",
            self.name,
            members.len(),
            removed
        );
        Ok(())
    }

    /// Total number of members in the collection.
    pub async fn len(&self) -> Result<u64> {
        self.pool
            .execute(|mut conn| {
                let zset = self.name.clone();
                async move { conn.zcard(&zset).await }
            })
            .await
    }

    /// Whether the collection holds no members.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Number of members, optionally restricted to one priority class.
    ///
    /// With `None` this equals [`len`](Self::len). With a priority it is an
    /// exact range count over the same score space insert and pop use, so
    /// the ten per-class counts always sum to the total.
    pub async fn count(&self, priority: Option<Priority>) -> Result<u64> {
        let Some(priority) = priority else {
            return self.len().await;
        };

        let (min, max) = score::priority_range(priority);
        self.pool
            .execute(|mut conn| {
                let zset = self.name.clone();
                let min = min.clone();
                let max = max.clone();
                async move { conn.zcount(&zset, &min, &max).await }
            })
            .await
    }
}

/// Key of the insertion counter belonging to a collection.
fn sequence_key(name: &str) -> String {
    format!("_{name}_seq")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_key_layout() {
        assert_eq!(sequence_key("jobs"), "_jobs_seq");
    }

    #[test]
    fn test_pop_bound_constants() {
        assert_eq!(DEFAULT_CHUNK_SIZE, 5_000);
        assert_eq!(MAX_POP_COUNT, 25_000);
    }
}

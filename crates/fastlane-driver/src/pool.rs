//! Fixed-capacity packet buffer pool
//!
//! Receive paths draw one [`PacketBuf`] per arriving packet from a
//! [`PacketPool`] and hand it to the caller inside a
//! [`Received`](crate::Received). The buffer comes back through the
//! [`PacketRecycler`] impl when the caller drops or releases it, possibly
//! from another thread.
//!
//! # Design
//!
//! - **Lock-Free:** free buffers live in a `crossbeam_queue::ArrayQueue`, so
//!   the poll loop and releasing workers never contend on a mutex
//! - **Bounded:** unlike a general-purpose buffer pool there is no fallback
//!   allocation; when the pool is empty `acquire` returns `None` and the
//!   driver applies backpressure instead of growing
//! - **Checked:** the count of buffers out on loan is tracked, and returning
//!   more buffers than were taken out is reported as [`PoolError::Underflow`]
//!
//! # Example
//!
//! ```
//! use fastlane_driver::PacketPool;
//!
//! let pool = PacketPool::new(2048, 4).unwrap();
//! let buf = pool.acquire().unwrap();
//! assert_eq!(pool.in_use(), 1);
//! pool.put(buf).unwrap();
//! assert_eq!(pool.available(), 4);
//! ```

use crate::error::{DriverError, DriverResult, PoolError};
use crate::received::{PacketBuf, PacketRecycler};
use crate::stats::DriverStats;
use crossbeam_queue::ArrayQueue;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::error;

/// A lock-free pool of pre-allocated packet buffers.
pub struct PacketPool {
    /// Buffers ready for `acquire`
    free: ArrayQueue<PacketBuf>,

    /// Size of every buffer in the pool
    buffer_size: usize,

    /// Buffers currently out on loan
    in_use: AtomicUsize,

    /// `acquire` calls that found the pool empty
    exhausted: AtomicU64,

    /// Counters to credit when buffers come back
    stats: Option<Arc<DriverStats>>,
}

impl PacketPool {
    /// Create a pool of `capacity` buffers of `buffer_size` bytes each.
    ///
    /// All memory is allocated up front. Fails if either argument is zero.
    pub fn new(buffer_size: usize, capacity: usize) -> DriverResult<Self> {
        if capacity == 0 || buffer_size == 0 {
            return Err(DriverError::PoolCreation(format!(
                "pool needs a nonzero size (buffers={capacity}, buffer_size={buffer_size})"
            )));
        }

        let free = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            // Cannot fail: the queue was sized for exactly this many
            let _ = free.push(PacketBuf::new(buffer_size));
        }

        Ok(Self {
            free,
            buffer_size,
            in_use: AtomicUsize::new(0),
            exhausted: AtomicU64::new(0),
            stats: None,
        })
    }

    /// Credit returned buffers to `stats`.
    pub fn with_stats(mut self, stats: Arc<DriverStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Take a buffer out of the pool, or `None` if all are on loan.
    pub fn acquire(&self) -> Option<PacketBuf> {
        match self.free.pop() {
            Some(buf) => {
                self.in_use.fetch_add(1, Ordering::AcqRel);
                Some(buf)
            }
            None => {
                self.exhausted.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Return a buffer taken out by [`acquire`](Self::acquire).
    ///
    /// Fails with [`PoolError::Underflow`] (and drops the buffer) when no
    /// buffers are on loan, which means something returned twice.
    pub fn put(&self, mut buf: PacketBuf) -> Result<(), PoolError> {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| PoolError::Underflow)?;

        buf.reset();
        // Never full: at most `capacity` buffers exist
        let _ = self.free.push(buf);
        if let Some(stats) = &self.stats {
            stats.record_release();
        }
        Ok(())
    }

    /// Buffers ready to be acquired.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Buffers currently on loan.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Total buffers owned by the pool.
    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }

    /// Size of each buffer in bytes.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// How often `acquire` found the pool empty.
    pub fn exhausted_count(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }
}

impl PacketRecycler for PacketPool {
    fn recycle(&self, buf: PacketBuf) {
        if let Err(e) = self.put(buf) {
            error!("{e} (in_use={}, capacity={})", self.in_use(), self.capacity());
        }
    }
}

impl std::fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketPool")
            .field("buffer_size", &self.buffer_size)
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .field("in_use", &self.in_use())
            .finish()
    }
}

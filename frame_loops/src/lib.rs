//! # frame_loops
//!
//! A small utility crate for running independent per-frame work on a fixed-size
//! worker pool.
//!
//! Every loop writes its results into frame-indexed slots, so the output order is
//! deterministic and independent of which worker finished first. The number of
//! workers is always chosen by the caller and never detected from the hardware,
//! which keeps runs reproducible across machines.
//!
//! ## Features
//!
//! - Ordered parallel map over a range of frames
//! - Parallel mutation of disjoint output slots
//! - Parallel map with reduction
//!
//! ## Example
//!
//! ```
//! use frame_loops::WorkerPool;
//!
//! let pool = WorkerPool::new(2).unwrap();
//! let squares = pool.map_frames(0..5, |t| t * t);
//! assert_eq!(squares, vec![0, 1, 4, 9, 16]);
//! ```

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::ops::Range;
use thiserror::Error;

/// Errors raised while building a [`WorkerPool`].
#[derive(Debug, Error)]
pub enum PoolError {
    /// A pool needs at least one worker.
    #[error("worker pool needs at least one thread")]
    ZeroThreads,
    /// The underlying rayon pool could not be created.
    #[error("failed to build worker pool: {0}")]
    Build(#[from] rayon::ThreadPoolBuildError),
}

/// A fixed-size pool of workers for per-frame computations.
#[derive(Debug)]
pub struct WorkerPool {
    pool: ThreadPool,
    threads: usize,
}

impl WorkerPool {
    /// Creates a pool with exactly `threads` workers.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ZeroThreads`] for `threads == 0` and
    /// [`PoolError::Build`] if the operating system refuses to spawn the workers.
    pub fn new(threads: usize) -> Result<Self, PoolError> {
        if threads == 0 {
            return Err(PoolError::ZeroThreads);
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("frame-worker-{i}"))
            .build()?;
        Ok(Self { pool, threads })
    }

    /// Number of workers in the pool.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Applies `func` to every frame index in `frames` and collects the results
    /// in frame order.
    ///
    /// # Examples
    ///
    /// ```
    /// use frame_loops::WorkerPool;
    ///
    /// let pool = WorkerPool::new(3).unwrap();
    /// let shifted = pool.map_frames(10..14, |t| t - 10);
    /// assert_eq!(shifted, vec![0, 1, 2, 3]);
    /// ```
    pub fn map_frames<R, F>(&self, frames: Range<usize>, func: F) -> Vec<R>
    where
        F: Fn(usize) -> R + Sync + Send,
        R: Send,
    {
        self.pool
            .install(|| frames.into_par_iter().map(func).collect())
    }

    /// Calls `func` on every slot together with its index. Slots are disjoint,
    /// so no locking is involved.
    ///
    /// # Examples
    ///
    /// ```
    /// use frame_loops::WorkerPool;
    ///
    /// let pool = WorkerPool::new(2).unwrap();
    /// let mut slots = vec![0.0; 4];
    /// pool.for_each_slot(&mut slots, |t, slot| *slot = t as f64 * 0.5);
    /// assert_eq!(slots, vec![0.0, 0.5, 1.0, 1.5]);
    /// ```
    pub fn for_each_slot<T, F>(&self, slots: &mut [T], func: F)
    where
        T: Send,
        F: Fn(usize, &mut T) + Sync + Send,
    {
        self.pool.install(|| {
            slots
                .par_iter_mut()
                .enumerate()
                .for_each(|(i, slot)| func(i, slot))
        });
    }

    /// Maps every frame to an optional partial result and reduces the partial
    /// results with `reducer`.
    ///
    /// Frames for which `func` returns `None` do not contribute. If no frame
    /// contributes, `identity` is returned. `reducer` must be associative and
    /// commutative for the result to be independent of scheduling.
    ///
    /// # Examples
    ///
    /// ```
    /// use frame_loops::WorkerPool;
    ///
    /// let pool = WorkerPool::new(4).unwrap();
    /// let sum = pool.map_reduce(0..10, |t| (t % 2 == 0).then_some(t), |a, b| a + b, 0);
    /// assert_eq!(sum, 20);
    /// ```
    pub fn map_reduce<R, F, G>(&self, frames: Range<usize>, func: F, reducer: G, identity: R) -> R
    where
        F: Fn(usize) -> Option<R> + Sync + Send,
        G: Fn(R, R) -> R + Sync + Send,
        R: Send + Sync + Clone,
    {
        self.pool.install(|| {
            frames
                .into_par_iter()
                .filter_map(func)
                .reduce(|| identity.clone(), reducer)
        })
    }

    /// Runs `op` inside the pool so that nested rayon iterators use its workers.
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_threads_is_rejected() {
        assert!(matches!(WorkerPool::new(0), Err(PoolError::ZeroThreads)));
    }

    #[test]
    fn map_frames_keeps_frame_order() {
        let pool = WorkerPool::new(4).unwrap();
        let out = pool.map_frames(0..1000, |t| {
            // uneven work so workers finish out of order
            if t % 7 == 0 {
                std::thread::sleep(std::time::Duration::from_micros(50));
            }
            t * 2
        });
        assert_eq!(out.len(), 1000);
        assert!(out.iter().enumerate().all(|(t, v)| *v == 2 * t));
    }

    #[test]
    fn map_reduce_returns_identity_for_empty_contribution() {
        let pool = WorkerPool::new(2).unwrap();
        let out = pool.map_reduce(0..10, |_| None::<i32>, |a, b| a.max(b), -1);
        assert_eq!(out, -1);
    }

    #[test]
    fn pool_reports_thread_count() {
        let pool = WorkerPool::new(3).unwrap();
        assert_eq!(pool.threads(), 3);
        assert_eq!(pool.install(rayon::current_num_threads), 3);
    }
}

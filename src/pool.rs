//! Counting gate used to bound the number of simultaneous in-flight
//! operations, mainly by the batch downloader.
//!
//! Unlike a plain semaphore, the limit can be adjusted at runtime: shrinking
//! the limit never evicts current holders, it only delays future admissions
//! until enough permits are released.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;


/// A concurrency-bounding pool, cheap to clone and shared between holders.
#[derive(Debug, Clone)]
pub struct Pool {
    state: Arc<Mutex<State>>,
}

#[derive(Debug)]
struct State {
    size: usize,
    limit: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// An admission into the pool, releasing its slot when dropped.
#[derive(Debug)]
pub struct PoolPermit {
    pool: Pool,
}

impl Pool {

    /// Create a new pool admitting up to `limit` concurrent holders.
    pub fn new(limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                size: 0,
                limit,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Acquire a slot, waiting in FIFO order when the pool is full.
    pub async fn acquire(&self) -> PoolPermit {

        let wait = {
            let mut state = self.state.lock().unwrap();
            if state.size < state.limit {
                state.size += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            }
        };

        if let Some(rx) = wait {
            // The sender lives in the shared state, it is either fired on a
            // release (the slot is then transferred to us, size unchanged) or
            // dropped when the whole pool is dropped.
            let _ = rx.await;
        }

        PoolPermit { pool: self.clone() }

    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        if state.size > state.limit {
            // Over-limit after a shrink, just decrement without waking anyone.
            state.size -= 1;
        } else {
            // Transfer the slot to the oldest waiter still alive, if any.
            loop {
                match state.waiters.pop_front() {
                    Some(waiter) => {
                        if waiter.send(()).is_ok() {
                            break;
                        }
                        // The waiter was cancelled, try the next one.
                    }
                    None => {
                        state.size -= 1;
                        break;
                    }
                }
            }
        }
    }

    /// Change the admission limit, this only affects future admissions and
    /// never evicts current holders. Growing the limit immediately admits
    /// queued waiters up to the new limit.
    pub fn set_limit(&self, limit: usize) {
        let mut state = self.state.lock().unwrap();
        state.limit = limit;
        while state.size < state.limit {
            match state.waiters.pop_front() {
                Some(waiter) => {
                    if waiter.send(()).is_ok() {
                        state.size += 1;
                    }
                }
                None => break,
            }
        }
    }

    /// The number of currently admitted holders, never exceeding the limit
    /// except transiently right after a shrink.
    pub fn size(&self) -> usize {
        self.state.lock().unwrap().size
    }

    /// The current admission limit.
    pub fn limit(&self) -> usize {
        self.state.lock().unwrap().limit
    }

}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.pool.release();
    }
}

#[cfg(test)]
mod tests {

    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn blocks_over_limit() {

        let pool = Pool::new(2);
        let p0 = pool.acquire().await;
        let p1 = pool.acquire().await;
        assert_eq!(pool.size(), 2);

        // The third acquire must stay pending until a release happens.
        let mut third = Box::pin(pool.acquire());
        let pending = tokio::time::timeout(Duration::from_millis(50), third.as_mut()).await;
        assert!(pending.is_err());

        drop(p0);
        let p2 = tokio::time::timeout(Duration::from_millis(50), third).await.unwrap();
        assert_eq!(pool.size(), 2);

        drop(p1);
        drop(p2);
        assert_eq!(pool.size(), 0);

    }

    #[tokio::test]
    async fn shrink_and_grow() {

        let pool = Pool::new(2);
        let p0 = pool.acquire().await;
        let p1 = pool.acquire().await;

        pool.set_limit(1);
        assert_eq!(pool.size(), 2);  // Transiently over-limit, not evicted.

        // The over-limit release must not admit anyone.
        drop(p0);
        assert_eq!(pool.size(), 1);

        let mut next = Box::pin(pool.acquire());
        let pending = tokio::time::timeout(Duration::from_millis(50), next.as_mut()).await;
        assert!(pending.is_err());

        // Growing the limit admits the queued waiter.
        pool.set_limit(2);
        let p2 = tokio::time::timeout(Duration::from_millis(50), next).await.unwrap();
        assert_eq!(pool.size(), 2);

        drop(p1);
        drop(p2);

    }

}

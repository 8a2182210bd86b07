//! Bounded-parallelism token pool.
//!
//! Every expensive per-file operation (hashing, copying) holds a token while
//! it runs. Tokens are interchangeable and may be returned from a different
//! thread than the one that acquired them, which lets the walk loop acquire
//! before spawning and the worker release when it finishes.

use std::sync::{Condvar, Mutex, PoisonError};

use rayon::ThreadPool;

/// Maximum worker threads for a walk (preserve system resources)
pub const MAX_WALK_THREADS: usize = 4;

/// Calculate default thread count: min(cpu_cores / 2, MAX_WALK_THREADS)
pub fn default_thread_count() -> usize {
    (num_cpus::get() / 2).clamp(1, MAX_WALK_THREADS)
}

/// Worker pool sized to match a throttle.
pub(crate) fn create_thread_pool(threads: usize) -> crate::Result<ThreadPool> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(|i| format!("relic-walk-{}", i))
        .build()?;
    Ok(pool)
}

/// Proof of one acquired slot. Hand it back with [`Throttle::release`].
#[derive(Debug)]
#[must_use = "a token that is never released shrinks the pool permanently"]
pub struct ThrottleToken {
    _private: (),
}

/// Fixed-capacity counting semaphore
#[derive(Debug)]
pub struct Throttle {
    available: Mutex<usize>,
    condvar: Condvar,
    capacity: usize,
}

impl Throttle {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            available: Mutex::new(capacity),
            condvar: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Block until a token is free.
    pub fn acquire(&self) -> ThrottleToken {
        let mut available = self.available.lock().unwrap_or_else(PoisonError::into_inner);
        while *available == 0 {
            available = self
                .condvar
                .wait(available)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *available -= 1;
        ThrottleToken { _private: () }
    }

    /// Return a token to the pool.
    pub fn release(&self, token: ThrottleToken) {
        let ThrottleToken { .. } = token;
        let mut available = self.available.lock().unwrap_or_else(PoisonError::into_inner);
        *available += 1;
        self.condvar.notify_one();
    }

    /// Acquire a token that is released when the permit drops.
    pub fn permit(&self) -> ThrottlePermit<'_> {
        let token = self.acquire();
        self.hold(token)
    }

    /// Wrap an already-acquired token so it is released on drop.
    pub fn hold(&self, token: ThrottleToken) -> ThrottlePermit<'_> {
        ThrottlePermit {
            throttle: self,
            token: Some(token),
        }
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(default_thread_count())
    }
}

pub struct ThrottlePermit<'a> {
    throttle: &'a Throttle,
    token: Option<ThrottleToken>,
}

impl Drop for ThrottlePermit<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.throttle.release(token);
        }
    }
}

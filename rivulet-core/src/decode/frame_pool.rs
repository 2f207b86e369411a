//! Bounded pool of reusable frame buffers
//!
//! Decoded frames are copied into pooled buffers before they are handed to
//! consumers, which keeps the memory held by in-flight frames bounded no
//! matter how slowly consumers run. The pool never holds more than
//! `capacity` buffers, counting both those checked out and those idle.
//!
//! Idle buffers are released once the pool has seen no activity for the idle
//! window. Every acquire or release reschedules that check, so a busy pool
//! keeps its buffers warm.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::FramePoolConfig;

/// Errors returned by buffer acquisition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("Buffer acquisition interrupted")]
    Interrupted,

    #[error("Frame pool has been shut down")]
    ShutDown,
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub checked_out: usize,
    pub idle: usize,
    pub peak_checked_out: usize,
    pub allocations: u64,
    pub reuses: u64,
    pub reclaimed: u64,
}

impl PoolStats {
    /// Fraction of acquisitions served from idle buffers
    pub fn reuse_rate(&self) -> f64 {
        let total = self.allocations + self.reuses;
        if total == 0 {
            0.0
        } else {
            self.reuses as f64 / total as f64
        }
    }
}

/// Flag that interrupts blocked acquisitions when raised
#[derive(Debug, Clone, Default)]
pub struct SuspendToken {
    flag: Arc<AtomicBool>,
}

impl SuspendToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, suspended: bool) {
        self.flag.store(suspended, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct PoolState {
    idle: HashMap<usize, Vec<Vec<u8>>>,
    idle_count: usize,
    checked_out: usize,
    last_activity: Instant,
    shut_down: bool,
    peak_checked_out: usize,
    allocations: u64,
    reuses: u64,
    reclaimed: u64,
}

impl PoolState {
    /// Drops one idle buffer of any length
    fn evict_one(&mut self) -> bool {
        let Some(len) = self
            .idle
            .iter()
            .find(|(_, buffers)| !buffers.is_empty())
            .map(|(len, _)| *len)
        else {
            return false;
        };
        if let Some(buffers) = self.idle.get_mut(&len) {
            buffers.pop();
            if buffers.is_empty() {
                self.idle.remove(&len);
            }
        }
        self.idle_count -= 1;
        self.reclaimed += 1;
        true
    }

    fn drain_idle(&mut self) -> usize {
        let dropped = self.idle_count;
        self.idle.clear();
        self.idle_count = 0;
        self.reclaimed += dropped as u64;
        dropped
    }
}

/// Bounded, blocking frame buffer pool
#[derive(Debug)]
pub struct FramePool {
    state: Mutex<PoolState>,
    available: Condvar,
    activity: Arc<Notify>,
    config: FramePoolConfig,
}

impl FramePool {
    pub fn new(config: FramePoolConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState {
                idle: HashMap::new(),
                idle_count: 0,
                checked_out: 0,
                last_activity: Instant::now(),
                shut_down: false,
                peak_checked_out: 0,
                allocations: 0,
                reuses: 0,
                reclaimed: 0,
            }),
            available: Condvar::new(),
            activity: Arc::new(Notify::new()),
            config,
        })
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Takes a buffer of exactly `len` bytes without waiting.
    ///
    /// Returns `Ok(None)` when every buffer is checked out.
    ///
    /// # Errors
    /// - `PoolError::ShutDown` - pool no longer hands out buffers
    pub fn try_acquire(self: &Arc<Self>, len: usize) -> Result<Option<PooledBuffer>, PoolError> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(PoolError::ShutDown);
        }
        let buffer = self.take_locked(&mut state, len);
        drop(state);
        Ok(buffer.map(|data| self.wrap(data)))
    }

    /// Takes a buffer of exactly `len` bytes, waiting while the pool is
    /// exhausted.
    ///
    /// The wait is re-checked every wait slice and whenever a buffer is
    /// released or waiters are interrupted.
    ///
    /// # Errors
    /// - `PoolError::Interrupted` - `interrupt` was raised while waiting
    /// - `PoolError::ShutDown` - pool was shut down
    pub fn acquire(
        self: &Arc<Self>,
        len: usize,
        interrupt: &SuspendToken,
    ) -> Result<PooledBuffer, PoolError> {
        let mut state = self.state.lock();
        loop {
            if state.shut_down {
                return Err(PoolError::ShutDown);
            }
            if interrupt.is_suspended() {
                return Err(PoolError::Interrupted);
            }
            if let Some(data) = self.take_locked(&mut state, len) {
                drop(state);
                return Ok(self.wrap(data));
            }
            trace!(
                "Frame pool exhausted ({} checked out), waiting",
                state.checked_out
            );
            self.available
                .wait_for(&mut state, self.config.wait_slice);
        }
    }

    fn take_locked(&self, state: &mut PoolState, len: usize) -> Option<Vec<u8>> {
        if state.checked_out >= self.config.capacity {
            return None;
        }

        let reused = state.idle.get_mut(&len).and_then(Vec::pop);
        let data = match reused {
            Some(data) => {
                if state.idle.get(&len).is_some_and(Vec::is_empty) {
                    state.idle.remove(&len);
                }
                state.idle_count -= 1;
                state.reuses += 1;
                data
            }
            None => {
                // Idle buffers of other shapes count against capacity
                if state.checked_out + state.idle_count >= self.config.capacity {
                    state.evict_one();
                }
                state.allocations += 1;
                vec![0u8; len]
            }
        };

        state.checked_out += 1;
        state.peak_checked_out = state.peak_checked_out.max(state.checked_out);
        state.last_activity = Instant::now();
        self.activity.notify_one();
        Some(data)
    }

    fn wrap(self: &Arc<Self>, data: Vec<u8>) -> PooledBuffer {
        PooledBuffer {
            data,
            pool: Arc::clone(self),
        }
    }

    fn release(&self, data: Vec<u8>) {
        let mut state = self.state.lock();
        state.checked_out = state.checked_out.saturating_sub(1);
        state.last_activity = Instant::now();
        if !state.shut_down {
            state.idle.entry(data.len()).or_default().push(data);
            state.idle_count += 1;
        }
        drop(state);
        self.available.notify_one();
        self.activity.notify_one();
    }

    /// Wakes every blocked acquisition so it can re-check its interrupt flag
    pub fn interrupt_waiters(&self) {
        self.available.notify_all();
    }

    /// Drops all idle buffers if the pool has been inactive for the idle
    /// window. Returns how many buffers were dropped.
    pub fn reclaim_idle(&self) -> usize {
        self.reclaim_idle_at(Instant::now())
    }

    pub fn reclaim_idle_at(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        if now.saturating_duration_since(state.last_activity) < self.config.idle_window {
            return 0;
        }
        let dropped = state.drain_idle();
        if dropped > 0 {
            debug!("Reclaimed {} idle frame buffers", dropped);
        }
        dropped
    }

    fn idle_deadline(&self) -> Option<Instant> {
        let state = self.state.lock();
        (state.idle_count > 0).then(|| state.last_activity + self.config.idle_window)
    }

    /// Starts the background task that reclaims idle buffers.
    ///
    /// Must be called from within a tokio runtime. The task only holds the
    /// pool while it is reclaiming, and stops when the returned handle or
    /// the last reference to the pool is dropped.
    pub fn spawn_reclaimer(self: &Arc<Self>) -> ReclaimerHandle {
        let weak: Weak<Self> = Arc::downgrade(self);
        let activity = Arc::clone(&self.activity);
        let task = tokio::spawn(async move {
            loop {
                activity.notified().await;

                // Keep pushing the deadline back while the pool stays busy
                loop {
                    let Some(pool) = weak.upgrade() else { return };
                    let Some(deadline) = pool.idle_deadline() else { break };
                    drop(pool);

                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
                    let Some(pool) = weak.upgrade() else { return };
                    if pool.reclaim_idle() > 0 {
                        break;
                    }
                }
            }
        });
        ReclaimerHandle { task }
    }

    /// Stops handing out buffers, drops idle ones and wakes all waiters.
    /// Buffers still checked out are freed when released.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        let dropped = state.drain_idle();
        drop(state);
        debug!("Frame pool shut down, dropped {} idle buffers", dropped);
        self.available.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            capacity: self.config.capacity,
            checked_out: state.checked_out,
            idle: state.idle_count,
            peak_checked_out: state.peak_checked_out,
            allocations: state.allocations,
            reuses: state.reuses,
            reclaimed: state.reclaimed,
        }
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        // Lets a waiting reclaimer notice the pool is gone
        self.activity.notify_one();
    }
}

/// Buffer checked out of a [`FramePool`]. Returned to the pool on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Arc<FramePool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.release(data);
    }
}

/// Handle to the idle reclaimer task
#[derive(Debug)]
pub struct ReclaimerHandle {
    task: JoinHandle<()>,
}

impl ReclaimerHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ReclaimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

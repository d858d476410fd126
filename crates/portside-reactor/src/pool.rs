//! Selector thread pool
//!
//! A small pool of permanent selector threads plus transient overflow
//! threads created when every existing thread is at capacity. Channel
//! placement happens here; once placed, a channel never migrates to
//! another thread.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::Sender;
use mio::{Token, Waker};
use tracing::{debug, error, warn};

use crate::error::ReactorError;
use crate::handler::SocketHandler;
use crate::thread::{
    spawn_selector_thread, SelectorCommand, SelectorThreadHandle,
};

#[derive(Debug, Clone)]
pub struct SelectorThreadPoolConfig {
    /// Threads kept alive for the lifetime of the pool and replaced if
    /// they die.
    pub permanent_threads: usize,
    /// Channels per thread before the pool grows.
    pub maximum_channels: usize,
    /// Select timeout; doubles as the idle-tick period.
    pub select_timeout: Duration,
}

impl Default for SelectorThreadPoolConfig {
    fn default() -> Self {
        Self {
            permanent_threads: 2,
            maximum_channels: 1024,
            select_timeout: Duration::from_millis(100),
        }
    }
}

/// Caller-side handle to a registered channel. Cheap to clone; usable
/// from any thread.
#[derive(Clone)]
pub struct ChannelHandle {
    token: Token,
    cmd_tx: Sender<SelectorCommand>,
    waker: Arc<Waker>,
}

impl ChannelHandle {
    pub fn token(&self) -> Token {
        self.token
    }

    /// Ask the owning selector thread to tear the channel down. Safe to
    /// call repeatedly.
    pub fn close(&self) {
        if self.cmd_tx.send(SelectorCommand::CloseChannel(self.token)).is_ok() {
            let _ = self.waker.wake();
        }
    }

    /// Re-derive the interest set from the handler's current wants. Used
    /// after queueing output from outside the selector thread.
    pub fn update_interest(&self) {
        if self.cmd_tx.send(SelectorCommand::UpdateInterest(self.token)).is_ok() {
            let _ = self.waker.wake();
        }
    }
}

pub(crate) struct PoolInner {
    config: SelectorThreadPoolConfig,
    threads: Mutex<Vec<SelectorThreadHandle>>,
    shutting_down: AtomicBool,
    next_thread_id: AtomicUsize,
    // Token 0 belongs to the wakers
    next_token: AtomicUsize,
}

/// Slot reserved on a selector thread; the load increment happened under
/// the pool lock so concurrent placements cannot oversubscribe a thread.
struct ThreadSlot {
    thread_id: usize,
    cmd_tx: Sender<SelectorCommand>,
    waker: Arc<Waker>,
    load: Arc<AtomicUsize>,
}

impl PoolInner {
    fn lock_threads(&self) -> MutexGuard<'_, Vec<SelectorThreadHandle>> {
        match self.threads.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn spawn_thread(
        inner: &Arc<PoolInner>,
        permanent: bool,
    ) -> Result<SelectorThreadHandle, ReactorError> {
        let id = inner.next_thread_id.fetch_add(1, Ordering::AcqRel);
        spawn_selector_thread(
            id,
            permanent,
            inner.config.select_timeout,
            Arc::downgrade(inner),
        )
    }

    /// Pick the thread for a new channel and reserve one unit of load on
    /// it. Idle threads win outright; otherwise the first thread found
    /// with the most spare capacity wins; when every thread is full a
    /// transient thread is created.
    fn select_next_thread(inner: &Arc<PoolInner>) -> Result<ThreadSlot, ReactorError> {
        let mut threads = inner.lock_threads();
        let maximum = inner.config.maximum_channels;

        let mut best: Option<usize> = None;
        let mut best_load = maximum;
        for (index, handle) in threads.iter().enumerate() {
            let load = handle.load.load(Ordering::Acquire);
            if load == 0 {
                best = Some(index);
                break;
            }
            if load < best_load {
                best = Some(index);
                best_load = load;
            }
        }

        let index = match best {
            Some(index) => index,
            None => {
                debug!("all selector threads at capacity; growing the pool");
                let handle = PoolInner::spawn_thread(inner, false)?;
                threads.push(handle);
                threads.len() - 1
            }
        };

        let handle = &threads[index];
        handle.load.fetch_add(1, Ordering::AcqRel);
        Ok(ThreadSlot {
            thread_id: handle.id,
            cmd_tx: handle.cmd_tx.clone(),
            waker: handle.waker.clone(),
            load: handle.load.clone(),
        })
    }

    /// Called by a selector thread as its last act. Permanent threads get
    /// a replacement unless the pool is shutting down; transient threads
    /// just shrink the pool.
    pub(crate) fn remove_thread(self: &Arc<Self>, thread_id: usize) {
        let mut threads = self.lock_threads();
        let Some(index) = threads.iter().position(|t| t.id == thread_id) else {
            return;
        };
        // Dropping the join handle detaches the (already exiting) thread
        let handle = threads.remove(index);
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        if !handle.permanent {
            debug!("transient selector thread {} retired", thread_id);
            return;
        }
        warn!(
            "permanent selector thread {} terminated; starting replacement",
            thread_id
        );
        match PoolInner::spawn_thread(self, true) {
            Ok(replacement) => threads.push(replacement),
            Err(e) => error!(
                "failed to replace selector thread {}: {}; pool capacity reduced",
                thread_id, e
            ),
        }
    }

    #[cfg(test)]
    fn thread_ids(&self) -> Vec<usize> {
        self.lock_threads().iter().map(|t| t.id).collect()
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // Best-effort stop for threads that outlived an un-shutdown pool
        if let Ok(threads) = self.threads.get_mut() {
            for handle in threads.iter() {
                let _ = handle.cmd_tx.send(SelectorCommand::Shutdown);
                let _ = handle.waker.wake();
            }
        }
    }
}

/// Owns the selector threads and places channels onto them.
#[derive(Clone)]
pub struct SelectorThreadPool {
    inner: Arc<PoolInner>,
}

impl SelectorThreadPool {
    pub fn new(config: SelectorThreadPoolConfig) -> Result<Self, ReactorError> {
        let inner = Arc::new(PoolInner {
            config,
            threads: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            next_thread_id: AtomicUsize::new(0),
            next_token: AtomicUsize::new(1),
        });
        {
            let mut threads = inner.lock_threads();
            for _ in 0..inner.config.permanent_threads {
                let handle = PoolInner::spawn_thread(&inner, true)?;
                threads.push(handle);
            }
        }
        Ok(Self { inner })
    }

    /// Place a handler on a selector thread. The channel stays on that
    /// thread until it closes.
    pub fn register_channel(
        &self,
        handler: Box<dyn SocketHandler>,
    ) -> Result<ChannelHandle, ReactorError> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(ReactorError::PoolShutdown);
        }
        let slot = PoolInner::select_next_thread(&self.inner)?;
        let token = Token(self.inner.next_token.fetch_add(1, Ordering::AcqRel));
        if slot
            .cmd_tx
            .send(SelectorCommand::Register { token, handler })
            .is_err()
        {
            slot.load.fetch_sub(1, Ordering::AcqRel);
            return Err(ReactorError::PoolShutdown);
        }
        if let Err(e) = slot.waker.wake() {
            warn!("failed to wake selector thread {}: {}", slot.thread_id, e);
        }
        Ok(ChannelHandle {
            token,
            cmd_tx: slot.cmd_tx,
            waker: slot.waker,
        })
    }

    /// Close every registered channel on every thread. The threads stay up.
    pub fn close_all_channels(&self) {
        let threads = self.inner.lock_threads();
        for handle in threads.iter() {
            if handle.cmd_tx.send(SelectorCommand::CloseAll).is_ok() {
                let _ = handle.waker.wake();
            }
        }
    }

    /// Stop every selector thread and wait for them. Idempotent; later
    /// `register_channel` calls fail with [`ReactorError::PoolShutdown`].
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let handles: Vec<SelectorThreadHandle> = {
            let mut threads = self.inner.lock_threads();
            threads.drain(..).collect()
        };
        for handle in &handles {
            let _ = handle.cmd_tx.send(SelectorCommand::Shutdown);
            let _ = handle.waker.wake();
        }
        // Join outside the lock: a dying thread calls remove_thread and
        // needs the lock to make progress.
        for mut handle in handles {
            if let Some(join) = handle.join.take() {
                let _ = join.join();
            }
        }
        debug!("selector thread pool shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    pub fn active_thread_count(&self) -> usize {
        self.inner.lock_threads().len()
    }
}

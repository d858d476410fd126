//! One-shot completion signalling
//!
//! Connect and disconnect requests are acknowledged through these futures:
//! any number of threads may wait or register listeners while a single
//! thread completes the future exactly once. `wait_for` is a plain blocking
//! wait and must only be called off the reactor threads.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::connection::Connection;

type Listener = Box<dyn FnOnce(&CompletionFuture) + Send>;

/// A one-shot, thread-safe completion future.
///
/// `done` transitions to the terminal state exactly once; later calls are
/// ignored. Waiters observe a stable `is_done`/`is_succeeded` pair once the
/// transition has happened.
pub struct CompletionFuture {
    state: Mutex<State>,
    done_cv: Condvar,
}

struct State {
    done: bool,
    succeeded: bool,
    listeners: Vec<Listener>,
}

impl CompletionFuture {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                done: false,
                succeeded: false,
                listeners: Vec::new(),
            }),
            done_cv: Condvar::new(),
        }
    }

    /// Complete the future. The first call wins; subsequent calls are
    /// no-ops. Queued listeners run on the calling thread, after the lock
    /// is released.
    pub fn done(&self, success: bool) {
        let listeners = {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.done {
                return;
            }
            state.done = true;
            state.succeeded = success;
            std::mem::take(&mut state.listeners)
        };
        self.done_cv.notify_all();
        for listener in listeners {
            listener(self);
        }
    }

    /// Block until the future completes or the timeout elapses. Returns
    /// `is_done()`; a timeout is not an error and does not cancel the
    /// underlying operation - callers re-check or treat it as unknown.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !state.done {
            let now = Instant::now();
            if now >= deadline {
                return state.done;
            }
            let (guard, _timed_out) = match self.done_cv.wait_timeout(state, deadline - now) {
                Ok(r) => r,
                Err(poisoned) => poisoned.into_inner(),
            };
            state = guard;
        }
        true
    }

    pub fn is_done(&self) -> bool {
        match self.state.lock() {
            Ok(s) => s.done,
            Err(poisoned) => poisoned.into_inner().done,
        }
    }

    pub fn is_succeeded(&self) -> bool {
        match self.state.lock() {
            Ok(s) => s.done && s.succeeded,
            Err(poisoned) => {
                let s = poisoned.into_inner();
                s.done && s.succeeded
            }
        }
    }

    /// Register a completion callback. Runs immediately on the calling
    /// thread if the future is already terminal, otherwise exactly once at
    /// transition time on the thread that calls `done`.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&CompletionFuture) + Send + 'static,
    {
        let run_now = {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.done {
                true
            } else {
                state.listeners.push(Box::new(listener));
                return;
            }
        };
        if run_now {
            listener(self);
        }
    }
}

impl Default for CompletionFuture {
    fn default() -> Self {
        Self::new()
    }
}

/// Completion signal for an outbound connect request.
///
/// Completed by the protocol layer once the transport is established; the
/// established connection handle is stashed for the waiter.
pub struct ConnectRequestFuture {
    future: CompletionFuture,
    connection: Mutex<Option<Arc<dyn Connection>>>,
}

impl ConnectRequestFuture {
    pub fn new() -> Self {
        Self {
            future: CompletionFuture::new(),
            connection: Mutex::new(None),
        }
    }

    /// Record the established connection and complete with success.
    pub fn connected(&self, connection: Arc<dyn Connection>) {
        if let Ok(mut slot) = self.connection.lock() {
            *slot = Some(connection);
        }
        self.future.done(true);
    }

    /// Complete with failure; no connection is stashed.
    pub fn failed(&self) {
        self.future.done(false);
    }

    /// The established connection, once `connected` has been called.
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.future.wait_for(timeout)
    }

    pub fn is_done(&self) -> bool {
        self.future.is_done()
    }

    pub fn is_succeeded(&self) -> bool {
        self.future.is_succeeded()
    }

    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&CompletionFuture) + Send + 'static,
    {
        self.future.add_listener(listener)
    }
}

impl Default for ConnectRequestFuture {
    fn default() -> Self {
        Self::new()
    }
}

/// Completion signal for a disconnect request. Carries no payload.
pub struct DisconnectRequestFuture {
    future: CompletionFuture,
}

impl DisconnectRequestFuture {
    pub fn new() -> Self {
        Self {
            future: CompletionFuture::new(),
        }
    }

    /// The transport has been torn down.
    pub fn disconnected(&self) {
        self.future.done(true);
    }

    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.future.wait_for(timeout)
    }

    pub fn is_done(&self) -> bool {
        self.future.is_done()
    }

    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&CompletionFuture) + Send + 'static,
    {
        self.future.add_listener(listener)
    }
}

impl Default for DisconnectRequestFuture {
    fn default() -> Self {
        Self::new()
    }
}

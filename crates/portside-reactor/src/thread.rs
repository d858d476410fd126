//! Selector thread
//!
//! One reactor loop bound to a native selector. The thread owns its
//! registered channels exclusively; other threads talk to it through the
//! command channel plus waker. The only blocking call on this thread is
//! the poll itself.

use std::collections::HashMap;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, trace, warn};

use crate::error::ReactorError;
use crate::handler::SocketHandler;
use crate::pool::PoolInner;

/// Token reserved for the wakeup source on every selector thread.
pub(crate) const WAKER_TOKEN: Token = Token(0);

const MAX_EVENTS: usize = 128;

pub(crate) enum SelectorCommand {
    Register {
        token: Token,
        handler: Box<dyn SocketHandler>,
    },
    CloseChannel(Token),
    UpdateInterest(Token),
    CloseAll,
    Shutdown,
}

/// Pool-side handle to a running selector thread.
pub(crate) struct SelectorThreadHandle {
    pub(crate) id: usize,
    pub(crate) permanent: bool,
    pub(crate) load: Arc<AtomicUsize>,
    pub(crate) cmd_tx: Sender<SelectorCommand>,
    pub(crate) waker: Arc<Waker>,
    pub(crate) join: Option<thread::JoinHandle<()>>,
}

/// Interest set derived from what the handler currently wants. Write
/// interest is registered only while the handler actually has output -
/// anything else busy-loops the selector.
pub(crate) fn desired_interest(wants_read: bool, wants_write: bool) -> Interest {
    match (wants_read, wants_write) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        (_, false) => Interest::READABLE,
    }
}

/// Spawn a selector thread. The thread reports its own termination to the
/// pool, which replaces it when it was permanent and the pool is still
/// running.
pub(crate) fn spawn_selector_thread(
    id: usize,
    permanent: bool,
    select_timeout: Duration,
    pool: Weak<PoolInner>,
) -> Result<SelectorThreadHandle, ReactorError> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
    let (cmd_tx, cmd_rx) = unbounded();
    let load = Arc::new(AtomicUsize::new(0));

    let mut selector = SelectorThread {
        id,
        poll,
        cmd_rx,
        channels: HashMap::new(),
        load: load.clone(),
        select_timeout,
        running: true,
    };

    let join = thread::Builder::new()
        .name(format!("portside-selector-{}", id))
        .spawn(move || {
            if catch_unwind(AssertUnwindSafe(|| selector.run())).is_err() {
                error!("selector thread {} terminated unexpectedly", id);
            }
            if let Some(pool) = pool.upgrade() {
                pool.remove_thread(id);
            }
        })
        .map_err(|e| ReactorError::ThreadSpawn(e.to_string()))?;

    Ok(SelectorThreadHandle {
        id,
        permanent,
        load,
        cmd_tx,
        waker,
        join: Some(join),
    })
}

struct SelectorThread {
    id: usize,
    poll: Poll,
    cmd_rx: Receiver<SelectorCommand>,
    channels: HashMap<Token, Box<dyn SocketHandler>>,
    load: Arc<AtomicUsize>,
    select_timeout: Duration,
    running: bool,
}

impl SelectorThread {
    fn run(&mut self) {
        debug!("selector thread {} started", self.id);
        let mut events = Events::with_capacity(MAX_EVENTS);
        while self.running {
            if let Err(e) = self.poll.poll(&mut events, Some(self.select_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("selector thread {} poll failed: {}", self.id, e);
                break;
            }

            // Commands first, so a registration always precedes the
            // readiness events it generates.
            self.drain_commands();

            if events.is_empty() {
                self.idle_tick();
                continue;
            }
            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                self.dispatch(event.token(), event.is_readable(), event.is_writable());
            }
        }
        self.close_all_channels();
        debug!("selector thread {} stopped", self.id);
    }

    fn drain_commands(&mut self) {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(SelectorCommand::Register { token, mut handler }) => {
                    match handler.register(self.poll.registry(), token) {
                        Ok(()) => {
                            trace!(
                                "thread {} registered channel {:?}",
                                self.id,
                                token
                            );
                            self.channels.insert(token, handler);
                            // The handler may already have output queued
                            // (a server banner, say); pick up its wants now
                            // rather than waiting for a readiness event.
                            self.refresh_interest(token);
                        }
                        Err(e) => {
                            error!(
                                "thread {} failed to register channel {:?}: {}",
                                self.id, token, e
                            );
                            handler.close();
                            self.load.fetch_sub(1, Ordering::AcqRel);
                        }
                    }
                }
                Ok(SelectorCommand::CloseChannel(token)) => self.remove_channel(token),
                Ok(SelectorCommand::UpdateInterest(token)) => self.refresh_interest(token),
                Ok(SelectorCommand::CloseAll) => self.close_all_channels(),
                Ok(SelectorCommand::Shutdown) => {
                    self.running = false;
                    return;
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.running = false;
                    return;
                }
            }
        }
    }

    /// A panic inside one handler closes that channel only; the thread
    /// and its other channels keep running.
    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
        let keep = match self.channels.get_mut(&token) {
            Some(handler) => {
                match catch_unwind(AssertUnwindSafe(|| {
                    let mut keep = true;
                    if readable {
                        keep = handler.process_read_event();
                    }
                    if keep && writable {
                        keep = handler.process_write_event();
                    }
                    keep
                })) {
                    Ok(keep) => keep,
                    Err(_) => {
                        error!(
                            "handler panicked on thread {}; closing channel {:?}",
                            self.id, token
                        );
                        false
                    }
                }
            }
            None => return,
        };
        if keep {
            self.refresh_interest(token);
        } else {
            self.remove_channel(token);
        }
    }

    fn refresh_interest(&mut self, token: Token) {
        let registry = self.poll.registry();
        if let Some(handler) = self.channels.get_mut(&token) {
            let interest = desired_interest(handler.wants_read(), handler.wants_write());
            if let Err(e) = handler.reregister(registry, token, interest) {
                warn!("thread reregister failed for {:?}: {}", token, e);
            }
        }
    }

    fn remove_channel(&mut self, token: Token) {
        if let Some(mut handler) = self.channels.remove(&token) {
            if let Err(e) = handler.deregister(self.poll.registry()) {
                trace!("deregister failed for {:?}: {}", token, e);
            }
            if catch_unwind(AssertUnwindSafe(|| handler.close())).is_err() {
                error!("handler close panicked for {:?}", token);
            }
            self.load.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn close_all_channels(&mut self) {
        let tokens: Vec<Token> = self.channels.keys().copied().collect();
        for token in tokens {
            self.remove_channel(token);
        }
    }

    fn idle_tick(&mut self) {
        let tokens: Vec<Token> = self.channels.keys().copied().collect();
        for token in tokens {
            let panicked = match self.channels.get_mut(&token) {
                Some(handler) => {
                    catch_unwind(AssertUnwindSafe(|| handler.on_idle())).is_err()
                }
                None => false,
            };
            if panicked {
                error!("idle processing panicked; closing channel {:?}", token);
                self.remove_channel(token);
            } else {
                self.refresh_interest(token);
            }
        }
    }
}

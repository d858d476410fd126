//! Blocking-work executor
//!
//! Selector threads must never block; synchronous authentication lookups,
//! DNS resolution and similar work are pushed here via
//! `SocketHandler::add_task` and resume the protocol asynchronously.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use tracing::{error, warn};

use crate::handler::Task;

const DEFAULT_WORKERS: usize = 4;

/// Fixed set of worker threads draining an unbounded job queue.
pub struct Executor {
    tx: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl Executor {
    pub fn new(workers: usize) -> Self {
        let (tx, rx) = unbounded::<Task>();
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("portside-executor-{}", index))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        if catch_unwind(AssertUnwindSafe(task)).is_err() {
                            error!("executor task panicked");
                        }
                    }
                })
                .expect("failed to spawn executor worker");
            handles.push(handle);
        }
        Self {
            tx: Some(tx),
            workers: handles,
        }
    }

    pub fn execute(&self, task: Task) {
        if let Some(tx) = &self.tx {
            if tx.send(task).is_err() {
                warn!("executor is shut down; task dropped");
            }
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Disconnect the queue so workers drain and exit
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

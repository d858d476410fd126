//! Active tunnel tracking
//!
//! Keeps the set of open tunnel channels for one forward. The stop and
//! kill latches share a single lock with the active set: an open racing a
//! `stop_admissions` or `kill_all_tunnels` either lands before it (and
//! stays tracked, closed with the rest on a kill) or after it (and is
//! refused admission). There is no window where a straggler survives.

use std::sync::{Arc, Mutex, MutexGuard};

use portside_core::{Channel, ChannelEventListener};
use tracing::{debug, warn};

struct TunnelSet {
    active: Vec<Arc<dyn Channel>>,
    stopped: bool,
    killing: bool,
}

pub struct ActiveTunnelManager {
    tunnels: Mutex<TunnelSet>,
    listeners: Mutex<Vec<Arc<dyn ChannelEventListener>>>,
}

impl ActiveTunnelManager {
    pub fn new() -> Self {
        Self {
            tunnels: Mutex::new(TunnelSet {
                active: Vec::new(),
                stopped: false,
                killing: false,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn lock_tunnels(&self) -> MutexGuard<'_, TunnelSet> {
        match self.tunnels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn snapshot_listeners(&self) -> Vec<Arc<dyn ChannelEventListener>> {
        match self.listeners.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ChannelEventListener>) {
        match self.listeners.lock() {
            Ok(mut guard) => guard.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    /// Admit a newly opened tunnel channel. Returns false (and closes the
    /// channel) when the forward has already stopped.
    pub fn on_channel_open(&self, channel: &Arc<dyn Channel>) -> bool {
        {
            let mut tunnels = self.lock_tunnels();
            if tunnels.stopped || tunnels.killing {
                warn!("tunnel opened after stop; refusing admission");
                channel.close();
                return false;
            }
            tunnels.active.push(channel.clone());
        }
        for listener in self.snapshot_listeners() {
            listener.on_channel_open(channel);
        }
        true
    }

    pub fn on_channel_close(&self, channel: &Arc<dyn Channel>) {
        let removed = {
            let mut tunnels = self.lock_tunnels();
            let before = tunnels.active.len();
            tunnels.active.retain(|tracked| !Arc::ptr_eq(tracked, channel));
            before != tunnels.active.len()
        };
        if removed {
            for listener in self.snapshot_listeners() {
                listener.on_channel_close(channel);
            }
        }
    }

    /// Refuse all future admissions without touching the tunnels already
    /// running. A channel open racing the stop either lands before it (and
    /// stays reachable for a later kill) or after it (and is refused); the
    /// shared lock leaves no window in between.
    pub fn stop_admissions(&self) {
        self.lock_tunnels().stopped = true;
    }

    /// Close every tracked tunnel and latch the manager shut. The latch is
    /// permanent: this manager belongs to one forward, and a stopped
    /// forward never accepts again.
    pub fn kill_all_tunnels(&self) {
        let drained: Vec<Arc<dyn Channel>> = {
            let mut tunnels = self.lock_tunnels();
            tunnels.stopped = true;
            tunnels.killing = true;
            std::mem::take(&mut tunnels.active)
        };
        if drained.is_empty() {
            return;
        }
        debug!("killing {} active tunnels", drained.len());
        for channel in drained {
            channel.close();
            for listener in self.snapshot_listeners() {
                listener.on_channel_close(&channel);
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock_tunnels().active.len()
    }
}

impl Default for ActiveTunnelManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use bytes::Bytes;

    struct FakeChannel {
        closed: AtomicBool,
    }

    impl FakeChannel {
        fn create() -> Arc<dyn Channel> {
            Arc::new(Self {
                closed: AtomicBool::new(false),
            })
        }
    }

    impl Channel for FakeChannel {
        fn write(&self, _data: Bytes) -> std::io::Result<()> {
            Ok(())
        }
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_open_then_close_updates_the_set() {
        let manager = ActiveTunnelManager::new();
        let first = FakeChannel::create();
        let second = FakeChannel::create();

        assert!(manager.on_channel_open(&first));
        assert!(manager.on_channel_open(&second));
        assert_eq!(manager.active_count(), 2);

        manager.on_channel_close(&first);
        assert_eq!(manager.active_count(), 1);
        // Closing an untracked channel is a no-op
        manager.on_channel_close(&first);
        assert_eq!(manager.active_count(), 1);
    }

    #[test]
    fn test_kill_closes_everything_and_latches() {
        let manager = ActiveTunnelManager::new();
        let tracked = FakeChannel::create();
        manager.on_channel_open(&tracked);

        manager.kill_all_tunnels();
        assert_eq!(manager.active_count(), 0);
        assert!(!tracked.is_open());

        // A straggler arriving after the kill is refused and closed
        let straggler = FakeChannel::create();
        assert!(!manager.on_channel_open(&straggler));
        assert!(!straggler.is_open());
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_stop_refuses_new_opens_but_keeps_running_tunnels() {
        let manager = ActiveTunnelManager::new();
        let established = FakeChannel::create();
        manager.on_channel_open(&established);

        manager.stop_admissions();

        // An open that completes after the stop is refused and closed,
        // even though nothing was killed
        let late = FakeChannel::create();
        assert!(!manager.on_channel_open(&late));
        assert!(!late.is_open());

        // The tunnel admitted before the stop keeps running and is still
        // reachable by a later kill
        assert_eq!(manager.active_count(), 1);
        assert!(established.is_open());
        manager.kill_all_tunnels();
        assert!(!established.is_open());
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_listeners_hear_open_and_close() {
        struct CountingListener {
            opens: AtomicUsize,
            closes: AtomicUsize,
        }
        impl ChannelEventListener for CountingListener {
            fn on_channel_open(&self, _channel: &Arc<dyn Channel>) {
                self.opens.fetch_add(1, Ordering::SeqCst);
            }
            fn on_channel_close(&self, _channel: &Arc<dyn Channel>) {
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
        }

        let manager = ActiveTunnelManager::new();
        let listener = Arc::new(CountingListener {
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });
        manager.add_listener(listener.clone());

        let channel = FakeChannel::create();
        manager.on_channel_open(&channel);
        manager.kill_all_tunnels();

        assert_eq!(listener.opens.load(Ordering::SeqCst), 1);
        assert_eq!(listener.closes.load(Ordering::SeqCst), 1);
    }
}

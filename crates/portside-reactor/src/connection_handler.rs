//! Data-channel socket handler
//!
//! Bridges one `mio` TCP stream and one protocol engine. Reads drain the
//! socket until it would block; writes flush a pending buffer first and
//! then pull more output from the engine. Outbound connects are observed
//! here too: the first writability event resolves the connect and flips
//! the handler into connected mode.

use std::io::{self, Read, Write};
use std::sync::Arc;

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use socket2::SockRef;
use tracing::debug;

use crate::context::SocketOptions;
use crate::engine::{ProtocolEngine, WriteCompletion, SocketInfo};
use crate::executor::Executor;
use crate::handler::{SocketHandler, Task};

const READ_BUFFER_SIZE: usize = 8 * 1024;

enum ConnectProgress {
    Connected,
    Pending,
    Failed,
}

pub struct ConnectionHandler {
    stream: TcpStream,
    engine: Box<dyn ProtocolEngine>,
    executor: Arc<Executor>,
    connecting: bool,
    send_queue: BytesMut,
    pending_completions: Vec<WriteCompletion>,
    close_notified: bool,
}

impl ConnectionHandler {
    /// Handler for an accepted, already-connected stream.
    pub fn accepted(
        stream: TcpStream,
        engine: Box<dyn ProtocolEngine>,
        executor: Arc<Executor>,
    ) -> Self {
        Self {
            stream,
            engine,
            executor,
            connecting: false,
            send_queue: BytesMut::new(),
            pending_completions: Vec::new(),
            close_notified: false,
        }
    }

    /// Handler for an in-flight outbound connect. The engine sees
    /// `on_socket_connect` once the connect resolves.
    pub fn connecting(
        stream: TcpStream,
        engine: Box<dyn ProtocolEngine>,
        executor: Arc<Executor>,
    ) -> Self {
        Self {
            connecting: true,
            ..Self::accepted(stream, engine, executor)
        }
    }

    pub fn apply_options(&self, options: &SocketOptions) -> io::Result<()> {
        options.apply(&SockRef::from(&self.stream))
    }

    fn socket_info(&self) -> SocketInfo {
        SocketInfo {
            local_addr: self.stream.local_addr().ok(),
            peer_addr: self.stream.peer_addr().ok(),
        }
    }

    fn notify_close(&mut self) {
        if !self.close_notified {
            self.close_notified = true;
            self.engine.on_socket_close();
        }
    }

    /// Non-blocking connects surface their outcome through `take_error`;
    /// a clean `peer_addr` confirms the three-way handshake finished.
    fn finish_connect(&mut self) -> ConnectProgress {
        match self.stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) => {
                debug!("outbound connect failed: {}", e);
                self.notify_close();
                return ConnectProgress::Failed;
            }
            Err(e) => {
                debug!("outbound connect state unavailable: {}", e);
                self.notify_close();
                return ConnectProgress::Failed;
            }
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.connecting = false;
                let info = self.socket_info();
                self.engine.on_socket_connect(&info);
                ConnectProgress::Connected
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => ConnectProgress::Pending,
            Err(e) => {
                debug!("outbound connect failed: {}", e);
                self.notify_close();
                ConnectProgress::Failed
            }
        }
    }

    /// Pull engine output into the send queue while the queue is empty and
    /// the engine reports more. A completion callback is retained until the
    /// queue next drains fully.
    fn fill_send_queue(&mut self) {
        while self.send_queue.is_empty() && self.engine.wants_to_write() {
            let before = self.send_queue.len();
            if let Some(completion) = self.engine.on_socket_write(&mut self.send_queue) {
                self.pending_completions.push(completion);
            }
            if self.send_queue.len() == before {
                break;
            }
        }
    }

    /// Returns Ok(true) when everything pending was written.
    fn try_flush(&mut self) -> io::Result<bool> {
        loop {
            self.fill_send_queue();
            if self.send_queue.is_empty() {
                for completion in self.pending_completions.drain(..) {
                    completion();
                }
                return Ok(true);
            }
            match self.stream.write(&self.send_queue) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => {
                    let _ = self.send_queue.split_to(written);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl SocketHandler for ConnectionHandler {
    fn initial_interest(&self) -> Interest {
        if self.connecting {
            // connect completion is a writability event
            Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let interest = self.initial_interest();
        registry.register(&mut self.stream, token, interest)?;
        if !self.connecting {
            let info = self.socket_info();
            self.engine.on_socket_connect(&info);
        }
        Ok(())
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.reregister(&mut self.stream, token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    fn process_read_event(&mut self) -> bool {
        if self.connecting {
            return true;
        }
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        loop {
            match self.stream.read(&mut buffer) {
                Ok(0) => {
                    self.notify_close();
                    return false;
                }
                Ok(count) => {
                    if self.engine.on_socket_read(&buffer[..count]) {
                        if let Err(e) = self.try_flush() {
                            debug!("write failed: {}", e);
                            self.notify_close();
                            return false;
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return self.engine.is_connected() || !self.send_queue.is_empty();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("read failed: {}", e);
                    self.notify_close();
                    return false;
                }
            }
        }
    }

    fn process_write_event(&mut self) -> bool {
        if self.connecting {
            match self.finish_connect() {
                ConnectProgress::Pending => return true,
                ConnectProgress::Failed => return false,
                ConnectProgress::Connected => {}
            }
        }
        match self.try_flush() {
            Ok(_) => {
                self.engine.is_connected()
                    || !self.send_queue.is_empty()
                    || !self.pending_completions.is_empty()
            }
            Err(e) => {
                debug!("write failed: {}", e);
                self.notify_close();
                false
            }
        }
    }

    fn wants_read(&self) -> bool {
        !self.connecting
    }

    fn wants_write(&self) -> bool {
        self.connecting || !self.send_queue.is_empty() || self.engine.wants_to_write()
    }

    fn add_task(&self, task: Task) {
        self.executor.execute(task);
    }

    fn on_idle(&mut self) {
        if self.connecting {
            return;
        }
        self.engine.on_idle();
        if self.wants_write() {
            if let Err(e) = self.try_flush() {
                debug!("write failed: {}", e);
                self.notify_close();
            }
        }
    }

    fn close(&mut self) {
        self.notify_close();
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

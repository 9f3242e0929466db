// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reactor thread for direct connections and the timeout reaper.
//!
//! One `mio::Poll` loop per agent. It owns the direct listener and every
//! direct socket, drains a command channel woken through a `mio::Waker`, and
//! calls back into a [`ReactorHandler`] for connection events, decoded
//! messages and periodic ticks.
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                         IoThread                            |
//! |  +-------------------------------------------------------+  |
//! |  |                      mio::Poll                        |  |
//! |  |  - listener (accept direct connections)               |  |
//! |  |  - streams (read messages, write frames)              |  |
//! |  |  - waker (commands from agent threads)                |  |
//! |  +-------------------------------------------------------+  |
//! |                              |                              |
//! |                              v                              |
//! |  +-------------------------------------------------------+  |
//! |  |  ReactorHandler: connected / message / closed / tick  |  |
//! |  +-------------------------------------------------------+  |
//! +-------------------------------------------------------------+
//! ```
//!
//! A queued frame's [`Completion`] fires `Deferred` once its last byte has
//! been written, or `Failed` when the connection goes away first.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, SendError, Sender, TryRecvError};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;

use crate::config::FenceConfig;
use crate::protocol::{DirectCodec, DirectMessage, Frame};
use crate::transport::{Completion, CompletionContext, SendStatus};

// ============================================================================
// Constants
// ============================================================================

/// Token for the direct listener
const LISTENER_TOKEN: Token = Token(0);

/// Token for the waker (command channel)
const WAKER_TOKEN: Token = Token(1);

/// Starting token for connections
const CONNECTION_TOKEN_START: usize = 2;

/// Upper bound on a single poll wait
const MAX_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Maximum events to process per poll
const MAX_EVENTS: usize = 128;

/// Reactor connection identifier.
pub type ConnId = u64;

// ============================================================================
// Handler and commands
// ============================================================================

/// Receiver of reactor events. Called on the reactor thread.
pub trait ReactorHandler: Send + Sync {
    /// A socket became usable; `outbound` is true for connections we dialled.
    fn on_connected(&self, conn: ConnId, remote: SocketAddr, outbound: bool);

    /// A complete message arrived.
    fn on_message(&self, conn: ConnId, remote: SocketAddr, msg: DirectMessage);

    /// A socket closed or failed; its queued sends have already failed.
    fn on_closed(&self, conn: ConnId, reason: Option<String>);

    /// Periodic tick.
    fn on_tick(&self, now: Instant);
}

/// Reactor settings.
#[derive(Clone, Debug)]
pub struct ReactorConfig {
    /// Listener address (`None` = no listener)
    pub listen: Option<SocketAddr>,
    /// Listen backlog
    pub backlog: i32,
    /// TCP_NODELAY on direct sockets
    pub nodelay: bool,
    /// Largest accepted message payload
    pub max_message_size: usize,
    /// Interval between `on_tick` calls
    pub tick: Duration,
}

impl ReactorConfig {
    /// Derive reactor settings; a listener exists only with direct connections enabled.
    pub fn from_fence(config: &FenceConfig) -> Self {
        let listen = if config.direct_conn {
            Some(SocketAddr::new(
                config.listen_address.unwrap_or([0, 0, 0, 0].into()),
                config.listen_port,
            ))
        } else {
            None
        };
        Self {
            listen,
            backlog: config.listen_backlog,
            nodelay: config.nodelay,
            max_message_size: config.max_message_size,
            tick: config.reaper_interval(),
        }
    }
}

/// Commands sent to the reactor.
#[derive(Debug)]
enum IoCommand {
    Connect {
        addr: SocketAddr,
        conn_id: ConnId,
    },
    Send {
        conn_id: ConnId,
        frame: Frame,
        completion: Completion,
    },
    Close {
        conn_id: ConnId,
    },
    Shutdown,
}

// ============================================================================
// Handle
// ============================================================================

/// Thread-safe handle to a running reactor.
pub struct IoThreadHandle {
    cmd_tx: Mutex<Sender<IoCommand>>,
    waker: Arc<Waker>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: Option<ThreadId>,
    running: Arc<AtomicBool>,
    next_conn_id: Arc<AtomicU64>,
    local_addr: Option<SocketAddr>,
}

impl IoThreadHandle {
    /// Listener address, when listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Start an outbound connection; the id is reported back through the handler.
    pub fn connect(&self, addr: SocketAddr) -> io::Result<ConnId> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.submit(IoCommand::Connect { addr, conn_id })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reactor stopped"))?;
        Ok(conn_id)
    }

    /// Queue `frame` on `conn_id`; `completion` fires exactly once.
    pub fn send(&self, conn_id: ConnId, frame: Frame, completion: Completion) {
        let cmd = IoCommand::Send {
            conn_id,
            frame,
            completion,
        };
        if let Err(SendError(IoCommand::Send { completion, .. })) = self.submit(cmd) {
            completion.complete(SendStatus::Failed, CompletionContext::Inline);
        }
    }

    /// Close a connection.
    pub fn close(&self, conn_id: ConnId) {
        let _ = self.submit(IoCommand::Close { conn_id });
    }

    /// Whether the reactor thread is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop the reactor and join it (unless called from the reactor itself).
    pub fn shutdown(&self) {
        if !self.is_running() {
            return;
        }
        let _ = self.submit(IoCommand::Shutdown);
        if self.thread_id == Some(thread::current().id()) {
            return;
        }
        if let Some(handle) = self.thread_handle.lock().take() {
            if handle.join().is_err() {
                log::error!("[reactor] thread panicked");
            }
        }
    }

    fn submit(&self, cmd: IoCommand) -> Result<(), SendError<IoCommand>> {
        self.cmd_tx.lock().send(cmd)?;
        if let Err(e) = self.waker.wake() {
            log::warn!("[reactor] wake failed: {}", e);
        }
        Ok(())
    }
}

impl Drop for IoThreadHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Reactor
// ============================================================================

struct Outgoing {
    frame: Frame,
    offset: usize,
    completion: Option<Completion>,
}

struct IoConnection {
    stream: TcpStream,
    conn_id: ConnId,
    remote_addr: SocketAddr,
    connecting: bool,
    codec: DirectCodec,
    send_queue: VecDeque<Outgoing>,
}

impl IoConnection {
    fn fail_pending(&mut self) {
        for mut out in self.send_queue.drain(..) {
            if let Some(c) = out.completion.take() {
                c.complete(SendStatus::Failed, CompletionContext::Deferred);
            }
        }
    }
}

/// Reactor state, owned by the reactor thread.
pub struct IoThread {
    config: ReactorConfig,
    poll: Poll,
    listener: Option<TcpListener>,
    connections: HashMap<Token, IoConnection>,
    conn_id_to_token: HashMap<ConnId, Token>,
    next_token: usize,
    next_conn_id: Arc<AtomicU64>,
    cmd_rx: Receiver<IoCommand>,
    handler: Weak<dyn ReactorHandler>,
    running: Arc<AtomicBool>,
    next_tick: Instant,
}

/// Bind a non-blocking listener with `SO_REUSEADDR` and an explicit backlog.
fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    let listener: std::net::TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(listener))
}

impl IoThread {
    /// Spawn the reactor thread.
    pub fn spawn(config: ReactorConfig, handler: Weak<dyn ReactorHandler>) -> io::Result<IoThreadHandle> {
        let poll = Poll::new()?;

        let listener = match config.listen {
            Some(addr) => {
                let mut listener = bind_listener(addr, config.backlog)?;
                poll.registry()
                    .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
                Some(listener)
            }
            None => None,
        };
        let local_addr = match &listener {
            Some(l) => Some(l.local_addr()?),
            None => None,
        };

        let (cmd_tx, cmd_rx) = channel();
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let running = Arc::new(AtomicBool::new(true));
        let next_conn_id = Arc::new(AtomicU64::new(1));

        let io_thread = Self {
            next_tick: Instant::now() + config.tick,
            config,
            poll,
            listener,
            connections: HashMap::new(),
            conn_id_to_token: HashMap::new(),
            next_token: CONNECTION_TOKEN_START,
            next_conn_id: next_conn_id.clone(),
            cmd_rx,
            handler,
            running: running.clone(),
        };

        let thread_handle = thread::Builder::new()
            .name("treefence-io".to_string())
            .spawn(move || io_thread.run())?;
        let thread_id = Some(thread_handle.thread().id());

        if let Some(addr) = local_addr {
            log::info!("[reactor] direct listener on {}", addr);
        }

        Ok(IoThreadHandle {
            cmd_tx: Mutex::new(cmd_tx),
            waker,
            thread_handle: Mutex::new(Some(thread_handle)),
            thread_id,
            running,
            next_conn_id,
            local_addr,
        })
    }

    /// Run the event loop until shutdown or until the handler is dropped.
    fn run(mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.running.load(Ordering::Relaxed) {
            let wait = self
                .next_tick
                .saturating_duration_since(Instant::now())
                .min(MAX_POLL_TIMEOUT);
            if let Err(e) = self.poll.poll(&mut events, Some(wait)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    log::error!("[reactor] poll error: {}", e);
                }
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.handle_accept(),
                    WAKER_TOKEN => self.handle_commands(),
                    token => {
                        if event.is_readable() {
                            self.handle_readable(token);
                        }
                        if event.is_writable() {
                            self.handle_writable(token);
                        }
                    }
                }
            }

            let now = Instant::now();
            if now >= self.next_tick {
                self.next_tick = now + self.config.tick;
                match self.handler.upgrade() {
                    Some(handler) => handler.on_tick(now),
                    None => self.running.store(false, Ordering::Relaxed),
                }
            }
        }

        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close_connection(token, Some("reactor shutdown".to_string()));
        }
        log::debug!("[reactor] stopped");
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn handle_accept(&mut self) {
        loop {
            let accepted = match &self.listener {
                Some(l) => l.accept(),
                None => return,
            };
            match accepted {
                Ok((mut stream, remote_addr)) => {
                    let token = self.alloc_token();
                    let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);

                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        log::warn!("[reactor] failed to register accepted socket: {}", e);
                        continue;
                    }
                    let _ = stream.set_nodelay(self.config.nodelay);

                    self.connections.insert(
                        token,
                        IoConnection {
                            stream,
                            conn_id,
                            remote_addr,
                            connecting: false,
                            codec: DirectCodec::new(self.config.max_message_size),
                            send_queue: VecDeque::new(),
                        },
                    );
                    self.conn_id_to_token.insert(conn_id, token);

                    log::debug!("[reactor] accepted conn {} from {}", conn_id, remote_addr);
                    if let Some(handler) = self.handler.upgrade() {
                        handler.on_connected(conn_id, remote_addr, false);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("[reactor] accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_commands(&mut self) {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(IoCommand::Connect { addr, conn_id }) => self.handle_connect(addr, conn_id),
                Ok(IoCommand::Send {
                    conn_id,
                    frame,
                    completion,
                }) => self.handle_send(conn_id, frame, completion),
                Ok(IoCommand::Close { conn_id }) => {
                    if let Some(token) = self.conn_id_to_token.get(&conn_id).copied() {
                        self.close_connection(token, Some("closed by request".to_string()));
                    }
                }
                Ok(IoCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                    self.running.store(false, Ordering::Relaxed);
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
    }

    fn handle_connect(&mut self, addr: SocketAddr, conn_id: ConnId) {
        match TcpStream::connect(addr) {
            Ok(mut stream) => {
                let token = self.alloc_token();
                if let Err(e) = self.poll.registry().register(
                    &mut stream,
                    token,
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    log::warn!("[reactor] failed to register conn {}: {}", conn_id, e);
                    self.notify_closed(conn_id, Some(format!("register failed: {}", e)));
                    return;
                }
                let _ = stream.set_nodelay(self.config.nodelay);

                self.connections.insert(
                    token,
                    IoConnection {
                        stream,
                        conn_id,
                        remote_addr: addr,
                        connecting: true,
                        codec: DirectCodec::new(self.config.max_message_size),
                        send_queue: VecDeque::new(),
                    },
                );
                self.conn_id_to_token.insert(conn_id, token);
            }
            Err(e) => {
                log::warn!("[reactor] connect to {} failed: {}", addr, e);
                self.notify_closed(conn_id, Some(format!("connect failed: {}", e)));
            }
        }
    }

    fn handle_send(&mut self, conn_id: ConnId, frame: Frame, completion: Completion) {
        let token = match self.conn_id_to_token.get(&conn_id) {
            Some(t) => *t,
            None => {
                log::debug!("[reactor] send on unknown conn {}", conn_id);
                completion.complete(SendStatus::Failed, CompletionContext::Deferred);
                return;
            }
        };
        let conn = match self.connections.get_mut(&token) {
            Some(c) => c,
            None => {
                completion.complete(SendStatus::Failed, CompletionContext::Deferred);
                return;
            }
        };
        conn.send_queue.push_back(Outgoing {
            frame,
            offset: 0,
            completion: Some(completion),
        });
        if !conn.connecting {
            self.try_flush(token);
        }
    }

    fn handle_readable(&mut self, token: Token) {
        let conn = match self.connections.get_mut(&token) {
            Some(c) => c,
            None => return,
        };
        let (conn_id, remote) = (conn.conn_id, conn.remote_addr);

        let mut received = Vec::new();
        let mut failure = None;
        loop {
            match conn.codec.decode(&mut conn.stream) {
                Ok(Some(msg)) => received.push(msg),
                Ok(None) => break,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    failure = Some("connection closed by peer".to_string());
                    break;
                }
                Err(e) => {
                    failure = Some(format!("read error: {}", e));
                    break;
                }
            }
        }

        if let Some(handler) = self.handler.upgrade() {
            for msg in received {
                handler.on_message(conn_id, remote, msg);
            }
        }
        if let Some(reason) = failure {
            self.close_connection(token, Some(reason));
        }
    }

    fn handle_writable(&mut self, token: Token) {
        let conn = match self.connections.get_mut(&token) {
            Some(c) => c,
            None => return,
        };

        if conn.connecting {
            match conn.stream.take_error() {
                Ok(None) => {
                    // Writable before the handshake finished: not connected yet.
                    if conn.stream.peer_addr().is_err() {
                        return;
                    }
                    conn.connecting = false;
                    let (conn_id, remote) = (conn.conn_id, conn.remote_addr);
                    log::debug!("[reactor] conn {} established to {}", conn_id, remote);
                    if let Some(handler) = self.handler.upgrade() {
                        handler.on_connected(conn_id, remote, true);
                    }
                }
                Ok(Some(e)) => {
                    self.close_connection(token, Some(format!("connect failed: {}", e)));
                    return;
                }
                Err(e) => {
                    self.close_connection(token, Some(format!("connect error: {}", e)));
                    return;
                }
            }
        }

        self.try_flush(token);
    }

    /// Write queued frames; completes each one as its last byte goes out.
    fn try_flush(&mut self, token: Token) {
        let conn = match self.connections.get_mut(&token) {
            Some(c) => c,
            None => return,
        };

        let mut error = None;
        while let Some(out) = conn.send_queue.front_mut() {
            let bytes = out.frame.direct_bytes();
            match conn.stream.write(&bytes[out.offset..]) {
                Ok(0) => {
                    error = Some("write returned 0".to_string());
                    break;
                }
                Ok(n) => {
                    out.offset += n;
                    if out.offset >= bytes.len() {
                        if let Some(mut done) = conn.send_queue.pop_front() {
                            if let Some(c) = done.completion.take() {
                                c.complete(SendStatus::Success, CompletionContext::Deferred);
                            }
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error = Some(format!("write error: {}", e));
                    break;
                }
            }
        }

        if let Some(reason) = error {
            self.close_connection(token, Some(reason));
        }
    }

    fn close_connection(&mut self, token: Token, reason: Option<String>) {
        if let Some(mut conn) = self.connections.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            self.conn_id_to_token.remove(&conn.conn_id);
            conn.fail_pending();
            log::debug!(
                "[reactor] conn {} to {} closed: {}",
                conn.conn_id,
                conn.remote_addr,
                reason.as_deref().unwrap_or("-")
            );
            self.notify_closed(conn.conn_id, reason);
        }
    }

    fn notify_closed(&self, conn_id: ConnId, reason: Option<String>) {
        if let Some(handler) = self.handler.upgrade() {
            handler.on_closed(conn_id, reason);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

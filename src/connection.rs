//! Per-connection state machine.
//!
//! A connection splits into two halves: the public [`Connection`] handle,
//! shared by callers and the retry tracker, and the reactor-owned
//! [`ConnDriver`](crate::reactor), which owns the socket and runs the
//! processing pipeline on readiness events and timer ticks.
//!
//! The pipeline order is fixed: incoming bytes, then heartbeat checks, then
//! outgoing bytes. A connection that starts closing mid-pipeline skips the
//! remaining stages.
//!
//! Closure is idempotent: however many times [`Connection::disconnect`] is
//! called, listeners observe exactly one `on_closed` notification.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use mio::net::TcpStream;
use minstant::Instant;
use rand::Rng;

use crate::call::Completion;
use crate::error::Error;
use crate::frame::{Frame, FrameAccumulator, HEARTBEAT};
use crate::policy::ClientPolicy;
use crate::reactor::ReactorHandle;
use crate::secure::SecureChannel;
use crate::trace::{debug, info, trace, warn};
use crate::tracker::RetryTransport;

/// Read buffer size for one socket pass.
const READ_CHUNK: usize = 16 * 1024;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Socket connect or TLS handshake in progress.
    Init = 0,
    /// Fully established and carrying traffic.
    Open = 1,
    /// Disconnect requested; awaiting reactor teardown.
    Closing = 2,
    /// Torn down.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Init,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Observer of connection-level events. Listener methods run on the reactor
/// thread and must hand heavy work off quickly.
pub trait ConnectionListener: Send + Sync {
    /// A complete frame arrived.
    fn on_frame(&self, connection: &Connection, frame: Frame);
    /// The connection closed. Fired exactly once per connection.
    fn on_closed(&self, client_id: &str, reason: &str);
}

enum OpenState {
    Pending,
    Open,
    Failed(String),
}

struct OutBuf {
    data: Vec<u8>,
    pos: usize,
}

fn now_millis() -> u64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    let anchor = ANCHOR.get_or_init(Instant::now);
    u64::try_from(anchor.elapsed().as_millis()).unwrap_or(u64::MAX)
}

pub(crate) struct ConnShared {
    hostname: String,
    port: u16,
    nonce: u32,
    state: AtomicU8,
    closed_once: AtomicBool,
    open: Mutex<OpenState>,
    open_cond: Condvar,
    outbox: Mutex<VecDeque<OutBuf>>,
    last_incoming: std::sync::atomic::AtomicU64,
    last_outgoing: std::sync::atomic::AtomicU64,
    half_warned: AtomicBool,
    policy: Mutex<ClientPolicy>,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    post_connect: Mutex<Option<Box<dyn FnOnce(&Connection) + Send>>>,
    close_done: Completion,
    reactor: ReactorHandle,
}

/// Shared handle to one outbound connection.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnShared>,
}

impl Connection {
    pub(crate) fn create(
        hostname: String,
        port: u16,
        policy: ClientPolicy,
        listeners: Vec<Arc<dyn ConnectionListener>>,
        post_connect: Option<Box<dyn FnOnce(&Connection) + Send>>,
        reactor: ReactorHandle,
    ) -> Self {
        let now = now_millis();
        let shared = ConnShared {
            hostname,
            port,
            nonce: rand::thread_rng().gen(),
            state: AtomicU8::new(ConnectionState::Init as u8),
            closed_once: AtomicBool::new(false),
            open: Mutex::new(OpenState::Pending),
            open_cond: Condvar::new(),
            outbox: Mutex::new(VecDeque::new()),
            last_incoming: std::sync::atomic::AtomicU64::new(now),
            last_outgoing: std::sync::atomic::AtomicU64::new(now),
            half_warned: AtomicBool::new(false),
            policy: Mutex::new(policy),
            listeners: Mutex::new(listeners),
            post_connect: Mutex::new(post_connect),
            close_done: Completion::new(),
            reactor,
        };
        Connection {
            inner: Arc::new(shared),
        }
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Stable identifier: `hostname:nonce`.
    #[must_use]
    pub fn client_id(&self) -> String {
        format!("{}:{:08x}", self.inner.hostname, self.inner.nonce)
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn set_policy(&self, policy: ClientPolicy) {
        *self.inner.policy.lock().unwrap_or_else(|e| e.into_inner()) = policy;
    }

    #[must_use]
    pub fn policy(&self) -> ClientPolicy {
        self.inner
            .policy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Queues raw bytes for the wire and wakes the reactor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] once the connection is closing.
    pub fn send(&self, data: Vec<u8>) -> Result<(), Error> {
        if self.inner.state.load(Ordering::Acquire) >= ConnectionState::Closing as u8 {
            return Err(Error::ConnectionClosed(self.client_id()));
        }
        self.inner
            .outbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(OutBuf { data, pos: 0 });
        self.inner.reactor.wake();
        Ok(())
    }

    /// Encodes and queues a frame.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::send`].
    pub fn send_frame(&self, frame: &Frame) -> Result<(), Error> {
        self.send(frame.encode())
    }

    /// Requests teardown. Idempotent: the first call wins, later calls are
    /// no-ops. Listeners get one `on_closed`, pending waiters are failed,
    /// and the reactor reaps the socket on its next cycle.
    pub fn disconnect(&self, reason: &str) {
        if self.inner.closed_once.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(client = %self.client_id(), reason, "disconnecting");
        self.inner
            .state
            .store(ConnectionState::Closing as u8, Ordering::Release);
        {
            let mut open = self.inner.open.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*open, OpenState::Pending) {
                *open = OpenState::Failed(reason.to_owned());
            }
        }
        self.inner.open_cond.notify_all();
        let client_id = self.client_id();
        let listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            listener.on_closed(&client_id, reason);
        }
        self.inner.reactor.wake();
    }

    /// Requests teardown and returns a latch that completes once the
    /// reactor has released the socket.
    pub fn close(&self) -> Completion {
        self.disconnect("closed by caller");
        self.inner.close_done.clone()
    }

    /// Blocks until the connection is established.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WaitTimeout`] if `timeout` elapses first, or
    /// [`Error::ConnectionClosed`] with the failure reason if the connect
    /// attempt failed.
    pub fn await_open(&self, timeout: Duration) -> Result<(), Error> {
        let open = self.inner.open.lock().unwrap_or_else(|e| e.into_inner());
        let (open, result) = self
            .inner
            .open_cond
            .wait_timeout_while(open, timeout, |open| matches!(*open, OpenState::Pending))
            .unwrap_or_else(|e| e.into_inner());
        match &*open {
            OpenState::Open => Ok(()),
            OpenState::Failed(reason) => Err(Error::ConnectionClosed(reason.clone())),
            OpenState::Pending if result.timed_out() => Err(Error::WaitTimeout),
            OpenState::Pending => Err(Error::WaitTimeout),
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) >= ConnectionState::Closing as u8
    }

    pub(crate) fn finish_close(&self) {
        self.inner
            .state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.inner.close_done.complete();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.client_id())
            .field("state", &self.state())
            .finish()
    }
}

impl RetryTransport for Connection {
    fn client_id(&self) -> String {
        Connection::client_id(self)
    }

    fn is_open(&self) -> bool {
        Connection::is_open(self)
    }

    fn resend(&self, wire: &[u8]) -> Result<(), Error> {
        self.send(wire.to_vec())
    }

    fn reset(&self, reason: &str) {
        self.disconnect(reason);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    TlsHandshake,
    Open,
}

/// Reactor-side half of a connection: owns the socket and the framing
/// state, and runs the processing pipeline.
pub(crate) struct ConnDriver {
    conn: Connection,
    sock: TcpStream,
    secure: Option<SecureChannel>,
    accumulator: FrameAccumulator,
    phase: Phase,
    read_buf: Box<[u8; READ_CHUNK]>,
}

impl ConnDriver {
    pub(crate) fn new(conn: Connection, sock: TcpStream, secure: Option<SecureChannel>) -> Self {
        ConnDriver {
            conn,
            sock,
            secure,
            accumulator: FrameAccumulator::new(),
            phase: Phase::Connecting,
            read_buf: Box::new([0u8; READ_CHUNK]),
        }
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn socket_mut(&mut self) -> &mut TcpStream {
        &mut self.sock
    }

    /// Whether the reactor should watch for writability.
    pub(crate) fn wants_write(&self) -> bool {
        match self.phase {
            Phase::Connecting => true,
            Phase::TlsHandshake => true,
            Phase::Open => {
                !self
                    .conn
                    .inner
                    .outbox
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .is_empty()
                    || self.secure.as_ref().is_some_and(SecureChannel::wants_write)
            }
        }
    }

    /// Runs one pass of the pipeline: connection setup, then incoming,
    /// heartbeat, and outgoing stages. Stages after a stage that started
    /// closure are skipped.
    ///
    /// # Errors
    ///
    /// Any error is terminal for this connection; the reactor disconnects
    /// it and other connections are unaffected.
    pub(crate) fn process(&mut self) -> Result<(), Error> {
        if self.conn.is_closing() {
            return Ok(());
        }
        if self.phase == Phase::Connecting {
            if !self.check_connected()? {
                return Ok(());
            }
        }
        if self.phase == Phase::TlsHandshake {
            let secure = self
                .secure
                .as_mut()
                .ok_or_else(|| Error::Connection("tls phase without tls state".into()))?;
            if !secure.drive_handshake(&mut self.sock)? {
                return Ok(());
            }
            secure.verify_peer_certificates()?;
            self.finish_open();
        }
        self.process_incoming()?;
        if self.conn.is_closing() {
            return Ok(());
        }
        self.check_heartbeat()?;
        self.process_outgoing()?;
        Ok(())
    }

    /// Resolves the pending non-blocking connect.
    ///
    /// Returns `true` once the TCP stage is done and the phase advanced.
    fn check_connected(&mut self) -> Result<bool, Error> {
        if let Some(err) = self.sock.take_error()? {
            return Err(Error::Transport(err));
        }
        match self.sock.peer_addr() {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        trace!(client = %self.conn.client_id(), "tcp connected");
        if self.secure.is_some() {
            self.phase = Phase::TlsHandshake;
        } else {
            self.finish_open();
        }
        Ok(true)
    }

    fn finish_open(&mut self) {
        self.phase = Phase::Open;
        let now = now_millis();
        self.conn.inner.last_incoming.store(now, Ordering::Release);
        self.conn.inner.last_outgoing.store(now, Ordering::Release);
        self.conn
            .inner
            .state
            .store(ConnectionState::Open as u8, Ordering::Release);
        {
            let mut open = self.conn.inner.open.lock().unwrap_or_else(|e| e.into_inner());
            *open = OpenState::Open;
        }
        self.conn.inner.open_cond.notify_all();
        info!(client = %self.conn.client_id(), "connection open");
        let hook = self
            .conn
            .inner
            .post_connect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(hook) = hook {
            hook(&self.conn);
        }
    }

    fn read_some(&mut self) -> io::Result<usize> {
        match &mut self.secure {
            Some(secure) => secure.read(&mut self.sock, &mut self.read_buf[..]),
            None => self.sock.read(&mut self.read_buf[..]),
        }
    }

    fn process_incoming(&mut self) -> Result<(), Error> {
        let mut got_bytes = false;
        loop {
            match self.read_some() {
                Ok(0) => {
                    return Err(Error::Transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed connection",
                    )))
                }
                Ok(n) => {
                    got_bytes = true;
                    self.accumulator.push(&self.read_buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if got_bytes {
            self.conn
                .inner
                .last_incoming
                .store(now_millis(), Ordering::Release);
            self.conn.inner.half_warned.store(false, Ordering::Release);
            self.dispatch_frames();
        }
        Ok(())
    }

    fn dispatch_frames(&mut self) {
        loop {
            match self.accumulator.next_frame() {
                Ok(Some(frame)) => {
                    trace!(client = %self.conn.client_id(), command = %frame.command, "frame in");
                    let listeners = self
                        .conn
                        .inner
                        .listeners
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .clone();
                    for listener in listeners {
                        listener.on_frame(&self.conn, frame.clone());
                    }
                }
                Ok(None) => break,
                // malformed frame: the consumed bytes are gone, resume at
                // the next boundary
                Err(e) => warn!(client = %self.conn.client_id(), error = %e, "bad frame"),
            }
        }
    }

    fn check_heartbeat(&mut self) -> Result<(), Error> {
        let policy = self.conn.policy();
        let now = now_millis();

        if policy.incoming_heartbeat_enabled() {
            let interval = u64::try_from(policy.incoming_heartbeat.as_millis()).unwrap_or(u64::MAX);
            let silence = now.saturating_sub(self.conn.inner.last_incoming.load(Ordering::Acquire));
            if silence > interval {
                return Err(Error::Connection(format!(
                    "heartbeat exceeded: {silence}ms of silence"
                )));
            }
            if silence > interval / 2
                && !self.conn.inner.half_warned.swap(true, Ordering::AcqRel)
            {
                warn!(
                    client = %self.conn.client_id(),
                    silence_ms = silence,
                    "half heartbeat interval exceeded"
                );
            }
        }

        if policy.outgoing_heartbeat_enabled() {
            let interval = u64::try_from(policy.outgoing_heartbeat.as_millis()).unwrap_or(u64::MAX);
            let idle = now.saturating_sub(self.conn.inner.last_outgoing.load(Ordering::Acquire));
            if idle >= interval {
                debug!(client = %self.conn.client_id(), "sending heartbeat");
                self.conn
                    .inner
                    .outbox
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push_back(OutBuf {
                        data: HEARTBEAT.to_vec(),
                        pos: 0,
                    });
            }
        }
        Ok(())
    }

    fn process_outgoing(&mut self) -> Result<(), Error> {
        loop {
            let Some(mut buf) = self
                .conn
                .inner
                .outbox
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
            else {
                break;
            };
            match self.write_buf(&mut buf) {
                Ok(true) => {
                    self.conn
                        .inner
                        .last_outgoing
                        .store(now_millis(), Ordering::Release);
                }
                Ok(false) => {
                    // socket full; keep the remainder at the front
                    self.conn
                        .inner
                        .outbox
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push_front(buf);
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(secure) = &mut self.secure {
            secure.flush(&mut self.sock)?;
        }
        Ok(())
    }

    /// Writes as much of `buf` as the socket accepts. Returns `true` when
    /// the buffer is fully written.
    fn write_buf(&mut self, buf: &mut OutBuf) -> io::Result<bool> {
        if let Some(secure) = &mut self.secure {
            // rustls buffers the plaintext; partial progress lives there
            secure.write(&mut self.sock, &buf.data[buf.pos..])?;
            buf.pos = buf.data.len();
            return Ok(true);
        }
        while buf.pos < buf.data.len() {
            match self.sock.write(&buf.data[buf.pos..]) {
                Ok(n) => buf.pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

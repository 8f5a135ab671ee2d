//! Non-blocking reactor event loop.
//!
//! One thread owns the poller and every socket. A cycle is: poll with a
//! bounded timeout, drain queued actions from other threads, dispatch
//! readiness to the affected connections, then tick every connection. The tick
//! runs heartbeat checks and outbox flushes for all connections, so timers
//! fire even on completely idle sockets.
//!
//! A failure while processing one connection disconnects that connection
//! only; the loop keeps serving the rest.

use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use rustls::ClientConfig;

use crate::connection::{ConnDriver, Connection, ConnectionListener};
use crate::error::Error;
use crate::policy::ClientPolicy;
use crate::secure::SecureChannel;
use crate::trace::{debug, error, info, trace, warn};

const WAKER_TOKEN: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const EVENT_CAPACITY: usize = 256;

type Action = Box<dyn FnOnce(&mut ReactorCore) + Send>;

/// Parameters for one outbound connection.
pub struct ConnectOptions {
    pub hostname: String,
    pub port: u16,
    pub policy: ClientPolicy,
    /// TLS client configuration; `None` connects in the clear.
    pub tls: Option<Arc<ClientConfig>>,
    /// Listeners attached before the connection can open, so no early
    /// frame or closure is missed.
    pub listeners: Vec<Arc<dyn ConnectionListener>>,
    /// Runs on the reactor thread the moment the connection opens,
    /// before any frame is processed.
    pub post_connect: Option<Box<dyn FnOnce(&Connection) + Send>>,
}

impl ConnectOptions {
    #[must_use]
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        ConnectOptions {
            hostname: hostname.into(),
            port,
            policy: ClientPolicy::default(),
            tls: None,
            listeners: Vec::new(),
            post_connect: None,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: ClientPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn ConnectionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    #[must_use]
    pub fn with_post_connect(
        mut self,
        hook: impl FnOnce(&Connection) + Send + 'static,
    ) -> Self {
        self.post_connect = Some(Box::new(hook));
        self
    }
}

struct Tracked {
    driver: ConnDriver,
    interest: Interest,
}

/// Reactor-thread state: the poller and every live connection.
struct ReactorCore {
    poll: Poll,
    drivers: HashMap<Token, Tracked>,
    next_token: usize,
}

impl ReactorCore {
    /// Opens the socket for `conn` and starts driving it.
    fn register(&mut self, conn: Connection, tls: Option<Arc<ClientConfig>>) {
        if let Err(e) = self.try_register(conn.clone(), tls) {
            warn!(client = %conn.client_id(), error = %e, "connect failed");
            conn.disconnect(&e.to_string());
            conn.finish_close();
        }
    }

    fn try_register(
        &mut self,
        conn: Connection,
        tls: Option<Arc<ClientConfig>>,
    ) -> Result<(), Error> {
        let addr = (conn.hostname(), conn.port())
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                Error::Connection(format!("no address for {}", conn.hostname()))
            })?;
        let mut sock = TcpStream::connect(addr)?;

        let token = Token(self.next_token);
        self.next_token += 1;
        let interest = Interest::READABLE | Interest::WRITABLE;
        self.poll.registry().register(&mut sock, token, interest)?;

        let secure = match tls {
            Some(config) => Some(SecureChannel::new(config, conn.hostname())?),
            None => None,
        };
        debug!(client = %conn.client_id(), %addr, "connecting");
        self.drivers.insert(
            token,
            Tracked {
                driver: ConnDriver::new(conn, sock, secure),
                interest,
            },
        );
        Ok(())
    }

    /// Readiness for one connection. Errors disconnect that connection only.
    fn handle_event(&mut self, token: Token) {
        let Some(tracked) = self.drivers.get_mut(&token) else {
            return;
        };
        if let Err(e) = tracked.driver.process() {
            let conn = tracked.driver.connection().clone();
            warn!(client = %conn.client_id(), error = %e, "connection failed");
            conn.disconnect(&e.to_string());
        }
    }

    /// One timer pass over every connection: run the pipeline (heartbeats
    /// and outbox included), reap closing connections, and reconcile poll
    /// interests with what each driver currently needs.
    fn tick(&mut self) {
        let tokens: Vec<Token> = self.drivers.keys().copied().collect();
        for token in tokens {
            let Some(tracked) = self.drivers.get_mut(&token) else {
                continue;
            };
            if tracked.driver.connection().is_closing() {
                self.reap(token);
                continue;
            }
            if let Err(e) = tracked.driver.process() {
                let conn = tracked.driver.connection().clone();
                warn!(client = %conn.client_id(), error = %e, "connection failed");
                conn.disconnect(&e.to_string());
                self.reap(token);
                continue;
            }
            let desired = if tracked.driver.wants_write() {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            if desired != tracked.interest {
                trace!(?token, "updating poll interest");
                if let Err(e) = self
                    .poll
                    .registry()
                    .reregister(tracked.driver.socket_mut(), token, desired)
                {
                    let conn = tracked.driver.connection().clone();
                    warn!(client = %conn.client_id(), error = %e, "reregister failed");
                    conn.disconnect(&e.to_string());
                    self.reap(token);
                    continue;
                }
                tracked.interest = desired;
            }
        }
    }

    /// Releases a closing connection's socket and completes its close latch.
    fn reap(&mut self, token: Token) {
        let Some(mut tracked) = self.drivers.remove(&token) else {
            return;
        };
        let _ = self
            .poll
            .registry()
            .deregister(tracked.driver.socket_mut());
        let conn = tracked.driver.connection().clone();
        drop(tracked);
        info!(client = %conn.client_id(), "connection reaped");
        conn.finish_close();
    }

    fn shutdown(&mut self) {
        let tokens: Vec<Token> = self.drivers.keys().copied().collect();
        for token in tokens {
            if let Some(tracked) = self.drivers.get(&token) {
                tracked.driver.connection().disconnect("reactor stopped");
            }
            self.reap(token);
        }
    }
}

/// Cloneable handle for submitting work to the reactor thread.
#[derive(Clone)]
pub struct ReactorHandle {
    actions: Sender<Action>,
    waker: Arc<Waker>,
    running: Arc<AtomicBool>,
}

impl ReactorHandle {
    /// Wakes the reactor out of its poll wait.
    pub fn wake(&self) {
        let _ = self.waker.wake();
    }

    fn submit(&self, action: Action) -> Result<(), Error> {
        if !self.running.load(Ordering::Acquire) || self.actions.send(action).is_err() {
            return Err(Error::ConnectionClosed("reactor stopped".into()));
        }
        self.wake();
        Ok(())
    }

    /// Starts an outbound connection. Returns immediately; use
    /// [`Connection::await_open`] to block until established.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the reactor has stopped.
    /// Connect failures surface through the returned connection.
    pub fn connect(&self, opts: ConnectOptions) -> Result<Connection, Error> {
        let ConnectOptions {
            hostname,
            port,
            policy,
            tls,
            listeners,
            post_connect,
        } = opts;
        let conn = Connection::create(hostname, port, policy, listeners, post_connect, self.clone());
        let for_reactor = conn.clone();
        self.submit(Box::new(move |core| core.register(for_reactor, tls)))?;
        Ok(conn)
    }
}

/// Owns the reactor thread.
pub struct Reactor {
    handle: ReactorHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    /// Creates the poller and spawns the reactor thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the poller cannot be created.
    pub fn new() -> Result<Self, Error> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (actions, receiver) = unbounded::<Action>();
        let running = Arc::new(AtomicBool::new(true));

        let handle = ReactorHandle {
            actions,
            waker,
            running: Arc::clone(&running),
        };
        let thread = std::thread::Builder::new()
            .name("tether-reactor".into())
            .spawn(move || run_loop(poll, receiver, running))
            .map_err(Error::Transport)?;
        Ok(Reactor {
            handle,
            thread: Mutex::new(Some(thread)),
        })
    }

    #[must_use]
    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// See [`ReactorHandle::connect`].
    ///
    /// # Errors
    ///
    /// Same as [`ReactorHandle::connect`].
    pub fn connect(&self, opts: ConnectOptions) -> Result<Connection, Error> {
        self.handle.connect(opts)
    }

    /// Stops the loop, closes every connection, and joins the thread.
    pub fn shutdown(&self) {
        self.handle.running.store(false, Ordering::Release);
        self.handle.wake();
        if let Some(thread) = self
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = thread.join();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(poll: Poll, receiver: Receiver<Action>, running: Arc<AtomicBool>) {
    let mut core = ReactorCore {
        poll,
        drivers: HashMap::new(),
        next_token: WAKER_TOKEN.0 + 1,
    };
    let mut events = Events::with_capacity(EVENT_CAPACITY);
    while running.load(Ordering::Acquire) {
        if let Err(e) = core.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "poll failed; stopping reactor");
            break;
        }
        while let Ok(action) = receiver.try_recv() {
            action(&mut core);
        }
        for event in &events {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            core.handle_event(event.token());
        }
        core.tick();
    }
    core.shutdown();
    info!("reactor stopped");
}

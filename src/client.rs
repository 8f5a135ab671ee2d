//! Client runtime and remote-procedure client.
//!
//! [`ClientRuntime`] owns the shared machinery: the reactor, the response
//! tracker, the worker pool, the event bus with its purge timer, and the
//! dispatch thread that turns inbound frames into settled calls and
//! published events. [`RpcClient`] binds one remote target to that
//! machinery and manages its session handshake.
//!
//! A session is established lazily on the first call and re-established
//! after a connection loss; a fresh connection is created per attempt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, unbounded, Sender};
use rustls::ClientConfig;
use serde_json::json;

use crate::call::{Call, Completion};
use crate::codec::{ErrorCode, Incoming, JsonCodec, PayloadCodec, Request, Response};
use crate::connection::{Connection, ConnectionListener};
use crate::error::Error;
use crate::events::{EventBus, EventSubscriber, Subscription};
use crate::frame::{headers, Command, Frame};
use crate::policy::ClientPolicy;
use crate::reactor::{ConnectOptions, Reactor, ReactorHandle};
use crate::trace::{debug, info, warn};
use crate::tracker::{ResponseTracker, RetryRecord, RetryTransport};
use crate::worker::WorkerPool;

/// Shared runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker threads for callbacks and subscriber delivery.
    pub workers: usize,
    /// How long undelivered events stay queued.
    pub event_retention: Duration,
    /// How often stale events are purged.
    pub purge_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            workers: 4,
            event_retention: Duration::from_secs(3600),
            purge_interval: Duration::from_secs(60),
        }
    }
}

/// Remote endpoint and queue naming for one client.
#[derive(Clone)]
pub struct ConnectTarget {
    pub hostname: String,
    pub port: u16,
    /// TLS client configuration; `None` connects in the clear.
    pub tls: Option<Arc<ClientConfig>>,
    /// Destination requests are sent to.
    pub request_queue: String,
    /// Destination the client subscribes to for responses and events.
    pub response_queue: String,
}

impl ConnectTarget {
    #[must_use]
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        ConnectTarget {
            hostname: hostname.into(),
            port,
            tls: None,
            request_queue: "queue.requests".into(),
            response_queue: "queue.responses".into(),
        }
    }

    #[must_use]
    pub fn with_tls(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    #[must_use]
    pub fn with_queues(
        mut self,
        request_queue: impl Into<String>,
        response_queue: impl Into<String>,
    ) -> Self {
        self.request_queue = request_queue.into();
        self.response_queue = response_queue.into();
        self
    }
}

pub(crate) enum Inbound {
    Message {
        hostname: String,
        body: Vec<u8>,
    },
    Closed {
        client_id: String,
        hostname: String,
        reason: String,
    },
    Shutdown,
}

/// Shared engine state: reactor, tracker, pool, event bus, dispatch.
pub struct ClientRuntime {
    reactor: Reactor,
    tracker: Arc<ResponseTracker>,
    bus: EventBus,
    codec: Arc<dyn PayloadCodec>,
    inbound: Sender<Inbound>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    purge_stop: Sender<()>,
    purge: Mutex<Option<JoinHandle<()>>>,
}

impl ClientRuntime {
    /// Starts the runtime threads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the reactor cannot be created.
    pub fn new(config: RuntimeConfig) -> Result<Self, Error> {
        let reactor = Reactor::new()?;
        let pool = Arc::new(WorkerPool::new(config.workers));
        let tracker = ResponseTracker::new(Arc::clone(&pool));
        let bus = EventBus::new(Arc::clone(&pool), config.event_retention);
        let codec: Arc<dyn PayloadCodec> = Arc::new(JsonCodec);

        let (inbound, inbound_rx) = unbounded::<Inbound>();
        let dispatch = {
            let tracker = Arc::clone(&tracker);
            let bus = bus.clone();
            let codec = Arc::clone(&codec);
            std::thread::Builder::new()
                .name("tether-dispatch".into())
                .spawn(move || {
                    while let Ok(inbound) = inbound_rx.recv() {
                        match inbound {
                            Inbound::Message { hostname, body } => {
                                dispatch_message(&tracker, &bus, codec.as_ref(), &hostname, &body);
                            }
                            Inbound::Closed {
                                client_id,
                                hostname,
                                reason,
                            } => {
                                tracker.fail_client(&client_id, &reason);
                                bus.publish(
                                    &format!("{hostname}|*|*|*"),
                                    json!({ "error": reason }),
                                );
                            }
                            Inbound::Shutdown => break,
                        }
                    }
                })
                .map_err(Error::Transport)?
        };

        let (purge_stop, purge_stop_rx) = bounded::<()>(0);
        let purge = {
            let bus = bus.clone();
            let ticker = tick(config.purge_interval);
            std::thread::Builder::new()
                .name("tether-event-purge".into())
                .spawn(move || loop {
                    select! {
                        recv(ticker) -> _ => bus.purge_now(),
                        recv(purge_stop_rx) -> _ => break,
                    }
                })
                .map_err(Error::Transport)?
        };

        Ok(ClientRuntime {
            reactor,
            tracker,
            bus,
            codec,
            inbound,
            dispatch: Mutex::new(Some(dispatch)),
            purge_stop,
            purge: Mutex::new(Some(purge)),
        })
    }

    /// Builds a client for `target` using `policy` for its connection and
    /// request retries.
    #[must_use]
    pub fn client(&self, target: ConnectTarget, policy: ClientPolicy) -> RpcClient {
        RpcClient {
            target,
            policy,
            reactor: self.reactor.handle(),
            tracker: Arc::clone(&self.tracker),
            codec: Arc::clone(&self.codec),
            inbound: self.inbound.clone(),
            session: Mutex::new(None),
            next_subscription: AtomicU64::new(0),
        }
    }

    /// Subscribes to server-pushed events. Patterns are `|`-delimited with
    /// `*` wildcards; delivery needs credit via [`Subscription::request`].
    pub fn subscribe(
        &self,
        pattern: impl Into<String>,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> Subscription {
        self.bus.subscribe(pattern, subscriber)
    }

    #[must_use]
    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<ResponseTracker> {
        &self.tracker
    }

    /// Stops every runtime thread. Outstanding calls are not failed; they
    /// time out under their own policies.
    pub fn shutdown(&self) {
        self.reactor.shutdown();
        self.tracker.shutdown();
        let _ = self.inbound.send(Inbound::Shutdown);
        if let Some(handle) = self
            .dispatch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = handle.join();
        }
        let _ = self.purge_stop.send(());
        if let Some(handle) = self.purge.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
        info!("runtime stopped");
    }
}

impl Drop for ClientRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_message(
    tracker: &ResponseTracker,
    bus: &EventBus,
    codec: &dyn PayloadCodec,
    hostname: &str,
    body: &[u8],
) {
    let incoming = match codec.decode(body) {
        Ok(incoming) => incoming,
        Err(e) => {
            warn!(hostname, error = %e, "undecodable payload");
            return;
        }
    };
    for entry in incoming {
        match entry {
            Incoming::Response(response) => {
                // A textual error code marks a transport-level issue
                // reported by the broker rather than a call result.
                if let Some(err) = &response.error {
                    if let ErrorCode::Text(code) = &err.code {
                        // the code carries the failing host, "hostname:hash"
                        let host = code
                            .split(':')
                            .next()
                            .filter(|h| !h.is_empty())
                            .unwrap_or(hostname);
                        let reason = format!("{code}: {}", err.message);
                        warn!(host, reason = %reason, "broker reported connection issue");
                        tracker.fail_host(host, &reason);
                        bus.publish(&format!("{host}|*|*|*"), json!({ "error": reason }));
                        continue;
                    }
                }
                let id = response.call_id();
                match tracker.remove_call(&id) {
                    Some(call) => tracker.deliver(&call, response),
                    None => debug!(id = %id, "response for unknown call"),
                }
            }
            Incoming::Notification(notification) => {
                let topic = if notification.method.starts_with('|') {
                    format!("{hostname}{}", notification.method)
                } else {
                    format!("{hostname}|{}", notification.method)
                };
                bus.publish(&topic, notification.params);
            }
        }
    }
}

#[derive(Clone)]
struct Session {
    connection: Connection,
    ready: Completion,
}

/// Remote-procedure client bound to one target.
pub struct RpcClient {
    target: ConnectTarget,
    policy: ClientPolicy,
    reactor: ReactorHandle,
    tracker: Arc<ResponseTracker>,
    codec: Arc<dyn PayloadCodec>,
    inbound: Sender<Inbound>,
    session: Mutex<Option<Session>>,
    next_subscription: AtomicU64,
}

impl RpcClient {
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.target.hostname
    }

    /// Sends `request` and returns a handle to the pending call.
    ///
    /// The call is registered before any byte reaches the wire, so a
    /// duplicate id fails without sending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRequest`] for an id already in flight, or
    /// a connection error if no session could be established.
    pub fn call(&self, request: &Request) -> Result<Call, Error> {
        self.call_internal(request, Call::new(request.call_id()), &self.policy)
    }

    /// Like [`RpcClient::call`], with a per-call retry policy overriding the
    /// client default.
    ///
    /// # Errors
    ///
    /// Same as [`RpcClient::call`].
    pub fn call_with_policy(
        &self,
        request: &Request,
        policy: &ClientPolicy,
    ) -> Result<Call, Error> {
        self.call_internal(request, Call::new(request.call_id()), policy)
    }

    /// Like [`RpcClient::call`], with a callback invoked on a worker thread
    /// when the response arrives.
    ///
    /// # Errors
    ///
    /// Same as [`RpcClient::call`].
    pub fn call_with_callback(
        &self,
        request: &Request,
        callback: impl FnOnce(Response) + Send + 'static,
    ) -> Result<Call, Error> {
        self.call_internal(
            request,
            Call::with_callback(request.call_id(), callback),
            &self.policy,
        )
    }

    /// Sends `request` and blocks for the response.
    ///
    /// # Errors
    ///
    /// As [`RpcClient::call`], plus [`Error::WaitTimeout`] if `timeout`
    /// elapses; the call is deregistered on timeout.
    pub fn call_sync(&self, request: &Request, timeout: Duration) -> Result<Response, Error> {
        let call = self.call(request)?;
        match call.wait(timeout) {
            Ok(response) => Ok(response),
            Err(e) => {
                self.tracker.remove_call(call.id());
                Err(e)
            }
        }
    }

    fn call_internal(
        &self,
        request: &Request,
        call: Call,
        policy: &ClientPolicy,
    ) -> Result<Call, Error> {
        let session = self.ensure_session()?;
        let id = request.call_id();
        let body = self.codec.encode_request(request)?;
        self.tracker.register_call(call.clone())?;

        let frame = Frame::new(Command::Send)
            .with_header(headers::DESTINATION, &self.target.request_queue)
            .with_header(headers::REPLY_TO, &self.target.response_queue)
            .with_header(headers::CONTENT_TYPE, "application/json")
            .with_body(body);
        let wire = frame.encode();

        let transport: Arc<dyn RetryTransport> = Arc::new(session.connection.clone());
        self.tracker.track(
            id.clone(),
            RetryRecord::new(
                wire.clone(),
                transport,
                policy.retry_timeout,
                policy.retry_attempts,
            )
            .with_reset(true),
        );

        if let Err(e) = session.connection.send(wire) {
            self.tracker.remove_call(&id);
            return Err(e);
        }
        Ok(call)
    }

    /// Returns the current session, establishing one if needed. Connect
    /// attempts are retried for error kinds the policy allows.
    fn ensure_session(&self) -> Result<Session, Error> {
        let mut guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = guard.as_ref() {
            if session.connection.is_open() && session.ready.is_complete() {
                return Ok(session.clone());
            }
        }

        let mut last_err = None;
        for attempt in 0..=self.policy.retry_attempts {
            match self.open_session() {
                Ok(session) => {
                    *guard = Some(session.clone());
                    return Ok(session);
                }
                Err(e) if self.policy.is_retryable(e.kind()) => {
                    warn!(
                        hostname = %self.target.hostname,
                        attempt,
                        error = %e,
                        "connect attempt failed"
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::ConnectionClosed("connect failed".into())))
    }

    /// One connect attempt: open the socket, run the session handshake, and
    /// wait for the subscription receipt.
    fn open_session(&self) -> Result<Session, Error> {
        let ready = Completion::new();
        let subscription_id = format!(
            "{}-{}",
            self.target.response_queue,
            self.next_subscription.fetch_add(1, Ordering::Relaxed)
        );
        let receipt_id = format!("rcpt-{subscription_id}");

        let listener = Arc::new(SessionListener {
            hostname: self.target.hostname.clone(),
            response_queue: self.target.response_queue.clone(),
            subscription_id,
            receipt_id,
            policy: self.policy.clone(),
            ready: ready.clone(),
            inbound: self.inbound.clone(),
        });

        let hostname = self.target.hostname.clone();
        let policy = self.policy.clone();
        let mut opts = ConnectOptions::new(&self.target.hostname, self.target.port)
            .with_policy(self.policy.clone())
            .with_listener(listener)
            .with_post_connect(move |conn| {
                let out = policy.outgoing_heartbeat.as_millis();
                let inc = policy.incoming_heartbeat.as_millis();
                let frame = Frame::new(Command::Connect)
                    .with_header(headers::ACCEPT_VERSION, "1.2")
                    .with_header(headers::HOST, &hostname)
                    .with_header(headers::HEART_BEAT, format!("{out},{inc}"));
                if let Err(e) = conn.send_frame(&frame) {
                    warn!(error = %e, "failed to send session open frame");
                }
            });
        if let Some(tls) = &self.target.tls {
            opts = opts.with_tls(Arc::clone(tls));
        }

        let connection = self.reactor.connect(opts)?;
        connection.await_open(self.policy.retry_timeout)?;
        if !ready.wait(self.policy.retry_timeout) {
            connection.disconnect("session handshake timed out");
            return Err(Error::ConnectionClosed(
                "session handshake timed out".into(),
            ));
        }
        Ok(Session { connection, ready })
    }
}

/// Drives the session handshake and forwards traffic to the dispatcher.
struct SessionListener {
    hostname: String,
    response_queue: String,
    subscription_id: String,
    receipt_id: String,
    policy: ClientPolicy,
    ready: Completion,
    inbound: Sender<Inbound>,
}

impl ConnectionListener for SessionListener {
    fn on_frame(&self, connection: &Connection, frame: Frame) {
        match frame.command {
            Command::Connected => {
                let negotiated = negotiate_heartbeats(
                    &self.policy,
                    frame.headers.get(headers::HEART_BEAT).unwrap_or("0,0"),
                );
                connection.set_policy(negotiated);
                let subscribe = Frame::new(Command::Subscribe)
                    .with_header(headers::ID, &self.subscription_id)
                    .with_header(headers::DESTINATION, &self.response_queue)
                    .with_header(headers::ACK, "auto")
                    .with_header(headers::RECEIPT, &self.receipt_id);
                if let Err(e) = connection.send_frame(&subscribe) {
                    warn!(error = %e, "failed to subscribe to response queue");
                }
            }
            Command::Receipt => {
                if frame.headers.get(headers::RECEIPT_ID) == Some(self.receipt_id.as_str()) {
                    debug!(hostname = %self.hostname, "session ready");
                    self.ready.complete();
                }
            }
            Command::Message => {
                let _ = self.inbound.send(Inbound::Message {
                    hostname: self.hostname.clone(),
                    body: frame.body,
                });
            }
            Command::Error => {
                warn!(
                    hostname = %self.hostname,
                    message = frame.headers.get("message").unwrap_or(""),
                    "broker error frame"
                );
            }
            other => debug!(hostname = %self.hostname, command = %other, "ignored frame"),
        }
    }

    fn on_closed(&self, client_id: &str, reason: &str) {
        let _ = self.inbound.send(Inbound::Closed {
            client_id: client_id.to_owned(),
            hostname: self.hostname.clone(),
            reason: reason.to_owned(),
        });
    }
}

/// Applies the peer's advertised `x,y` heartbeat capabilities to the local
/// policy. Either side advertising zero disables that direction; otherwise
/// the slower of the two intervals wins.
fn negotiate_heartbeats(policy: &ClientPolicy, server: &str) -> ClientPolicy {
    let (server_outgoing, server_incoming) = parse_heartbeat_header(server);
    let mut negotiated = policy.clone();
    negotiated.incoming_heartbeat =
        negotiate(policy.incoming_heartbeat, server_outgoing);
    negotiated.outgoing_heartbeat =
        negotiate(policy.outgoing_heartbeat, server_incoming);
    negotiated
}

fn parse_heartbeat_header(value: &str) -> (Duration, Duration) {
    let mut parts = value.split(',');
    let mut next = || {
        parts
            .next()
            .and_then(|p| p.trim().parse::<u64>().ok())
            .map_or(Duration::ZERO, Duration::from_millis)
    };
    let outgoing = next();
    let incoming = next();
    (outgoing, incoming)
}

fn negotiate(ours: Duration, theirs: Duration) -> Duration {
    if ours.is_zero() || theirs.is_zero() {
        Duration::ZERO
    } else {
        ours.max(theirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_takes_slower_interval() {
        let a = Duration::from_millis(5000);
        let b = Duration::from_millis(8000);
        assert_eq!(negotiate(a, b), b);
        assert_eq!(negotiate(b, a), b);
    }

    #[test]
    fn negotiate_zero_disables() {
        assert_eq!(negotiate(Duration::ZERO, Duration::from_secs(5)), Duration::ZERO);
        assert_eq!(negotiate(Duration::from_secs(5), Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn parse_heartbeat_header_values() {
        assert_eq!(
            parse_heartbeat_header("5000,8000"),
            (Duration::from_millis(5000), Duration::from_millis(8000))
        );
        assert_eq!(parse_heartbeat_header("garbage"), (Duration::ZERO, Duration::ZERO));
        assert_eq!(parse_heartbeat_header(""), (Duration::ZERO, Duration::ZERO));
    }

    #[test]
    fn heartbeat_negotiation_updates_policy() {
        let policy = ClientPolicy::default()
            .with_heartbeat(Duration::from_millis(4000), Duration::from_millis(2000));
        let negotiated = negotiate_heartbeats(&policy, "6000,1000");
        assert_eq!(negotiated.incoming_heartbeat, Duration::from_millis(6000));
        assert_eq!(negotiated.outgoing_heartbeat, Duration::from_millis(2000));
    }
}

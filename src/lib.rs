//! Transport engine for remote-procedure clients.
//!
//! `tether` multiplexes many outbound connections over a line-oriented text
//! wire protocol on a single-threaded reactor, correlates requests with
//! asynchronous responses, retries timed-out requests under a configurable
//! policy, and fans out server-pushed notifications to subscribers with
//! credit-based backpressure.

pub mod call;
pub mod client;
pub mod codec;
pub mod connection;
pub mod error;
pub mod events;
pub mod frame;
pub mod policy;
pub mod reactor;
pub mod secure;
pub mod trace;
pub mod tracker;
pub mod worker;

pub use call::{Call, Completion};
pub use client::{ClientRuntime, ConnectTarget, RpcClient, RuntimeConfig};
pub use codec::{
    CallId, ErrorCode, Incoming, JsonCodec, Notification, PayloadCodec, Request, Response,
    RpcError, INTERNAL_FAILURE_CODE,
};
pub use connection::{Connection, ConnectionListener, ConnectionState};
pub use error::{Error, ErrorKind};
pub use events::{EventBus, EventSubscriber, Subscription};
pub use frame::{Command, Frame, FrameAccumulator, Headers};
pub use policy::ClientPolicy;
pub use reactor::{ConnectOptions, Reactor, ReactorHandle};
pub use secure::SecureChannel;
pub use tracker::{ResponseTracker, RetryRecord, RetryTransport};
pub use worker::WorkerPool;

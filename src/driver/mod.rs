//! Pluggable wire drivers.
//!
//! A [`Driver`] turns endpoints into live [`Connection`]s, either by dialing
//! out or by accepting on a listener, and reports everything that happens on
//! those connections through [`DriverEvents`]. The transport core never
//! touches sockets itself.
//!
//! # Overview
//!
//! Drivers own their I/O threads. Connecting is asynchronous: the driver
//! reports the outcome of [`Driver::connect`] through
//! [`DriverEvents::connected`] or [`DriverEvents::connect_failed`], tagged
//! with the [`ConnectRequest`] the caller passed in. Every frame read is
//! decoded into a pooled message and handed to [`DriverEvents::received`].
//!
//! Drivers are picked by URL scheme through a [`DriverRegistry`] built at
//! startup.
//!
//! # See Also
//!
//! - [`tcp`]: framed TCP, one reader thread per connection.
//! - [`memory`]: in-process connections for tests and embedding.
pub mod memory;
pub mod tcp;

use std::{
    collections::HashMap,
    fmt, io,
    net::{SocketAddr, ToSocketAddrs},
    str::FromStr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, Sender},
    },
    thread::{self, JoinHandle, ThreadId},
    time::{Duration, Instant},
};

use log::warn;
use thiserror::Error;
use url::Url;

use crate::{
    message::{Message, MessagePool},
    protocol::FrameError,
    sync::lock,
};

pub use memory::{MemoryDriver, MemoryNetwork};
pub use tcp::TcpDriver;

pub type ConnectionId = u64;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique connection id.
pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid endpoint '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("cannot resolve {0}")]
    Unresolvable(String),
    #[error("connection refused by {0}")]
    Refused(String),
    #[error("connect to {0} timed out")]
    Timeout(String),
    #[error("connection closed")]
    Closed,
    #[error("{0} is already listening")]
    AddressInUse(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("driver I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Parsed `scheme://host:port` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    url: Url,
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn parse(s: &str) -> Result<Self, DriverError> {
        let invalid = |reason: &str| DriverError::InvalidUrl {
            url: s.to_string(),
            reason: reason.to_string(),
        };
        let url = Url::parse(s).map_err(|e| invalid(&e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| invalid("missing host"))?
            .to_string();
        let port = url.port().ok_or_else(|| invalid("missing port"))?;
        Ok(Self { url, host, port })
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    /// Same scheme and host on another port.
    pub fn with_port(&self, port: u16) -> Result<Self, DriverError> {
        Self::parse(&format!("{}://{}:{}", self.scheme(), self.host, port))
    }

    /// Resolves the host to a socket address. Pools are keyed by the result
    /// so aliases of one host share connections.
    pub fn resolve(&self) -> Result<SocketAddr, DriverError> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        (host, self.port)
            .to_socket_addrs()
            .map_err(|_| DriverError::Unresolvable(self.url().to_string()))?
            .next()
            .ok_or_else(|| DriverError::Unresolvable(self.url().to_string()))
    }
}

impl FromStr for Endpoint {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url())
    }
}

/// Correlates a [`Driver::connect`] call with its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectRequest(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Accepted on a listener.
    Inbound,
    /// Dialed by [`Driver::connect`].
    Outbound { request: ConnectRequest },
}

/// Callbacks a driver makes into the transport core.
pub trait DriverEvents: Send + Sync {
    fn connected(&self, conn: Arc<dyn Connection>, origin: Origin);
    fn connect_failed(&self, request: ConnectRequest, error: DriverError);
    fn disconnected(&self, conn: ConnectionId);
    fn received(&self, conn: ConnectionId, message: Message);
    fn transmitted(&self, conn: ConnectionId, message: Message);
    fn transmit_failed(&self, conn: ConnectionId, message: Message, error: DriverError);
}

/// What a driver needs from the core to run connections.
#[derive(Clone)]
pub struct DriverContext {
    pub events: Arc<dyn DriverEvents>,
    pub pool: Arc<MessagePool>,
    pub max_frame: usize,
}

/// A live session produced by a driver.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Dialed URL of an outbound connection, or the listener URL an inbound
    /// one arrived on.
    fn url(&self) -> &str;

    /// Queues `message` for transmission. Ownership passes to the driver,
    /// which later reports [`DriverEvents::transmitted`] or
    /// [`DriverEvents::transmit_failed`]. The message is handed back when it
    /// cannot even be queued.
    fn send(&self, message: Message) -> Result<(), (DriverError, Message)>;

    /// Closes the session. The driver reports [`DriverEvents::disconnected`]
    /// once its threads notice.
    fn close(&self);
}

pub trait Driver: Send + Sync {
    fn scheme(&self) -> &str;

    /// Starts accepting on `endpoint` and returns the endpoint actually
    /// bound (port 0 picks a free port).
    fn listen(&self, endpoint: &Endpoint, ctx: DriverContext) -> Result<Endpoint, DriverError>;

    /// Starts dialing `endpoint`; the outcome is reported through `ctx`.
    fn connect(
        &self,
        endpoint: &Endpoint,
        ctx: DriverContext,
        request: ConnectRequest,
        timeout: Duration,
    ) -> Result<(), DriverError>;

    /// Closes listeners and connections, waiting up to `drain` for I/O
    /// threads to exit.
    fn stop(&self, drain: Duration);
}

/// I/O threads owned by a driver instance. Every thread reports its exit,
/// so [`join`](Self::join) sleeps until one is done.
#[derive(Debug)]
pub(crate) struct DriverThreads {
    handles: Mutex<HashMap<ThreadId, JoinHandle<()>>>,
    exits: Mutex<Receiver<ThreadId>>,
    exited: Sender<ThreadId>,
}

impl Default for DriverThreads {
    fn default() -> Self {
        let (exited, exits) = mpsc::channel();
        Self {
            handles: Mutex::default(),
            exits: Mutex::new(exits),
            exited,
        }
    }
}

/// Reports the exit of the thread it lives on, panics included.
struct ExitNotice(Sender<ThreadId>);

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.0.send(thread::current().id());
    }
}

impl DriverThreads {
    pub fn spawn<F>(&self, name: String, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let notice = ExitNotice(self.exited.clone());
        let handle = thread::Builder::new().name(name).spawn(move || {
            let _notice = notice;
            f();
        })?;
        let mut handles = lock(&self.handles);
        handles.retain(|_, h| !h.is_finished());
        handles.insert(handle.thread().id(), handle);
        Ok(())
    }

    /// Joins every thread that exits before `drain` runs out. The calling
    /// thread is skipped when it is one of them.
    pub fn join(&self, drain: Duration) {
        let deadline = Instant::now() + drain;
        let mut pending: HashMap<_, _> = lock(&self.handles).drain().collect();
        pending.remove(&thread::current().id());

        let exits = lock(&self.exits);
        while !pending.is_empty() {
            let exit = exits
                .try_recv()
                .or_else(|_| exits.recv_timeout(deadline.saturating_duration_since(Instant::now())));
            let Ok(id) = exit else {
                break;
            };
            if let Some(handle) = pending.remove(&id) {
                let _ = handle.join();
            }
        }
        for handle in pending.values() {
            warn!("driver thread {:?} did not exit in time", handle.thread().name());
        }
    }
}

/// Scheme to driver lookup, fixed at startup.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the TCP driver installed.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TcpDriver::new()));
        registry
    }

    pub fn register(&mut self, driver: Arc<dyn Driver>) -> &mut Self {
        self.drivers.insert(driver.scheme().to_string(), driver);
        self
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(scheme).cloned()
    }

    pub fn drivers(&self) -> impl Iterator<Item = &Arc<dyn Driver>> {
        self.drivers.values()
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.drivers.keys()).finish()
    }
}

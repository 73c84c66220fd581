//! The transport core.
//!
//! # Overview
//!
//! A [`Transport`] owns the message pool, the drivers, the directory chain
//! and every registry in between. Sending a message walks them in order:
//!
//! 1. the target is looked up in the target registry, reusing the link that
//!    resolved it last time;
//! 2. otherwise the directory supplies candidate URLs, the connection pool
//!    hands out an open link or a driver dials a new one, and a name is
//!    resolved to an id over that link;
//! 3. a reply-expecting send registers a route id in the correlation table;
//! 4. the message goes to the link, and the driver later reports it as
//!    transmitted.
//!
//! Drivers call back into the core through an event sink holding a weak
//! reference, so dropping the last [`Transport`] handle shuts everything
//! down.
//!
//! # See Also
//!
//! - [`crate::routing`]: the registries walked above.
//! - [`crate::driver`]: the contract drivers implement.
mod events;
mod resolve;
#[cfg(test)]
mod tests;

use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, info, trace, warn};

use crate::{
    config::{DeliveryMode, TransportConfig},
    delivery::DeliveryQueue,
    directory::DirectoryChain,
    driver::{ConnectRequest, Driver, DriverContext, DriverError, DriverRegistry, Endpoint},
    error::TransportError,
    message::{Message, MessagePool, PoolError, PoolStats},
    operation::{
        Completion, ConnectSlot, Operation, OperationId, OperationKind, OperationPool,
        OperationStats, ReplyCallback, ReplySlot, TransmitCallback,
    },
    protocol::control::{
        self, BindClient, ControlCode, ProxyRegistration, UNKNOWN_TARGET, is_valid_target,
    },
    routing::{ConnectionPool, Link, RouteEntry, RouteTable, Target, TargetRecord, TargetRegistry},
    service::{Liveness, Registration, ReturnToken, Service, ServiceRegistry},
    sync::{SyncWait, Ticker, lock},
};

use events::EventSink;
use resolve::Resolver;

/// Per-send settings of [`Transport::send`].
#[derive(Default)]
pub struct SendOptions {
    ttl: Option<u8>,
    priority: u8,
    reply_timeout: Option<Duration>,
    on_transmit: Option<TransmitCallback>,
    on_reply: Option<ReplyCallback>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hop budget; the configured default when unset.
    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = Some(timeout);
        self
    }

    /// Called once the message left through a driver, or with the error that
    /// stopped it.
    pub fn on_transmit<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Result<(), TransportError>) + Send + 'static,
    {
        self.on_transmit = Some(Box::new(callback));
        self
    }

    /// Makes the send expect a reply, handed to `callback` along with every
    /// failure to get one.
    pub fn on_reply<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Result<Message, TransportError>) + Send + 'static,
    {
        self.on_reply = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for SendOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendOptions")
            .field("ttl", &self.ttl)
            .field("priority", &self.priority)
            .field("reply_timeout", &self.reply_timeout)
            .field("on_transmit", &self.on_transmit.is_some())
            .field("on_reply", &self.on_reply.is_some())
            .finish()
    }
}

/// Counters of every pool and registry, for monitoring and leak checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportStats {
    pub messages: PoolStats,
    pub operations: OperationStats,
    pub routes: usize,
    pub links: usize,
    pub targets: usize,
    /// Resolve requests sent so far.
    pub resolves: u64,
}

struct Sweep {
    ticker: Arc<Ticker>,
    handle: JoinHandle<()>,
}

pub(crate) struct Inner {
    config: TransportConfig,
    pool: Arc<MessagePool>,
    drivers: DriverRegistry,
    directory: DirectoryChain,
    targets: TargetRegistry,
    connections: ConnectionPool,
    routes: RouteTable,
    ops: OperationPool,
    services: ServiceRegistry,
    resolver: Resolver,
    listen_urls: Mutex<Vec<String>>,
    queue: Option<DeliveryQueue>,
    sweep: Mutex<Option<Sweep>>,
    shutting_down: AtomicBool,
    resolves: AtomicU64,
}

/// Handle to a running transport. Clones share the same core.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub fn new(
        config: TransportConfig,
        drivers: DriverRegistry,
        directory: DirectoryChain,
    ) -> Result<Self, TransportError> {
        config.validate()?;

        let queue = match config.delivery {
            DeliveryMode::Direct => None,
            DeliveryMode::Queued { capacity, workers } => {
                Some(DeliveryQueue::new(capacity, workers))
            }
        };
        let inner = Arc::new(Inner {
            pool: Arc::new(MessagePool::new()),
            drivers,
            directory,
            targets: TargetRegistry::new(),
            connections: ConnectionPool::new(config.pool.clone()),
            routes: RouteTable::new(config.max_routes),
            ops: OperationPool::new(),
            services: ServiceRegistry::new(),
            resolver: Resolver::new(),
            listen_urls: Mutex::default(),
            queue,
            sweep: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            resolves: AtomicU64::new(0),
            config,
        });

        if let Some(period) = inner.config.route_sweep {
            let ticker = Arc::new(Ticker::new());
            let weak = Arc::downgrade(&inner);
            let handle = {
                let ticker = Arc::clone(&ticker);
                thread::Builder::new()
                    .name("route-sweep".to_string())
                    .spawn(move || {
                        while ticker.tick(period) {
                            let Some(inner) = weak.upgrade() else {
                                break;
                            };
                            inner.sweep_routes(Instant::now());
                        }
                    })
                    .map_err(DriverError::from)?
            };
            *lock(&inner.sweep) = Some(Sweep { ticker, handle });
        }

        debug!("transport started with {:?}", inner.drivers);
        Ok(Self { inner })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Starts accepting connections on `url` and returns the URL actually
    /// bound.
    pub fn listen(&self, url: &str) -> Result<String, TransportError> {
        self.inner.check_running()?;
        self.inner.listen(url)
    }

    /// URLs this transport accepts connections on.
    pub fn listen_urls(&self) -> Vec<String> {
        lock(&self.inner.listen_urls).clone()
    }

    /// Registers a local service and returns its id.
    pub fn register(&self, mut registration: Registration) -> Result<i32, TransportError> {
        let inner = &self.inner;
        inner.check_running()?;

        let (id, name) = match &registration.target {
            Target::Id(id) if !is_valid_target(*id) => {
                return Err(TransportError::InvalidTarget(*id));
            }
            Target::Id(id) => (*id, None),
            Target::Name(name) => (inner.services.allocate_id(), Some(name.clone())),
        };
        if let Some(urls) = registration.urls.take() {
            let bound = urls
                .iter()
                .map(|url| inner.ensure_listening(url))
                .collect::<Result<Vec<_>, _>>()?;
            registration.urls = Some(bound);
        }

        let service = Service::new(id, name, registration, inner.config.chirp_interval);
        let service = inner.services.insert(service)?;
        let weak = Arc::downgrade(inner);
        let started = inner.services.start_chirp(&service, move |service| {
            weak.upgrade()
                .is_some_and(|inner| inner.broadcast_chirp(service))
        });
        if let Err(e) = started {
            inner.services.remove(id);
            return Err(e);
        }
        Ok(id)
    }

    pub fn unregister(&self, id: i32) -> Result<(), TransportError> {
        self.inner
            .services
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| TransportError::UnknownService(id.to_string()))
    }

    /// Takes a message buffer with a zeroed body of `len` bytes from the pool.
    pub fn allocate(&self, len: usize) -> Message {
        self.inner.pool.allocate(len)
    }

    pub fn free(&self, message: Message) -> Result<(), PoolError> {
        self.inner.pool.free(message)
    }

    /// Sends `message` to `target`. Returns once the message is handed to a
    /// driver; outcomes after that reach the callbacks in `options`. The
    /// message is consumed on every path.
    pub fn send(
        &self,
        target: impl Into<Target>,
        message: Message,
        options: SendOptions,
    ) -> Result<(), TransportError> {
        let target = target.into();
        let inner = &self.inner;
        let message = inner.checked(&target, message)?;

        let timeout = options.reply_timeout.unwrap_or(inner.config.reply_timeout);
        let completion = Completion::Callbacks {
            on_transmit: options.on_transmit,
            on_reply: options.on_reply,
        };
        let id = inner
            .ops
            .start(OperationKind::Send, completion, &target.key());
        inner.dispatch(
            id,
            &target,
            message,
            Stamp {
                ttl: options.ttl,
                priority: options.priority,
                timeout,
            },
        )
    }

    /// Sends `message` and blocks for the reply, up to `timeout` or the
    /// configured reply timeout.
    pub fn send_and_wait(
        &self,
        target: impl Into<Target>,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<Message, TransportError> {
        let target = target.into();
        let inner = &self.inner;
        let message = inner.checked(&target, message)?;

        let timeout = timeout.unwrap_or(inner.config.reply_timeout);
        let slot: ReplySlot = Arc::new(SyncWait::new());
        let id = inner.ops.start(
            OperationKind::SendAndWait,
            Completion::Reply(Arc::clone(&slot)),
            &target.key(),
        );
        let stamp = Stamp {
            ttl: None,
            priority: 0,
            timeout,
        };
        inner.dispatch(id, &target, message, stamp)?;

        match slot.wait_until(Instant::now() + timeout) {
            Some(outcome) => outcome,
            None => {
                if let Some(op) = inner.ops.take(id) {
                    debug!("{id} to {target} timed out after {timeout:?}");
                    inner.retire(op);
                }
                Err(TransportError::Timeout)
            }
        }
    }

    /// Answers a received message along the path it came in on.
    pub fn send_via_return(
        &self,
        mut message: Message,
        token: &ReturnToken,
    ) -> Result<(), TransportError> {
        let inner = &self.inner;
        let refused = if token.route == 0 {
            Some(TransportError::MissingRoute)
        } else if message.is_empty() {
            Some(TransportError::EmptyMessage)
        } else {
            inner.check_running().err()
        };
        if let Some(err) = refused {
            inner.release(message);
            return Err(err);
        }

        message.set_target(ControlCode::RouteReturn.code());
        message.set_route(token.route);
        message.set_token(token.token);
        message.set_ttl(inner.config.default_ttl);
        token.link.send(message).map_err(|(e, message)| {
            inner.release(message);
            TransportError::SendFailed(e.to_string())
        })
    }

    /// Makes the connection `token` arrived on the owner of `name`: sends to
    /// `name` go back over it, and it is never closed for being idle.
    pub fn bind_client(&self, token: &ReturnToken, name: &str) -> Result<(), TransportError> {
        let inner = &self.inner;
        inner.check_running()?;

        let link = &token.link;
        inner.targets.bind(name, link.id());
        link.pin();
        let frame = control::control_message(
            &inner.pool,
            ControlCode::BindClient,
            &BindClient {
                name: name.to_string(),
            },
        )?;
        info!("bound client '{name}' to connection {}", link.id());
        inner.send_control(link, frame, name)
    }

    /// Connects to `url` and asks the peer to chirp its services to us.
    pub fn announce_proxy(&self, url: &str) -> Result<(), TransportError> {
        let inner = &self.inner;
        inner.check_running()?;

        let link = inner.link_to(url)?;
        link.pin();
        let frame = control::control_message(
            &inner.pool,
            ControlCode::ProxyRegistration,
            &ProxyRegistration { name: None },
        );
        let sent = frame
            .map_err(TransportError::from)
            .and_then(|frame| inner.send_control(&link, frame, url));
        inner.release_link(&link);
        sent
    }

    /// Makes `alias` another name of `name`.
    pub fn alias(&self, alias: &str, name: &str) {
        self.inner.targets.alias(alias, name);
    }

    /// Drops what is known about `name`, so the next send looks it up anew.
    pub fn forget_target(&self, name: &str) -> bool {
        let inner = &self.inner;
        let canonical = inner.targets.canonical(&Target::from(name));
        inner.directory.evict(&inner.config.qualifier, &canonical);
        inner.targets.forget(name)
    }

    /// Only uses locations of `name` published for `host`.
    pub fn restrict_target(&self, name: &str, host: Option<&str>) {
        let inner = &self.inner;
        let canonical = inner.targets.canonical(&Target::from(name));
        inner.directory.evict(&inner.config.qualifier, &canonical);
        inner.targets.restrict(name, host);
    }

    /// Runs queued deliveries on the calling thread until shutdown. Returns
    /// at once when deliveries are not queued.
    pub fn serve_deliveries(&self) {
        match &self.inner.queue {
            Some(queue) => queue.serve(),
            None => debug!("deliveries run on driver threads, nothing to serve"),
        }
    }

    /// Last chirp received for a peer's service.
    pub fn liveness(&self, service: i32) -> Option<Liveness> {
        self.inner.services.liveness(service)
    }

    pub fn stats(&self) -> TransportStats {
        let inner = &self.inner;
        TransportStats {
            messages: inner.pool.stats(),
            operations: inner.ops.stats(),
            routes: inner.routes.len(),
            links: inner.connections.len(),
            targets: inner.targets.len(),
            resolves: inner.resolves.load(Ordering::SeqCst),
        }
    }

    /// Stops chirps, fails every pending operation with
    /// [`TransportError::Shutdown`], closes every link and stops the drivers.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("drivers", &self.inner.drivers)
            .field("directory", &self.inner.directory)
            .field("listen_urls", &self.listen_urls())
            .finish()
    }
}

/// Header fields a send stamps on its message.
#[derive(Debug, Clone, Copy)]
struct Stamp {
    ttl: Option<u8>,
    priority: u8,
    timeout: Duration,
}

impl Inner {
    fn context(self: &Arc<Self>) -> DriverContext {
        DriverContext {
            events: Arc::new(EventSink::new(self)),
            pool: Arc::clone(&self.pool),
            max_frame: self.config.max_message_size,
        }
    }

    fn check_running(&self) -> Result<(), TransportError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(TransportError::Shutdown);
        }
        Ok(())
    }

    /// Validates a send, freeing the message when it is refused.
    fn checked(&self, target: &Target, message: Message) -> Result<Message, TransportError> {
        let refused = if self.shutting_down.load(Ordering::SeqCst) {
            Some(TransportError::Shutdown)
        } else if message.is_empty() {
            Some(TransportError::EmptyMessage)
        } else {
            match target {
                Target::Id(id) if !is_valid_target(*id) => {
                    Some(TransportError::InvalidTarget(*id))
                }
                _ => None,
            }
        };
        match refused {
            Some(err) => {
                self.release(message);
                Err(err)
            }
            None => Ok(message),
        }
    }

    /// Returns a buffer to the pool.
    fn release(&self, message: Message) {
        if let Err(e) = self.pool.free(message) {
            debug!("message not returned to the pool: {e}");
        }
    }

    fn listen(self: &Arc<Self>, url: &str) -> Result<String, TransportError> {
        let endpoint = Endpoint::parse(url)?;
        let driver = self.driver(&endpoint)?;

        let id = self
            .ops
            .start(OperationKind::Listen, Completion::Idle, endpoint.url());
        let bound = driver.listen(&endpoint, self.context());
        if let Some(op) = self.ops.take(id) {
            self.ops.recycle(op);
        }

        let bound = bound?.url().to_string();
        info!("listening on {bound}");
        lock(&self.listen_urls).push(bound.clone());
        Ok(bound)
    }

    fn ensure_listening(self: &Arc<Self>, url: &str) -> Result<String, TransportError> {
        let endpoint = Endpoint::parse(url)?;
        if lock(&self.listen_urls).iter().any(|u| u == endpoint.url()) {
            return Ok(endpoint.url().to_string());
        }
        self.listen(url)
    }

    fn driver(&self, endpoint: &Endpoint) -> Result<Arc<dyn Driver>, TransportError> {
        self.drivers
            .get(endpoint.scheme())
            .ok_or_else(|| TransportError::UnknownScheme(endpoint.scheme().to_string()))
    }

    /// Routes, stamps and transmits the message of operation `id`. Failures
    /// go through [`Inner::fail_operation`] and are also returned.
    fn dispatch(
        self: &Arc<Self>,
        id: OperationId,
        target: &Target,
        mut message: Message,
        stamp: Stamp,
    ) -> Result<(), TransportError> {
        let (link, remote) = match self.link_for(target) {
            Ok(found) => found,
            Err(e) => {
                self.release(message);
                self.fail_operation(id, e.clone());
                return Err(e);
            }
        };
        let expects_reply = self.ops.with(id, |op| {
            op.link = Some(link.id());
            op.expects_reply()
        });
        let Some(expects_reply) = expects_reply else {
            // Drained by a concurrent shutdown.
            self.release(message);
            self.release_link(&link);
            return Err(TransportError::Shutdown);
        };

        message.set_target(remote);
        message.set_ttl(stamp.ttl.unwrap_or(self.config.default_ttl));
        message.set_priority(stamp.priority);
        message.set_route(0);
        message.operation = Some(id);

        if expects_reply {
            let deadline = Instant::now() + stamp.timeout;
            let entry = RouteEntry {
                operation: id,
                link: link.id(),
                deadline,
            };
            match self.routes.register(entry) {
                Ok(route) => {
                    message.set_route(route);
                    let seconds = u32::try_from(stamp.timeout.as_secs()).unwrap_or(u32::MAX);
                    message.set_timeout(seconds);
                    self.ops.with(id, |op| {
                        op.route = route;
                        op.deadline = Some(deadline);
                    });
                    trace!("{id} waits on route {route}");
                }
                Err(e) => {
                    self.release(message);
                    self.fail_operation(id, e.clone());
                    return Err(e);
                }
            }
        }

        link.send(message).map_err(|(e, message)| {
            self.release(message);
            let err = match self.check_running() {
                Ok(()) => TransportError::SendFailed(e.to_string()),
                Err(stopped) => stopped,
            };
            self.fail_operation(id, err.clone());
            err
        })
    }

    /// Finds a link to `target` holding one use of it, and the id the remote
    /// side knows the target by.
    fn link_for(self: &Arc<Self>, target: &Target) -> Result<(Arc<Link>, i32), TransportError> {
        let record = self.targets.ensure(target);

        if let Some(link_id) = record.link {
            match self.connections.get(link_id).filter(|l| !l.is_closed()) {
                Some(link) => {
                    link.acquire();
                    return match record.id {
                        Some(id) => Ok((link, id)),
                        None => self.resolve_over(&record.name, link),
                    };
                }
                None => self.targets.detach(&record.target),
            }
        }

        let link = self.connect_target(&record)?;
        match record.id {
            Some(id) => {
                self.targets.linked(&record.target, link.id());
                Ok((link, id))
            }
            None => self.resolve_over(&record.name, link),
        }
    }

    /// Tries every location the directory knows for `record`, in order.
    fn connect_target(self: &Arc<Self>, record: &TargetRecord) -> Result<Arc<Link>, TransportError> {
        let urls = self
            .directory
            .lookup(&self.config.qualifier, &record.name, record.host.as_deref())
            .map_err(|e| {
                debug!("no location for '{}': {e}", record.name);
                TransportError::TargetUnresolved(record.name.clone())
            })?;

        let mut last = None;
        for url in &urls {
            match self.link_to(url) {
                Ok(link) => return Ok(link),
                Err(e) => {
                    debug!("cannot reach '{}' at {url}: {e}", record.name);
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| TransportError::TargetUnresolved(record.name.clone())))
    }

    /// Hands out a pooled link to `url`, dialing one when the pool policy
    /// asks for it.
    fn link_to(self: &Arc<Self>, url: &str) -> Result<Arc<Link>, TransportError> {
        let endpoint = Endpoint::parse(url)?;
        let driver = self.driver(&endpoint)?;
        let addr = endpoint.resolve()?;

        let setup = self.connections.setup_lock(addr);
        let _setup = lock(&setup);
        if let Some(link) = self.connections.checkout(addr) {
            return Ok(link);
        }
        self.check_running()?;

        let slot: ConnectSlot = Arc::new(SyncWait::new());
        let id = self.ops.start(
            OperationKind::Connect,
            Completion::Connect(Arc::clone(&slot)),
            endpoint.url(),
        );
        self.ops.with(id, |op| op.address = Some(addr));
        debug!("{id} dialing {endpoint}");

        let timeout = self.config.connect_timeout;
        if let Err(e) = driver.connect(&endpoint, self.context(), ConnectRequest(id.0), timeout) {
            let err = TransportError::ConnectFailed {
                url: endpoint.url().to_string(),
                reason: e.to_string(),
            };
            self.fail_operation(id, err.clone());
            return Err(err);
        }

        match slot.wait_until(Instant::now() + timeout) {
            Some(outcome) => outcome,
            None => {
                let err = TransportError::ConnectTimeout(endpoint.url().to_string());
                self.fail_operation(id, err.clone());
                Err(err)
            }
        }
    }

    /// Resolves `name` over `link`, keeping the link's use on success.
    fn resolve_over(&self, name: &str, link: Arc<Link>) -> Result<(Arc<Link>, i32), TransportError> {
        match self.resolve(name, &link) {
            Ok(id) => {
                debug!("resolved '{name}' to {id} over connection {}", link.id());
                self.targets.resolved(name, id, link.id());
                Ok((link, id))
            }
            Err(e) => {
                self.release_link(&link);
                self.directory.evict(&self.config.qualifier, name);
                Err(e)
            }
        }
    }

    fn resolve(&self, name: &str, link: &Link) -> Result<i32, TransportError> {
        let unresolved = || TransportError::TargetUnresolved(name.to_string());

        let (slot, leader) = self.resolver.join(name);
        if leader {
            if let Some(id) = self.targets.lookup(name).and_then(|r| r.id) {
                self.resolver.answer(name, Ok(id));
                return Ok(id);
            }
            self.resolves.fetch_add(1, Ordering::SeqCst);
            let request = control::resolve_request(&self.pool, name);
            if let Err((e, request)) = link.send(request) {
                self.release(request);
                debug!("resolve request for '{name}' not sent: {e}");
                self.resolver.answer(name, Err(unresolved()));
                return Err(unresolved());
            }
        }

        match slot.wait_shared(Instant::now() + self.config.resolve_timeout) {
            Some(Ok(id)) if id != UNKNOWN_TARGET && is_valid_target(id) => Ok(id),
            Some(Ok(_)) => Err(unresolved()),
            Some(Err(e)) => Err(e),
            None => {
                self.resolver.abandon(name, &slot);
                Err(unresolved())
            }
        }
    }

    /// Sends a control frame that expects no answer.
    fn send_control(&self, link: &Link, mut frame: Message, target: &str) -> Result<(), TransportError> {
        let id = self.ops.start(OperationKind::Client, Completion::Idle, target);
        frame.operation = Some(id);
        link.send(frame).map_err(|(e, frame)| {
            self.release(frame);
            let err = TransportError::SendFailed(e.to_string());
            self.fail_operation(id, err.clone());
            err
        })
    }

    /// Sends a chirp of `service` to every proxy reached through one of its
    /// URLs. Returns `false` once the transport is shutting down.
    fn broadcast_chirp(&self, service: &Service) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        let urls = match &service.urls {
            Some(urls) => urls.clone(),
            None => lock(&self.listen_urls).clone(),
        };
        let frame = match control::control_message(&self.pool, ControlCode::Chirp, &service.chirp()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("cannot build chirp of service {}: {e}", service.id);
                return true;
            }
        };

        for link in self.connections.proxies() {
            if !urls.iter().any(|u| u == link.url()) {
                continue;
            }
            trace!("service {} chirps to connection {}", service.id, link.id());
            if let Err((e, copy)) = link.send(self.pool.duplicate(&frame)) {
                debug!("chirp to connection {} failed: {e}", link.id());
                self.release(copy);
            }
        }
        self.release(frame);
        true
    }

    /// Drops one use of `link`, closing it when the pool reclaims it.
    fn release_link(&self, link: &Arc<Link>) {
        if let Some(idle) = self.connections.release(link) {
            debug!("closing idle connection {}", idle.id());
            idle.close();
        }
    }

    /// The single failure path of an operation that is still live.
    fn fail_operation(&self, id: OperationId, err: TransportError) {
        if let Some(mut op) = self.ops.take(id) {
            debug!("{id} ({:?}) to '{}' failed: {err}", op.kind, op.target);
            op.fail(err);
            self.retire(op);
        }
    }

    /// Releases what a finished operation holds and recycles it.
    fn retire(&self, op: Operation) {
        if op.route != 0 {
            self.routes.take_if(op.route, op.id);
        }
        if let Some(link) = op.link.and_then(|l| self.connections.get(l)) {
            self.release_link(&link);
        }
        trace!("{} ({:?}) retired", op.id, op.kind);
        self.ops.recycle(op);
    }

    fn sweep_routes(&self, now: Instant) {
        for (route, entry) in self.routes.expired(now) {
            if let Some(mut op) = self.ops.take(entry.operation) {
                debug!("route {route} of {} expired", op.id);
                op.route = 0;
                op.fail(TransportError::Timeout);
                self.retire(op);
            }
        }
    }

    fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down transport");

        self.services.clear();
        if let Some(sweep) = lock(&self.sweep).take() {
            sweep.ticker.stop();
            if sweep.handle.thread().id() != thread::current().id() {
                let _ = sweep.handle.join();
            }
        }

        self.routes.drain();
        for mut op in self.ops.drain() {
            op.fail(TransportError::Shutdown);
            self.ops.recycle(op);
        }
        self.resolver.fail_all(TransportError::Shutdown);

        for link in self.connections.drain() {
            link.close();
        }
        for driver in self.drivers.drivers() {
            driver.stop(self.config.drain_timeout);
        }
        self.directory.shutdown();
        if let Some(queue) = &self.queue {
            queue.close();
        }
        info!("transport stopped");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

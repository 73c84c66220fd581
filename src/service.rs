//! Locally registered services and the liveness they announce.
//!
//! # Overview
//!
//! A service is a receiver registered under a numeric id, optionally with a
//! name peers can resolve. Services that receive messages may chirp: a
//! background thread periodically sends a [`Chirp`] to every proxy link
//! reaching one of the service's URLs, and any proxy registration kicks an
//! immediate round so peers do not wait a full interval.
//!
//! Chirps arriving from peers land in a liveness table, queried through
//! [`Transport::liveness`](crate::Transport::liveness).
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicI32, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use log::{debug, info, warn};

use crate::{
    driver::ConnectionId,
    error::TransportError,
    message::Message,
    protocol::control::Chirp,
    routing::{Link, Target},
    sync::{Ticker, lock},
};

/// First id handed to services registered by name only.
const FIRST_AUTO_ID: i32 = 0x0001_0000;

pub type ReceiveHandler = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Path a received message came in on, for answering it.
#[derive(Clone)]
pub struct ReturnToken {
    pub(crate) link: Arc<Link>,
    pub(crate) token: u64,
    pub(crate) route: u32,
}

impl ReturnToken {
    /// Route the sender waits on; 0 when it expects no reply.
    pub fn route(&self) -> u32 {
        self.route
    }

    pub fn connection(&self) -> ConnectionId {
        self.link.id()
    }

    pub fn url(&self) -> &str {
        self.link.url()
    }
}

impl fmt::Debug for ReturnToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReturnToken")
            .field("link", &self.link.id())
            .field("token", &self.token)
            .field("route", &self.route)
            .finish()
    }
}

/// A message handed to a service. The handler owns `message` and must
/// free it or send it back through `reply`.
#[derive(Debug)]
pub struct Delivery {
    pub service: i32,
    pub message: Message,
    pub reply: ReturnToken,
}

/// Arguments of [`Transport::register`](crate::Transport::register).
pub struct Registration {
    pub(crate) target: Target,
    pub(crate) receiver: Option<ReceiveHandler>,
    pub(crate) urls: Option<Vec<String>>,
    pub(crate) replica_group: Option<u32>,
    pub(crate) chirp: Option<Option<Duration>>,
}

impl Registration {
    pub fn new(target: impl Into<Target>) -> Self {
        Self {
            target: target.into(),
            receiver: None,
            urls: None,
            replica_group: None,
            chirp: None,
        }
    }

    pub fn on_receive<F>(mut self, handler: F) -> Self
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        self.receiver = Some(Arc::new(handler));
        self
    }

    /// Listens on `urls` and chirps only to proxies reached through them.
    pub fn listen_on<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.urls = Some(urls.into_iter().map(Into::into).collect());
        self
    }

    /// Marks the service as one replica of a group. Replicas chirp a zero
    /// clock so peers cannot tell them apart.
    pub fn replica_group(mut self, group: u32) -> Self {
        self.replica_group = Some(group);
        self
    }

    /// Overrides the transport's chirp interval; `None` disables chirps.
    pub fn chirp_every(mut self, interval: Option<Duration>) -> Self {
        self.chirp = Some(interval);
        self
    }
}

struct ChirpTask {
    ticker: Arc<Ticker>,
    handle: JoinHandle<()>,
}

pub(crate) struct Service {
    pub id: i32,
    pub name: Option<String>,
    pub created: u64,
    pub interval: Option<Duration>,
    pub receiver: Option<ReceiveHandler>,
    pub urls: Option<Vec<String>>,
    pub replica_group: Option<u32>,
    task: Mutex<Option<ChirpTask>>,
}

impl Service {
    pub fn new(
        id: i32,
        name: Option<String>,
        registration: Registration,
        default: Option<Duration>,
    ) -> Self {
        Self {
            id,
            name,
            created: unix_now(),
            interval: registration.chirp.unwrap_or(default),
            receiver: registration.receiver,
            urls: registration.urls,
            replica_group: registration.replica_group,
            task: Mutex::new(None),
        }
    }

    pub fn chirp(&self) -> Chirp {
        Chirp {
            service: self.id,
            created: self.created,
            now: if self.replica_group.is_some() {
                0
            } else {
                unix_now()
            },
            flags: 0,
            name: self.name.clone(),
        }
    }

    fn kick(&self) {
        if let Some(task) = lock(&self.task).as_ref() {
            task.ticker.kick();
        }
    }

    fn stop_chirp(&self) {
        let Some(task) = lock(&self.task).take() else {
            return;
        };
        task.ticker.stop();
        if task.handle.thread().id() != thread::current().id() {
            let _ = task.handle.join();
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("urls", &self.urls)
            .finish()
    }
}

/// What a peer last told us about one of its services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Liveness {
    pub service: i32,
    pub name: Option<String>,
    /// Remote registration time, seconds since the epoch.
    pub created: u64,
    /// Remote clock at the chirp, 0 for replicas.
    pub reported: u64,
    pub seen: Instant,
    /// Link the chirp arrived on.
    pub via: String,
}

#[derive(Debug)]
pub(crate) struct ServiceRegistry {
    services: Mutex<HashMap<i32, Arc<Service>>>,
    next_auto: AtomicI32,
    peers: Mutex<HashMap<i32, Liveness>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: Mutex::default(),
            next_auto: AtomicI32::new(FIRST_AUTO_ID),
            peers: Mutex::default(),
        }
    }

    /// Next free id for a service registered by name.
    pub fn allocate_id(&self) -> i32 {
        let services = lock(&self.services);
        loop {
            let id = self.next_auto.fetch_add(1, Ordering::SeqCst);
            if !services.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn insert(&self, service: Service) -> Result<Arc<Service>, TransportError> {
        let mut services = lock(&self.services);
        if services.contains_key(&service.id) {
            return Err(TransportError::DuplicateService(service.id));
        }
        if let Some(name) = &service.name {
            if services.values().any(|s| s.name.as_ref() == Some(name)) {
                return Err(TransportError::DuplicateName(name.clone()));
            }
        }
        let service = Arc::new(service);
        services.insert(service.id, Arc::clone(&service));
        info!("registered service {} ({:?})", service.id, service.name);
        Ok(service)
    }

    pub fn get(&self, id: i32) -> Option<Arc<Service>> {
        lock(&self.services).get(&id).cloned()
    }

    /// Id of the service registered under `name`. Numeric names match ids.
    pub fn find(&self, name: &str) -> Option<i32> {
        let services = lock(&self.services);
        services
            .values()
            .find(|s| s.name.as_deref() == Some(name))
            .map(|s| s.id)
            .or_else(|| name.parse::<i32>().ok().filter(|id| services.contains_key(id)))
    }

    pub fn remove(&self, id: i32) -> Option<Arc<Service>> {
        let service = lock(&self.services).remove(&id)?;
        service.stop_chirp();
        info!("unregistered service {id}");
        Some(service)
    }

    /// Starts the chirp thread of `service`. `broadcast` runs once per
    /// period or kick and returns `false` when the transport is gone.
    pub fn start_chirp<F>(&self, service: &Arc<Service>, broadcast: F) -> Result<(), TransportError>
    where
        F: Fn(&Service) -> bool + Send + 'static,
    {
        let Some(interval) = service.interval else {
            return Ok(());
        };
        if service.receiver.is_none() {
            return Ok(());
        }

        let ticker = Arc::new(Ticker::new());
        let weak: Weak<Service> = Arc::downgrade(service);
        let handle = {
            let ticker = Arc::clone(&ticker);
            thread::Builder::new()
                .name(format!("chirp-{}", service.id))
                .spawn(move || {
                    while ticker.tick(interval) {
                        let Some(service) = weak.upgrade() else {
                            break;
                        };
                        if !broadcast(&service) {
                            break;
                        }
                    }
                })
                .map_err(|e| TransportError::SendFailed(format!("cannot start chirps: {e}")))?
        };
        debug!("service {} chirps every {interval:?}", service.id);
        *lock(&service.task) = Some(ChirpTask { ticker, handle });
        Ok(())
    }

    /// Makes every chirping service broadcast now.
    pub fn kick_all(&self) {
        for service in self.all() {
            service.kick();
        }
    }

    pub fn all(&self) -> Vec<Arc<Service>> {
        lock(&self.services).values().cloned().collect()
    }

    /// Stops every chirp thread and forgets all services.
    pub fn clear(&self) {
        let services: Vec<_> = lock(&self.services).drain().map(|(_, s)| s).collect();
        for service in services {
            service.stop_chirp();
        }
        lock(&self.peers).clear();
    }

    pub fn observe(&self, chirp: Chirp, via: &str) {
        if chirp.service <= 0 {
            warn!("ignoring chirp for invalid service {}", chirp.service);
            return;
        }
        debug!("chirp from service {} via {via}", chirp.service);
        lock(&self.peers).insert(
            chirp.service,
            Liveness {
                service: chirp.service,
                name: chirp.name,
                created: chirp.created,
                reported: chirp.now,
                seen: Instant::now(),
                via: via.to_string(),
            },
        );
    }

    pub fn liveness(&self, service: i32) -> Option<Liveness> {
        lock(&self.peers).get(&service).cloned()
    }
}

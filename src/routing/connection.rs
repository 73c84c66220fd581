use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use log::debug;

use crate::{
    config::PoolPolicy,
    driver::{Connection, ConnectionId, DriverError},
    message::Message,
    sync::lock,
};

/// A driver connection as the core sees it.
pub struct Link {
    conn: Arc<dyn Connection>,
    id: ConnectionId,
    url: String,
    /// Pool key of a dialed connection.
    address: Option<SocketAddr>,
    uses: AtomicUsize,
    proxy: AtomicBool,
    pinned: AtomicBool,
    closed: AtomicBool,
}

impl Link {
    pub fn new(conn: Arc<dyn Connection>, address: Option<SocketAddr>) -> Self {
        Self {
            id: conn.id(),
            url: conn.url().to_string(),
            conn,
            address,
            uses: AtomicUsize::new(0),
            proxy: AtomicBool::new(false),
            pinned: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_outbound(&self) -> bool {
        self.address.is_some()
    }

    pub fn uses(&self) -> usize {
        self.uses.load(Ordering::SeqCst)
    }

    pub(crate) fn acquire(&self) {
        self.uses.fetch_add(1, Ordering::SeqCst);
    }

    /// Drops one use and returns how many remain.
    pub(crate) fn release(&self) -> usize {
        match self
            .uses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => 0,
        }
    }

    pub fn is_proxy(&self) -> bool {
        self.proxy.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_proxy(&self) {
        self.proxy.store(true, Ordering::SeqCst);
    }

    /// Pinned links carry a bound client and are never reclaimed when idle.
    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::SeqCst)
    }

    pub(crate) fn pin(&self) {
        self.pinned.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn send(&self, message: Message) -> Result<(), (DriverError, Message)> {
        if self.is_closed() {
            return Err((DriverError::Closed, message));
        }
        self.conn.send(message)
    }

    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("closing link {} to {}", self.id, self.url);
            self.conn.close();
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("address", &self.address)
            .field("uses", &self.uses())
            .field("proxy", &self.is_proxy())
            .field("pinned", &self.is_pinned())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Debug, Default)]
struct Links {
    all: HashMap<ConnectionId, Arc<Link>>,
    destinations: HashMap<SocketAddr, Vec<Arc<Link>>>,
}

/// Every live link, with dialed ones grouped by resolved address.
#[derive(Debug)]
pub struct ConnectionPool {
    policy: PoolPolicy,
    links: Mutex<Links>,
    setup: Mutex<HashMap<SocketAddr, Arc<Mutex<()>>>>,
}

impl ConnectionPool {
    pub fn new(policy: PoolPolicy) -> Self {
        Self {
            policy,
            links: Mutex::default(),
            setup: Mutex::default(),
        }
    }

    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    /// Lock serializing connection setup towards `addr`.
    pub fn setup_lock(&self, addr: SocketAddr) -> Arc<Mutex<()>> {
        let mut setup = lock(&self.setup);
        Arc::clone(setup.entry(addr).or_default())
    }

    /// Picks an open link to `addr` for one more use, honouring the policy.
    /// `None` means a new connection should be made.
    pub fn checkout(&self, addr: SocketAddr) -> Option<Arc<Link>> {
        let links = lock(&self.links);
        let chosen = if self.policy.single_connection {
            links
                .all
                .values()
                .filter(|l| l.is_outbound() && !l.is_closed())
                .min_by_key(|l| l.id())
                .cloned()
        } else if self.policy.connection_per_send {
            None
        } else {
            let open: Vec<&Arc<Link>> = links
                .destinations
                .get(&addr)
                .map(|v| v.iter().filter(|l| !l.is_closed()).collect())
                .unwrap_or_default();
            let free = open.iter().find(|l| l.uses() == 0);
            match free {
                Some(link) => Some(Arc::clone(link)),
                None if open.len() >= self.policy.max_connections => {
                    open.iter().min_by_key(|l| l.uses()).map(|l| Arc::clone(l))
                }
                None => None,
            }
        };
        if let Some(link) = &chosen {
            link.acquire();
        }
        chosen
    }

    pub fn insert(&self, link: Arc<Link>) {
        let mut links = lock(&self.links);
        if let Some(addr) = link.address {
            links
                .destinations
                .entry(addr)
                .or_default()
                .push(Arc::clone(&link));
        }
        links.all.insert(link.id(), link);
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Link>> {
        lock(&self.links).all.get(&id).cloned()
    }

    /// Drops one use of `link`. An idle link that the policy reclaims is
    /// removed and handed back for the caller to close.
    pub fn release(&self, link: &Arc<Link>) -> Option<Arc<Link>> {
        if link.release() > 0 || link.is_pinned() {
            return None;
        }
        if !(self.policy.close_idle || self.policy.connection_per_send) {
            return None;
        }
        let addr = link.address?;

        let mut links = lock(&self.links);
        let open = links
            .destinations
            .get(&addr)
            .map(|v| v.iter().filter(|l| !l.is_closed()).count())
            .unwrap_or(0);
        if open <= self.policy.min_connections || link.uses() > 0 {
            return None;
        }
        Self::unlink(&mut links, link.id())
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Link>> {
        Self::unlink(&mut lock(&self.links), id)
    }

    fn unlink(links: &mut Links, id: ConnectionId) -> Option<Arc<Link>> {
        let link = links.all.remove(&id)?;
        if let Some(addr) = link.address {
            if let Some(list) = links.destinations.get_mut(&addr) {
                list.retain(|l| l.id() != id);
                if list.is_empty() {
                    links.destinations.remove(&addr);
                }
            }
        }
        Some(link)
    }

    pub fn proxies(&self) -> Vec<Arc<Link>> {
        lock(&self.links)
            .all
            .values()
            .filter(|l| l.is_proxy() && !l.is_closed())
            .cloned()
            .collect()
    }

    /// Removes every link, for shutdown.
    pub fn drain(&self) -> Vec<Arc<Link>> {
        let mut links = lock(&self.links);
        links.destinations.clear();
        links.all.drain().map(|(_, l)| l).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.links).all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

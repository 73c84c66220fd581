use std::{collections::HashMap, sync::Mutex, time::Instant};

use log::debug;

use crate::{driver::ConnectionId, error::TransportError, operation::OperationId, sync::lock};

/// Operation waiting on a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub operation: OperationId,
    pub link: ConnectionId,
    pub deadline: Instant,
}

#[derive(Debug, Default)]
struct Routes {
    last: u32,
    entries: HashMap<u32, RouteEntry>,
}

/// Route id to pending operation, behind one lock.
#[derive(Debug)]
pub struct RouteTable {
    inner: Mutex<Routes>,
    capacity: usize,
}

impl RouteTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::default(),
            capacity,
        }
    }

    /// Assigns the next route id to `entry`. Ids increase by one per
    /// registration and skip 0, which means "no route" on the wire.
    pub fn register(&self, entry: RouteEntry) -> Result<u32, TransportError> {
        let mut routes = lock(&self.inner);
        if routes.entries.len() >= self.capacity {
            return Err(TransportError::RouteOverflow);
        }
        let mut route = routes.last;
        loop {
            route = route.wrapping_add(1);
            if route != 0 && !routes.entries.contains_key(&route) {
                break;
            }
        }
        routes.last = route;
        routes.entries.insert(route, entry);
        Ok(route)
    }

    /// Removes `route` when an answer for it arrives on `link`. Answers on
    /// any other link leave the route waiting.
    pub fn take_on(&self, route: u32, link: ConnectionId) -> Option<RouteEntry> {
        let mut routes = lock(&self.inner);
        match routes.entries.get(&route) {
            Some(entry) if entry.link == link => routes.entries.remove(&route),
            Some(entry) => {
                debug!("route {route} belongs to connection {}, not {link}", entry.link);
                None
            }
            None => None,
        }
    }

    /// Removes `route` only while it still belongs to `operation`.
    pub fn take_if(&self, route: u32, operation: OperationId) -> bool {
        let mut routes = lock(&self.inner);
        match routes.entries.get(&route) {
            Some(entry) if entry.operation == operation => {
                routes.entries.remove(&route);
                true
            }
            _ => false,
        }
    }

    /// Removes every route carried by a lost link.
    pub fn remove_for_link(&self, link: ConnectionId) -> Vec<(u32, RouteEntry)> {
        self.remove_where(|e| e.link == link)
    }

    /// Removes every route whose deadline has passed.
    pub fn expired(&self, now: Instant) -> Vec<(u32, RouteEntry)> {
        self.remove_where(|e| e.deadline <= now)
    }

    pub fn drain(&self) -> Vec<(u32, RouteEntry)> {
        lock(&self.inner).entries.drain().collect()
    }

    fn remove_where<F>(&self, pred: F) -> Vec<(u32, RouteEntry)>
    where
        F: Fn(&RouteEntry) -> bool,
    {
        let mut routes = lock(&self.inner);
        let matched: Vec<u32> = routes
            .entries
            .iter()
            .filter(|(_, e)| pred(e))
            .map(|(r, _)| *r)
            .collect();
        let removed: Vec<_> = matched
            .into_iter()
            .filter_map(|r| routes.entries.remove(&r).map(|e| (r, e)))
            .collect();
        if !removed.is_empty() {
            debug!("removed {} routes", removed.len());
        }
        removed
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

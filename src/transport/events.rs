//! What the core does with driver events.
use std::sync::{Arc, Weak};

use log::{debug, info, trace, warn};

use crate::{
    driver::{Connection, ConnectRequest, ConnectionId, DriverError, DriverEvents, Origin},
    error::TransportError,
    message::Message,
    operation::{Completion, OperationId},
    protocol::control::{self, BindClient, Chirp, ControlCode, UNKNOWN_TARGET, is_valid_target},
    routing::Link,
    service::{Delivery, ReturnToken},
};

use super::Inner;

/// Driver-facing side of a transport. Holds the core weakly so drivers never
/// keep a dropped transport alive.
pub(crate) struct EventSink(Weak<Inner>);

impl EventSink {
    pub fn new(inner: &Arc<Inner>) -> Self {
        Self(Arc::downgrade(inner))
    }

    fn inner(&self) -> Option<Arc<Inner>> {
        self.0.upgrade()
    }
}

impl DriverEvents for EventSink {
    fn connected(&self, conn: Arc<dyn Connection>, origin: Origin) {
        match self.inner() {
            Some(inner) => inner.connected(conn, origin),
            None => conn.close(),
        }
    }

    fn connect_failed(&self, request: ConnectRequest, error: DriverError) {
        if let Some(inner) = self.inner() {
            inner.connect_failed(request, error);
        }
    }

    fn disconnected(&self, conn: ConnectionId) {
        if let Some(inner) = self.inner() {
            inner.disconnected(conn);
        }
    }

    fn received(&self, conn: ConnectionId, message: Message) {
        if let Some(inner) = self.inner() {
            inner.received(conn, message);
        }
    }

    fn transmitted(&self, conn: ConnectionId, message: Message) {
        if let Some(inner) = self.inner() {
            inner.transmitted(conn, message);
        }
    }

    fn transmit_failed(&self, conn: ConnectionId, message: Message, error: DriverError) {
        if let Some(inner) = self.inner() {
            inner.transmit_failed(conn, message, error);
        }
    }
}

impl Inner {
    fn connected(&self, conn: Arc<dyn Connection>, origin: Origin) {
        let Origin::Outbound { request } = origin else {
            debug!("accepted connection {} on {}", conn.id(), conn.url());
            self.connections.insert(Arc::new(Link::new(conn, None)));
            return;
        };

        let Some(mut op) = self.ops.take(OperationId(request.0)) else {
            debug!("connection {} arrived after its dial gave up", conn.id());
            conn.close();
            return;
        };
        let link = Arc::new(Link::new(conn, op.address));
        link.acquire();
        self.connections.insert(Arc::clone(&link));
        debug!("{} connected {} as connection {}", op.id, link.url(), link.id());

        if let Completion::Connect(slot) = std::mem::take(&mut op.completion) {
            if slot.complete(Ok(Arc::clone(&link))).is_err() {
                self.release_link(&link);
            }
        }
        self.ops.recycle(op);
        self.services.kick_all();
    }

    fn connect_failed(&self, request: ConnectRequest, error: DriverError) {
        let id = OperationId(request.0);
        let Some(url) = self.ops.with(id, |op| op.target.clone()) else {
            return;
        };
        let err = match error {
            DriverError::Timeout(url) => TransportError::ConnectTimeout(url),
            other => TransportError::ConnectFailed {
                url,
                reason: other.to_string(),
            },
        };
        self.fail_operation(id, err);
    }

    /// Tears down everything a lost link carried.
    fn disconnected(&self, conn: ConnectionId) {
        if let Some(link) = self.connections.remove(conn) {
            link.close();
        }
        let names = self.targets.unlink(conn);
        if !names.is_empty() {
            debug!("connection {conn} owned targets {names:?}");
        }
        for (route, entry) in self.routes.remove_for_link(conn) {
            if let Some(mut op) = self.ops.take(entry.operation) {
                debug!("route {route} of {} lost with connection {conn}", op.id);
                op.route = 0;
                op.fail(TransportError::NotConnected);
                self.retire(op);
            }
        }
        debug!("connection {conn} disconnected");
    }

    fn received(&self, conn: ConnectionId, message: Message) {
        if self.check_running().is_err() {
            self.release(message);
            return;
        }
        let Some(link) = self.connections.get(conn) else {
            warn!("dropping frame from unknown connection {conn}");
            self.release(message);
            return;
        };

        if message.target() < 0 {
            self.control(&link, message);
        } else {
            self.deliver(link, message);
        }
    }

    fn transmitted(&self, _conn: ConnectionId, message: Message) {
        let op = message.operation;
        self.release(message);
        let Some(id) = op else {
            return;
        };

        let Some((callback, finished)) = self
            .ops
            .with(id, |op| (op.take_on_transmit(), !op.expects_reply()))
        else {
            return;
        };
        if let Some(callback) = callback {
            callback(Ok(()));
        }
        if finished {
            if let Some(op) = self.ops.take(id) {
                self.retire(op);
            }
        }
    }

    fn transmit_failed(&self, conn: ConnectionId, message: Message, error: DriverError) {
        let op = message.operation;
        self.release(message);
        warn!("transmit on connection {conn} failed: {error}");
        if let Some(id) = op {
            self.fail_operation(id, TransportError::SendFailed(error.to_string()));
        }
    }

    fn control(&self, link: &Arc<Link>, mut message: Message) {
        let code = match ControlCode::try_from(message.target()) {
            Ok(code) => code,
            Err(e) => {
                warn!("dropping frame from connection {}: {e}", link.id());
                self.release(message);
                return;
            }
        };

        match code {
            ControlCode::RouteReturn => self.route_return(link, message),
            ControlCode::RouteTimeout
            | ControlCode::RouteOverflow
            | ControlCode::TtlExpired
            | ControlCode::RouteFailed
            | ControlCode::UnresolvedTarget => self.route_failure(link, code, message),
            ControlCode::ResolveRequest => {
                match control::parse_resolve_request(&message) {
                    Ok(name) => {
                        let id = self.services.find(&name).unwrap_or(UNKNOWN_TARGET);
                        debug!("answering resolve of '{name}' with {id}");
                        self.reply(link, control::resolve_reply(&self.pool, id, &name));
                    }
                    Err(e) => warn!("bad resolve request on connection {}: {e}", link.id()),
                }
                self.release(message);
            }
            ControlCode::ResolveReply => {
                match control::parse_resolve_reply(&mut message) {
                    Ok((id, name)) => {
                        // Recorded before waking anyone, so a caller arriving
                        // after the answer finds the id instead of asking again.
                        if is_valid_target(id) {
                            self.targets.resolved(&name, id, link.id());
                        }
                        self.resolver.answer(&name, Ok(id));
                    }
                    Err(e) => warn!("bad resolve reply on connection {}: {e}", link.id()),
                }
                self.release(message);
            }
            ControlCode::Chirp => {
                match control::decode_payload::<Chirp>(&message) {
                    Ok(chirp) => self.services.observe(chirp, link.url()),
                    Err(e) => warn!("bad chirp on connection {}: {e}", link.id()),
                }
                self.release(message);
            }
            ControlCode::ProxyRegistration => {
                debug!("connection {} registered as proxy", link.id());
                link.mark_proxy();
                self.release(message);
                self.services.kick_all();
            }
            ControlCode::BindClient => {
                match control::decode_payload::<BindClient>(&message) {
                    Ok(bind) => {
                        link.pin();
                        info!("connection {} bound as client '{}'", link.id(), bind.name);
                    }
                    Err(e) => warn!("bad bind request on connection {}: {e}", link.id()),
                }
                self.release(message);
            }
            ControlCode::Health => {
                trace!("health frame on connection {}", link.id());
                self.release(message);
            }
        }
    }

    fn route_return(&self, link: &Link, message: Message) {
        let route = message.route();
        let Some(entry) = self.routes.take_on(route, link.id()) else {
            warn!("reply on unknown route {route} from connection {}", link.id());
            self.release(message);
            return;
        };
        let Some(mut op) = self.ops.take(entry.operation) else {
            debug!("reply on route {route} after {} finished", entry.operation);
            self.release(message);
            return;
        };

        op.route = 0;
        if let Some(unclaimed) = op.deliver(message) {
            self.release(unclaimed);
        }
        self.retire(op);
    }

    fn route_failure(&self, link: &Link, code: ControlCode, message: Message) {
        let route = message.route();
        self.release(message);
        let Some(entry) = self.routes.take_on(route, link.id()) else {
            warn!("{code:?} on unknown route {route} from connection {}", link.id());
            return;
        };
        let Some(mut op) = self.ops.take(entry.operation) else {
            return;
        };

        let err = TransportError::from_route_failure(code, &op.target)
            .unwrap_or(TransportError::RouteFailed);
        op.route = 0;
        op.fail(err);
        self.retire(op);
    }

    /// Hands a user frame to the local service it is addressed to.
    fn deliver(&self, link: Arc<Link>, message: Message) {
        let service_id = message.target();
        if message.ttl() == 0 {
            debug!("frame for service {service_id} ran out of hops");
            self.bounce(&link, message, ControlCode::TtlExpired);
            return;
        }
        let Some(service) = self.services.get(service_id) else {
            debug!("frame for unknown service {service_id}");
            self.bounce(&link, message, ControlCode::UnresolvedTarget);
            return;
        };
        let Some(receiver) = service.receiver.clone() else {
            debug!("service {service_id} does not receive");
            self.bounce(&link, message, ControlCode::RouteFailed);
            return;
        };

        let reply = ReturnToken {
            token: message.token(),
            route: message.route(),
            link,
        };
        let delivery = Delivery {
            service: service_id,
            message,
            reply,
        };
        match &self.queue {
            None => receiver(delivery),
            Some(queue) => {
                if queue.push(Box::new(move || receiver(delivery))).is_err() {
                    warn!("delivery queue closed, dropping frame for service {service_id}");
                }
            }
        }
    }

    /// Tells the sender of `message` why it was not delivered, when it waits
    /// on a route.
    fn bounce(&self, link: &Link, message: Message, code: ControlCode) {
        let route = message.route();
        let token = message.token();
        self.release(message);
        if route == 0 {
            return;
        }

        let mut answer = self.pool.allocate(0);
        answer.set_target(code.code());
        answer.set_route(route);
        answer.set_token(token);
        self.reply(link, answer);
    }

    /// Sends a frame that needs no bookkeeping back over `link`.
    fn reply(&self, link: &Link, message: Message) {
        if let Err((e, message)) = link.send(message) {
            debug!("cannot answer on connection {}: {e}", link.id());
            self.release(message);
        }
    }
}

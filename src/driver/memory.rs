//! In-process driver.
//!
//! Connections are pairs of channels carrying fully encoded frames, so
//! everything above the socket layer behaves as it would over TCP. Drivers
//! sharing one [`MemoryNetwork`] can reach each other's listeners.
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        mpsc::{self, Receiver, Sender},
    },
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    message::Message,
    protocol::{decode, encode},
    sync::lock,
};

use super::{
    ConnectRequest, Connection, ConnectionId, Driver, DriverContext, DriverError, DriverThreads,
    Endpoint, Origin, next_connection_id,
};

struct Listener {
    url: String,
    ctx: DriverContext,
    shared: Arc<Shared>,
}

/// Address space shared by a set of [`MemoryDriver`]s.
#[derive(Default)]
pub struct MemoryNetwork {
    listeners: Mutex<HashMap<SocketAddr, Listener>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[derive(Default)]
struct Shared {
    connections: Mutex<HashMap<ConnectionId, Arc<MemoryConnection>>>,
    threads: DriverThreads,
}

impl Shared {
    /// Registers one end of a pipe, reports it, and starts draining its inbox.
    fn attach(
        self: &Arc<Self>,
        conn: Arc<MemoryConnection>,
        inbox: Receiver<Vec<u8>>,
        origin: Origin,
    ) {
        lock(&self.connections).insert(conn.id, Arc::clone(&conn));
        conn.ctx
            .events
            .connected(Arc::clone(&conn) as Arc<dyn Connection>, origin);

        let shared = Arc::clone(self);
        let spawned = self.threads.spawn(format!("mem-inbox-{}", conn.id), {
            let conn = Arc::clone(&conn);
            move || {
                for frame in inbox {
                    match decode(&frame, &conn.ctx.pool, conn.ctx.max_frame) {
                        Ok(message) => conn.ctx.events.received(conn.id, message),
                        Err(e) => warn!("memory connection {} dropped a frame: {e}", conn.id),
                    }
                }
                lock(&shared.connections).remove(&conn.id);
                conn.ctx.events.disconnected(conn.id);
            }
        });
        if let Err(e) = spawned {
            warn!("failed to start inbox of memory connection {}: {e}", conn.id);
            conn.close();
        }
    }
}

/// Both inbox senders of a connection pair. Clearing them ends both inboxes.
struct Pipe {
    ends: Mutex<[Option<Sender<Vec<u8>>>; 2]>,
}

struct MemoryConnection {
    id: ConnectionId,
    url: String,
    side: usize,
    pipe: Arc<Pipe>,
    ctx: DriverContext,
}

impl Connection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn send(&self, message: Message) -> Result<(), (DriverError, Message)> {
        let peer = lock(&self.pipe.ends)[1 - self.side].clone();
        let Some(peer) = peer else {
            return Err((DriverError::Closed, message));
        };
        if peer.send(encode(&message)).is_err() {
            return Err((DriverError::Closed, message));
        }
        self.ctx.events.transmitted(self.id, message);
        Ok(())
    }

    fn close(&self) {
        let mut ends = lock(&self.pipe.ends);
        if ends.iter().any(Option::is_some) {
            debug!("closing memory connection {} ({})", self.id, self.url);
        }
        *ends = [None, None];
    }
}

pub struct MemoryDriver {
    network: Arc<MemoryNetwork>,
    shared: Arc<Shared>,
}

impl MemoryDriver {
    pub fn new(network: Arc<MemoryNetwork>) -> Self {
        Self {
            network,
            shared: Arc::default(),
        }
    }
}

impl Driver for MemoryDriver {
    fn scheme(&self) -> &str {
        "mem"
    }

    fn listen(&self, endpoint: &Endpoint, ctx: DriverContext) -> Result<Endpoint, DriverError> {
        let addr = endpoint.resolve()?;
        let mut listeners = lock(&self.network.listeners);
        if listeners.contains_key(&addr) {
            return Err(DriverError::AddressInUse(endpoint.url().to_string()));
        }
        listeners.insert(
            addr,
            Listener {
                url: endpoint.url().to_string(),
                ctx,
                shared: Arc::clone(&self.shared),
            },
        );
        info!("listening at {endpoint}");
        Ok(endpoint.clone())
    }

    fn connect(
        &self,
        endpoint: &Endpoint,
        ctx: DriverContext,
        request: ConnectRequest,
        _timeout: Duration,
    ) -> Result<(), DriverError> {
        let addr = endpoint.resolve()?;
        let url = endpoint.url().to_string();
        let network = Arc::clone(&self.network);
        let shared = Arc::clone(&self.shared);

        self.shared.threads.spawn(format!("mem-connect-{}", request.0), move || {
            let listener = lock(&network.listeners)
                .get(&addr)
                .map(|l| (l.url.clone(), l.ctx.clone(), Arc::clone(&l.shared)));
            let Some((listen_url, server_ctx, server)) = listener else {
                ctx.events.connect_failed(request, DriverError::Refused(url));
                return;
            };

            let (client_tx, client_rx) = mpsc::channel();
            let (server_tx, server_rx) = mpsc::channel();
            let pipe = Arc::new(Pipe {
                ends: Mutex::new([Some(client_tx), Some(server_tx)]),
            });
            let accepted = Arc::new(MemoryConnection {
                id: next_connection_id(),
                url: listen_url,
                side: 1,
                pipe: Arc::clone(&pipe),
                ctx: server_ctx,
            });
            let dialed = Arc::new(MemoryConnection {
                id: next_connection_id(),
                url,
                side: 0,
                pipe,
                ctx,
            });

            server.attach(accepted, server_rx, Origin::Inbound);
            shared.attach(dialed, client_rx, Origin::Outbound { request });
        })?;
        Ok(())
    }

    fn stop(&self, drain: Duration) {
        lock(&self.network.listeners).retain(|_, l| !Arc::ptr_eq(&l.shared, &self.shared));
        let connections: Vec<_> = lock(&self.shared.connections).values().cloned().collect();
        for conn in connections {
            conn.close();
        }
        self.shared.threads.join(drain);
    }
}

#[cfg(test)]
mod tests {
    use crate::{driver::DriverEvents, message::MessagePool};

    use super::*;

    #[derive(Default)]
    struct Collect {
        connections: Mutex<Vec<Arc<dyn Connection>>>,
        received: Mutex<Vec<(ConnectionId, Vec<u8>, i32)>>,
        transmitted: Mutex<usize>,
        disconnected: Mutex<Vec<ConnectionId>>,
        refused: Mutex<usize>,
    }

    impl DriverEvents for Collect {
        fn connected(&self, conn: Arc<dyn Connection>, _: Origin) {
            lock(&self.connections).push(conn);
        }
        fn connect_failed(&self, _: ConnectRequest, _: DriverError) {
            *lock(&self.refused) += 1;
        }
        fn disconnected(&self, conn: ConnectionId) {
            lock(&self.disconnected).push(conn);
        }
        fn received(&self, conn: ConnectionId, message: Message) {
            let target = message.target();
            lock(&self.received).push((conn, message.body().to_vec(), target));
        }
        fn transmitted(&self, _: ConnectionId, _: Message) {
            *lock(&self.transmitted) += 1;
        }
        fn transmit_failed(&self, _: ConnectionId, _: Message, _: DriverError) {}
    }

    fn context(events: &Arc<Collect>) -> DriverContext {
        DriverContext {
            events: Arc::clone(events) as Arc<dyn DriverEvents>,
            pool: Arc::new(MessagePool::new()),
            max_frame: 4096,
        }
    }

    fn eventually(mut f: impl FnMut() -> bool) {
        for _ in 0..500 {
            if f() {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("condition not reached");
    }

    #[test]
    fn pair_exchanges_frames_and_closes_both_ends() {
        let network = MemoryNetwork::new();
        let server = MemoryDriver::new(Arc::clone(&network));
        let client = MemoryDriver::new(Arc::clone(&network));
        let server_events = Arc::new(Collect::default());
        let client_events = Arc::new(Collect::default());
        let endpoint = Endpoint::parse("mem://127.0.0.1:4000").unwrap();

        server.listen(&endpoint, context(&server_events)).unwrap();
        let client_ctx = context(&client_events);
        client
            .connect(&endpoint, client_ctx.clone(), ConnectRequest(1), Duration::ZERO)
            .unwrap();
        eventually(|| lock(&client_events.connections).len() == 1);

        let conn = Arc::clone(&lock(&client_events.connections)[0]);
        assert_eq!(conn.url(), "mem://127.0.0.1:4000");
        let mut msg = client_ctx.pool.allocate(0);
        msg.put_bytes(b"hello");
        msg.set_target(12);
        conn.send(msg).unwrap();
        assert_eq!(*lock(&client_events.transmitted), 1);

        eventually(|| lock(&server_events.received).len() == 1);
        let (_, body, target) = lock(&server_events.received)[0].clone();
        assert_eq!(body, b"hello");
        assert_eq!(target, 12);

        conn.close();
        eventually(|| lock(&client_events.disconnected).len() == 1);
        eventually(|| lock(&server_events.disconnected).len() == 1);
        server.stop(Duration::from_secs(1));
        client.stop(Duration::from_secs(1));
    }

    #[test]
    fn connect_without_listener_is_refused() {
        let client = MemoryDriver::new(MemoryNetwork::new());
        let events = Arc::new(Collect::default());
        let endpoint = Endpoint::parse("mem://127.0.0.1:4001").unwrap();

        client
            .connect(&endpoint, context(&events), ConnectRequest(1), Duration::ZERO)
            .unwrap();
        eventually(|| *lock(&events.refused) == 1);
        client.stop(Duration::from_secs(1));
    }

    #[test]
    fn second_listener_on_address_fails() {
        let network = MemoryNetwork::new();
        let a = MemoryDriver::new(Arc::clone(&network));
        let b = MemoryDriver::new(network);
        let endpoint = Endpoint::parse("mem://127.0.0.1:4002").unwrap();
        let events = Arc::new(Collect::default());

        a.listen(&endpoint, context(&events)).unwrap();
        assert!(matches!(
            b.listen(&endpoint, context(&events)),
            Err(DriverError::AddressInUse(_))
        ));

        a.stop(Duration::from_secs(1));
        assert!(b.listen(&endpoint, context(&events)).is_ok());
        b.stop(Duration::from_secs(1));
    }
}

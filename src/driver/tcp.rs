//! Framed TCP driver.
//!
//! Each connection gets a reader thread that decodes frames and reports them;
//! writes happen on the caller's thread behind a per-connection lock. Frames
//! go on the wire exactly as [`encode`](crate::protocol::encode) produces
//! them, with no handshake.
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    net::{Shutdown, TcpListener, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    message::Message,
    protocol::{FrameError, ProtocolTransport},
    sync::lock,
};

use super::{
    ConnectRequest, Connection, ConnectionId, Driver, DriverContext, DriverError, DriverThreads,
    Endpoint, Origin, next_connection_id,
};

const ACCEPT_POLL: Duration = Duration::from_millis(20);

#[derive(Default)]
struct Shared {
    stopped: AtomicBool,
    connections: Mutex<HashMap<ConnectionId, Arc<TcpConnection>>>,
    threads: DriverThreads,
}

#[derive(Default)]
pub struct TcpDriver {
    shared: Arc<Shared>,
}

impl TcpDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

struct TcpConnection {
    id: ConnectionId,
    url: String,
    writer: Mutex<ProtocolTransport<TcpStream>>,
    /// Handle for shutting the socket down while a write holds `writer`.
    socket: TcpStream,
    closed: AtomicBool,
    ctx: DriverContext,
}

impl Connection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn send(&self, message: Message) -> Result<(), (DriverError, Message)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err((DriverError::Closed, message));
        }
        let written = lock(&self.writer).write_message(&message);
        match written {
            Ok(()) => {
                self.ctx.events.transmitted(self.id, message);
                Ok(())
            }
            Err(e) => Err((DriverError::Frame(e), message)),
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("closing tcp connection {} ({})", self.id, self.url);
            let _ = self.socket.shutdown(Shutdown::Both);
        }
    }
}

/// Registers a connected stream, reports it, and starts its reader thread.
fn start_connection(
    shared: &Arc<Shared>,
    stream: TcpStream,
    url: String,
    origin: Origin,
    ctx: DriverContext,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let reader = stream.try_clone()?;
    let socket = stream.try_clone()?;
    let conn = Arc::new(TcpConnection {
        id: next_connection_id(),
        url,
        writer: Mutex::new(ProtocolTransport::new(stream, ctx.max_frame)),
        socket,
        closed: AtomicBool::new(false),
        ctx: ctx.clone(),
    });
    lock(&shared.connections).insert(conn.id, Arc::clone(&conn));
    ctx.events.connected(Arc::clone(&conn) as Arc<dyn Connection>, origin);

    let handle = Arc::clone(shared);
    shared.threads.spawn(format!("tcp-read-{}", conn.id), move || {
        read_loop(&conn, reader);
        conn.closed.store(true, Ordering::SeqCst);
        lock(&handle.connections).remove(&conn.id);
        conn.ctx.events.disconnected(conn.id);
    })
}

fn read_loop(conn: &TcpConnection, reader: TcpStream) {
    let mut transport = ProtocolTransport::new(reader, conn.ctx.max_frame);
    loop {
        match transport.read_message(&conn.ctx.pool) {
            Ok(message) => conn.ctx.events.received(conn.id, message),
            Err(FrameError::Io(e))
                if matches!(
                    e.kind(),
                    ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe
                ) || conn.closed.load(Ordering::SeqCst) =>
            {
                debug!("tcp connection {} ended: {e}", conn.id);
                return;
            }
            Err(e) => {
                // The stream cannot be resynchronized after a bad frame.
                warn!("dropping tcp connection {}: {e}", conn.id);
                let _ = transport.get_ref().shutdown(Shutdown::Both);
                return;
            }
        }
    }
}

fn accept_loop(shared: Arc<Shared>, listener: TcpListener, url: String, ctx: DriverContext) {
    while !shared.stopped.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("accepted {peer} on {url}");
                let accepted = stream.set_nonblocking(false).and_then(|_| {
                    start_connection(&shared, stream, url.clone(), Origin::Inbound, ctx.clone())
                });
                if let Err(e) = accepted {
                    warn!("failed to start connection from {peer}: {e}");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => warn!("accept on {url} failed: {e}"),
        }
    }
    debug!("stopped listening on {url}");
}

impl Driver for TcpDriver {
    fn scheme(&self) -> &str {
        "tcp"
    }

    fn listen(&self, endpoint: &Endpoint, ctx: DriverContext) -> Result<Endpoint, DriverError> {
        let listener = TcpListener::bind(endpoint.resolve()?)?;
        listener.set_nonblocking(true)?;
        let bound = endpoint.with_port(listener.local_addr()?.port())?;
        info!("listening at {bound}");

        let shared = Arc::clone(&self.shared);
        let url = bound.url().to_string();
        self.shared.threads.spawn(format!("tcp-accept-{}", bound.port()), move || {
            accept_loop(shared, listener, url, ctx)
        })?;
        Ok(bound)
    }

    fn connect(
        &self,
        endpoint: &Endpoint,
        ctx: DriverContext,
        request: ConnectRequest,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let addr = endpoint.resolve()?;
        let url = endpoint.url().to_string();
        let shared = Arc::clone(&self.shared);

        self.shared.threads.spawn(format!("tcp-connect-{}", request.0), move || {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    debug!("connected to {url}");
                    let origin = Origin::Outbound { request };
                    if let Err(e) = start_connection(&shared, stream, url, origin, ctx.clone()) {
                        ctx.events.connect_failed(request, DriverError::Io(e));
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    ctx.events.connect_failed(request, DriverError::Timeout(url));
                }
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    ctx.events.connect_failed(request, DriverError::Refused(url));
                }
                Err(e) => ctx.events.connect_failed(request, DriverError::Io(e)),
            }
        })?;
        Ok(())
    }

    fn stop(&self, drain: Duration) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        let connections: Vec<_> = lock(&self.shared.connections).values().cloned().collect();
        for conn in connections {
            conn.close();
        }

        self.shared.threads.join(drain);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, time::Instant};

    use crate::{driver::DriverEvents, message::MessagePool};

    use super::*;

    enum Event {
        Connected(Arc<dyn Connection>, Origin),
        Failed(DriverError),
        Disconnected(ConnectionId),
        Received(ConnectionId, Vec<u8>),
    }

    struct Recorder(Mutex<mpsc::Sender<Event>>);

    impl DriverEvents for Recorder {
        fn connected(&self, conn: Arc<dyn Connection>, origin: Origin) {
            let _ = lock(&self.0).send(Event::Connected(conn, origin));
        }
        fn connect_failed(&self, _: ConnectRequest, error: DriverError) {
            let _ = lock(&self.0).send(Event::Failed(error));
        }
        fn disconnected(&self, conn: ConnectionId) {
            let _ = lock(&self.0).send(Event::Disconnected(conn));
        }
        fn received(&self, conn: ConnectionId, message: Message) {
            let _ = lock(&self.0).send(Event::Received(conn, message.body().to_vec()));
        }
        fn transmitted(&self, _: ConnectionId, _: Message) {}
        fn transmit_failed(&self, _: ConnectionId, _: Message, _: DriverError) {}
    }

    fn context() -> (DriverContext, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        let ctx = DriverContext {
            events: Arc::new(Recorder(Mutex::new(tx))),
            pool: Arc::new(MessagePool::new()),
            max_frame: 1 << 20,
        };
        (ctx, rx)
    }

    fn next(rx: &mpsc::Receiver<Event>) -> Event {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn frames_flow_between_listener_and_dialer() {
        let driver = TcpDriver::new();
        let (server_ctx, server_rx) = context();
        let (client_ctx, client_rx) = context();

        let bound = driver
            .listen(&Endpoint::parse("tcp://127.0.0.1:0").unwrap(), server_ctx)
            .unwrap();
        assert_ne!(bound.port(), 0);
        driver
            .connect(&bound, client_ctx.clone(), ConnectRequest(1), Duration::from_secs(5))
            .unwrap();

        let Event::Connected(client, Origin::Outbound { request }) = next(&client_rx) else {
            panic!("expected outbound connection");
        };
        assert_eq!(request, ConnectRequest(1));
        assert_eq!(client.url(), bound.url());
        let Event::Connected(server, Origin::Inbound) = next(&server_rx) else {
            panic!("expected inbound connection");
        };
        assert_eq!(server.url(), bound.url());

        let mut msg = client_ctx.pool.allocate(0);
        msg.put_bytes(b"over tcp");
        msg.set_target(5);
        client.send(msg).unwrap();

        let Event::Received(id, body) = next(&server_rx) else {
            panic!("expected a frame");
        };
        assert_eq!(id, server.id());
        assert_eq!(body, b"over tcp");

        client.close();
        assert!(matches!(next(&client_rx), Event::Disconnected(id) if id == client.id()));
        assert!(matches!(next(&server_rx), Event::Disconnected(id) if id == server.id()));
        driver.stop(Duration::from_secs(1));
    }

    #[test]
    fn refused_connect_is_reported() {
        let driver = TcpDriver::new();
        let (ctx, rx) = context();

        // Bind and drop to find a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let endpoint = Endpoint::parse(&format!("tcp://127.0.0.1:{port}")).unwrap();
        driver
            .connect(&endpoint, ctx, ConnectRequest(2), Duration::from_secs(2))
            .unwrap();

        assert!(matches!(next(&rx), Event::Failed(_)));
        driver.stop(Duration::from_secs(1));
    }

    #[test]
    fn send_after_close_hands_message_back() {
        let driver = TcpDriver::new();
        let (server_ctx, _server_rx) = context();
        let (client_ctx, client_rx) = context();
        let bound = driver
            .listen(&Endpoint::parse("tcp://127.0.0.1:0").unwrap(), server_ctx)
            .unwrap();
        driver
            .connect(&bound, client_ctx.clone(), ConnectRequest(3), Duration::from_secs(5))
            .unwrap();
        let Event::Connected(client, _) = next(&client_rx) else {
            panic!("expected connection");
        };

        client.close();
        let msg = client_ctx.pool.allocate(4);
        let (err, msg) = client.send(msg).unwrap_err();
        assert!(matches!(err, DriverError::Closed));
        assert_eq!(msg.len(), 4);
        driver.stop(Duration::from_secs(1));
    }

    #[test]
    fn close_does_not_wait_for_a_blocked_write() {
        // A peer that accepts and never reads, so writes fill the socket.
        let peer = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = peer.local_addr().unwrap().port();
        let driver = TcpDriver::new();
        let (ctx, rx) = context();
        let endpoint = Endpoint::parse(&format!("tcp://127.0.0.1:{port}")).unwrap();
        driver
            .connect(&endpoint, ctx.clone(), ConnectRequest(4), Duration::from_secs(5))
            .unwrap();
        let (_unread, _) = peer.accept().unwrap();
        let Event::Connected(conn, _) = next(&rx) else {
            panic!("expected connection");
        };

        let writer = {
            let conn = Arc::clone(&conn);
            let pool = Arc::clone(&ctx.pool);
            thread::spawn(move || {
                for _ in 0..10_000 {
                    let mut msg = pool.allocate(512 * 1024);
                    msg.set_target(5);
                    if let Err((_, msg)) = conn.send(msg) {
                        let _ = pool.free(msg);
                        return true;
                    }
                }
                false
            })
        };
        thread::sleep(Duration::from_millis(300));

        let started = Instant::now();
        conn.close();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(writer.join().unwrap());
        driver.stop(Duration::from_secs(5));
    }
}

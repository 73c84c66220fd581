use std::{
    sync::{Arc, mpsc},
    thread,
    time::{Duration, Instant},
};

use crate::{
    config::{DeliveryMode, TransportConfig},
    directory::{DirectoryChain, Entry, StaticDirectory},
    driver::{DriverRegistry, MemoryDriver, MemoryNetwork},
    error::TransportError,
    protocol::ControlCode,
    routing::Target,
    service::{Delivery, Registration, ReturnToken},
};

use super::{SendOptions, Transport};

const SERVER: &str = "mem://127.0.0.1:7001";
const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn config() -> TransportConfig {
    TransportConfig {
        chirp_interval: None,
        reply_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn node(network: &Arc<MemoryNetwork>, config: TransportConfig, directory: DirectoryChain) -> Transport {
    let mut drivers = DriverRegistry::new();
    drivers.register(Arc::new(MemoryDriver::new(Arc::clone(network))));
    Transport::new(config, drivers, directory).unwrap()
}

/// Directory pointing every given target at the server.
fn directory(targets: &[&str]) -> DirectoryChain {
    let entries = targets
        .iter()
        .fold(StaticDirectory::new(), |dir, t| dir.with(Entry::new("", t, SERVER)));
    DirectoryChain::new().with(Arc::new(entries))
}

fn echo(transport: &Transport) -> impl Fn(Delivery) + Send + Sync + 'static {
    let transport = transport.clone();
    move |delivery: Delivery| {
        let mut reply = transport.allocate(0);
        reply.put_bytes(delivery.message.body());
        transport.free(delivery.message).unwrap();
        if let Err(e) = transport.send_via_return(reply, &delivery.reply) {
            assert!(matches!(e, TransportError::MissingRoute));
        }
    }
}

fn server(network: &Arc<MemoryNetwork>, config: TransportConfig) -> Transport {
    let server = node(network, config, DirectoryChain::new());
    server.listen(SERVER).unwrap();
    server
        .register(Registration::new("echo").on_receive(echo(&server)))
        .unwrap();
    server
}

fn payload(transport: &Transport, bytes: &[u8]) -> crate::message::Message {
    let mut message = transport.allocate(0);
    message.put_bytes(bytes);
    message
}

fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn echo_round_trip() {
    let network = MemoryNetwork::new();
    let server = server(&network, config());
    let client = node(&network, config(), directory(&["echo"]));

    let reply = client
        .send_and_wait("echo", payload(&client, b"hello"), WAIT)
        .unwrap();
    assert_eq!(reply.body(), b"hello");
    assert_eq!(reply.target(), ControlCode::RouteReturn.code());
    client.free(reply).unwrap();

    let stats = client.stats();
    assert_eq!(stats.links, 1);
    assert_eq!(stats.routes, 0);
    assert_eq!(stats.operations.live, 0);
    assert_eq!(stats.messages.in_use, 0);

    client.shutdown();
    server.shutdown();
}

#[test]
fn name_is_resolved_once() {
    let network = MemoryNetwork::new();
    let server = server(&network, config());
    let client = node(&network, config(), directory(&["echo"]));
    client.alias("mirror", "echo");

    for (i, target) in ["echo", "echo", "mirror"].into_iter().enumerate() {
        let reply = client
            .send_and_wait(target, payload(&client, &[i as u8]), WAIT)
            .unwrap();
        assert_eq!(reply.body(), &[i as u8]);
        client.free(reply).unwrap();
        assert_eq!(client.stats().resolves, 1);
    }

    client.shutdown();
    server.shutdown();
}

#[test]
fn concurrent_waits_get_their_own_replies() {
    let network = MemoryNetwork::new();
    let server = server(&network, config());
    let client = node(&network, config(), directory(&["echo"]));

    let handles: Vec<_> = (0..8u8)
        .map(|i| {
            let client = client.clone();
            thread::spawn(move || {
                for round in 0..10u8 {
                    let body = [i, round, i ^ round];
                    let reply = client
                        .send_and_wait("echo", payload(&client, &body), WAIT)
                        .unwrap();
                    assert_eq!(reply.body(), &body);
                    client.free(reply).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(client.stats().resolves, 1);
    assert_eq!(client.stats().routes, 0);
    client.shutdown();
    server.shutdown();
}

#[test]
fn silent_service_times_out_and_counters_recover() {
    let network = MemoryNetwork::new();
    let server = server(&network, config());
    let silent = server.clone();
    server
        .register(Registration::new("silent").on_receive(move |d| {
            silent.free(d.message).unwrap();
        }))
        .unwrap();
    let client = node(&network, config(), directory(&["echo", "silent"]));

    // Warm up the link and the resolution so only the wait is timed.
    let reply = client
        .send_and_wait("echo", payload(&client, b"warm"), WAIT)
        .unwrap();
    client.free(reply).unwrap();
    client
        .send("silent", payload(&client, b"warm"), SendOptions::new())
        .unwrap();
    let baseline = client.stats();

    let timeout = Duration::from_millis(300);
    let started = Instant::now();
    let outcome = client.send_and_wait("silent", payload(&client, b"anyone?"), Some(timeout));
    let elapsed = started.elapsed();

    assert!(matches!(outcome, Err(TransportError::Timeout)));
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_secs(1));

    let after = client.stats();
    assert_eq!(after.operations.live, 0);
    assert_eq!(after.routes, 0);
    assert_eq!(after.messages.in_use, baseline.messages.in_use);
    assert_eq!(after.links, baseline.links);

    client.shutdown();
    server.shutdown();
}

#[test]
fn callbacks_report_transmit_and_reply() {
    let network = MemoryNetwork::new();
    let server = server(&network, config());
    let client = node(&network, config(), directory(&["echo"]));

    let (sent_tx, sent_rx) = mpsc::channel();
    let (reply_tx, reply_rx) = mpsc::channel();
    let options = SendOptions::new()
        .priority(3)
        .on_transmit(move |r| sent_tx.send(r.is_ok()).unwrap())
        .on_reply(move |r| reply_tx.send(r.map(|m| m.body().to_vec())).unwrap());
    client.send("echo", payload(&client, b"ping"), options).unwrap();

    assert!(sent_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    let reply = reply_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(reply.unwrap(), b"ping");
    assert!(eventually(|| client.stats().operations.live == 0));

    client.shutdown();
    server.shutdown();
}

#[test]
fn unknown_targets_are_unresolved() {
    let network = MemoryNetwork::new();
    let server = server(&network, config());
    let client = node(&network, config(), directory(&["ghost", "41"]));

    let outcome = client.send_and_wait("ghost", payload(&client, b"x"), WAIT);
    assert!(matches!(outcome, Err(TransportError::TargetUnresolved(name)) if name == "ghost"));

    let outcome = client.send_and_wait("nowhere", payload(&client, b"x"), WAIT);
    assert!(matches!(outcome, Err(TransportError::TargetUnresolved(_))));

    // The peer bounces frames for ids it does not serve.
    let outcome = client.send_and_wait(41, payload(&client, b"x"), WAIT);
    assert!(matches!(outcome, Err(TransportError::TargetUnresolved(name)) if name == "41"));

    assert_eq!(client.stats().operations.live, 0);
    assert_eq!(client.stats().messages.in_use, 0);
    client.shutdown();
    server.shutdown();
}

#[test]
fn exhausted_ttl_is_reported() {
    let network = MemoryNetwork::new();
    let server = server(&network, config());
    let client = node(&network, config(), directory(&["echo"]));

    let (tx, rx) = mpsc::channel();
    let options = SendOptions::new()
        .ttl(0)
        .on_reply(move |r| tx.send(r.map(|_| ())).unwrap());
    client.send("echo", payload(&client, b"x"), options).unwrap();

    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(outcome, Err(TransportError::TtlExpired)));
    client.shutdown();
    server.shutdown();
}

#[test]
fn usage_errors_release_the_message() {
    let network = MemoryNetwork::new();
    let client = node(&network, config(), DirectoryChain::new());

    let outcome = client.send("echo", client.allocate(0), SendOptions::new());
    assert!(matches!(outcome, Err(TransportError::EmptyMessage)));

    let outcome = client.send_and_wait(0, payload(&client, b"x"), WAIT);
    assert!(matches!(outcome, Err(TransportError::InvalidTarget(0))));

    let outcome = client.send(Target::Id(-9), payload(&client, b"x"), SendOptions::new());
    assert!(matches!(outcome, Err(TransportError::InvalidTarget(-9))));

    let outcome = client.listen("udp://127.0.0.1:1");
    assert!(matches!(outcome, Err(TransportError::UnknownScheme(s)) if s == "udp"));

    assert_eq!(client.stats().messages.in_use, 0);
    assert_eq!(client.stats().operations.live, 0);
    client.shutdown();
}

#[test]
fn return_token_without_route_is_refused() {
    let network = MemoryNetwork::new();
    let server = node(&network, config(), DirectoryChain::new());
    server.listen(SERVER).unwrap();
    let (tx, rx) = mpsc::channel::<ReturnToken>();
    let keep = server.clone();
    server
        .register(Registration::new(40).on_receive(move |d| {
            keep.free(d.message).unwrap();
            tx.send(d.reply).unwrap();
        }))
        .unwrap();
    let client = node(&network, config(), directory(&["40"]));

    client.send(40, payload(&client, b"x"), SendOptions::new()).unwrap();
    let token = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(token.route(), 0);

    let outcome = server.send_via_return(payload(&server, b"y"), &token);
    assert!(matches!(outcome, Err(TransportError::MissingRoute)));
    assert_eq!(client.stats().resolves, 0);

    client.shutdown();
    server.shutdown();
}

#[test]
fn bound_client_is_reached_over_its_connection() {
    let network = MemoryNetwork::new();
    let server = node(&network, config(), DirectoryChain::new());
    server.listen(SERVER).unwrap();
    let binder = server.clone();
    server
        .register(Registration::new("login").on_receive(move |d| {
            binder.free(d.message).unwrap();
            binder.bind_client(&d.reply, "desk").unwrap();
            let ack = payload(&binder, b"bound");
            binder.send_via_return(ack, &d.reply).unwrap();
        }))
        .unwrap();

    let client = node(&network, config(), directory(&["login"]));
    let (tx, rx) = mpsc::channel();
    let inbox = client.clone();
    client
        .register(Registration::new("desk").on_receive(move |d| {
            tx.send(d.message.body().to_vec()).unwrap();
            inbox.free(d.message).unwrap();
        }))
        .unwrap();

    let ack = client
        .send_and_wait("login", payload(&client, b"hi"), WAIT)
        .unwrap();
    assert_eq!(ack.body(), b"bound");
    client.free(ack).unwrap();

    server
        .send("desk", payload(&server, b"push"), SendOptions::new())
        .unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), b"push");
    assert_eq!(server.stats().resolves, 1);

    client.shutdown();
    server.shutdown();
}

#[test]
fn proxy_receives_chirps() {
    let network = MemoryNetwork::new();
    let server = node(&network, config(), DirectoryChain::new());
    server.listen(SERVER).unwrap();
    let id = server
        .register(
            Registration::new("beacon")
                .on_receive(|_| {})
                .chirp_every(Some(Duration::from_secs(3600))),
        )
        .unwrap();

    let client = node(&network, config(), DirectoryChain::new());
    assert!(client.liveness(id).is_none());
    client.announce_proxy(SERVER).unwrap();

    assert!(eventually(|| client.liveness(id).is_some()));
    let seen = client.liveness(id).unwrap();
    assert_eq!(seen.name.as_deref(), Some("beacon"));
    assert_eq!(seen.via, SERVER);
    assert_ne!(seen.reported, 0);

    client.shutdown();
    server.shutdown();
}

#[test]
fn queued_deliveries_run_on_donated_threads() {
    let network = MemoryNetwork::new();
    let queued = TransportConfig {
        delivery: DeliveryMode::Queued {
            capacity: 16,
            workers: 0,
        },
        ..config()
    };
    let server = server(&network, queued);
    let donor = {
        let server = server.clone();
        thread::spawn(move || server.serve_deliveries())
    };
    let client = node(&network, config(), directory(&["echo"]));

    let reply = client
        .send_and_wait("echo", payload(&client, b"queued"), WAIT)
        .unwrap();
    assert_eq!(reply.body(), b"queued");
    client.free(reply).unwrap();

    client.shutdown();
    server.shutdown();
    donor.join().unwrap();
}

#[test]
fn lost_connection_fails_pending_replies() {
    let network = MemoryNetwork::new();
    let server = node(&network, config(), DirectoryChain::new());
    server.listen(SERVER).unwrap();
    let silent = server.clone();
    server
        .register(Registration::new("silent").on_receive(move |d| {
            silent.free(d.message).unwrap();
        }))
        .unwrap();
    let client = node(&network, config(), directory(&["silent"]));

    let (tx, rx) = mpsc::channel();
    let options = SendOptions::new()
        .reply_timeout(Duration::from_secs(30))
        .on_reply(move |r| tx.send(r.map(|_| ())).unwrap());
    client.send("silent", payload(&client, b"x"), options).unwrap();
    assert!(eventually(|| client.stats().routes == 1));

    server.shutdown();
    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(outcome, Err(TransportError::NotConnected)));
    assert!(eventually(|| client.stats().links == 0));
    assert_eq!(client.stats().targets, 0);

    client.shutdown();
}

#[test]
fn shutdown_fails_waits_and_refuses_sends() {
    let network = MemoryNetwork::new();
    let server = node(&network, config(), DirectoryChain::new());
    server.listen(SERVER).unwrap();
    let silent = server.clone();
    server
        .register(Registration::new("silent").on_receive(move |d| {
            silent.free(d.message).unwrap();
        }))
        .unwrap();
    let client = node(&network, config(), directory(&["silent"]));

    let waiter = {
        let client = client.clone();
        thread::spawn(move || {
            let body = client.allocate(1);
            client.send_and_wait("silent", body, Some(Duration::from_secs(30)))
        })
    };
    assert!(eventually(|| client.stats().routes == 1));
    client.shutdown();

    assert!(matches!(waiter.join().unwrap(), Err(TransportError::Shutdown)));
    let outcome = client.send("silent", payload(&client, b"x"), SendOptions::new());
    assert!(matches!(outcome, Err(TransportError::Shutdown)));
    assert!(matches!(
        client.register(Registration::new("late")),
        Err(TransportError::Shutdown)
    ));

    server.shutdown();
}

#[test]
fn per_send_connections_are_closed_when_idle() {
    let network = MemoryNetwork::new();
    let server = server(&network, config());
    let mut per_send = config();
    per_send.pool.connection_per_send = true;
    let client = node(&network, per_send, directory(&["echo"]));

    for _ in 0..3 {
        let reply = client
            .send_and_wait("echo", payload(&client, b"once"), WAIT)
            .unwrap();
        client.free(reply).unwrap();
        assert!(eventually(|| client.stats().links == 0));
    }

    client.shutdown();
    server.shutdown();
}

#[test]
fn services_are_unique_and_removable() {
    let network = MemoryNetwork::new();
    let transport = node(&network, config(), DirectoryChain::new());

    assert_eq!(transport.register(Registration::new(12)).unwrap(), 12);
    assert!(matches!(
        transport.register(Registration::new(12)),
        Err(TransportError::DuplicateService(12))
    ));
    assert!(matches!(
        transport.register(Registration::new(0)),
        Err(TransportError::InvalidTarget(0))
    ));

    let named = transport
        .register(Registration::new("worker").listen_on([SERVER]))
        .unwrap();
    assert!(named > 12);
    assert_eq!(transport.listen_urls(), vec![SERVER.to_string()]);
    assert!(matches!(
        transport.register(Registration::new("worker")),
        Err(TransportError::DuplicateName(name)) if name == "worker"
    ));

    transport.unregister(12).unwrap();
    assert!(matches!(
        transport.unregister(12),
        Err(TransportError::UnknownService(_))
    ));
    transport.shutdown();
}

/// Answers the route of `token` with the failure `code`, the way a peer's
/// router does.
fn fail_route(transport: &Transport, token: &ReturnToken, code: ControlCode) {
    let mut answer = transport.allocate(0);
    answer.set_target(code.code());
    answer.set_route(token.route);
    answer.set_token(token.token);
    assert!(token.link.send(answer).is_ok());
}

#[test]
fn peer_route_failures_end_the_wait() {
    let network = MemoryNetwork::new();
    let server = server(&network, config());
    let keep = server.clone();
    server
        .register(Registration::new("refuse").on_receive(move |d| {
            let code = ControlCode::try_from(-i32::from(d.message.body()[0])).unwrap();
            keep.free(d.message).unwrap();
            fail_route(&keep, &d.reply, code);
        }))
        .unwrap();
    let client = node(&network, config(), directory(&["refuse"]));

    let cases = [
        (ControlCode::RouteTimeout, TransportError::RouteTimeout),
        (ControlCode::RouteOverflow, TransportError::RouteOverflow),
        (ControlCode::RouteFailed, TransportError::RouteFailed),
        (ControlCode::TtlExpired, TransportError::TtlExpired),
        (
            ControlCode::UnresolvedTarget,
            TransportError::TargetUnresolved("refuse".into()),
        ),
    ];
    let mut codes = Vec::new();
    for (code, expected) in cases {
        let selector = u8::try_from(-code.code()).unwrap();
        let outcome = client.send_and_wait("refuse", payload(&client, &[selector]), WAIT);
        let err = outcome.unwrap_err();
        assert_eq!(err.code(), expected.code(), "{code:?} ended as {err}");
        codes.push(err.code());
    }
    codes.sort_unstable();
    codes.dedup();
    assert_eq!(codes.len(), 5);

    assert!(eventually(|| client.stats().messages.in_use == 0));
    let stats = client.stats();
    assert_eq!(stats.operations.live, 0);
    assert_eq!(stats.routes, 0);
    assert_eq!(stats.links, 1);

    client.shutdown();
    server.shutdown();
}

#[test]
fn full_route_table_refuses_waits() {
    let network = MemoryNetwork::new();
    let server = server(&network, config());
    let silent = server.clone();
    server
        .register(Registration::new("silent").on_receive(move |d| {
            silent.free(d.message).unwrap();
        }))
        .unwrap();
    let client = node(
        &network,
        TransportConfig {
            max_routes: 1,
            ..config()
        },
        directory(&["echo", "silent"]),
    );

    let reply = client
        .send_and_wait("echo", payload(&client, b"warm"), WAIT)
        .unwrap();
    client.free(reply).unwrap();

    let waiter = {
        let client = client.clone();
        thread::spawn(move || {
            client.send_and_wait(
                "silent",
                payload(&client, b"hold"),
                Some(Duration::from_millis(500)),
            )
        })
    };
    assert!(eventually(|| client.stats().routes == 1));

    let outcome = client.send_and_wait("echo", payload(&client, b"more"), WAIT);
    assert!(matches!(outcome, Err(TransportError::RouteOverflow)));
    assert!(matches!(
        waiter.join().unwrap(),
        Err(TransportError::Timeout)
    ));

    // The table has room again once the held route is gone.
    let reply = client
        .send_and_wait("echo", payload(&client, b"again"), WAIT)
        .unwrap();
    assert_eq!(reply.body(), b"again");
    client.free(reply).unwrap();

    let stats = client.stats();
    assert_eq!(stats.operations.live, 0);
    assert_eq!(stats.routes, 0);
    assert_eq!(stats.messages.in_use, 0);
    client.shutdown();
    server.shutdown();
}

#[test]
fn replies_may_start_with_the_health_marker() {
    let network = MemoryNetwork::new();
    let server = server(&network, config());
    let client = node(&network, config(), directory(&["echo"]));

    let reply = client
        .send_and_wait("echo", payload(&client, b"HB is just data"), WAIT)
        .unwrap();
    assert_eq!(reply.body(), b"HB is just data");
    client.free(reply).unwrap();

    client.shutdown();
    server.shutdown();
}

#[test]
fn answers_from_another_connection_are_ignored() {
    const OTHER: &str = "mem://127.0.0.1:7002";
    let network = MemoryNetwork::new();

    let owner = node(&network, config(), DirectoryChain::new());
    owner.listen(SERVER).unwrap();
    let (held_tx, held_rx) = mpsc::channel::<ReturnToken>();
    let keep = owner.clone();
    owner
        .register(Registration::new("slow").on_receive(move |d| {
            keep.free(d.message).unwrap();
            held_tx.send(d.reply).unwrap();
        }))
        .unwrap();

    let other = node(&network, config(), DirectoryChain::new());
    other.listen(OTHER).unwrap();
    let (seen_tx, seen_rx) = mpsc::channel::<ReturnToken>();
    let keep = other.clone();
    other
        .register(Registration::new("tap").on_receive(move |d| {
            keep.free(d.message).unwrap();
            seen_tx.send(d.reply).unwrap();
        }))
        .unwrap();

    let entries = StaticDirectory::new()
        .with(Entry::new("", "slow", SERVER))
        .with(Entry::new("", "tap", OTHER));
    let client = node(&network, config(), DirectoryChain::new().with(Arc::new(entries)));

    let waiter = {
        let client = client.clone();
        thread::spawn(move || {
            let reply = client.send_and_wait("slow", payload(&client, b"x"), WAIT)?;
            let body = reply.body().to_vec();
            client.free(reply).unwrap();
            Ok::<_, TransportError>(body)
        })
    };
    let held = held_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    client
        .send("tap", payload(&client, b"hi"), SendOptions::new())
        .unwrap();
    let seen = seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Same route and token, but over the link to the other node.
    let forged = ReturnToken {
        link: Arc::clone(&seen.link),
        token: held.token,
        route: held.route,
    };
    other
        .send_via_return(payload(&other, b"forged"), &forged)
        .unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(client.stats().routes, 1);

    owner
        .send_via_return(payload(&owner, b"genuine"), &held)
        .unwrap();
    assert_eq!(waiter.join().unwrap().unwrap(), b"genuine");

    client.shutdown();
    other.shutdown();
    owner.shutdown();
}

mod common;

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use common::{get, init_tracing, local_config, pump, send, spawn_request, wait_for_queue};
use tickserve::{DispatchPolicy, Error, MatchMode, Method, Phase, Server, ServerState};

fn route_list(server: &Server) -> Vec<(String, String, MatchMode)> {
    server
        .routes()
        .iter()
        .map(|r| (r.method().to_string(), r.path().to_owned(), r.mode()))
        .collect()
}

// ── Routing over the wire ─────────────────────────────────────────────────────

#[test]
fn unmatched_request_is_answered_by_the_listener() {
    init_tracing();
    let mut server = Server::new(local_config());
    server
        .register(Method::Get, "/a", MatchMode::Exact, |_, res| res.write_text("a"))
        .unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    // No drain anywhere in this test.
    let res = get(addr, "/nope").unwrap();
    assert_eq!(res.status, 404);
    assert!(res.body.is_empty());

    // Method strings compare exactly.
    let res = send(addr, "get", "/a", &[], "").unwrap();
    assert_eq!(res.status, 404);
    let res = send(addr, "POST", "/a", &[], "x").unwrap();
    assert_eq!(res.status, 404);

    assert!(server.scheduler().is_empty());
    server.stop().unwrap();
}

#[test]
fn exact_and_prefix_routes_on_the_same_path() {
    init_tracing();
    let mut server = Server::new(local_config());
    server
        .register(Method::Get, "/a", MatchMode::Exact, |_, res| res.write_text("exact"))
        .unwrap();
    server
        .register(Method::Get, "/a", MatchMode::Prefix, |_, res| res.write_text("prefix"))
        .unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    for (target, expected) in [("/a", "exact"), ("/A", "exact"), ("/a/b", "prefix"), ("/ab", "prefix")] {
        let res = pump(&server, thread::spawn(move || get(addr, target))).unwrap();
        assert_eq!(res.status, 200, "{target}");
        assert_eq!(res.body, expected, "{target}");
    }

    let res = get(addr, "/b").unwrap();
    assert_eq!(res.status, 404);
    server.stop().unwrap();
}

#[test]
fn handler_sees_query_headers_and_body() {
    init_tracing();
    let mut server = Server::new(local_config());
    server
        .register(Method::Post, "/login", MatchMode::Exact, |req, res| {
            let user = req.query("user").unwrap_or_default().to_owned();
            let agent = req.header("x-agent").unwrap_or_default().to_owned();
            let body = req.text().unwrap_or_default().to_owned();
            res.write_text(&format!("{user}|{agent}|{body}"))
        })
        .unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let client = thread::spawn(move || send(addr, "POST", "/login?user=ada%20l", &[("X-Agent", "probe")], "secret"));
    let res = pump(&server, client).unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(res.body, "ada l|probe|secret");
    assert_eq!(res.header("content-type"), Some("text/plain; charset=utf-8"));
    server.stop().unwrap();
}

#[test]
fn handler_runs_on_the_host_thread() {
    init_tracing();
    let host = thread::current().id();
    let seen = Arc::new(Mutex::new(None));

    let mut server = Server::new(local_config());
    let record = Arc::clone(&seen);
    server
        .register(Method::Get, "/where", MatchMode::Exact, move |_, _| {
            *record.lock().unwrap() = Some(thread::current().id());
        })
        .unwrap();
    server.start().unwrap();

    let res = pump(&server, spawn_request(server.local_addr().unwrap(), "GET", "/where")).unwrap();
    // Left open by the handler, closed at the dispatch boundary.
    assert_eq!(res.status, 200);
    assert_eq!(*seen.lock().unwrap(), Some(host));
    server.stop().unwrap();
}

// ── Dispatch policies ─────────────────────────────────────────────────────────

#[test]
fn fire_and_forget_keeps_accepting_before_any_drain() {
    init_tracing();
    let mut server = Server::new(local_config());
    server
        .register(Method::Get, "/q", MatchMode::Exact, |_, res| res.write_text("ok"))
        .unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let clients: Vec<_> = (0..3).map(|_| spawn_request(addr, "GET", "/q")).collect();
    wait_for_queue(&server, 3);

    for client in clients {
        let res = pump(&server, client).unwrap();
        assert_eq!(res.body, "ok");
    }
    server.stop().unwrap();
}

#[test]
fn blocking_handoff_holds_accept_until_the_handler_runs() {
    init_tracing();
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut server = Server::new(local_config().with_policy(DispatchPolicy::BlockingHandoff));
    for path in ["/first", "/second"] {
        let order = Arc::clone(&order);
        server
            .register(Method::Get, path, MatchMode::Exact, move |req, res| {
                order.lock().unwrap().push(req.path().to_owned());
                res.ok()
            })
            .unwrap();
    }
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let first = spawn_request(addr, "GET", "/first");
    wait_for_queue(&server, 1);
    let second = spawn_request(addr, "GET", "/second");

    // The second request waits its turn while the first is with the host.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(server.scheduler().len(), 1);

    assert_eq!(pump(&server, first).unwrap().status, 200);
    assert_eq!(pump(&server, second).unwrap().status, 200);
    assert_eq!(*order.lock().unwrap(), ["/first", "/second"]);
    server.stop().unwrap();
}

#[test]
fn blocking_handoff_is_not_held_up_by_an_idle_connection() {
    init_tracing();
    let mut server = Server::new(local_config().with_policy(DispatchPolicy::BlockingHandoff));
    server
        .register(Method::Get, "/ready", MatchMode::Exact, |_, res| res.write_text("ready"))
        .unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    // Connects and never sends a request head.
    let idle = TcpStream::connect(addr).unwrap();
    thread::sleep(Duration::from_millis(50));

    // Answered on the listener thread, no drain needed.
    let res = get(addr, "/nope").unwrap();
    assert_eq!(res.status, 404);

    let res = pump(&server, spawn_request(addr, "GET", "/ready")).unwrap();
    assert_eq!(res.body, "ready");

    drop(idle);
    server.stop().unwrap();
}

#[test]
fn percent_encoded_paths_match_decoded_routes() {
    init_tracing();
    let mut server = Server::new(local_config());
    server
        .register(Method::Get, "/café", MatchMode::Exact, |req, res| res.write_text(req.path()))
        .unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let res = pump(&server, spawn_request(addr, "GET", "/caf%C3%A9")).unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(res.body, "/café");
    server.stop().unwrap();
}

#[test]
fn failing_handlers_only_lose_their_own_connection() {
    init_tracing();
    let mut server = Server::new(local_config());
    server
        .register(Method::Get, "/panic", MatchMode::Exact, |_, _| -> () { panic!("boom") })
        .unwrap();
    server
        .register(Method::Get, "/fail", MatchMode::Exact, |_, _| Err::<(), _>("nope"))
        .unwrap();
    server
        .register(Method::Get, "/ok", MatchMode::Exact, |_, res| res.write_text("fine"))
        .unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let panicking = spawn_request(addr, "GET", "/panic");
    wait_for_queue(&server, 1);
    let failing = spawn_request(addr, "GET", "/fail");
    wait_for_queue(&server, 2);
    let fine = spawn_request(addr, "GET", "/ok");
    wait_for_queue(&server, 3);

    // All three run in one drain.
    assert_eq!(server.drain(Phase::First), 3);

    assert!(panicking.join().unwrap().is_err());
    assert!(failing.join().unwrap().is_err());
    assert_eq!(fine.join().unwrap().unwrap().body, "fine");
    server.stop().unwrap();
}

#[test]
fn other_phases_do_not_run_the_queue() {
    init_tracing();
    let mut server = Server::new(local_config().with_phase(Phase::Second));
    server
        .register(Method::Get, "/tick", MatchMode::Exact, |_, res| res.ok())
        .unwrap();
    server.start().unwrap();

    let client = spawn_request(server.local_addr().unwrap(), "GET", "/tick");
    wait_for_queue(&server, 1);
    assert_eq!(server.drain(Phase::First), 0);
    assert_eq!(server.drain(Phase::Third), 0);
    assert_eq!(server.scheduler().len(), 1);

    assert_eq!(pump(&server, client).unwrap().status, 200);
    server.stop().unwrap();
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

#[test]
fn routes_are_frozen_while_running() {
    init_tracing();
    let mut server = Server::new(local_config());
    let handle = server
        .register(Method::Get, "/a", MatchMode::Exact, |_, res| res.ok())
        .unwrap();
    server.start().unwrap();
    let before = route_list(&server);

    let err = server.register(Method::Get, "/b", MatchMode::Exact, |_, res| res.ok());
    assert!(matches!(err, Err(Error::ServerBusy)));
    assert!(matches!(server.unregister(handle), Err(Error::ServerBusy)));
    assert!(matches!(server.routes_mut(), Err(Error::ServerBusy)));
    assert_eq!(route_list(&server), before);

    server.stop().unwrap();
    assert!(server.register(Method::Get, "/b", MatchMode::Exact, |_, res| res.ok()).is_ok());
    assert!(server.unregister(handle).unwrap());
    assert_eq!(server.routes().len(), 1);
}

#[test]
fn start_failure_leaves_the_server_stopped() {
    init_tracing();
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let mut server = Server::new(local_config().with_port(port));
    let err = server.start().unwrap_err();
    assert!(matches!(err, Error::Startup { .. }), "{err}");
    assert!(!server.is_running());
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(server.local_addr(), None);

    // Still configurable after a failed start.
    assert!(server.register(Method::Get, "/", MatchMode::Exact, |_, res| res.ok()).is_ok());
}

#[test]
fn start_and_stop_are_idempotent() {
    init_tracing();
    let mut server = Server::new(local_config());
    server.stop().unwrap();

    server.start().unwrap();
    let addr = server.local_addr();
    assert_eq!(server.state(), ServerState::Listening);
    server.start().unwrap();
    assert_eq!(server.local_addr(), addr);

    server.stop().unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
    server.stop().unwrap();
}

#[test]
fn stop_returns_promptly_and_frees_the_port() {
    init_tracing();
    let mut server = Server::new(local_config());
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let started = Instant::now();
    server.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!server.is_running());

    TcpListener::bind(addr).unwrap();
}

#[test]
fn stop_abandons_in_flight_requests() {
    init_tracing();
    let ran = Arc::new(AtomicUsize::new(0));
    let mut server = Server::new(local_config());
    let counter = Arc::clone(&ran);
    server
        .register(Method::Get, "/slow", MatchMode::Exact, move |_, res| {
            counter.fetch_add(1, Ordering::SeqCst);
            res.write_text("late")
        })
        .unwrap();
    server.start().unwrap();

    let client = spawn_request(server.local_addr().unwrap(), "GET", "/slow");
    wait_for_queue(&server, 1);
    server.stop().unwrap();

    // The client is cut off without a response.
    assert!(client.join().unwrap().is_err());

    // The queued unit still runs and writes into the void.
    assert_eq!(server.drain(Phase::First), 1);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn restart_serves_newly_registered_routes() {
    init_tracing();
    let mut server = Server::new(local_config());
    server
        .register(Method::Get, "/v1", MatchMode::Exact, |_, res| res.write_text("one"))
        .unwrap();
    server.start().unwrap();
    server.stop().unwrap();

    server
        .register(Method::Get, "/v2", MatchMode::Exact, |_, res| res.write_text("two"))
        .unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let res = pump(&server, spawn_request(addr, "GET", "/v2")).unwrap();
    assert_eq!(res.body, "two");
    server.stop().unwrap();
}

#[test]
fn invoker_reaches_the_host_while_serving() {
    init_tracing();
    let mut server = Server::new(local_config());
    server.start().unwrap();
    let invoker = server.invoker();

    let worker = thread::spawn(move || invoker.execute_on_main_thread(|| thread::current().id()));
    let host = pump(&server, worker).unwrap();
    assert_eq!(host, thread::current().id());
    server.stop().unwrap();
}

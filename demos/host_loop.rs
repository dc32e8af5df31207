//! A host that advances in ticks and answers HTTP between them.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example host_loop
//!
//! Try:
//!   curl http://localhost:8080/hello
//!   curl 'http://localhost:8080/login?user=ada&password=hunter2'
//!   curl http://localhost:8080/assets/logo.png
//!   curl -i -X OPTIONS http://localhost:8080/scores
//!   curl -X POST http://localhost:8080/scores -d '{"score":42}'
//!   curl http://localhost:8080/nope          ← 404 from the listener thread

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use serde_json::json;
use tickserve::middleware::cors::CorsOptions;
use tickserve::{Error, MatchMode, Method, Phase, Request, Response, Server, ServerConfig};

const TICK: Duration = Duration::from_millis(16);

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    let mut server = Server::new(config);

    // Host state. Only the host thread writes it; handlers run there too.
    let ticks = Arc::new(AtomicU64::new(0));

    let seen = Arc::clone(&ticks);
    server.register(Method::Get, "/hello", MatchMode::Exact, move |_, res| {
        let tick = seen.load(Ordering::Relaxed);
        res.write_json(format!(r#"{{"message":"Hello World","tick":{tick}}}"#))
    })?;
    server.register(Method::Get, "/login", MatchMode::Exact, login)?;
    server.register(Method::Get, "/assets", MatchMode::Prefix, |req, res| {
        res.write_text(&format!("would serve {}", req.path()))
    })?;
    server.register_cors(Method::Post, "/scores", MatchMode::Exact, |req, res| {
        if req.body().is_empty() {
            return res.bad_request(Some("empty body"));
        }
        res.write_json(req.body())
    }, &CorsOptions::default())?;

    server.start()?;

    // A worker that needs the host thread now and then.
    let invoker = server.invoker();
    let seen = Arc::clone(&ticks);
    thread::spawn(move || loop {
        thread::sleep(Duration::from_secs(5));
        let seen = Arc::clone(&seen);
        match invoker.execute_on_main_thread(move || seen.load(Ordering::Relaxed)) {
            Ok(tick) => tracing::info!(tick, "host checkpoint"),
            Err(_) => break,
        }
    });

    loop {
        ticks.fetch_add(1, Ordering::Relaxed);
        server.drain(Phase::First);
        thread::sleep(TICK);
    }
}

// GET /login?user=..&password=..
fn login(req: &Request, res: &mut Response) -> Result<(), Error> {
    match (req.query("user"), req.query("password")) {
        (Some(user), Some(_)) if !user.is_empty() => res.write_json(json!({ "user": user }).to_string()),
        _ => res.bad_request(Some("user and password are required")),
    }
}

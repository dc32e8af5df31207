#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tickserve::{Server, ServerConfig};

/// A parsed HTTP/1.1 response.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Loopback config on an ephemeral port.
pub fn local_config() -> ServerConfig {
    ServerConfig::default().with_port(0)
}

/// Sends one request and reads until the server closes the connection.
///
/// Errors when the connection closes without any response bytes.
pub fn send(addr: SocketAddr, method: &str, target: &str, headers: &[(&str, &str)], body: &str) -> io::Result<RawResponse> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;

    let mut req = format!(
        "{method} {target} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\nContent-Length: {}\r\n",
        body.len()
    );
    for (name, value) in headers {
        req.push_str(&format!("{name}: {value}\r\n"));
    }
    req.push_str("\r\n");
    req.push_str(body);
    stream.write_all(req.as_bytes())?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;
    parse(&raw)
}

pub fn get(addr: SocketAddr, target: &str) -> io::Result<RawResponse> {
    send(addr, "GET", target, &[], "")
}

/// Runs `send` on a client thread.
pub fn spawn_request(
    addr: SocketAddr,
    method: &'static str,
    target: &'static str,
) -> JoinHandle<io::Result<RawResponse>> {
    thread::spawn(move || send(addr, method, target, &[], ""))
}

/// Plays the host: drains the server's phase until `client` finishes.
pub fn pump<T>(server: &Server, client: JoinHandle<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !client.is_finished() {
        assert!(Instant::now() < deadline, "client did not finish");
        server.drain(server.config().phase);
        thread::sleep(Duration::from_millis(2));
    }
    client.join().expect("client thread panicked")
}

/// Waits, without draining, until at least `n` units are queued.
pub fn wait_for_queue(server: &Server, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while server.scheduler().len() < n {
        assert!(Instant::now() < deadline, "queue never reached {n}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn parse(raw: &[u8]) -> io::Result<RawResponse> {
    if raw.is_empty() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed without a response"));
    }
    let text = String::from_utf8_lossy(raw);
    let (head, body) = text
        .split_once("\r\n\r\n")
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "incomplete response head"))?;

    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad status line"))?;
    let headers = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
        .collect();

    Ok(RawResponse { status, headers, body: body.to_owned() })
}

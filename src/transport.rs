//! Socket drivers feeding raw requests into [`App::handle`].
//!
//! Both drivers read one request per connection, write one response and
//! close. Neither keeps connections alive.

use std::future::Future;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};
use log::{debug, error, warn};
use mio::{Events, Interest, Poll, Token};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task;
use crate::def::*;
use crate::http::App;
use crate::message::*;

const CHUNK: usize = 1024;
const LISTENER: Token = Token(0);
const STREAM: Token = Token(1);

pub trait Transport {
    fn name(&self) -> &'static str;

    /// Serves `app` on `addr` until a fatal error occurs.
    fn run(&self, app: Rc<App>, addr: SocketAddr) -> Result<(), Error>;
}

// whether the buffered bytes hold everything we are going to read
fn complete(raw: &[u8], limit: usize) -> bool {
    raw.len() >= limit || Request::frame_len(raw).map_or(false, |length| raw.len() >= length)
}

// read window that keeps the buffer within `limit`
fn window(raw: &[u8], limit: usize) -> usize {
    CHUNK.min(limit.saturating_sub(raw.len()))
}

/// Bytes to send back, or `None` when the connection should just be closed.
fn respond(app: &App, raw: &[u8]) -> Option<Vec<u8>> {
    match app.handle(raw) {
        Ok(mut response) => Some(response.render()),
        Err(Error::Handler { kind, message, mut response }) => {
            error!("Unhandled {}: {}", kind, message);
            Some(response.render())
        }
        Err(e) => {
            warn!("Dropping connection: {}", e);
            None
        }
    }
}

// accept failures only cost the connection being accepted
async fn accept_next<T, F, Fut>(mut accept: F) -> T
where F: FnMut() -> Fut, Fut: Future<Output = io::Result<T>> {
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => warn!("Failed to accept connection: {}", e)
        }
    }
}

/// Single-threaded cooperative driver on a tokio current-thread runtime.
/// Every connection is its own local task; they interleave only while
/// waiting on socket I/O.
#[derive(Clone, Copy, Debug)]
pub struct Cooperative {
    max_request_size: usize
}

impl Cooperative {
    pub fn new(max_request_size: usize) -> Self {
        Self { max_request_size }
    }

    /// Accept loop. Must run inside a [`task::LocalSet`].
    pub async fn serve(self, app: Rc<App>, listener: tokio::net::TcpListener) {
        loop {
            let (stream, peer) = accept_next(|| listener.accept()).await;
            debug!("Accepted connection from {}", peer);
            let app = Rc::clone(&app);
            task::spawn_local(async move {
                if let Err(e) = self.serve_connection(&app, stream).await {
                    warn!("Connection from {} failed: {}", peer, e);
                }
            });
        }
    }

    async fn serve_connection(self, app: &App, mut stream: tokio::net::TcpStream) -> io::Result<()> {
        let mut raw = Vec::new();
        let mut chunk = [0u8; CHUNK];
        loop {
            let want = window(&raw, self.max_request_size);
            if want == 0 { break }
            let size = stream.read(&mut chunk[..want]).await?;
            if size == 0 { break }
            raw.extend_from_slice(&chunk[..size]);
            if complete(&raw, self.max_request_size) { break }
        }

        if !raw.is_empty() {
            if let Some(bytes) = respond(app, &raw) {
                stream.write_all(&bytes).await?;
            }
        }
        stream.shutdown().await
    }
}

impl Transport for Cooperative {
    fn name(&self) -> &'static str {
        "cooperative"
    }

    fn run(&self, app: Rc<App>, addr: SocketAddr) -> Result<(), Error> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_io().build()?;
        let local = task::LocalSet::new();
        local.block_on(&runtime, async {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            self.serve(app, listener).await;
            Ok::<_, io::Error>(())
        })?;

        Ok(())
    }
}

/// Outcome of one polling tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tick {
    /// Nothing was pending before the accept timeout.
    Idle,
    Served
}

/// Blocking driver: every `period` a tick waits up to `accept_timeout` for
/// a connection and serves it to completion before returning.
#[derive(Clone, Copy, Debug)]
pub struct Polling {
    period: Duration,
    accept_timeout: Duration,
    io_timeout: Duration,
    max_request_size: usize
}

impl Polling {
    pub fn new(period: Duration, accept_timeout: Duration) -> Self {
        Self { period, accept_timeout, io_timeout: Duration::from_secs(1), max_request_size: 8192 }
    }

    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn with_max_request_size(mut self, max_request_size: usize) -> Self {
        self.max_request_size = max_request_size;
        self
    }

    pub fn bind(&self, addr: SocketAddr) -> io::Result<Poller> {
        let poll = Poll::new()?;
        let mut listener = mio::net::TcpListener::bind(addr)?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
        Ok(Poller { poll, events: Events::with_capacity(16), listener, settings: *self })
    }
}

impl Default for Polling {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(100))
    }
}

impl Transport for Polling {
    fn name(&self) -> &'static str {
        "polling"
    }

    fn run(&self, app: Rc<App>, addr: SocketAddr) -> Result<(), Error> {
        let mut poller = self.bind(addr)?;
        loop {
            let started = Instant::now();
            if let Err(e) = poller.tick(&app) {
                warn!("Polling tick failed: {}", e);
            }
            if let Some(rest) = self.period.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }
    }
}

/// A bound listener driven one tick at a time.
pub struct Poller {
    poll: Poll,
    events: Events,
    listener: mio::net::TcpListener,
    settings: Polling
}

impl Poller {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    // accept whatever is already queued, otherwise wait up to the timeout
    fn accept(&mut self) -> io::Result<Option<(mio::net::TcpStream, SocketAddr)>> {
        match self.listener.accept() {
            Ok(accepted) => return Ok(Some(accepted)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(e)
        }

        match self.poll.poll(&mut self.events, Some(self.settings.accept_timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(e)
        }
        if self.events.is_empty() { return Ok(None) }

        match self.listener.accept() {
            Ok(accepted) => Ok(Some(accepted)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e)
        }
    }

    pub fn tick(&mut self, app: &App) -> Result<Tick, Error> {
        let (stream, peer) = match self.accept()? {
            Some(accepted) => accepted,
            None => return Ok(Tick::Idle)
        };
        debug!("Accepted connection from {}", peer);

        let mut connection = Connection::open(stream, self.settings.io_timeout)?;
        let raw = connection.read_request(self.settings.max_request_size)?;
        if !raw.is_empty() {
            if let Some(bytes) = respond(app, &raw) {
                connection.write_all(&bytes)?;
            }
        }

        Ok(Tick::Served)
    }
}

/// Accepted stream with its own poll; deregistered and shut down on drop.
struct Connection {
    poll: Poll,
    events: Events,
    stream: mio::net::TcpStream,
    timeout: Duration
}

impl Connection {
    fn open(mut stream: mio::net::TcpStream, timeout: Duration) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry().register(&mut stream, STREAM, Interest::READABLE | Interest::WRITABLE)?;
        Ok(Self { poll, events: Events::with_capacity(4), stream, timeout })
    }

    fn wait(&mut self) -> io::Result<()> {
        self.poll.poll(&mut self.events, Some(self.timeout))?;
        if self.events.is_empty() {
            return Err(io::Error::new(ErrorKind::TimedOut, "connection stalled"));
        }
        Ok(())
    }

    fn read_request(&mut self, limit: usize) -> io::Result<Vec<u8>> {
        let mut raw = Vec::new();
        let mut chunk = [0u8; CHUNK];
        loop {
            let want = window(&raw, limit);
            if want == 0 { break }
            match self.stream.read(&mut chunk[..want]) {
                Ok(0) => break,
                Ok(size) => {
                    raw.extend_from_slice(&chunk[..size]);
                    if complete(&raw, limit) { break }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => self.wait()?,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e)
            }
        }

        Ok(raw)
    }

    fn write_all(&mut self, mut bytes: &[u8]) -> io::Result<()> {
        while !bytes.is_empty() {
            match self.stream.write(bytes) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(size) => bytes = &bytes[size..],
                Err(e) if e.kind() == ErrorKind::WouldBlock => self.wait()?,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e)
            }
        }

        self.stream.flush()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.poll.registry().deregister(&mut self.stream);
        let _ = self.stream.shutdown(Shutdown::Both);
        debug!("Closed connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use serde_json::json;

    fn app() -> Rc<App> {
        let mut app = App::new("transport");
        app.route("/", &["GET"], |_, _| Ok(json!({"hello": "world"}))).unwrap();
        app.route("/echo", &["POST"], |app, _| Ok(app.request().map(|r| r.body.clone()).unwrap_or_default())).unwrap();
        Rc::new(app)
    }

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn polling() -> Polling {
        Polling::new(Duration::from_millis(10), Duration::from_millis(20))
    }

    #[test]
    fn polling_tick_without_connection_is_idle() {
        let mut poller = polling().bind(localhost()).unwrap();
        assert_eq!(poller.tick(&app()).unwrap(), Tick::Idle);
        assert_eq!(poller.tick(&app()).unwrap(), Tick::Idle);
    }

    #[test]
    fn polling_tick_serves_pending_connection() {
        let mut poller = polling().bind(localhost()).unwrap();
        let mut client = TcpStream::connect(poller.local_addr().unwrap()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 4\r\n\r\nping").unwrap();

        assert_eq!(serve_one(&mut poller, &app()), Tick::Served);

        let mut response = String::new();
        client.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\nping\r\n"));
    }

    #[test]
    fn polling_closes_connection_on_parse_failure() {
        let mut poller = polling().bind(localhost()).unwrap();
        let mut client = TcpStream::connect(poller.local_addr().unwrap()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"garbage\r\n\r\n").unwrap();

        assert_eq!(serve_one(&mut poller, &app()), Tick::Served);

        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert!(response.is_empty());
    }

    fn serve_one(poller: &mut Poller, app: &App) -> Tick {
        let mut tick = poller.tick(app).unwrap();
        for _ in 0..10 {
            if tick == Tick::Served { break }
            tick = poller.tick(app).unwrap();
        }
        tick
    }

    // head announcing more body than fits, padded to exactly `limit` bytes
    fn truncated_request(limit: usize) -> (Vec<u8>, String) {
        let head = "POST /echo HTTP/1.1\r\nContent-Length: 200\r\n\r\n";
        let body = "a".repeat(limit - head.len());
        (format!("{}{}", head, body).into_bytes(), body)
    }

    #[test]
    fn read_window_stops_at_limit() {
        assert_eq!(window(&[], 8192), CHUNK);
        assert_eq!(window(&[0; 60], 64), 4);
        assert_eq!(window(&[0; 70], 64), 0);
    }

    #[test]
    fn polling_survives_huge_content_length() {
        let mut poller = polling().bind(localhost()).unwrap();
        let mut client = TcpStream::connect(poller.local_addr().unwrap()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\nping").unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        let app = app();
        assert_eq!(serve_one(&mut poller, &app), Tick::Served);

        let mut response = String::new();
        client.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\nping\r\n"));
    }

    #[test]
    fn polling_stops_reading_at_max_request_size() {
        let mut poller = polling().with_max_request_size(64).bind(localhost()).unwrap();
        let mut client = TcpStream::connect(poller.local_addr().unwrap()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let (raw, body) = truncated_request(64);
        client.write_all(&raw).unwrap();

        assert_eq!(serve_one(&mut poller, &app()), Tick::Served);

        let mut response = String::new();
        client.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with(&format!("\r\n\r\n{}\r\n", body)));
    }

    #[tokio::test]
    async fn accept_keeps_going_after_failures() {
        let mut failures = 2;
        let accepted = accept_next(|| {
            let result = if failures > 0 {
                failures -= 1;
                Err(io::Error::from(ErrorKind::ConnectionAborted))
            } else {
                Ok(7)
            };
            async move { result }
        }).await;
        assert_eq!(accepted, 7);
        assert_eq!(failures, 0);
    }

    #[tokio::test]
    async fn cooperative_stops_reading_at_max_request_size() {
        let local = task::LocalSet::new();
        local.run_until(async {
            let listener = tokio::net::TcpListener::bind(localhost()).await.unwrap();
            let addr = listener.local_addr().unwrap();
            task::spawn_local(Cooperative::new(64).serve(app(), listener));

            let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
            let (raw, body) = truncated_request(64);
            client.write_all(&raw).await.unwrap();

            let mut response = String::new();
            client.read_to_string(&mut response).await.unwrap();
            assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
            assert!(response.ends_with(&format!("\r\n\r\n{}\r\n", body)));
        }).await;
    }

    #[tokio::test]
    async fn cooperative_survives_huge_content_length() {
        let local = task::LocalSet::new();
        local.run_until(async {
            let listener = tokio::net::TcpListener::bind(localhost()).await.unwrap();
            let addr = listener.local_addr().unwrap();
            task::spawn_local(Cooperative::new(8192).serve(app(), listener));

            let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
            client.write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\nping").await.unwrap();
            client.shutdown().await.unwrap();

            let mut response = String::new();
            client.read_to_string(&mut response).await.unwrap();
            assert!(response.ends_with("\r\n\r\nping\r\n"));

            let mut next = tokio::net::TcpStream::connect(addr).await.unwrap();
            next.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
            let mut response = String::new();
            next.read_to_string(&mut response).await.unwrap();
            assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        }).await;
    }

    #[tokio::test]
    async fn cooperative_serves_overlapping_connections() {
        let local = task::LocalSet::new();
        local.run_until(async {
            let listener = tokio::net::TcpListener::bind(localhost()).await.unwrap();
            let addr = listener.local_addr().unwrap();
            task::spawn_local(Cooperative::new(8192).serve(app(), listener));

            let mut first = tokio::net::TcpStream::connect(addr).await.unwrap();
            let mut second = tokio::net::TcpStream::connect(addr).await.unwrap();
            first.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n").await.unwrap();
            second.write_all(b"GET /missing HTTP/1.1\r\n\r\n").await.unwrap();
            first.write_all(b"\r\n").await.unwrap();

            let mut response = String::new();
            first.read_to_string(&mut response).await.unwrap();
            assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
            assert!(response.contains("content-type: application/json\r\n"));
            assert!(response.contains("\r\n\r\n{\"hello\":\"world\"}\r\n"));

            let mut response = String::new();
            second.read_to_string(&mut response).await.unwrap();
            assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
            assert!(response.contains("No route found for request GET /missing"));
        }).await;
    }
}

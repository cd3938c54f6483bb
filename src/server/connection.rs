use std::{io, net::IpAddr};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time,
};
use tokio_rustls::{TlsAcceptor, server::TlsStream};

use codec::{HEAD_DELIMITER, HeaderMap};
use service::{Address, pool};

use super::{Environment, responses};

/// Upper bound on a request head. A buffer that grows past this without a
/// head terminator gets a 431 and the connection is closed.
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Transport setup that precedes the first request on a client socket.
///
/// The proxy drives a TLS accept here; tests substitute a plain stream. The
/// handshake is the connection's first suspension point and runs under the
/// same idle timeout as everything else.
pub trait Handshake {
    type Stream: AsyncRead + AsyncWrite + Unpin;

    async fn handshake(self) -> io::Result<Self::Stream>;
}

impl Handshake for (TlsAcceptor, TcpStream) {
    type Stream = TlsStream<TcpStream>;

    async fn handshake(self) -> io::Result<Self::Stream> {
        self.0.accept(self.1).await
    }
}

/// Where a connection currently is in its request cycle.
///
/// `WriteClient` loops back to `ReadRequest` on keep-alive, `Cleanup` is
/// absorbing. All other transitions only ever move forward through the
/// cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadRequest,
    ConnectBackend,
    WriteBackend,
    ReadBackend,
    WriteClient,
    Cleanup,
}

/// Accumulated bytes and the one-shot parse result for one direction of an
/// exchange.
#[derive(Default)]
struct Exchange {
    buffer: BytesMut,
    /// Bytes before the head terminator, valid once `parsed` is set.
    head_length: usize,
    content_length: usize,
    parsed: bool,
    line: String,
    headers: HeaderMap,
}

impl Exchange {
    fn find_head(&self) -> Option<usize> {
        self.buffer
            .windows(HEAD_DELIMITER.len())
            .position(|it| it == HEAD_DELIMITER)
    }

    /// Head, terminator and declared body together.
    fn total_size(&self) -> usize {
        self.head_length + HEAD_DELIMITER.len() + self.content_length
    }

    fn body(&self) -> &[u8] {
        &self.buffer[self.head_length + HEAD_DELIMITER.len()..self.total_size()]
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

struct Backend {
    address: Address,
    stream: TcpStream,
    /// Set while a request/response exchange is in flight. A busy stream
    /// never goes back to the pool, its wire state is unknown.
    busy: bool,
}

/// The per-client state machine.
///
/// One instance per accepted socket, driven by a single cooperative task.
/// Every read, write and connect suspends on readiness and is bounded by
/// the keep-alive timeout; an expiry closes the connection without a
/// response. The shared services arrive through the [`Environment`] handle.
pub struct Connection<S> {
    environment: Environment,
    client: S,
    client_ip: IpAddr,
    state: State,
    backend: Option<Backend>,
    request: Exchange,
    response: Exchange,
    /// Rewritten request bytes headed for the backend.
    outbound: Bytes,
    /// Response bytes staged for the client.
    staged: Bytes,
    method: String,
    path: String,
    accepts_gzip: bool,
    keepalive: bool,
    retries: u32,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Accept a client: run the transport handshake, then drive the state
    /// machine until cleanup.
    pub async fn open<H>(handshaker: H, client_ip: IpAddr, environment: Environment)
    where
        H: Handshake<Stream = S>,
    {
        let client = match time::timeout(environment.keepalive, handshaker.handshake()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                log::debug!("handshake failed: ip={client_ip}, err={e}");
                return;
            }
            Err(_) => {
                log::debug!("handshake timed out: ip={client_ip}");
                return;
            }
        };

        Self {
            environment,
            client,
            client_ip,
            state: State::ReadRequest,
            backend: None,
            request: Exchange::default(),
            response: Exchange::default(),
            outbound: Bytes::new(),
            staged: Bytes::new(),
            method: String::new(),
            path: String::new(),
            accepts_gzip: false,
            keepalive: false,
            retries: 0,
        }
        .run()
        .await;
    }

    async fn run(mut self) {
        while self.state != State::Cleanup {
            self.state = match self.state {
                State::ReadRequest => self.read_request().await,
                State::ConnectBackend => self.connect_backend().await,
                State::WriteBackend => self.write_backend().await,
                State::ReadBackend => self.read_backend().await,
                State::WriteClient => self.write_client().await,
                State::Cleanup => State::Cleanup,
            };
        }

        self.close().await;
    }

    /// Read until a complete request (head and declared body) is buffered,
    /// then hand it onwards. Cache hits and malformed requests leave early
    /// with a staged response.
    async fn read_request(&mut self) -> State {
        loop {
            let read = self.client.read_buf(&mut self.request.buffer);
            match time::timeout(self.environment.keepalive, read).await {
                Err(_) => {
                    log::debug!("client idle timeout: ip={}", self.client_ip);
                    return State::Cleanup;
                }
                Ok(Err(e)) => {
                    log::debug!("client read failed: ip={}, err={e}", self.client_ip);
                    return State::Cleanup;
                }
                Ok(Ok(0)) => return State::Cleanup,
                Ok(Ok(_)) => {}
            }

            if !self.request.parsed {
                match self.request.find_head() {
                    Some(head_length) => {
                        if let Some(next) = self.parse_request_head(head_length) {
                            return next;
                        }
                    }
                    None => {
                        if self.request.buffer.len() > MAX_HEAD_SIZE {
                            log::warn!("request head too large: ip={}", self.client_ip);
                            self.keepalive = false;
                            self.staged = responses::header_too_large();
                            return State::WriteClient;
                        }

                        continue;
                    }
                }
            }

            if self.request.parsed && self.request.buffer.len() >= self.request.total_size() {
                let next = self.finalize_request();

                // Keep-alive may have left a backend stream attached. It is
                // only worth writing to when it survived the gap between
                // requests, otherwise it goes back through selection.
                if next == State::WriteBackend && !self.backend_alive().await {
                    self.close_backend();
                    return State::ConnectBackend;
                }

                return next;
            }
        }
    }

    /// One-shot head parse. `None` means the request is fine and the body
    /// may still be in flight; `Some` carries the early exit.
    fn parse_request_head(&mut self, head_length: usize) -> Option<State> {
        self.request.head_length = head_length;

        let (line, mut headers) = match codec::parse_request(&self.request.buffer[..head_length]) {
            Ok(it) => it,
            Err(e) => {
                log::warn!("request head unparseable: ip={}, err={e}", self.client_ip);
                self.keepalive = false;
                self.staged = responses::bad_request();
                return Some(State::WriteClient);
            }
        };

        let mut tokens = line.split_whitespace();
        let method = tokens.next().unwrap_or_default().to_string();
        let path = tokens.next().unwrap_or_default().to_string();
        let version = tokens.next().unwrap_or_default();

        if version != "HTTP/1.1" {
            log::warn!("unsupported version: ip={}, version={version}", self.client_ip);
            self.keepalive = false;
            self.staged = responses::version_not_supported();
            return Some(State::WriteClient);
        }

        self.request.content_length = headers
            .get_ignore_case("content-length")
            .and_then(|it| it.trim().parse().ok())
            .unwrap_or(0);

        // Connection is hop-by-hop: remember the client's wish, then strip
        // it from what goes to the backend.
        self.keepalive = headers
            .get_ignore_case("connection")
            .map(|it| !it.eq_ignore_ascii_case("close"))
            .unwrap_or(true);
        headers.remove_ignore_case("connection");

        self.accepts_gzip = headers
            .get_ignore_case("accept-encoding")
            .map(|it| it.to_ascii_lowercase().contains("gzip"))
            .unwrap_or(false);

        self.method = method;
        self.path = path;
        self.request.line = line;
        self.request.headers = headers;
        self.request.parsed = true;

        if let Some(cached) = self.environment.cache.get(&self.method, &self.path) {
            log::debug!("cache hit: method={}, path={}", self.method, self.path);
            self.staged = cached;
            return Some(State::WriteClient);
        }

        None
    }

    /// The full request is buffered: append the forwarding headers, rebuild
    /// the wire form and decide how to reach a backend.
    fn finalize_request(&mut self) -> State {
        let forwarded_for = self.client_ip.to_string();
        self.request.headers.insert("X-Forwarded-For", &forwarded_for);
        self.request.headers.insert("X-Forwarded-Proto", "https");

        self.outbound = codec::reconstruct_request(
            &self.request.line,
            &self.request.headers,
            self.request.body(),
        );

        if self.backend.is_some() {
            State::WriteBackend
        } else {
            State::ConnectBackend
        }
    }

    async fn backend_alive(&self) -> bool {
        match &self.backend {
            Some(backend) => pool::is_alive(&backend.stream).await,
            None => false,
        }
    }

    /// Ask the balancer for a backend and fetch a connection, retrying
    /// against fresh selections until the retry budget runs out. Repeatedly
    /// failing addresses get evicted along the way.
    async fn connect_backend(&mut self) -> State {
        loop {
            let address = match self.environment.balancer.get_server(&self.client_ip.to_string()) {
                Ok(address) => address,
                Err(e) => {
                    log::warn!("backend selection failed: ip={}, err={e}", self.client_ip);

                    // An empty registry on the first attempt means nothing
                    // was ever reachable. Mid-retry it means the candidates
                    // were just evicted under this request, which reads as
                    // a gateway failure to the client.
                    self.staged = if self.retries == 0 {
                        responses::service_unavailable()
                    } else {
                        responses::bad_gateway()
                    };

                    return State::WriteClient;
                }
            };

            self.environment.balancer.increment(&address);

            let fetch = self.environment.pool.get(&address);
            match time::timeout(self.environment.keepalive, fetch).await {
                Ok(Ok(stream)) => {
                    self.environment.failures.reset(&address);
                    log::debug!("backend connected: addr={address}");

                    self.backend = Some(Backend {
                        address,
                        stream,
                        busy: true,
                    });

                    return State::WriteBackend;
                }
                result => {
                    match result {
                        Ok(Err(e)) => log::warn!("backend connect failed: addr={address}, err={e}"),
                        _ => log::warn!("backend connect timed out: addr={address}"),
                    }

                    self.environment.balancer.decrement(&address);

                    let failures = self.environment.failures.record(&address);
                    if failures >= self.environment.failure_threshold {
                        log::warn!("evicting failing backend: addr={address}, failures={failures}");
                        self.environment.balancer.remove_server(&address);
                        self.environment.failures.reset(&address);
                    }

                    if self.retries < self.environment.max_retries {
                        self.retries += 1;
                        log::debug!("retrying backend connect: attempt={}", self.retries);
                        continue;
                    }

                    self.staged = responses::bad_gateway();
                    return State::WriteClient;
                }
            }
        }
    }

    /// Drain the rewritten request into the backend stream.
    async fn write_backend(&mut self) -> State {
        let mut outbound = std::mem::take(&mut self.outbound);

        let Some(backend) = self.backend.as_mut() else {
            self.staged = responses::bad_gateway();
            return State::WriteClient;
        };

        backend.busy = true;
        let address = backend.address.clone();

        let write = backend.stream.write_all_buf(&mut outbound);
        match time::timeout(self.environment.keepalive, write).await {
            Ok(Ok(())) => State::ReadBackend,
            Ok(Err(e)) => {
                log::warn!("backend write failed: addr={address}, err={e}");
                self.close_backend();
                self.staged = responses::bad_gateway();
                State::WriteClient
            }
            Err(_) => {
                log::warn!("backend write timed out: addr={address}");
                self.close_backend();
                self.staged = responses::bad_gateway();
                State::WriteClient
            }
        }
    }

    /// Buffer the backend's reply until head and declared body are in, then
    /// rewrite and stage it. A backend that dies before producing a head is
    /// a 502; one that dies mid-body gets its partial reply forwarded
    /// untouched.
    async fn read_backend(&mut self) -> State {
        loop {
            let Some(backend) = self.backend.as_mut() else {
                self.staged = responses::bad_gateway();
                return State::WriteClient;
            };

            let address = backend.address.clone();

            let read = backend.stream.read_buf(&mut self.response.buffer);
            let received = match time::timeout(self.environment.keepalive, read).await {
                Err(_) => {
                    log::debug!("backend idle timeout: addr={address}");
                    return State::Cleanup;
                }
                Ok(Err(e)) => {
                    log::warn!("backend read failed: addr={address}, err={e}");
                    self.close_backend();
                    self.staged = responses::bad_gateway();
                    return State::WriteClient;
                }
                Ok(Ok(received)) => received,
            };

            if received == 0 {
                self.close_backend();

                if self.response.parsed {
                    // Truncated body, forward whatever arrived.
                    log::warn!("backend closed mid body: addr={address}");
                    self.staged = self.response.buffer.split().freeze();
                } else {
                    log::warn!("backend closed before response head: addr={address}");
                    self.staged = responses::bad_gateway();
                }

                return State::WriteClient;
            }

            if !self.response.parsed
                && let Some(head_length) = self.response.find_head()
            {
                self.response.head_length = head_length;

                match codec::parse_response(&self.response.buffer[..head_length]) {
                    Ok((line, headers)) => {
                        self.response.content_length = headers
                            .get_ignore_case("content-length")
                            .and_then(|it| it.trim().parse().ok())
                            .unwrap_or(0);

                        self.response.line = line;
                        self.response.headers = headers;
                        self.response.parsed = true;
                    }
                    Err(e) => {
                        log::warn!("backend head unparseable: addr={address}, err={e}");
                        self.close_backend();
                        self.staged = responses::bad_gateway();
                        return State::WriteClient;
                    }
                }
            }

            if self.response.parsed && self.response.buffer.len() >= self.response.total_size() {
                return self.finalize_response();
            }
        }
    }

    /// Optionally gzip, optionally memoize, then stage the final bytes.
    fn finalize_response(&mut self) -> State {
        let mut body = self.response.body().to_vec();

        if self.accepts_gzip && !self.response.headers.contains_ignore_case("content-encoding") {
            match codec::compress(&body) {
                Ok(compressed) => {
                    body = compressed;
                    self.response.headers.set("Content-Encoding", "gzip");
                    self.response.headers.set("Content-Length", &body.len().to_string());
                }
                Err(e) => log::warn!("compression failed, forwarding identity: err={e}"),
            }
        }

        let message =
            codec::reconstruct_response(&self.response.line, &self.response.headers, &body);

        if let Some(directives) = self.response.headers.get_ignore_case("cache-control") {
            let max_age = codec::cache_control_max_age(directives);
            if max_age > 0 {
                self.environment
                    .cache
                    .put(&self.method, &self.path, message.clone(), max_age);
            }
        }

        // The exchange is complete, the stream may be pooled again.
        if let Some(backend) = self.backend.as_mut() {
            backend.busy = false;
        }

        self.staged = message;
        State::WriteClient
    }

    /// Drain the staged response. Keep-alive clients loop back for their
    /// next request with fresh per-request state, everyone else is done.
    async fn write_client(&mut self) -> State {
        let mut staged = std::mem::take(&mut self.staged);

        let write = self.client.write_all_buf(&mut staged);
        match time::timeout(self.environment.keepalive, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::debug!("client write failed: ip={}, err={e}", self.client_ip);
                return State::Cleanup;
            }
            Err(_) => {
                log::debug!("client write timed out: ip={}", self.client_ip);
                return State::Cleanup;
            }
        }

        if self.keepalive {
            log::debug!("keep-alive, awaiting next request: ip={}", self.client_ip);
            self.reset();
            return State::ReadRequest;
        }

        State::Cleanup
    }

    /// Per-request state only: the client stream, the keep-alive flag and
    /// any attached backend survive into the next request.
    fn reset(&mut self) {
        self.request.reset();
        self.response.reset();
        self.outbound = Bytes::new();
        self.staged = Bytes::new();
        self.method.clear();
        self.path.clear();
        self.accepts_gzip = false;
        self.retries = 0;
    }

    /// Detach and close the backend stream, releasing its selection count.
    fn close_backend(&mut self) {
        if let Some(backend) = self.backend.take() {
            self.environment.balancer.decrement(&backend.address);
        }
    }

    async fn close(&mut self) {
        if let Some(backend) = self.backend.take() {
            self.environment.balancer.decrement(&backend.address);

            if !backend.busy {
                self.environment.pool.put(backend.address, backend.stream);
            }
        }

        let _ = self.client.shutdown().await;
        log::debug!("connection closed: ip={}", self.client_ip);
    }
}

//! The gateway server: listener lifecycle and the request pipeline
//!
//! Every accepted connection is served on its own task. A request captures
//! one snapshot of the live [`ProxyState`](crate::service::ProxyState) and
//! runs the gates strictly in order: host resolution, routing, auth, rate
//! limit, forwarding, relay. The first failing gate terminates the request
//! with its status code; every branch emits exactly one log line.

use crate::error::{empty_response, text_response};
use crate::service::{snapshot, ProxyState, SharedState};
use crate::token;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::{HeaderValue, AUTHORIZATION, HOST};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// The gateway server owning the listener and the drain procedure
pub struct ProxyServer {
    bind_addr: SocketAddr,
    state: SharedState,
    shutdown_rx: watch::Receiver<bool>,
    shutdown_timeout: Duration,
    forward_timeout: Option<Duration>,
    client: Client<HttpConnector, Incoming>,
    in_flight: Arc<AtomicUsize>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        state: SharedState,
        shutdown_rx: watch::Receiver<bool>,
        shutdown_timeout: Duration,
        forward_timeout: Option<Duration>,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            bind_addr,
            state,
            shutdown_rx,
            shutdown_timeout,
            forward_timeout,
            client,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bind and serve until the shutdown channel fires, then drain.
    ///
    /// Bind and accept failures propagate to the caller; a clean shutdown
    /// returns `Ok` even when the drain deadline was exceeded.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "gateway listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, addr) = result?;
                    let state = Arc::clone(&self.state);
                    let client = self.client.clone();
                    let in_flight = Arc::clone(&self.in_flight);
                    let forward_timeout = self.forward_timeout;

                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, addr, state, client, in_flight, forward_timeout).await
                        {
                            debug!(addr = %addr, error = %e, "connection error");
                        }
                    });
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("gateway shutting down, no longer accepting connections");
                        break;
                    }
                }
            }
        }

        drop(listener);
        self.drain().await;
        Ok(())
    }

    /// Wait for in-flight requests to finish, bounded by the deadline
    async fn drain(&self) {
        let deadline = Instant::now() + self.shutdown_timeout;
        info!(
            timeout_s = self.shutdown_timeout.as_secs(),
            "draining in-flight requests"
        );

        loop {
            let remaining = self.in_flight.load(Ordering::Acquire);
            if remaining == 0 {
                info!("drain complete");
                return;
            }
            if Instant::now() >= deadline {
                warn!(remaining, "shutdown deadline exceeded, terminating");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Decrements the in-flight counter when a request finishes, whichever
/// gate it ends at. For relayed responses the guard rides inside the
/// response body, so the request stays in flight until the last byte has
/// been streamed to the client.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A response body that holds its request's in-flight guard until it is
/// fully written or dropped
struct TrackedBody {
    inner: BoxBody<Bytes, hyper::Error>,
    _guard: InFlightGuard,
}

impl Body for TrackedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    shared: SharedState,
    client: Client<HttpConnector, Incoming>,
    in_flight: Arc<AtomicUsize>,
    forward_timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        // One consistent state snapshot per request
        let state = snapshot(&shared);
        let client = client.clone();
        let guard = InFlightGuard::enter(Arc::clone(&in_flight));
        async move {
            let response = handle_request(req, state, client, addr, forward_timeout).await?;
            Ok::<_, hyper::Error>(
                response.map(|inner| TrackedBody { inner, _guard: guard }.boxed()),
            )
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;

    Ok(())
}

/// The five pipeline gates, strictly in order
async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    client: Client<HttpConnector, Incoming>,
    remote_addr: SocketAddr,
    forward_timeout: Option<Duration>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let method = req.method().clone();
    let declared_host = declared_host(&req);
    let uri = req.uri().clone();

    // Host resolution: the Host value up to the first colon; an empty or
    // missing host falls through as a registry miss
    let host = declared_host.split(':').next().unwrap_or("").to_string();

    let service = match state.registry.get(&host) {
        Some(service) => service,
        None => {
            info!(
                method = %method, host = %declared_host, uri = %uri,
                remote = %remote_addr, status = 403,
                "service not configured"
            );
            return Ok(empty_response(StatusCode::FORBIDDEN));
        }
    };

    if service.auth_required {
        let header = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if let Err(e) = token::validate(&state.secret, &state.service_name, &state.revoked, header)
        {
            info!(
                method = %method, host = %declared_host, uri = %uri,
                remote = %remote_addr, status = 407, reason = %e,
                "proxy authentication required"
            );
            return Ok(empty_response(StatusCode::PROXY_AUTHENTICATION_REQUIRED));
        }
    }

    if !service.allow() {
        info!(
            method = %method, host = %declared_host, uri = %uri,
            remote = %remote_addr, status = 429,
            "rate limit exceeded"
        );
        return Ok(empty_response(StatusCode::TOO_MANY_REQUESTS));
    }

    // Rewrite the request against the backend target, keeping the original
    // path, query, method, headers and body
    let authority = service
        .target
        .authority()
        .map(|a| a.as_str().to_string())
        .unwrap_or_default();
    let scheme = service.target.scheme_str().unwrap_or("http");
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let target_uri = format!("{}://{}{}", scheme, authority, path_and_query);

    let (mut parts, body) = req.into_parts();
    parts.uri = match target_uri.parse::<Uri>() {
        Ok(target) => target,
        Err(e) => {
            info!(
                method = %method, host = %declared_host, uri = %uri,
                remote = %remote_addr, status = 500, error = %e,
                "failed to build backend uri"
            );
            return Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
            ));
        }
    };
    if let Ok(value) = HeaderValue::from_str(&authority) {
        parts.headers.insert(HOST, value);
    }
    if let Some(auth) = &service.basic_auth {
        if let Ok(value) = HeaderValue::from_str(&auth.header_value()) {
            parts.headers.insert(AUTHORIZATION, value);
        }
    }
    let outbound = Request::from_parts(parts, body);

    // Single attempt against the backend, bounded when a timeout is set
    let result = match forward_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, client.request(outbound)).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!(
                "request to {} timed out after {}s",
                authority,
                timeout.as_secs()
            )),
        },
        None => client.request(outbound).await.map_err(|e| e.to_string()),
    };

    match result {
        Ok(response) => {
            // The relay step records 200 regardless of the backend status
            info!(
                method = %method, host = %declared_host, uri = %uri,
                remote = %remote_addr, status = 200,
                "request forwarded"
            );
            let (parts, body) = response.into_parts();
            Ok(Response::from_parts(parts, body.boxed()))
        }
        Err(e) => {
            info!(
                method = %method, host = %declared_host, uri = %uri,
                remote = %remote_addr, status = 500, error = %e,
                "backend request failed"
            );
            Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, e))
        }
    }
}

/// The host the client addressed, from the Host header or, for HTTP/2,
/// the request authority
fn declared_host<B>(req: &Request<B>) -> String {
    if let Some(host) = req.headers().get(HOST).and_then(|h| h.to_str().ok()) {
        return host.to_string();
    }
    req.uri().host().unwrap_or("").to_string()
}

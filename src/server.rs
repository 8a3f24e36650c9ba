//! The service runner: middleware chain, HTTP server, graceful shutdown.
//!
//! # Shutdown
//!
//! [`Service::listen_and_serve`] blocks until the process receives
//! **SIGTERM** (sent by Kubernetes and most supervisors) or **SIGINT**
//! (Ctrl-C), or until the listener cannot be bound. On a signal, with
//! connection draining enabled (the default):
//!
//! 1. the pre-shutdown hook runs;
//! 2. the listener stops accepting;
//! 3. every open connection is asked to finish its in-flight request and
//!    close;
//! 4. the runner waits up to the shutdown timeout (25 s by default), then
//!    aborts whatever is left and returns [`Error::ShutdownTimeout`];
//! 5. the post-shutdown hook runs, whether or not the drain succeeded.
//!
//! With draining disabled every connection is dropped immediately and no
//! hooks run. Keep the shutdown timeout below the supervisor's grace period
//! (`terminationGracePeriodSeconds`, 30 s by default).

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::client::TraceClient;
use crate::env;
use crate::error::Error;
use crate::logging::LogConfig;
use crate::middleware::context::ContextInit;
use crate::middleware::recovery::Recovery;
use crate::middleware::request_id::RequestId;
use crate::middleware::{Chain, Middleware};
use crate::request::Request;
use crate::response::Response;
use crate::router::Router;

/// Callback run around a graceful shutdown.
pub type ShutdownHook = Arc<dyn Fn() + Send + Sync>;

/// Runner settings, fixed at startup.
#[derive(Clone)]
pub struct ServiceConfig {
    /// Tags log records built from [`log_config`](ServiceConfig::log_config)
    /// and is the `User-Agent` of clients from
    /// [`Service::trace_client`].
    pub service_name: String,
    /// Wait for in-flight requests on shutdown instead of dropping them.
    pub drain: bool,
    /// Upper bound on the graceful drain.
    pub shutdown_timeout: Duration,
    /// Bound on reading a request's headers, from the first byte.
    pub read_timeout: Duration,
    /// Bound on producing a response; the connection is closed when it
    /// expires.
    pub write_timeout: Duration,
    /// Bound on a connection that sends nothing: before its first request,
    /// between kept-alive HTTP/1 requests, and for an HTTP/2 peer that
    /// stops answering pings.
    pub idle_timeout: Duration,
    pre_shutdown: Option<ShutdownHook>,
    post_shutdown: Option<ShutdownHook>,
}

impl ServiceConfig {
    /// Defaults overridden by `SERVICE_NAME`, `DRAIN_CONNECTIONS` and
    /// `SHUTDOWN_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            drain: env::get_bool("DRAIN_CONNECTIONS", defaults.drain),
            shutdown_timeout: Duration::from_secs(env::get_parsed(
                "SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout.as_secs(),
            )),
            ..defaults
        }
    }

    /// Logging setup tagged with this service's name; the level comes from
    /// `LOG_LEVEL`.
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            service: self.service_name.clone(),
            ..LogConfig::from_env()
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: env::service_name(),
            drain: true,
            shutdown_timeout: Duration::from_secs(25),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(60),
            pre_shutdown: None,
            post_shutdown: None,
        }
    }
}

/// A router behind an ordered middleware chain, plus how to run it.
///
/// ```rust,no_run
/// use std::time::Duration;
/// use svckit::{Request, Router, Service};
///
/// async fn index(req: Request) -> String {
///     let id = svckit::middleware::request_id::get(req.context()).unwrap_or_default();
///     format!("({id}) Welcome to the home page!")
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<(), svckit::Error> {
///     Service::simple(Router::new().get("/", index))
///         .drain_connections(true, Duration::from_secs(10))
///         .on_post_shutdown(|| tracing::info!("shutdown completed"))
///         .listen_and_serve("0.0.0.0:8080")
///         .await
/// }
/// ```
pub struct Service {
    router: Arc<Router>,
    middleware: Vec<Arc<dyn Middleware>>,
    config: ServiceConfig,
}

impl Service {
    /// A service with no middleware at all.
    pub fn new(router: Router) -> Self {
        Self { router: Arc::new(router), middleware: Vec::new(), config: ServiceConfig::default() }
    }

    /// A service with the default chain: [`ContextInit`], [`RequestId`],
    /// [`Recovery`], in that order.
    pub fn simple(router: Router) -> Self {
        Self::new(router)
            .with(ContextInit)
            .with(RequestId::new())
            .with(Recovery::new())
    }

    /// Appends a link to the chain. Links run in the order they are added.
    pub fn with(mut self, middleware: impl Middleware) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Enables or disables graceful shutdown. `timeout` only matters when
    /// `drain` is true.
    pub fn drain_connections(mut self, drain: bool, timeout: Duration) -> Self {
        self.config.drain = drain;
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Runs right before a graceful shutdown starts.
    pub fn on_pre_shutdown(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.config.pre_shutdown = Some(Arc::new(hook));
        self
    }

    /// Runs right after a graceful shutdown, even one that timed out.
    pub fn on_post_shutdown(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.config.post_shutdown = Some(Arc::new(hook));
        self
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.config.service_name = name.into();
        self
    }

    pub fn settings(&self) -> &ServiceConfig {
        &self.config
    }

    /// A [`TraceClient`] whose `User-Agent` is this service's name.
    pub fn trace_client(&self, request_id: impl Fn() -> String + Send + Sync + 'static) -> TraceClient {
        let mut client = TraceClient::new(request_id);
        client.set_user_agent(self.config.service_name.as_str());
        client
    }

    /// Runs one request through the whole chain, without a socket.
    pub async fn handle(&self, req: impl Into<Request>) -> Response {
        self.chain().run(req.into()).await
    }

    fn chain(&self) -> Arc<Chain> {
        Arc::new(Chain::new(self.middleware.clone(), self.router.clone()))
    }

    /// Binds `addr` (`ip:port`) and serves until SIGTERM or Ctrl-C.
    pub async fn listen_and_serve(self, addr: &str) -> Result<(), Error> {
        let addr: SocketAddr = addr.parse().map_err(|_| Error::Address(addr.to_owned()))?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serves connections from `listener` until `shutdown` resolves.
    ///
    /// Failed accepts of a single connection are skipped. When the process
    /// runs out of file descriptors or memory, accepting pauses with a
    /// doubling delay (5 ms up to 1 s). Any other accept error stops the
    /// server: open connections are shut down as on a signal and the error
    /// is returned.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        let chain = self.chain();
        let limits = Limits::from(&self.config);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        let mut backoff = AcceptBackoff::default();

        info!(addr = %listener.local_addr()?, service = %self.config.service_name, "listening");

        tokio::pin!(shutdown);

        let failure = loop {
            tokio::select! {
                // Check the signal first so it wins over a queue of pending
                // connections.
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received");
                    break None;
                }

                res = listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(v) => v,
                        Err(e) => match classify_accept_error(&e) {
                            AcceptError::Connection => {
                                debug!("accept error: {e}");
                                continue;
                            }
                            AcceptError::Resources => {
                                let delay = backoff.next_delay();
                                error!(?delay, "accept error: {e}");
                                tokio::time::sleep(delay).await;
                                continue;
                            }
                            AcceptError::Fatal => {
                                error!("accept error, stopping: {e}");
                                break Some(e);
                            }
                        },
                    };
                    backoff.reset();
                    tasks.spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&chain),
                        stop_rx.clone(),
                        limits,
                    ));
                }

                // Reap finished connection tasks so the set stays small on
                // long-running servers.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        };

        drop(listener);
        let stopped = self.stop(tasks, stop_tx).await;
        match failure {
            Some(e) => Err(Error::Io(e)),
            None => stopped,
        }
    }

    async fn stop(&self, mut tasks: JoinSet<()>, stop: watch::Sender<bool>) -> Result<(), Error> {
        if !self.config.drain {
            tasks.shutdown().await;
            info!("stopped without draining");
            return Ok(());
        }

        if let Some(hook) = &self.config.pre_shutdown {
            hook();
        }

        stop.send_replace(true);
        let timeout = self.config.shutdown_timeout;
        let drained = tokio::time::timeout(timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        let result = match drained {
            Ok(()) => {
                info!("drained all connections");
                Ok(())
            }
            Err(_) => {
                warn!(remaining = tasks.len(), ?timeout, "drain deadline exceeded, aborting connections");
                tasks.shutdown().await;
                Err(Error::ShutdownTimeout(timeout))
            }
        };

        if let Some(hook) = &self.config.post_shutdown {
            hook();
        }
        result
    }
}

// ── Connections ───────────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
struct Limits {
    header_read: Duration,
    idle: Duration,
    response: Duration,
}

impl From<&ServiceConfig> for Limits {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            // hyper's header timer also covers the wait for the next request
            // on a kept-alive connection.
            header_read: config.read_timeout.min(config.idle_timeout),
            idle: config.idle_timeout,
            response: config.write_timeout,
        }
    }
}

/// What a failed `accept` means for the serving loop.
#[derive(Debug, PartialEq, Eq)]
enum AcceptError {
    /// One connection failed before it was handed over.
    Connection,
    /// The process is out of descriptors or buffers; retrying later helps.
    Resources,
    Fatal,
}

fn classify_accept_error(e: &io::Error) -> AcceptError {
    use io::ErrorKind as Kind;

    match e.kind() {
        Kind::ConnectionAborted
        | Kind::ConnectionReset
        | Kind::ConnectionRefused
        | Kind::Interrupted
        | Kind::WouldBlock
        | Kind::TimedOut => AcceptError::Connection,
        Kind::OutOfMemory => AcceptError::Resources,
        _ if e.raw_os_error().is_some_and(is_resource_exhaustion) => AcceptError::Resources,
        _ => AcceptError::Fatal,
    }
}

#[cfg(unix)]
fn is_resource_exhaustion(code: i32) -> bool {
    // ENOMEM, ENFILE and EMFILE share their numbers across unix targets.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    const ENOBUFS: i32 = 105;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const ENOBUFS: i32 = 55;

    matches!(code, 12 | 23 | 24) || code == ENOBUFS
}

#[cfg(windows)]
fn is_resource_exhaustion(code: i32) -> bool {
    // WSAEMFILE, WSAENOBUFS
    matches!(code, 10024 | 10055)
}

#[cfg(not(any(unix, windows)))]
fn is_resource_exhaustion(_code: i32) -> bool {
    false
}

/// Doubling pause between accepts while resources are exhausted.
#[derive(Default)]
struct AcceptBackoff {
    current: Option<Duration>,
}

impl AcceptBackoff {
    const FIRST: Duration = Duration::from_millis(5);
    const MAX: Duration = Duration::from_secs(1);

    fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            Some(d) => (d * 2).min(Self::MAX),
            None => Self::FIRST,
        };
        self.current = Some(delay);
        delay
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    chain: Arc<Chain>,
    mut stop: watch::Receiver<bool>,
    limits: Limits,
) {
    // hyper's header timer only starts with the first byte; a client that
    // connects and stays silent is dropped here.
    tokio::select! {
        ready = tokio::time::timeout(limits.idle, stream.readable()) => match ready {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(%peer, "connection error: {e}");
                return;
            }
            Err(_) => {
                debug!(%peer, "no request within the idle timeout, closing");
                return;
            }
        },
        _ = stop.changed() => return,
    }

    let io = TokioIo::new(stream);
    let svc = service_fn(move |req| dispatch(Arc::clone(&chain), req, limits.response));

    // `auto::Builder` serves HTTP/1.1 and HTTP/2, whichever the client speaks.
    let mut builder = ConnBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(limits.header_read);
    builder
        .http2()
        .timer(TokioTimer::new())
        .keep_alive_interval(limits.idle)
        .keep_alive_timeout(limits.idle);

    let conn = builder.serve_connection(io, svc);
    tokio::pin!(conn);

    let mut draining = false;
    let result = loop {
        tokio::select! {
            res = conn.as_mut() => break res,
            _ = stop.changed(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    };

    if let Err(e) = result {
        debug!(%peer, "connection error: {e}");
    }
}

/// Runs one request through the chain within the response deadline.
async fn dispatch(
    chain: Arc<Chain>,
    req: hyper::Request<hyper::body::Incoming>,
    deadline: Duration,
) -> Result<http::Response<Full<Bytes>>, Error> {
    match tokio::time::timeout(deadline, chain.run(Request::from(req))).await {
        Ok(res) => Ok(res.into_inner()),
        Err(_) => {
            warn!(?deadline, "response deadline exceeded, closing connection");
            Err(Error::ResponseTimeout(deadline))
        }
    }
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first SIGTERM or SIGINT. A signal that cannot be
/// listened for is logged and ignored.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c  => {}
        () = sigterm => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ServiceConfig::default();
        assert!(cfg.drain);
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(25));
        assert_eq!(cfg.read_timeout, Duration::from_secs(60));
        assert_eq!(cfg.write_timeout, Duration::from_secs(60));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn builder_overrides_config() {
        let service = Service::new(Router::new())
            .drain_connections(false, Duration::from_secs(3))
            .service_name("orders");
        assert!(!service.settings().drain);
        assert_eq!(service.settings().shutdown_timeout, Duration::from_secs(3));
        assert_eq!(service.settings().service_name, "orders");
    }

    #[test]
    fn service_name_tags_logs_and_outbound_calls() {
        let service = Service::new(Router::new()).service_name("orders");
        assert_eq!(service.settings().log_config().service, "orders");
        assert_eq!(service.trace_client(String::new).user_agent(), "orders");
    }

    #[test]
    fn from_env_reads_drain_settings() {
        // The only test that touches these two variables.
        unsafe {
            std::env::set_var("DRAIN_CONNECTIONS", "off");
            std::env::set_var("SHUTDOWN_TIMEOUT_SECS", "7");
        }
        let cfg = ServiceConfig::from_env();
        assert!(!cfg.drain);
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(7));

        unsafe {
            std::env::set_var("DRAIN_CONNECTIONS", "maybe");
            std::env::set_var("SHUTDOWN_TIMEOUT_SECS", "soon");
        }
        let cfg = ServiceConfig::from_env();
        assert!(cfg.drain);
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(25));

        unsafe {
            std::env::remove_var("DRAIN_CONNECTIONS");
            std::env::remove_var("SHUTDOWN_TIMEOUT_SECS");
        }
    }

    #[test]
    fn accept_errors_are_classified() {
        let reset = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(classify_accept_error(&reset), AcceptError::Connection);

        #[cfg(unix)]
        {
            let emfile = io::Error::from_raw_os_error(24);
            assert_eq!(classify_accept_error(&emfile), AcceptError::Resources);
        }

        let other = io::Error::other("listener closed");
        assert_eq!(classify_accept_error(&other), AcceptError::Fatal);
    }

    #[test]
    fn accept_backoff_doubles_up_to_a_second() {
        let mut backoff = AcceptBackoff::default();
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        for _ in 0..20 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn bad_address_is_an_error() {
        let err = Service::new(Router::new()).listen_and_serve("not-an-addr").await;
        assert!(matches!(err, Err(Error::Address(_))));
    }

    #[tokio::test]
    async fn simple_service_stamps_request_ids() {
        let service = Service::simple(Router::new().get("/", |_req: Request| async { "ok" }));
        let res = service
            .handle(http::Request::get("/").body(String::new()).unwrap())
            .await;
        assert!(res.headers().contains_key("x-request-id"));
    }
}

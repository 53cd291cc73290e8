use std::{future::Future, io, net::SocketAddr, time::Duration};

pub mod config;
pub mod error;
pub mod handler;
pub mod init_log;
pub mod metrics;
pub mod util;

pub type DynError = Box<dyn std::error::Error + Send + Sync>;

pub use error::{AppError, MetricError, UpstreamRequestError};

use crate::util::io::{TimeoutIO, create_dual_stack_listener};

use axum::{
    Router,
    extract::{ConnectInfo, Request},
};
use hyper::body::Incoming;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::graceful::GracefulShutdown,
    service::TowerToHyperService,
};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tower::ServiceExt;

type AutoBuilder = hyper_util::server::conn::auto::Builder<TokioExecutor>;

/// HTTP/1 + HTTP/2 server around an axum [`Router`].
pub struct Server {
    pub port: u16,
    router: Router,
    /// A connection with no reads or writes for this long is closed.
    pub idle_timeout: Duration,
    /// How long shutdown waits for in-flight connections.
    pub drain_timeout: Duration,
}

impl Server {
    pub fn new(port: u16, router: Router) -> Self {
        Self {
            port,
            router,
            idle_timeout: Duration::from_secs(120),
            drain_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Binds `[::]:port` and serves until `shutdown` resolves.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        let listener = create_dual_stack_listener(self.port).await?;
        info!("listening on port {}", self.port);
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Accepts on `listener` until `shutdown` resolves, then stops accepting
    /// and gives open connections up to `drain_timeout` to finish.
    pub async fn serve(self, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        let connections = Connections {
            router: self.router,
            builder: AutoBuilder::new(TokioExecutor::new()),
            graceful: GracefulShutdown::new(),
            idle_timeout: self.idle_timeout,
        };
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => connections.spawn(stream, peer),
                    Err(e) => warn!("accept failed: {e}"),
                },
            }
        }
        drop(listener);
        connections.drain(self.drain_timeout).await;
    }
}

/// Everything a freshly accepted connection needs, shared by the accept loop.
struct Connections {
    router: Router,
    builder: AutoBuilder,
    graceful: GracefulShutdown,
    idle_timeout: Duration,
}

impl Connections {
    fn spawn(&self, stream: TcpStream, peer: SocketAddr) {
        let io = TokioIo::new(Box::pin(TimeoutIO::new(stream, self.idle_timeout)));
        // Same extension `into_make_service_with_connect_info` would add.
        let service = self.router.clone().map_request(move |mut request: Request<Incoming>| {
            request.extensions_mut().insert(ConnectInfo(peer));
            request
        });
        let conn = self.builder.serve_connection_with_upgrades(io, TowerToHyperService::new(service));
        let conn = self.graceful.watch(conn.into_owned());
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                let (level, tag) = classify(err.as_ref());
                log::log!(level, "[{tag}] {err} from {}", peer.ip().to_canonical());
            }
            debug!("connection closed: {peer}");
        });
    }

    async fn drain(self, timeout: Duration) {
        info!("stopped accepting, draining open connections");
        match tokio::time::timeout(timeout, self.graceful.shutdown()).await {
            Ok(()) => info!("all connections closed"),
            Err(_) => warn!("connections still open after {timeout:?}, exiting anyway"),
        }
    }
}

/// Log level and tag for an error that ended a connection.
///
/// Protocol misuse by the client is a warning. Idle timeouts, resets and
/// half-sent requests happen all the time and stay at debug.
fn classify(err: &(dyn std::error::Error + Send + Sync + 'static)) -> (log::Level, &'static str) {
    if let Some(hyper_err) = err.downcast_ref::<hyper::Error>() {
        if hyper_err.is_user() {
            return (log::Level::Warn, "hyper user");
        }
        let io_kind = std::error::Error::source(hyper_err).and_then(|source| source.downcast_ref::<io::Error>()).map(io::Error::kind);
        return match io_kind {
            Some(kind) => classify_io(kind),
            None => (log::Level::Debug, "hyper"),
        };
    }
    match err.downcast_ref::<io::Error>() {
        Some(io_err) => classify_io(io_err.kind()),
        None => (log::Level::Warn, "connection"),
    }
}

fn classify_io(kind: io::ErrorKind) -> (log::Level, &'static str) {
    match kind {
        io::ErrorKind::TimedOut => (log::Level::Debug, "idle timeout"),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => (log::Level::Debug, "io"),
        _ => (log::Level::Warn, "io"),
    }
}

/// Resolves on SIGTERM or Ctrl-C.
///
/// If the handlers cannot be installed it logs and never resolves, so the
/// server keeps running without signal handling rather than stopping.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for ctrl_c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut terminate_signal) => {
                terminate_signal.recv().await;
            }
            Err(e) => {
                log::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("receive ctrl_c signal"),
        _ = terminate => info!("receive terminate signal"),
    }
}

#[cfg(test)]
mod tests {
    use axum::routing::get;

    use super::*;

    #[tokio::test]
    async fn serves_until_shutdown_then_stops_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Router::new().route(
            "/peer",
            get(|ConnectInfo(peer): ConnectInfo<SocketAddr>| async move { peer.ip().to_string() }),
        );
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let server = Server::new(addr.port(), router).with_drain_timeout(Duration::from_secs(1));
        let task = tokio::spawn(server.serve(listener, async {
            let _ = shutdown_rx.await;
        }));

        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        let body = client.get(format!("http://{addr}/peer")).send().await.unwrap().text().await.unwrap();
        assert_eq!(body, "127.0.0.1");
        drop(client);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[test]
    fn routine_disconnects_stay_quiet() {
        let timed_out: DynError = Box::new(io::Error::from(io::ErrorKind::TimedOut));
        assert_eq!(classify(timed_out.as_ref()), (log::Level::Debug, "idle timeout"));

        let reset: DynError = Box::new(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(classify(reset.as_ref()), (log::Level::Debug, "io"));

        let denied: DynError = Box::new(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(classify(denied.as_ref()), (log::Level::Warn, "io"));

        let other: DynError = "tls handshake failed".into();
        assert_eq!(classify(other.as_ref()), (log::Level::Warn, "connection"));
    }
}

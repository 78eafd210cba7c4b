//! HTTP API of the sleep timeline service

pub mod error;
mod routes;

use std::future::Future;
use std::io;
use std::net::{AddrParseError, SocketAddr};
use std::str::FromStr as _;
use std::sync::Arc;

use axum::Router;
use slumber_db::Database;
use slumber_feed::FeedPlanner;
use snafu::{ResultExt as _, Snafu};
use tokio::net::{TcpListener, TcpSocket};
use tokio::signal;
use tower_http::CompressionLevel;
use tower_http::compression::CompressionLayer;
use tower_http::compression::predicate::SizeAbove;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const LOG_TARGET: &str = "slumber::server";

pub struct AppState {
    pub db: Arc<Database>,
    pub planner: FeedPlanner,
}

pub type SharedState = Arc<AppState>;

/// All API routes with the standard middleware stack applied
pub fn router(state: SharedState) -> Router {
    routes::route_handler(state)
        .layer(compression_layer())
        .layer(TraceLayer::new_for_http())
}

fn compression_layer() -> CompressionLayer<SizeAbove> {
    CompressionLayer::new()
        .quality(CompressionLevel::Precise(4))
        .compress_when(SizeAbove::new(512))
}

#[derive(Debug, Snafu)]
pub enum ServerError {
    #[snafu(transparent)]
    IO { source: io::Error },

    ListenAddr { source: AddrParseError },
}

pub type ServerResult<T> = std::result::Result<T, ServerError>;

pub struct Server {
    listener: TcpListener,
    state: SharedState,
}

impl Server {
    pub async fn init(listen: &str, state: SharedState) -> ServerResult<Server> {
        let listener = Self::get_listener(listen).await?;
        info!(target: LOG_TARGET, "Listening on {}", listener.local_addr()?);
        Ok(Self { listener, state })
    }

    async fn get_listener(listen: &str) -> ServerResult<TcpListener> {
        let addr = SocketAddr::from_str(listen).context(ListenAddrSnafu)?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;
        socket.bind(addr)?;

        Ok(socket.listen(1024)?)
    }

    /// Serve requests until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> ServerResult<()> {
        info!(target: LOG_TARGET, "Starting server");
        axum::serve(
            self.listener,
            router(self.state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        info!(target: LOG_TARGET, "Server stopped");
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(target: LOG_TARGET, %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                warn!(target: LOG_TARGET, %err, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!(target: LOG_TARGET, "Shutdown signal received");
}

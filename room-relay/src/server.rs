use std::{
    future::{self, Future, IntoFuture},
    net::SocketAddr,
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
    routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{net::TcpListener, select, signal, sync::oneshot, time};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    config::RelayConfig,
    connection,
    hub::{Hub, RoomSnapshot},
};

const DEFAULT_ROOM: &str = "general";
const DEFAULT_USERNAME: &str = "anonymous";

pub struct Server {
    listener: TcpListener,
    hub: Arc<Hub>,
    config: Arc<RelayConfig>,
}

impl Server {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            listener,
            hub: Arc::new(Hub::new()),
            config: Arc::new(config),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    /// Serves until `shutdown` resolves, then closes the hub, gives open
    /// connections the configured grace period and waits for the delivery
    /// loop to finish.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server {
            listener,
            hub,
            config,
        } = self;

        let delivery = tokio::spawn({
            let hub = Arc::clone(&hub);
            async move { hub.run().await }
        });

        let (stopping_tx, stopping_rx) = oneshot::channel::<()>();
        let shutdown_hub = Arc::clone(&hub);
        let serve = axum::serve(listener, router(Arc::clone(&hub), Arc::clone(&config)))
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("relay shutting down");
                shutdown_hub.close().await;
                let _ = stopping_tx.send(());
            });
        let mut serve = std::pin::pin!(serve.into_future());

        select! {
            result = &mut serve => result.context("server stopped with error")?,
            _ = stopping_rx => {
                match time::timeout(config.shutdown_grace, serve).await {
                    Ok(result) => result.context("server stopped with error")?,
                    Err(_) => warn!(
                        grace = ?config.shutdown_grace,
                        "grace period elapsed with connections still open"
                    ),
                }
            }
        }

        hub.close().await;
        if time::timeout(config.shutdown_grace, delivery).await.is_err() {
            warn!("hub delivery loop did not stop within the grace period");
        }

        info!("relay stopped");
        Ok(())
    }

    /// Serves until Ctrl-C or, on unix, SIGTERM.
    pub async fn run_until_signal(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }
}

/// Resolves on the first process shutdown signal. A handler that cannot be
/// installed never fires.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
            future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                warn!(error = ?err, "failed to install SIGTERM handler");
                future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = future::pending::<()>();

    select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[derive(Clone)]
struct AppState {
    hub: Arc<Hub>,
    config: Arc<RelayConfig>,
}

pub fn router(hub: Arc<Hub>, config: Arc<RelayConfig>) -> Router {
    let static_files = ServeDir::new(&config.static_dir);

    Router::new()
        .route("/ws", get(upgrade))
        .route("/ping", get(ping))
        .route("/rooms", get(rooms))
        .fallback_service(static_files)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { hub, config })
}

/// Query parameters of the upgrade endpoint. Missing and empty values both
/// fall back to the defaults.
#[derive(Debug, Default, Deserialize)]
pub struct JoinParams {
    pub room: Option<String>,
    pub username: Option<String>,
}

impl JoinParams {
    pub fn resolve(self) -> (String, String) {
        let pick = |value: Option<String>, default: &str| {
            value
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        (
            pick(self.room, DEFAULT_ROOM),
            pick(self.username, DEFAULT_USERNAME),
        )
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<JoinParams>,
    State(state): State<AppState>,
) -> Response {
    let (room, username) = params.resolve();
    let AppState { hub, config } = state;

    ws.max_message_size(config.max_message_size)
        .max_frame_size(config.max_message_size)
        .on_upgrade(move |socket| connection::serve_connection(socket, hub, config, username, room))
}

async fn ping() -> Json<Value> {
    Json(json!({"ping": "pong"}))
}

async fn rooms(State(state): State<AppState>) -> Json<Vec<RoomSnapshot>> {
    Json(state.hub.rooms().await)
}

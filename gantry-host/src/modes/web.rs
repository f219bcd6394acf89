//! Web mode
//!
//! Assembles the HTTP surface: built-in routes (`/health`, `/api/docs`,
//! `/events`), every module router nested under `/api/{module}`, static
//! files from the configured public directory, and the realtime bridge at
//! `/rt`. The server binds the configured host and port (port 0 asks the
//! OS for a free one) and shuts down gracefully through a watch channel.

use crate::app::App;
use crate::error::{Error, Result};
use crate::realtime::{self, RealtimeBridge};
use crate::registry::ModuleStructure;
use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::Stream;
use gantry_common::sse::heartbeat_stream;
use serde::Serialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// State shared by the built-in routes
#[derive(Clone)]
struct WebState {
    app_name: String,
    version: &'static str,
    structure: Arc<ModuleStructure>,
}

/// Running web server plus its realtime bridge
pub(crate) struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<std::io::Result<()>>,
    bridge: RealtimeBridge,
}

impl ServerHandle {
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn realtime_connections(&self) -> usize {
        self.bridge.connection_count()
    }

    /// Stop serving: disconnect realtime clients, close the listener
    /// gracefully, then close the bridge. Graceful close waits for open
    /// connections, so the disconnect has to come first.
    pub(crate) async fn shutdown(self) -> Result<()> {
        self.bridge.force_disconnect();
        let _ = self.shutdown_tx.send(true);

        let result = match self.task.await {
            Ok(Ok(())) => {
                info!("✓ HTTP server stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Http(format!("server task failed: {}", e))),
            Err(e) => Err(Error::Http(format!("server task panicked: {}", e))),
        };

        self.bridge.close();
        result
    }
}

/// Bind the listener and start serving
pub(crate) async fn start(app: &App) -> Result<()> {
    let config = app.config();

    // The bridge dispatches into a clone of the router built *before*
    // the bridge endpoint itself is merged, so a frame can never reach
    // `/rt` and recurse.
    let router = build_router(app);
    let bridge = RealtimeBridge::new(router.clone());
    let router = router.merge(
        Router::new()
            .route("/rt", get(realtime::ws_handler))
            .with_state(bridge.clone()),
    );

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| Error::Http(format!("cannot bind {}: {}", bind, e)))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| Error::Http(format!("local address: {}", e)))?;
    info!("✓ HTTP server listening on http://{}", local_addr);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = shutdown_rx.changed().await;
    });
    let task = tokio::spawn(async move { server.await });

    app.set_server(ServerHandle {
        local_addr,
        shutdown_tx,
        task,
        bridge,
    });
    Ok(())
}

fn build_router(app: &App) -> Router {
    let config = app.config();
    let state = WebState {
        app_name: app.name().to_string(),
        version: env!("CARGO_PKG_VERSION"),
        structure: app.structure(),
    };

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/api/docs", get(api_docs))
        .route("/events", get(events))
        .with_state(state);

    for (name, def) in &app.registry().modules {
        if let Some(factory) = &def.router {
            router = router.nest(&format!("/api/{}", name), factory(app));
            debug!("Mounted module router at /api/{}", name);
        }
    }

    router
        .fallback_service(ServeDir::new(&config.public_dir))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    module: String,
    version: String,
}

async fn health(State(state): State<WebState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        module: state.app_name.clone(),
        version: state.version.to_string(),
    })
}

/// JSON manifest of the assembled application: every module with its
/// artifacts, plus the API mount point for modules that expose one
async fn api_docs(State(state): State<WebState>) -> Json<Value> {
    let modules: Vec<Value> = state
        .structure
        .iter()
        .map(|(name, artifacts)| {
            let mut entry = json!({
                "name": name,
                "artifacts": artifacts,
            });
            if artifacts.router {
                entry["api"] = json!(format!("/api/{}", name));
            }
            entry
        })
        .collect();

    Json(json!({
        "application": state.app_name,
        "version": state.version,
        "modules": modules,
    }))
}

async fn events(
    State(state): State<WebState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    heartbeat_stream(state.app_name.clone())
}

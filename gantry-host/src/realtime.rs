//! Realtime bridge
//!
//! Exposes the module API surface over one WebSocket endpoint. An inbound
//! text frame names a method and a path; the bridge synthesizes an HTTP
//! request, dispatches it through the same router the plain HTTP listener
//! uses, and replies with the response tagged by the frame's id. A
//! malformed frame or a failed dispatch produces an error frame and a log
//! line; it never takes the server down.
//!
//! Frame format in: `{"id", "method", "path", "body"?}`.
//! Frame format out: `{"id", "status", "body"}` or `{"id", "error"}`.

use crate::error::{Error, Result};
use axum::body::{to_bytes, Body};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, Method, Request};
use axum::response::Response;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower::ServiceExt;
use tracing::{debug, info, warn};

/// Cap on dispatched response bodies relayed over the socket
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// One inbound frame
#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(default)]
    id: Value,
    method: String,
    path: String,
    #[serde(default)]
    body: Option<Value>,
}

/// Shared state behind the bridge endpoint
#[derive(Clone)]
pub(crate) struct RealtimeBridge {
    router: Router,
    disconnect_tx: broadcast::Sender<()>,
    connections: Arc<AtomicUsize>,
}

impl RealtimeBridge {
    /// `router` is the dispatch target; it must not contain the bridge's
    /// own endpoint
    pub(crate) fn new(router: Router) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        RealtimeBridge {
            router,
            disconnect_tx,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Tell every open socket to close now
    pub(crate) fn force_disconnect(&self) {
        let open = self.connection_count();
        if open > 0 {
            info!("Disconnecting {} realtime clients", open);
        }
        let _ = self.disconnect_tx.send(());
    }

    pub(crate) fn close(&self) {
        debug!("Realtime bridge closed");
    }

    async fn handle_socket(self, socket: WebSocket) {
        let open = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Realtime client connected ({} open)", open);

        let mut disconnect = self.disconnect_tx.subscribe();
        let (mut sender, mut receiver) = socket.split();

        loop {
            tokio::select! {
                _ = disconnect.recv() => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                inbound = receiver.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            let reply = self.dispatch(&text).await;
                            if sender.send(Message::Text(reply)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        // Binary, ping, and pong frames are ignored
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Realtime socket error: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        let open = self.connections.fetch_sub(1, Ordering::SeqCst) - 1;
        info!("Realtime client disconnected ({} open)", open);
    }

    /// Turn one inbound frame into one reply frame
    async fn dispatch(&self, text: &str) -> String {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Malformed realtime frame: {}", e);
                return reply_error(Value::Null, &format!("malformed frame: {}", e));
            }
        };

        let id = frame.id.clone();
        match self.call(frame).await {
            Ok((status, body)) => reply_ok(id, status, body),
            Err(e) => {
                warn!("Realtime dispatch failed: {}", e);
                reply_error(id, &e.to_string())
            }
        }
    }

    async fn call(&self, frame: Frame) -> Result<(u16, Value)> {
        let method = Method::from_bytes(frame.method.as_bytes())
            .map_err(|_| Error::Http(format!("invalid method '{}'", frame.method)))?;

        let builder = Request::builder().method(method).uri(frame.path);
        let request = match frame.body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .map_err(|e| Error::Http(format!("invalid request: {}", e)))?;

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .map_err(|e| Error::Http(format!("dispatch failed: {}", e)))?;

        let status = response.status().as_u16();
        let bytes = to_bytes(response.into_body(), MAX_BODY_BYTES)
            .await
            .map_err(|e| Error::Http(format!("response body: {}", e)))?;

        // Non-JSON responses (static files, plain text) pass through as strings
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };

        Ok((status, body))
    }
}

/// Axum handler for the bridge endpoint
pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(bridge): State<RealtimeBridge>,
) -> Response {
    ws.on_upgrade(move |socket| bridge.handle_socket(socket))
}

fn reply_ok(id: Value, status: u16, body: Value) -> String {
    json!({ "id": id, "status": status, "body": body }).to_string()
}

fn reply_error(id: Value, message: &str) -> String {
    json!({ "id": id, "error": message }).to_string()
}

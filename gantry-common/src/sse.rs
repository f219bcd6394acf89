//! Server-Sent Events (SSE) utilities
//!
//! Shared SSE implementation for hosted applications.

use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, info};

/// Create a heartbeat-only SSE stream for connection status monitoring
///
/// Web-mode hosts expose this at `/events` so a browser can tell whether
/// the server is still up without the application defining any events.
///
/// # Arguments
/// * `app_name` - Application name for logging
pub fn heartbeat_stream(app_name: String) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New SSE client connected to {} events", app_name);

    let stream = async_stream::stream! {
        debug!("SSE: {} event stream started", app_name);

        // Send initial connected status
        yield Ok(Event::default()
            .event("ConnectionStatus")
            .data("connected"));

        loop {
            // Heartbeat every 15 seconds
            tokio::time::sleep(Duration::from_secs(15)).await;
            debug!("SSE: Sending heartbeat");
            yield Ok(Event::default().comment("heartbeat"));
        }
    };

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}

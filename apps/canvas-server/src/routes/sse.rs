use std::convert::Infallible;

use axum::{
    extract::State,
    http::header,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
};
use futures::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::canvas::CanvasEvent;
use crate::metrics::{self, SPECTATORS};
use crate::state::AppState;

pub async fn prometheus_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}

/// Keeps the spectator gauge in step with open streams.
struct SpectatorGuard;

impl SpectatorGuard {
    fn new() -> Self {
        SPECTATORS.inc();
        SpectatorGuard
    }
}

impl Drop for SpectatorGuard {
    fn drop(&mut self) {
        SPECTATORS.dec();
    }
}

pub async fn stream_placements(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let guard = SpectatorGuard::new();
    let rx = state.canvas.subscribe();
    // Lagged receivers skip what they missed; spectators re-sync from /api/canvas.
    let stream = BroadcastStream::new(rx)
        .filter_map(|msg| msg.ok())
        .map(move |event| {
            let _ = &guard;
            let name = match &event {
                CanvasEvent::Placement { .. } => "placement",
                CanvasEvent::Reset { .. } => "reset",
            };
            let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".into());
            Ok(Event::default().event(name).data(data))
        });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

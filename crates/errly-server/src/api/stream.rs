//! The dashboard push stream.
//!
//! `GET /api/errors/stream` upgrades a cookie-authenticated request into a
//! long-lived `text/event-stream` response fed by the push hub. The
//! response stream owns the hub registration: dropping it (client went
//! away) unsubscribes.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, Response};
use futures::Stream;
use tokio::sync::mpsc;

use crate::api::auth::validate_session;
use crate::error::ApiError;
use crate::hub::{Frame, PushHub};
use crate::AppState;

/// Handle `GET /api/errors/stream`.
#[tracing::instrument(skip(state, headers))]
pub async fn stream(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response<Body>, ApiError> {
    let session_hash = validate_session(&state, &headers).await?;

    let (client_id, rx) = state
        .hub
        .subscribe(&session_hash)
        .ok_or(ApiError::Overloaded)?;

    let body = Body::from_stream(ClientStream {
        rx,
        hub: Arc::clone(&state.hub),
        client_id,
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(body)
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Adapts a hub registration into a byte stream, unsubscribing on drop.
struct ClientStream {
    rx: mpsc::Receiver<Frame>,
    hub: Arc<PushHub>,
    client_id: u64,
}

impl Stream for ClientStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(frame)) => Poll::Ready(Some(Ok(Bytes::from(frame.to_bytes())))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.client_id);
    }
}

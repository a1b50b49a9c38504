//! `GET /api/events` - server-sent events
//!
//! Each client gets the full app list first, then every later snapshot or
//! theme message as one `data:` frame.

use super::ApiState;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use perch_core::StreamMessage;
use std::convert::Infallible;
use std::sync::Arc;

pub async fn events(
    State(state): State<Arc<ApiState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let supervisor = state.supervisor.clone();
    let subscription = state
        .broadcaster
        .subscribe_with(|| StreamMessage::Snapshot(supervisor.snapshot()).to_json());

    // The subscription unsubscribes itself when the client goes away and
    // axum drops this stream.
    let stream = futures_util::stream::unfold(subscription, |mut sub| async move {
        let message = sub.recv().await?;
        Some((Ok(Event::default().data(&*message)), sub))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

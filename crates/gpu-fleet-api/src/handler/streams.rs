//! Server-sent event streams
//!
//! A client that falls behind loses the events it missed; the stream itself
//! stays open.

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{self, Stream};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::AppState;

type BoxedEvents = Pin<Box<dyn Stream<Item = Result<Event, axum::Error>> + Send>>;
type EventStream = Sse<BoxedEvents>;

fn sse(events: impl Stream<Item = Result<Event, axum::Error>> + Send + 'static) -> EventStream {
    let events: BoxedEvents = Box::pin(events);
    Sse::new(events).keep_alive(KeepAlive::default())
}

fn to_event<T: Serialize>(name: &'static str, item: &T) -> Result<Event, axum::Error> {
    Event::default().event(name).json_data(item)
}

fn from_broadcast<T>(name: &'static str, receiver: broadcast::Receiver<T>) -> EventStream
where
    T: Serialize + Clone + Send + 'static,
{
    let events = stream::unfold(receiver, move |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(item) => return Some((to_event(name, &item), receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(stream = name, skipped, "SSE client lagging");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    sse(events)
}

/// GET /api/v1/streams/changes
pub(super) async fn change_stream(State(state): State<Arc<AppState>>) -> EventStream {
    let subscription = state.service.stream_changes();
    let events = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        Some((to_event("change", &event), subscription))
    });
    sse(events)
}

/// GET /api/v1/streams/availability
pub(super) async fn availability_stream(State(state): State<Arc<AppState>>) -> EventStream {
    from_broadcast("availability", state.service.stream_availability())
}

/// GET /api/v1/streams/alerts
pub(super) async fn alert_stream(State(state): State<Arc<AppState>>) -> EventStream {
    from_broadcast("alert", state.service.stream_alerts())
}

//! Server-Sent Events support

use crate::runtime::SessionHandle;
use crate::translator::ExternalEvent;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::StreamExt;

/// Stream a session's events; the stream closes when the session ends
pub fn sse_stream(session: SessionHandle) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = session.into_stream().map(|event| Ok(external_event_to_axum(&event)));

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn external_event_to_axum(event: &ExternalEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(data) => Event::default().event(event.event_type()).data(data),
        Err(e) => {
            tracing::error!(event = %event.event_type(), error = %e, "Failed to serialize event");
            Event::default()
                .event("error")
                .data(format!(r#"{{"type":"error","errorText":"{}"}}"#, event.event_type()))
        }
    }
}

use std::convert::Infallible;
use std::sync::Arc;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use conductor_core::events::StreamEvent;
use conductor_core::ids::SubscriberId;

use crate::error::StreamError;
use crate::stream::StreamSession;

/// Removes the subscriber when the consuming stream is dropped, e.g. when an
/// SSE client disconnects mid-run.
struct SubscriptionGuard {
    session: Arc<StreamSession>,
    id: SubscriberId,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if self.session.remove_subscriber(&self.id) {
            debug!(stream_id = %self.session.id(), subscriber_id = %self.id, "subscriber detached");
        }
    }
}

/// Buffered events first, then live ones until the session closes.
///
/// A session that already closed yields its frozen buffer and ends.
pub fn replay_then_follow(
    session: Arc<StreamSession>,
) -> Result<BoxStream<'static, StreamEvent>, StreamError> {
    match session.subscribe_with_replay() {
        Ok((id, replay, rx)) => {
            let guard = SubscriptionGuard { session, id };
            let live = ReceiverStream::new(rx).map(move |event| {
                let _attached = &guard;
                event
            });
            Ok(stream::iter(replay).chain(live).boxed())
        }
        Err(StreamError::SessionClosed(_)) => Ok(stream::iter(session.buffered_events()).boxed()),
        Err(e) => Err(e),
    }
}

/// One SSE frame per event; the SSE event name is the event type.
pub fn to_sse_event(event: &StreamEvent) -> Result<Event, axum::Error> {
    Event::default()
        .event(event.event_type.to_string())
        .json_data(event)
}

pub fn sse_response(
    session: Arc<StreamSession>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StreamError> {
    let events = replay_then_follow(session)?.filter_map(|event| async move {
        match to_sse_event(&event) {
            Ok(frame) => Some(Ok(frame)),
            Err(e) => {
                warn!(error = %e, event_type = %event.event_type, "event not serializable, skipped");
                None
            }
        }
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::events::EventType;
    use conductor_core::ids::{RequestId, TenantId};

    use crate::stream::StreamConfig;

    fn session() -> Arc<StreamSession> {
        Arc::new(StreamSession::new(
            RequestId::from_raw("req_1"),
            TenantId::from_raw("acme"),
            &StreamConfig::default(),
        ))
    }

    #[tokio::test]
    async fn replays_buffer_then_follows_until_close() {
        let s = session();
        s.emit(StreamEvent::message("billing", "looking up"));
        let stream = replay_then_follow(Arc::clone(&s)).unwrap();

        s.emit(StreamEvent::transfer("supervisor", "shipping"));
        s.emit(StreamEvent::complete(Some("done".into())));
        s.complete();

        let types: Vec<_> = stream.map(|e| e.event_type).collect().await;
        assert_eq!(types, [EventType::Message, EventType::Transfer, EventType::Complete]);
    }

    #[tokio::test]
    async fn closed_session_yields_its_buffer() {
        let s = session();
        s.emit(StreamEvent::error(None, "boom"));
        s.set_error("boom");

        let events: Vec<_> = replay_then_follow(s).unwrap().collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn dropping_the_stream_detaches_the_subscriber() {
        let s = session();
        let stream = replay_then_follow(Arc::clone(&s)).unwrap();
        assert_eq!(s.subscriber_count(), 1);
        drop(stream);
        assert_eq!(s.subscriber_count(), 0);
        assert!(s.is_active());
    }

    #[test]
    fn sse_frame_is_built_from_event() {
        assert!(to_sse_event(&StreamEvent::ping()).is_ok());
        assert!(to_sse_event(&StreamEvent::tool_call("a", "lookup", serde_json::json!({"id": 1}))).is_ok());
    }
}

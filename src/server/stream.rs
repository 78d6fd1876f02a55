//! Streaming endpoint adapter
//!
//! Per-connection glue between the dispatcher and one client's live
//! stream: open a bounded outbound channel, register it, forward every
//! ChangeEvent as one SSE event. The registration guard unregisters on
//! every exit path, including disconnects and shutdown, so no dispatcher
//! state leaks.

use crate::dispatch::{ChangeEvent, DispatcherHandle, SUBSCRIBER_BUFFER};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error};
use uuid::Uuid;

/// Unregisters the subscriber when the client's stream is dropped
struct RegistrationGuard {
    id: Uuid,
    dispatcher: DispatcherHandle,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        debug!(subscriber = %self.id, "stream closed, unregistering");
        self.dispatcher.unregister(self.id);
    }
}

/// Register a subscriber and turn its event channel into an SSE response
pub fn subscribe(
    dispatcher: DispatcherHandle,
    topics: Vec<String>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel::<ChangeEvent>(SUBSCRIBER_BUFFER);

    dispatcher.register(id, topics, tx);
    let guard = RegistrationGuard { id, dispatcher };

    let stream = ReceiverStream::new(rx).filter_map(move |event| {
        // The guard lives inside the stream; axum drops it with the body
        let _ = &guard;
        match SseEvent::default().event("notification").json_data(&event) {
            Ok(sse_event) => Some(Ok(sse_event)),
            Err(err) => {
                error!(video_id = %event.video_id, error = %err, "failed to serialize event");
                None
            }
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_guard_unregisters_on_drop() {
        let dispatcher = crate::dispatch::spawn();

        {
            let _sse = subscribe(dispatcher.clone(), vec!["UCabc".to_string()]);
            let stats = dispatcher.stats().await;
            assert_eq!(stats.subscribers, 1);
        }

        // Dropping the response tears the registration down
        let stats = timeout(Duration::from_secs(1), dispatcher.stats())
            .await
            .unwrap();
        assert_eq!(stats.subscribers, 0);
        assert_eq!(stats.topics, 0);
    }
}

// Event streaming routes (SSE)
//
// Streams are fed by the in-process bus: per-user streams carry
// `task:updated` / `inbox:updated` notifications, per-task streams carry
// status changes plus sandbox job logs. Heartbeats come from the bus's
// per-subscriber heartbeat task.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures::stream::Stream;
use tracing::debug;
use uuid::Uuid;

use foreman_core::bus::{event_names, BusEvent, Subscription};

use crate::state::AppState;

/// Create the event routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/events/:user_id", get(stream_user_events))
        .route("/tasks/:task_id/logs", get(stream_task_logs))
        .with_state(state)
}

fn encode(event: &BusEvent) -> SseEvent {
    SseEvent::default()
        .id(event.id.clone())
        .event(event.event.clone())
        .data(event.data.to_string())
}

/// GET /events/{user_id} — the user's live event stream
async fn stream_user_events(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    debug!(user_id, "starting user event stream");
    let subscription = state.bus.subscribe_user(&user_id);

    let stream = futures::stream::unfold(subscription, |mut subscription| async move {
        subscription
            .receiver
            .recv()
            .await
            .map(|event| (Ok(encode(&event)), subscription))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Poll cadence for sandbox job logs
const LOG_POLL_INTERVAL: Duration = Duration::from_secs(2);

struct LogStreamState {
    subscription: Subscription,
    state: AppState,
    task_id: Uuid,
    sent_len: usize,
    finished: bool,
}

/// GET /tasks/{task_id}/logs — status events plus incremental job logs
async fn stream_task_logs(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    debug!(%task_id, "starting task log stream");
    let subscription = state.bus.subscribe_task(task_id);

    let initial = LogStreamState {
        subscription,
        state,
        task_id,
        sent_len: 0,
        finished: false,
    };

    let stream = futures::stream::unfold(initial, |mut s| async move {
        if s.finished {
            return None;
        }

        loop {
            // Bus events (status changes, heartbeats) take priority; between
            // them, poll the sandbox for fresh log output
            match tokio::time::timeout(LOG_POLL_INTERVAL, s.subscription.receiver.recv()).await {
                Ok(Some(event)) => {
                    // A terminal status ends the stream after this event
                    if event.event == event_names::STATUS {
                        if let Some(status) = event.data.get("status").and_then(|v| v.as_str()) {
                            if matches!(status, "completed" | "failed" | "cancelled") {
                                s.finished = true;
                            }
                        }
                    }
                    return Some((Ok(encode(&event)), s));
                }
                Ok(None) => return None,
                Err(_) => {
                    // Timeout: check for new logs
                    let logs = s
                        .state
                        .sandbox
                        .job_logs(s.task_id)
                        .await
                        .ok()
                        .flatten()
                        .unwrap_or_default();
                    if logs.len() > s.sent_len {
                        let fresh = logs[s.sent_len..].to_string();
                        s.sent_len = logs.len();
                        let event = BusEvent::new(
                            event_names::LOG,
                            serde_json::json!({ "task_id": s.task_id, "logs": fresh }),
                        );
                        return Some((Ok(encode(&event)), s));
                    }
                }
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

//! The viewer stream: live log fan-out for one job.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use uuid::Uuid;

use cinch_core::error::CinchError;
use cinch_core::model::JobId;
use cinch_core::protocol::ViewerMessage;

use super::server::{ApiError, AppState};

/// WebSocket upgrade handler for log viewers.
pub async fn viewer_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let job_id = Uuid::parse_str(&id)
        .map(JobId::from_uuid)
        .map_err(|_| ApiError(CinchError::Validation(format!("invalid job id '{}'", id))))?;

    // Reject unknown jobs before the upgrade.
    state.store.get_job(job_id).await?;

    Ok(ws
        .on_upgrade(move |socket| handle_viewer_socket(socket, state, job_id))
        .into_response())
}

async fn handle_viewer_socket(socket: WebSocket, state: AppState, job_id: JobId) {
    let (mut sink, mut stream) = socket.split();

    let mut subscription = match state.logbus.subscribe(job_id, None).await {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::warn!(%job_id, "Log subscription failed: {}", e);
            return;
        }
    };

    // Replay stored history for a seamless join.
    for chunk in std::mem::take(&mut subscription.history) {
        let message = ViewerMessage::Chunk {
            stream: chunk.stream,
            ts_ms: chunk.ts_ms,
            data: chunk.data,
        };
        if send_viewer(&mut sink, &message).await.is_err() {
            state.logbus.unsubscribe(subscription.handle).await;
            return;
        }
    }

    // Already terminal: deliver the marker and close.
    if let Some(status) = subscription.terminal {
        let _ = send_viewer(&mut sink, &ViewerMessage::Terminal { status }).await;
        return;
    }

    loop {
        tokio::select! {
            message = subscription.receiver.recv() => {
                match message {
                    Some(message) => {
                        let is_terminal = matches!(message, ViewerMessage::Terminal { .. });
                        if send_viewer(&mut sink, &message).await.is_err() || is_terminal {
                            break;
                        }
                    }
                    // Topic released (terminal already delivered or the
                    // viewer was dropped as too slow).
                    None => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.logbus.unsubscribe(subscription.handle).await;
    tracing::debug!(%job_id, "Log viewer disconnected");
}

async fn send_viewer(
    sink: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    message: &ViewerMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(message).unwrap_or_default();
    sink.send(Message::Text(json.into())).await
}

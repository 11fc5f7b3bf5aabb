//! The worker stream.
//!
//! Bidirectional JSON frames over a WebSocket. The bearer token arrives in
//! the first frame after upgrade, never in the URL. Read deadlines are
//! renewed by heartbeats; each outbound send gets its own write deadline.

use std::collections::BTreeSet;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cinch_core::model::{JobOutcome, LogChunk, WorkerId, WorkerRegistration};
use cinch_core::protocol::{ServerMessage, WorkerMessage};

use super::server::AppState;

/// How long the client has to present its token and registration.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-send write deadline.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// WebSocket upgrade handler for workers.
pub async fn worker_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_worker_socket(socket, state))
}

async fn handle_worker_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // First frame: the bearer token.
    let Some(WorkerMessage::Auth { token }) = next_frame(&mut stream).await else {
        let _ = send_frame(&mut sink, &ServerMessage::AuthFail {
            reason: "expected auth frame".to_string(),
        })
        .await;
        return;
    };

    let token_row = match state.store.authenticate_worker_token(&token).await {
        Ok(row) => row,
        Err(e) => {
            tracing::warn!("Worker authentication failed: {}", e);
            let _ = send_frame(&mut sink, &ServerMessage::AuthFail {
                reason: "invalid credentials".to_string(),
            })
            .await;
            return;
        }
    };

    // Second frame: the advertisement.
    let Some(WorkerMessage::Register {
        name,
        hostname,
        labels,
        mode,
        concurrency,
        version,
    }) = next_frame(&mut stream).await
    else {
        let _ = send_frame(&mut sink, &ServerMessage::AuthFail {
            reason: "expected register frame".to_string(),
        })
        .await;
        return;
    };

    let registration = WorkerRegistration {
        name,
        hostname,
        labels: labels.into_iter().collect::<BTreeSet<_>>(),
        mode,
        concurrency: concurrency.max(1),
        version,
    };

    let worker_id = match state
        .store
        .register_worker(token_row.id, token_row.owner_user_id, &registration)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            tracing::error!("Worker registration failed: {}", e);
            return;
        }
    };

    if send_frame(&mut sink, &ServerMessage::AuthOk { worker_id })
        .await
        .is_err()
    {
        return;
    }

    let (sender, receiver) = mpsc::channel(state.dispatch_config.send_buffer);
    let cancel = CancellationToken::new();
    let conn_id = state
        .hub
        .register(
            worker_id,
            token_row.owner_user_id,
            registration,
            sender,
            cancel.clone(),
        )
        .await;

    tracing::info!(%worker_id, "Worker connected");

    let send_task = tokio::spawn(send_pump(sink, receiver));

    // Read until the deadline lapses (missed heartbeats), the stream ends,
    // or the connection is superseded, drained dry, or force-closed.
    let read_deadline = Duration::from_secs(
        state.dispatch_config.heartbeat_interval_secs
            * (state.dispatch_config.heartbeat_misses as u64 + 1),
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(%worker_id, "Worker connection closed by hub");
                break;
            }
            frame = tokio::time::timeout(read_deadline, stream.next()) => {
                match frame {
                    Err(_) => {
                        tracing::warn!(%worker_id, "Worker missed heartbeats");
                        break;
                    }
                    Ok(None) | Ok(Some(Err(_))) => break,
                    Ok(Some(Ok(Message::Close(_)))) => break,
                    Ok(Some(Ok(Message::Text(text)))) => {
                        match serde_json::from_str::<WorkerMessage>(&text) {
                            Ok(message) => {
                                handle_frame(&state, worker_id, message).await;
                            }
                            Err(e) => {
                                tracing::warn!(%worker_id, "Unparseable worker frame: {}", e);
                            }
                        }
                    }
                    Ok(Some(Ok(_))) => {}
                }
            }
        }
    }

    send_task.abort();
    state.hub.unregister(worker_id, conn_id).await;
    tracing::info!(%worker_id, "Worker disconnected");
}

/// Forward queued server messages onto the socket, one write deadline per
/// send.
async fn send_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut receiver: mpsc::Receiver<ServerMessage>,
) {
    while let Some(message) = receiver.recv().await {
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to encode server message: {}", e);
                continue;
            }
        };
        match tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Text(json.into()))).await {
            Ok(Ok(())) => {}
            _ => break,
        }
    }
}

async fn handle_frame(state: &AppState, worker_id: WorkerId, message: WorkerMessage) {
    match message {
        WorkerMessage::Log {
            job_id,
            attempt,
            stream,
            ts_ms,
            data,
        } => {
            // Only the assigned worker may publish a job's output.
            if !state.hub.is_assigned(worker_id, job_id).await {
                tracing::warn!(%worker_id, %job_id, "Dropping log chunk for unassigned job");
                return;
            }
            let chunk = LogChunk {
                job_id,
                attempt,
                stream,
                ts_ms,
                data,
            };
            if let Err(e) = state.logbus.publish(chunk).await {
                tracing::warn!(%job_id, "Failed to publish log chunk: {}", e);
            }
        }
        WorkerMessage::Complete {
            job_id,
            exit_code,
            duration_ms,
        } => {
            state.dispatcher.report_completion(
                worker_id,
                job_id,
                JobOutcome::from_exit(exit_code, duration_ms),
            );
        }
        WorkerMessage::Error {
            job_id,
            phase,
            message,
        } => {
            tracing::warn!(%worker_id, %job_id, phase = phase.as_str(), "Worker reported error: {}", message);
            state
                .dispatcher
                .report_completion(worker_id, job_id, JobOutcome::Error { phase });
        }
        WorkerMessage::Ping { active_jobs } => {
            if let Err(e) = state.store.touch_worker(worker_id).await {
                tracing::debug!(%worker_id, "Heartbeat persist failed: {}", e);
            }
            tracing::trace!(%worker_id, jobs = active_jobs.len(), "Heartbeat");
            state.hub.send(worker_id, ServerMessage::Pong).await;
        }
        WorkerMessage::Pong => {}
        WorkerMessage::Auth { .. } | WorkerMessage::Register { .. } => {
            tracing::warn!(%worker_id, "Unexpected handshake frame mid-stream");
        }
    }
}

/// Send one frame outside the pump (handshake only).
async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(message).unwrap_or_default();
    match tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Text(json.into()))).await {
        Ok(result) => result,
        Err(_) => Err(axum::Error::new(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write deadline elapsed",
        ))),
    }
}

/// Read the next JSON frame during the handshake.
async fn next_frame(stream: &mut SplitStream<WebSocket>) -> Option<WorkerMessage> {
    loop {
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return serde_json::from_str(&text).ok();
            }
            Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
            _ => return None,
        }
    }
}

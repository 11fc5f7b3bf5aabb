//! Relay client for self-hosted deployments behind NAT.
//!
//! Holds an outbound WebSocket to a public relay, authenticated by a
//! first-frame token. Inbound HTTP envelopes are replayed against the
//! local gateway and answered with response envelopes. Only envelopes
//! traverse the relay; webhook secrets never leave this process, since
//! signature verification happens in the local ingress.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use cinch_core::config::RelayConfig;
use cinch_core::error::{CinchError, Result};
use cinch_core::protocol::RelayFrame;

/// The relay link.
pub struct RelayClient {
    config: RelayConfig,
    local_base: String,
    http: reqwest::Client,
}

impl RelayClient {
    /// Build a client that forwards to the local gateway port.
    pub fn new(config: RelayConfig, gateway_port: u16) -> Self {
        Self {
            config,
            local_base: format!("http://127.0.0.1:{}", gateway_port),
            http: reqwest::Client::new(),
        }
    }

    /// Maintain the relay link until shutdown, reconnecting with bounded
    /// exponential backoff.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut backoff_secs = self.config.reconnect_backoff_secs.max(1);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.connect_once(&shutdown).await {
                Ok(()) => {
                    // Clean close; reconnect promptly.
                    backoff_secs = self.config.reconnect_backoff_secs.max(1);
                }
                Err(e) => {
                    tracing::warn!("Relay link failed: {}", e);
                }
            }

            if shutdown.is_cancelled() {
                break;
            }

            tracing::debug!("Reconnecting to relay in {}s", backoff_secs);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
            }
            backoff_secs = next_backoff(backoff_secs, self.config.reconnect_backoff_max_secs);
        }

        tracing::info!("Relay client stopped");
    }

    async fn connect_once(&self, shutdown: &CancellationToken) -> Result<()> {
        let (ws, _) = connect_async(self.config.url.as_str())
            .await
            .map_err(|e| CinchError::Upstream(format!("relay connect: {}", e)))?;
        let (mut sink, mut stream) = ws.split();

        // First frame: authenticate this deployment.
        let auth = serde_json::to_string(&RelayFrame::Auth {
            token: self.config.token.clone(),
        })?;
        sink.send(Message::Text(auth.into()))
            .await
            .map_err(|e| CinchError::Upstream(format!("relay auth send: {}", e)))?;

        match read_frame(&mut stream).await? {
            Some(RelayFrame::AuthOk) => {
                tracing::info!("Relay link established");
            }
            Some(_) | None => {
                return Err(CinchError::Auth("relay rejected the token".to_string()));
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                frame = read_frame(&mut stream) => {
                    match frame? {
                        Some(RelayFrame::Request { id, method, path, headers, body }) => {
                            let response = self.forward(id, &method, &path, headers, &body).await;
                            let json = serde_json::to_string(&response)?;
                            sink.send(Message::Text(json.into()))
                                .await
                                .map_err(|e| CinchError::Upstream(format!("relay send: {}", e)))?;
                        }
                        Some(other) => {
                            tracing::debug!("Ignoring unexpected relay frame: {:?}", other);
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Replay one envelope against the local gateway.
    async fn forward(
        &self,
        id: u64,
        method: &str,
        path: &str,
        headers: Vec<(String, String)>,
        body_b64: &str,
    ) -> RelayFrame {
        let url = format!("{}{}", self.local_base, path);
        let method = match reqwest::Method::from_bytes(method.as_bytes()) {
            Ok(method) => method,
            Err(_) => return error_response(id, 400),
        };
        let body = match BASE64.decode(body_b64) {
            Ok(body) => body,
            Err(_) => return error_response(id, 400),
        };

        let mut request = self.http.request(method, &url).body(body);
        for (name, value) in &headers {
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let headers = response
                    .headers()
                    .iter()
                    .filter_map(|(name, value)| {
                        value
                            .to_str()
                            .ok()
                            .map(|v| (name.as_str().to_string(), v.to_string()))
                    })
                    .collect();
                let body = response.bytes().await.unwrap_or_default();
                RelayFrame::Response {
                    id,
                    status,
                    headers,
                    body: BASE64.encode(body),
                }
            }
            Err(e) => {
                tracing::warn!("Local forward failed: {}", e);
                error_response(id, 502)
            }
        }
    }
}

fn error_response(id: u64, status: u16) -> RelayFrame {
    RelayFrame::Response {
        id,
        status,
        headers: Vec::new(),
        body: String::new(),
    }
}

/// Doubling backoff, bounded.
fn next_backoff(current_secs: u64, max_secs: u64) -> u64 {
    current_secs.saturating_mul(2).min(max_secs.max(1))
}

async fn read_frame<S>(stream: &mut S) -> Result<Option<RelayFrame>>
where
    S: StreamExt<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let frame = serde_json::from_str(&text)
                    .map_err(|e| CinchError::Protocol(format!("bad relay frame: {}", e)))?;
                return Ok(Some(frame));
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(CinchError::Upstream(format!("relay stream: {}", e)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        assert_eq!(next_backoff(1, 60), 2);
        assert_eq!(next_backoff(2, 60), 4);
        assert_eq!(next_backoff(32, 60), 60);
        assert_eq!(next_backoff(60, 60), 60);
    }

    #[test]
    fn test_error_response_shape() {
        match error_response(7, 502) {
            RelayFrame::Response { id, status, body, .. } => {
                assert_eq!(id, 7);
                assert_eq!(status, 502);
                assert!(body.is_empty());
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_request_frame_roundtrip() {
        let frame = RelayFrame::Request {
            id: 1,
            method: "POST".to_string(),
            path: "/hooks/github".to_string(),
            headers: vec![("x-github-event".to_string(), "push".to_string())],
            body: BASE64.encode(b"{}"),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let parsed: RelayFrame = serde_json::from_str(&json).unwrap();
        match parsed {
            RelayFrame::Request { path, .. } => assert_eq!(path, "/hooks/github"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

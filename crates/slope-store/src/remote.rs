use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tracing::{debug, info, warn};
use uuid::Uuid;

use slope_types::api::{ErrorBody, Filter, LikeToggle, Query, ToggleLikeRequest};
use slope_types::events::{ChangeEvent, ChangeKind, RealtimeCommand, RealtimeEvent, Resource};

use crate::{ChangeStream, DataStore, StoreError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for a running slope server: REST for reads and writes, one
/// WebSocket per realtime subscription.
#[derive(Clone)]
pub struct RemoteStore {
    http: reqwest::Client,
    base_url: Url,
    token: String,
}

impl RemoteStore {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, StoreError> {
        // A trailing slash makes `join` append instead of replacing the last segment
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| StoreError::Rejected(format!("invalid base url '{}': {}", base_url, e)))?;

        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Transient(format!("http client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            token: token.into(),
        })
    }

    /// Build from `SLOPE_URL` (default http://127.0.0.1:3000) and
    /// `SLOPE_ACCESS_TOKEN`.
    pub fn from_env() -> Result<Self, StoreError> {
        let url = std::env::var("SLOPE_URL").unwrap_or_else(|_| "http://127.0.0.1:3000".into());
        let token = std::env::var("SLOPE_ACCESS_TOKEN")
            .map_err(|_| StoreError::Unauthorized("SLOPE_ACCESS_TOKEN is not set".into()))?;
        Self::new(&url, token)
    }

    fn url(&self, path: &str) -> Result<Url, StoreError> {
        self.base_url
            .join(path)
            .map_err(|e| StoreError::Rejected(format!("invalid path '{}': {}", path, e)))
    }

    fn realtime_url(&self) -> Result<Url, StoreError> {
        let mut url = self.url("realtime")?;
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| StoreError::Rejected(format!("cannot derive realtime url from {}", self.base_url)))?;
        url.query_pairs_mut().append_pair("access_token", &self.token);
        Ok(url)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, StoreError> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|e| {
                if e.is_decode() {
                    StoreError::Rejected(format!("unexpected response body: {}", e))
                } else {
                    StoreError::Transient(e.to_string())
                }
            });
        }

        let message = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| status.to_string());
        Err(status_error(status, message))
    }
}

impl DataStore for RemoteStore {
    async fn query(&self, query: Query) -> Result<Vec<Value>, StoreError> {
        let url = self.url(&format!("rest/{}", query.resource))?;

        let mut params = query.filter.to_query_pairs();
        if let Some(order) = &query.order {
            params.push(("order".into(), order.to_string()));
        }
        if let Some(limit) = query.limit {
            params.push(("limit".into(), limit.to_string()));
        }

        self.send(self.http.get(url).query(&params)).await
    }

    async fn fetch(&self, resource: Resource, id: Uuid) -> Result<Value, StoreError> {
        let url = self.url(&format!("rest/{}/{}", resource, id))?;
        self.send(self.http.get(url)).await
    }

    async fn insert(&self, resource: Resource, row: Value) -> Result<Value, StoreError> {
        let url = self.url(&format!("rest/{}", resource))?;
        self.send(self.http.post(url).json(&row)).await
    }

    async fn toggle_like(&self, user_id: Uuid, photo_id: Uuid) -> Result<LikeToggle, StoreError> {
        let url = self.url("rpc/toggle_like")?;
        let body = ToggleLikeRequest {
            photo_id,
            user_id: Some(user_id),
        };
        self.send(self.http.post(url).json(&body)).await
    }

    async fn subscribe(
        &self,
        resource: Resource,
        filter: Filter,
        events: Vec<ChangeKind>,
    ) -> Result<ChangeStream, StoreError> {
        let url = self.realtime_url()?;
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(socket_error)?;
        let (mut sink, mut stream) = socket.split();

        let command = RealtimeCommand::Subscribe { resource, filter, events };
        let text = serde_json::to_string(&command).map_err(|e| StoreError::Rejected(e.to_string()))?;
        sink.send(WsMessage::text(text)).await.map_err(socket_error)?;

        // Wait for the server to confirm before reporting the subscription live
        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<RealtimeEvent>(text.as_str()) {
                    Ok(RealtimeEvent::Subscribed { .. }) => break,
                    Ok(RealtimeEvent::Error { message }) => return Err(StoreError::Rejected(message)),
                    Ok(RealtimeEvent::Change(_)) => {}
                    Err(e) => warn!("Unreadable realtime frame during handshake: {}", e),
                },
                Some(Ok(WsMessage::Close(_))) | None => {
                    return Err(StoreError::Transient("realtime socket closed during subscribe".into()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(socket_error(e)),
            }
        }

        info!("Realtime subscription to {} established", resource);

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                    frame = stream.next() => match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            if !forward_frame(&tx, text.as_str()) {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        // Pings are answered by tungstenite on the next read
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Realtime socket for {} failed: {}", resource, e);
                            break;
                        }
                    }
                }
            }
            debug!("Realtime stream for {} closed", resource);
        });

        Ok(ChangeStream::new(rx))
    }
}

/// Returns false once nobody is listening any more.
fn forward_frame(tx: &mpsc::UnboundedSender<ChangeEvent>, text: &str) -> bool {
    match serde_json::from_str::<RealtimeEvent>(text) {
        Ok(RealtimeEvent::Change(event)) => tx.send(event).is_ok(),
        Ok(RealtimeEvent::Error { message }) => {
            warn!("Realtime error from server: {}", message);
            true
        }
        Ok(RealtimeEvent::Subscribed { .. }) => true,
        Err(e) => {
            warn!("Unreadable realtime frame: {} -- raw: {}", e, preview(text));
            true
        }
    }
}

fn preview(text: &str) -> String {
    text.chars().take(200).collect()
}

fn status_error(status: StatusCode, message: String) -> StoreError {
    match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Unauthorized(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => StoreError::Transient(message),
        s if s.is_server_error() => StoreError::Transient(message),
        _ => StoreError::Rejected(message),
    }
}

fn transport_error(e: reqwest::Error) -> StoreError {
    if e.is_builder() {
        StoreError::Rejected(e.to_string())
    } else {
        StoreError::Transient(e.to_string())
    }
}

fn socket_error(e: tungstenite::Error) -> StoreError {
    match e {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            let code = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            status_error(code, format!("realtime handshake rejected: {}", status))
        }
        other => StoreError::Transient(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_built_under_the_base_path() {
        let store = RemoteStore::new("http://localhost:3000/api", "tok").unwrap();
        assert_eq!(
            store.url("rest/chat_messages").unwrap().as_str(),
            "http://localhost:3000/api/rest/chat_messages"
        );
        assert_eq!(
            store.realtime_url().unwrap().as_str(),
            "ws://localhost:3000/api/realtime?access_token=tok"
        );

        let secure = RemoteStore::new("https://slope.example/", "tok").unwrap();
        assert!(secure.realtime_url().unwrap().as_str().starts_with("wss://slope.example/realtime"));
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(matches!(RemoteStore::new("not a url", "tok"), Err(StoreError::Rejected(_))));
    }

    #[test]
    fn statuses_map_onto_the_taxonomy() {
        let classify = |s| status_error(s, String::new());
        assert!(classify(StatusCode::NOT_FOUND).is_not_found());
        assert!(matches!(classify(StatusCode::FORBIDDEN), StoreError::Unauthorized(_)));
        assert!(classify(StatusCode::SERVICE_UNAVAILABLE).is_retryable());
        assert!(classify(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(matches!(classify(StatusCode::UNPROCESSABLE_ENTITY), StoreError::Rejected(_)));
    }

    #[test]
    fn frames_forward_until_receiver_drops() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let event = serde_json::json!({
            "type": "Change",
            "data": {
                "resource": "chat_messages",
                "kind": "INSERT",
                "id": "6f1d0c3a-4a57-4b8e-9a43-3e1c5d2f0a11",
                "record": { "id": "6f1d0c3a-4a57-4b8e-9a43-3e1c5d2f0a11" },
                "commit_timestamp": "2024-01-05T10:00:00Z"
            }
        })
        .to_string();

        assert!(forward_frame(&tx, &event));
        assert_eq!(rx.try_recv().unwrap().kind, ChangeKind::Insert);
        assert!(forward_frame(&tx, "garbage"));

        drop(rx);
        assert!(!forward_frame(&tx, &event));
    }

    #[test]
    fn unreadable_frame_with_multibyte_text_is_logged() {
        let subscriber = tracing_subscriber::fmt().with_test_writer().finish();
        tracing::subscriber::with_default(subscriber, || {
            let (tx, _rx) = mpsc::unbounded_channel();
            let frame = format!("{}\u{1F3C2} not json", "x".repeat(199));
            assert!(forward_frame(&tx, &frame));
        });

        let cut = preview(&format!("{}\u{1F3C2}\u{1F3C2}", "x".repeat(199)));
        assert_eq!(cut.chars().count(), 200);
        assert!(cut.ends_with('\u{1F3C2}'));
    }
}

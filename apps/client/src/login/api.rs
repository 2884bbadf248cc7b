/// Handshake service client: the only code that talks to the QR login endpoints.
///
/// Endpoints (relative to the configured base, e.g. `https://host/api/boss/login`):
///   POST /start                        → StartResponse
///   GET  /qrcode?format=base64&t=<ms>  → 404 until generated, then a QrCodePayload
///   GET  /status                       → StatusResponse
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::credentials::CredentialSource;
use crate::errors::HandshakeError;
use crate::models::login::{parse_qrcode_body, QrArtifact, StartResponse, StatusResponse};

/// Seam between the login controller and the handshake service.
#[async_trait]
pub trait HandshakeApi: Send + Sync {
    async fn start(&self) -> Result<StartResponse, HandshakeError>;

    /// `Ok(None)` when the service answered but had no image in the body.
    /// A 404 is reported as `HandshakeError::NotFound`.
    async fn fetch_qrcode(&self) -> Result<Option<QrArtifact>, HandshakeError>;

    async fn fetch_status(&self) -> Result<StatusResponse, HandshakeError>;
}

#[derive(Clone)]
pub struct HttpHandshakeApi {
    client: Client,
    base_url: String,
    credentials: Arc<dyn CredentialSource>,
}

impl HttpHandshakeApi {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Arc<dyn CredentialSource>,
        timeout: Duration,
    ) -> Result<Self, HandshakeError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.credentials.token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl HandshakeApi for HttpHandshakeApi {
    async fn start(&self) -> Result<StartResponse, HandshakeError> {
        let response = self
            .authorized(self.client.post(self.url("start")))
            .header("content-type", "application/json")
            .send()
            .await?;
        read_json(response).await
    }

    async fn fetch_qrcode(&self) -> Result<Option<QrArtifact>, HandshakeError> {
        let cache_buster = chrono::Utc::now().timestamp_millis();
        let response = self
            .authorized(self.client.get(self.url("qrcode")))
            .query(&[("format", "base64".to_string()), ("t", cache_buster.to_string())])
            .header("accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(HandshakeError::NotFound);
        }
        let body = response.text().await?;
        if !status.is_success() {
            return Err(HandshakeError::Status {
                status: status.as_u16(),
                body,
            });
        }

        parse_qrcode_body(&body).map_err(|e| HandshakeError::Decode(e.to_string()))
    }

    async fn fetch_status(&self) -> Result<StatusResponse, HandshakeError> {
        let response = self
            .authorized(self.client.get(self.url("status")))
            .send()
            .await?;
        read_json(response).await
    }
}

/// The service reports flow outcomes in JSON even on non-2xx responses, so the
/// body is parsed first and the status code only decides how a parse failure
/// is reported.
async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, HandshakeError> {
    let status = response.status();
    let body = response.text().await?;
    match serde_json::from_str::<T>(&body) {
        Ok(value) => Ok(value),
        Err(_) if !status.is_success() => Err(HandshakeError::Status {
            status: status.as_u16(),
            body,
        }),
        Err(e) => {
            debug!("Unparseable handshake response body: {body}");
            Err(HandshakeError::Decode(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{
        extract::{Query, State},
        http::{HeaderMap, StatusCode as AxumStatus},
        response::IntoResponse,
        routing::{get, post},
        Json, Router,
    };
    use serde_json::json;

    use crate::credentials::MemoryCredentials;
    use crate::models::login::RemoteLoginStatus;

    async fn start_handler(headers: HeaderMap) -> impl IntoResponse {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        Json(json!({ "success": true, "status": "started", "message": auth }))
    }

    async fn qrcode_handler(
        State(hits): State<Arc<AtomicUsize>>,
        Query(params): Query<HashMap<String, String>>,
    ) -> axum::response::Response {
        assert_eq!(params.get("format").map(String::as_str), Some("base64"));
        assert!(params.contains_key("t"));
        if hits.fetch_add(1, Ordering::SeqCst) == 0 {
            AxumStatus::NOT_FOUND.into_response()
        } else {
            Json(json!("aGVsbG8=")).into_response()
        }
    }

    async fn status_handler() -> impl IntoResponse {
        Json(json!({ "status": "waiting", "isInProgress": true, "elapsedSeconds": 12 }))
    }

    async fn broken_handler() -> impl IntoResponse {
        (AxumStatus::BAD_GATEWAY, "<html>upstream down</html>")
    }

    async fn spawn_server() -> String {
        let app = Router::new()
            .route("/ok/start", post(start_handler))
            .route("/ok/qrcode", get(qrcode_handler))
            .route("/ok/status", get(status_handler))
            .route("/broken/qrcode", get(broken_handler))
            .route("/broken/status", get(broken_handler))
            .with_state(Arc::new(AtomicUsize::new(0)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn api(base: String, token: Option<&str>) -> HttpHandshakeApi {
        HttpHandshakeApi::new(
            base,
            Arc::new(MemoryCredentials::new(token.map(str::to_string))),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_sends_bearer_token() {
        let base = spawn_server().await;
        let resp = api(format!("{base}/ok/"), Some("tok")).start().await.unwrap();
        assert!(resp.flow_started());
        assert_eq!(resp.message.as_deref(), Some("Bearer tok"));
    }

    #[tokio::test]
    async fn test_start_without_token_sends_no_auth_header() {
        let base = spawn_server().await;
        let resp = api(format!("{base}/ok"), None).start().await.unwrap();
        assert_eq!(resp.message.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_qrcode_404_then_raw_string() {
        let base = spawn_server().await;
        let client = api(format!("{base}/ok"), Some("tok"));

        let first = client.fetch_qrcode().await;
        assert!(matches!(first, Err(HandshakeError::NotFound)));

        let second = client.fetch_qrcode().await.unwrap().unwrap();
        assert_eq!(second.data_uri(), "data:image/png;base64,aGVsbG8=");
    }

    #[tokio::test]
    async fn test_status_decodes_progress_fields() {
        let base = spawn_server().await;
        let status = api(format!("{base}/ok"), None).fetch_status().await.unwrap();
        assert_eq!(status.status, RemoteLoginStatus::Waiting);
        assert_eq!(status.is_in_progress, Some(true));
        assert_eq!(status.elapsed_seconds, Some(12));
    }

    #[tokio::test]
    async fn test_server_errors_are_retryable_status_errors() {
        let base = spawn_server().await;
        let client = api(format!("{base}/broken"), None);

        let err = client.fetch_qrcode().await.unwrap_err();
        assert!(matches!(err, HandshakeError::Status { status: 502, .. }));
        assert!(err.is_retryable());

        let err = client.fetch_status().await.unwrap_err();
        assert!(matches!(err, HandshakeError::Status { status: 502, .. }));
    }
}

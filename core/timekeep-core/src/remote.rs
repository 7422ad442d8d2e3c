//! Boundary to the remote authoritative service.
//!
//! The scheduler only sees the [`RemoteService`] trait; [`HttpRemote`] is the
//! production implementation (HTTP+JSON, bearer token). Tests script their own
//! implementations.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use timekeep_protocol::routes;

use crate::error::SyncError;

const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub method: HttpMethod,
    pub path: String,
    pub body: Option<Value>,
}

impl RemoteRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.into(),
            body,
        }
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Put,
            path: path.into(),
            body: Some(body),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Delete,
            path: path.into(),
            body: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid response body: {0}")]
    InvalidResponse(String),
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Transport(message) => SyncError::Network(message),
            RemoteError::Unauthorized => SyncError::AuthExpired,
            RemoteError::Status { status, message } if (400..500).contains(&status) => {
                SyncError::Validation { status, message }
            }
            RemoteError::Status { status, message } => SyncError::Server { status, message },
            RemoteError::InvalidResponse(message) => SyncError::InvalidResponse(message),
        }
    }
}

/// Bearer credentials for the remote service.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(alias = "token")]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

pub trait RemoteService: Send + Sync {
    fn send(&self, request: &RemoteRequest, bearer: Option<&str>) -> Result<Value, RemoteError>;

    /// Exchanges a refresh token for new credentials.
    fn refresh(&self, refresh_token: &str) -> Result<Credentials, RemoteError>;
}

#[derive(Debug, Clone)]
pub struct HttpRemoteConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpRemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct HttpRemote {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpRemote {
    pub fn new(config: &HttpRemoteConfig) -> Result<Self, RemoteError> {
        let base_url = config.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(RemoteError::Transport(
                "remote base_url must not be empty".to_string(),
            ));
        }
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| RemoteError::Transport(err.to_string()))?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

impl RemoteService for HttpRemote {
    fn send(&self, request: &RemoteRequest, bearer: Option<&str>) -> Result<Value, RemoteError> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };
        let mut builder = self.client.request(method, self.url(&request.path));
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .map_err(|err| RemoteError::Transport(err.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .map_err(|err| RemoteError::Transport(err.to_string()))?;
        decode_response(status, &text)
    }

    fn refresh(&self, refresh_token: &str) -> Result<Credentials, RemoteError> {
        let request = RemoteRequest::post(
            routes::AUTH_REFRESH,
            Some(serde_json::json!({ "refresh_token": refresh_token })),
        );
        let value = self.send(&request, None)?;
        serde_json::from_value(value).map_err(|err| RemoteError::InvalidResponse(err.to_string()))
    }
}

/// Maps a raw HTTP status and body onto the remote error taxonomy.
pub fn decode_response(status: u16, body: &str) -> Result<Value, RemoteError> {
    if status == 401 {
        return Err(RemoteError::Unauthorized);
    }
    if !(200..300).contains(&status) {
        return Err(RemoteError::Status {
            status,
            message: error_message(body),
        });
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(body).map_err(|err| RemoteError::InvalidResponse(err.to_string()))
}

fn error_message(body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        ["message", "error", "detail"]
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str).map(str::to_string))
    });
    let message = from_json.unwrap_or_else(|| body.trim().to_string());
    message.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_maps_statuses() {
        assert_eq!(decode_response(401, ""), Err(RemoteError::Unauthorized));
        assert_eq!(decode_response(204, ""), Ok(Value::Null));
        assert_eq!(
            decode_response(200, r#"{"id":"p1"}"#),
            Ok(serde_json::json!({"id": "p1"}))
        );
        assert_eq!(
            decode_response(422, r#"{"message":"name is required"}"#),
            Err(RemoteError::Status {
                status: 422,
                message: "name is required".to_string()
            })
        );
    }

    #[test]
    fn status_errors_classify_by_range() {
        let validation: SyncError = RemoteError::Status {
            status: 409,
            message: "conflict".to_string(),
        }
        .into();
        assert!(matches!(validation, SyncError::Validation { status: 409, .. }));

        let server: SyncError = RemoteError::Status {
            status: 502,
            message: "bad gateway".to_string(),
        }
        .into();
        assert!(server.is_retryable());
    }

    #[test]
    fn unparseable_success_body_is_terminal() {
        let err: SyncError = decode_response(200, "<html>maintenance</html>")
            .expect_err("not json")
            .into();
        assert!(matches!(err, SyncError::InvalidResponse(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = Credentials {
            access_token: "secret-access".to_string(),
            refresh_token: Some("secret-refresh".to_string()),
        };
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn http_remote_rejects_empty_base_url() {
        let config = HttpRemoteConfig {
            base_url: "  ".to_string(),
            ..HttpRemoteConfig::default()
        };
        assert!(HttpRemote::new(&config).is_err());
    }

    #[test]
    fn http_remote_joins_paths() {
        let config = HttpRemoteConfig {
            base_url: "https://tracker.example/".to_string(),
            ..HttpRemoteConfig::default()
        };
        let remote = HttpRemote::new(&config).expect("client");
        assert_eq!(remote.url("/api/projects"), "https://tracker.example/api/projects");
        assert_eq!(remote.url("api/projects"), "https://tracker.example/api/projects");
    }
}

//! Authenticated request pipeline.
//!
//! Every REST call of the client goes through [`ApiClient::execute`]. The
//! pipeline attaches the stored access credential, and on a 401 from a
//! protected endpoint refreshes the credential pair once and re-issues the
//! request once. Refreshes are single-flight: concurrent callers that fail
//! with the same expired token share one refresh.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::AUTHORIZATION;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use kindred_protocol::auth::{RefreshRequest, RefreshResponse};

use super::error::{ApiError, ApiResult};
use crate::auth::{CredentialPair, CredentialStore};

/// Prefix of the endpoints that issue credentials. Never intercepted.
pub const AUTH_PATH_PREFIX: &str = "/users/auth/";

/// Endpoint that exchanges a refresh token for a new pair.
pub const REFRESH_PATH: &str = "/users/auth/refresh/";

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One field of a multipart body.
#[derive(Debug, Clone)]
pub enum MultipartField {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        mime: Option<String>,
        bytes: Bytes,
    },
}

/// Body of an [`ApiRequest`].
///
/// Multipart bodies are kept as owned fields so the form can be rebuilt for
/// the retried attempt.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    Multipart(Vec<MultipartField>),
}

/// A REST call relative to the configured base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: RequestBody,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> ApiResult<Self> {
        let value = serde_json::to_value(body)
            .map_err(|e| ApiError::Decode(format!("Failed to encode request body: {}", e)))?;
        self.body = RequestBody::Json(value);
        Ok(self)
    }

    pub fn multipart(mut self, fields: Vec<MultipartField>) -> Self {
        self.body = RequestBody::Multipart(fields);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Login, register and refresh must never carry a bearer or trigger a
    /// refresh of their own.
    pub fn is_credential_issuing(&self) -> bool {
        self.path.starts_with(AUTH_PATH_PREFIX)
    }
}

/// REST client with credential injection and refresh-on-401.
pub struct ApiClient {
    http: Client,
    base_url: String,
    credentials: Arc<dyn CredentialStore>,
    refresh_lock: Mutex<()>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Create a client for `base_url` (e.g. `http://localhost:8000/api`).
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        credentials: Arc<dyn CredentialStore>,
    ) -> ApiResult<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::transport(&base_url, e))?;

        Ok(Self {
            http,
            base_url,
            credentials,
            refresh_lock: Mutex::new(()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Issue `request` and return the successful response.
    ///
    /// At most one refresh and one retried request happen per call; a 401 on
    /// the retried request is returned as is.
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn execute(&self, request: &ApiRequest) -> ApiResult<Response> {
        if request.is_credential_issuing() {
            return self.send_once(request, None).await;
        }

        let access = self.credentials.get().map(|pair| pair.access);
        match self.send_once(request, access.as_deref()).await {
            Err(ApiError::AuthExpired) => self.refresh_and_retry(request, access).await,
            other => other,
        }
    }

    /// Issue `request` and decode the JSON body.
    pub async fn send<T: DeserializeOwned>(&self, request: &ApiRequest) -> ApiResult<T> {
        let response = self.execute(request).await?;
        decode(response).await
    }

    /// Issue `request` and discard the body.
    pub async fn send_empty(&self, request: &ApiRequest) -> ApiResult<()> {
        self.execute(request).await.map(drop)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        self.send(&ApiRequest::get(path)).await
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> ApiResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(&ApiRequest::post(path).json(body)?).await
    }

    pub async fn patch_json<B, T>(&self, path: &str, body: &B) -> ApiResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(&ApiRequest::patch(path).json(body)?).await
    }

    pub async fn delete(&self, path: &str) -> ApiResult<()> {
        self.send_empty(&ApiRequest::delete(path)).await
    }

    async fn refresh_and_retry(
        &self,
        request: &ApiRequest,
        used_access: Option<String>,
    ) -> ApiResult<Response> {
        let access = {
            let _guard = self.refresh_lock.lock().await;

            let Some(current) = self.credentials.get() else {
                debug!("No refresh credential stored, propagating 401");
                return Err(ApiError::AuthExpired);
            };

            if used_access.as_deref() == Some(current.access.as_str()) {
                self.refresh(current).await?
            } else {
                debug!("Credential pair changed while waiting, reusing it");
                current.access
            }
        };

        debug!("Retrying request with refreshed credential");
        self.send_once(request, Some(&access)).await
    }

    /// Exchange the stored refresh token for a new pair. Must be called with
    /// the refresh lock held.
    async fn refresh(&self, current: CredentialPair) -> ApiResult<String> {
        info!("Access credential expired, refreshing");
        let url = self.url(REFRESH_PATH);
        let body = RefreshRequest {
            refresh: current.refresh.clone(),
        };

        let result = async {
            let response = self
                .http
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| ApiError::transport(&url, e))?;
            let response = check_status(response).await?;
            decode::<RefreshResponse>(response).await
        }
        .await;

        match result {
            Ok(tokens) => {
                let pair = CredentialPair::new(
                    tokens.access,
                    tokens.refresh.unwrap_or(current.refresh),
                );
                let access = pair.access.clone();
                self.credentials.set(pair)?;
                debug!("Stored refreshed credential pair");
                Ok(access)
            }
            Err(err) => {
                warn!("Credential refresh failed, signing out: {}", err);
                if let Err(clear_err) = self.credentials.clear() {
                    warn!("Failed to clear credential store: {}", clear_err);
                }
                Err(match err {
                    ApiError::AuthExpired => {
                        ApiError::AuthInvalid("refresh token rejected".to_string())
                    }
                    ApiError::Validation { message, .. } => ApiError::AuthInvalid(message),
                    other => other,
                })
            }
        }
    }

    async fn send_once(&self, request: &ApiRequest, access: Option<&str>) -> ApiResult<Response> {
        let url = self.url(&request.path);
        let mut builder = self.http.request(request.method.clone(), &url);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(access) = access {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", access));
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Multipart(fields) => builder.multipart(build_form(fields, &url)?),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::transport(&url, e))?;
        check_status(response).await
    }
}

fn build_form(fields: &[MultipartField], url: &str) -> ApiResult<Form> {
    let mut form = Form::new();
    for field in fields {
        form = match field {
            MultipartField::Text { name, value } => form.text(name.clone(), value.clone()),
            MultipartField::File {
                name,
                file_name,
                mime,
                bytes,
            } => {
                let mut part = Part::bytes(bytes.to_vec()).file_name(file_name.clone());
                if let Some(mime) = mime {
                    part = part
                        .mime_str(mime)
                        .map_err(|e| ApiError::transport(url, e))?;
                }
                form.part(name.clone(), part)
            }
        };
    }
    Ok(form)
}

async fn check_status(response: Response) -> ApiResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    debug!("Request failed with {}", status);
    Err(ApiError::from_status(status, &body))
}

async fn decode<T: DeserializeOwned>(response: Response) -> ApiResult<T> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ApiError::Decode(format!("Failed to read response body: {}", e)))?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryCredentialStore;

    #[test]
    fn test_credential_issuing_paths() {
        assert!(ApiRequest::post("/users/auth/login/").is_credential_issuing());
        assert!(ApiRequest::post("/users/auth/refresh/").is_credential_issuing());
        assert!(!ApiRequest::get("/users/profiles/me/").is_credential_issuing());
        assert!(!ApiRequest::get("/chat/messages/").is_credential_issuing());
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = ApiClient::new(
            "http://localhost:8000/api/",
            DEFAULT_TIMEOUT,
            Arc::new(MemoryCredentialStore::new()),
        )
        .unwrap();
        assert_eq!(client.base_url(), "http://localhost:8000/api");
        assert_eq!(
            client.url("/users/profiles/"),
            "http://localhost:8000/api/users/profiles/"
        );
    }

    #[test]
    fn test_request_builder() {
        let request = ApiRequest::get("/chat/messages/").query("match_id", "m1");
        assert_eq!(request.method(), &Method::GET);
        assert_eq!(request.query, vec![("match_id".to_string(), "m1".to_string())]);

        let request = ApiRequest::post("/social/swipes/")
            .json(&serde_json::json!({"target": "p1", "value": "LIKE"}))
            .unwrap();
        assert!(matches!(request.body, RequestBody::Json(_)));
    }

    #[tokio::test]
    async fn test_transport_failure_is_not_refreshed() {
        let store = Arc::new(MemoryCredentialStore::with_pair(CredentialPair::new(
            "a1", "r1",
        )));
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = ApiClient::new(
            format!("http://127.0.0.1:{}", port),
            Duration::from_secs(2),
            store.clone(),
        )
        .unwrap();

        let err = client.get_json::<serde_json::Value>("/users/profiles/me/").await;
        assert!(matches!(err, Err(ApiError::Transport { .. })));
        assert_eq!(store.get(), Some(CredentialPair::new("a1", "r1")));
    }
}

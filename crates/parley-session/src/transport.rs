use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use url::Url;

use parley_types::ApiError;

/// Upload bodies are fed to the connection in slices of this size so progress
/// can be observed while the request is in flight.
const UPLOAD_SLICE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_reqwest().as_str())
    }
}

/// Shared progress counters for a multipart upload.
#[derive(Debug, Default)]
pub struct UploadProgress {
    pub bytes_done: AtomicU64,
    pub bytes_total: AtomicU64,
}

impl UploadProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn start(&self, total: u64) {
        self.bytes_total.store(total, Ordering::Relaxed);
        self.bytes_done.store(0, Ordering::Relaxed);
    }

    fn advance(&self, n: u64) {
        self.bytes_done.fetch_add(n, Ordering::Relaxed);
    }

    /// Whole-number percentage, 0 until the upload starts.
    pub fn percent(&self) -> u8 {
        let total = self.bytes_total.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        let done = self.bytes_done.load(Ordering::Relaxed).min(total);
        ((done * 100) / total) as u8
    }
}

/// A single file field of a multipart request.
#[derive(Clone)]
pub struct UploadPart {
    pub field: String,
    pub file_name: String,
    pub mime: String,
    pub data: Bytes,
    pub progress: Option<Arc<UploadProgress>>,
}

impl fmt::Debug for UploadPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadPart")
            .field("field", &self.field)
            .field("file_name", &self.file_name)
            .field("mime", &self.mime)
            .field("len", &self.data.len())
            .finish()
    }
}

impl UploadPart {
    fn to_form(&self) -> Result<Form, ApiError> {
        let total = self.data.len() as u64;
        if let Some(progress) = &self.progress {
            progress.start(total);
        }

        let data = self.data.clone();
        let slices: Vec<Bytes> = (0..data.len())
            .step_by(UPLOAD_SLICE)
            .map(|start| data.slice(start..(start + UPLOAD_SLICE).min(data.len())))
            .collect();
        let progress = self.progress.clone();
        let stream = futures_util::stream::iter(slices).map(move |slice| {
            if let Some(progress) = &progress {
                progress.advance(slice.len() as u64);
            }
            Ok::<_, std::io::Error>(slice)
        });

        let part = Part::stream_with_length(reqwest::Body::wrap_stream(stream), total)
            .file_name(self.file_name.clone())
            .mime_str(&self.mime)
            .map_err(|e| ApiError::Network(format!("invalid mime '{}': {}", self.mime, e)))?;
        Ok(Form::new().part(self.field.clone(), part))
    }
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Upload(UploadPart),
}

/// A REST call, relative to the gateway's base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    /// Caller-held handle for cancelling just this request.
    pub cancel: Option<CancellationToken>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
            cancel: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, ApiError> {
        self.body = RequestBody::Json(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn upload(mut self, part: UploadPart) -> Self {
        self.body = RequestBody::Upload(part);
        self
    }

    pub fn cancel_with(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Raw HTTP outcome. Non-2xx statuses are not errors at this layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    /// Server-provided message, falling back to the status line.
    pub fn error_message(&self) -> String {
        self.body
            .get("message")
            .or_else(|| self.body.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {}", self.status))
    }
}

/// Moves one request over the wire. Implemented by [`ReqwestTransport`]
/// in production and by in-memory fakes in tests.
pub trait Transport: Send + Sync + 'static {
    fn execute(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> impl Future<Output = Result<ApiResponse, ApiError>> + Send;
}

pub struct ReqwestTransport {
    client: Client,
    base_url: Url,
}

impl ReqwestTransport {
    /// `timeout` applies to every call; an expired call is a network error,
    /// never an authentication failure.
    pub fn new(mut base_url: Url, timeout: Duration) -> Result<Self, ApiError> {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(format!("cannot build http client: {}", e)))?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

fn classify(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::Network(e.to_string())
    }
}

impl Transport for ReqwestTransport {
    async fn execute(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        let url = self
            .base_url
            .join(request.path.trim_start_matches('/'))
            .map_err(|e| ApiError::Network(format!("bad path '{}': {}", request.path, e)))?;

        let mut builder = self.client.request(request.method.as_reqwest(), url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Upload(part) => builder.multipart(part.to_form()?),
        };

        trace!("{} {}", request.method, request.path);
        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(classify)?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        Ok(ApiResponse { status, body })
    }
}

//! HTTP transport implementation.
//!
//! This module provides an HTTP-based transport for the sync client.
//! The actual HTTP client is abstracted via a trait so any library (reqwest,
//! hyper, ureq) or an in-process loopback can carry the requests.

use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use offsync_protocol::{
    BatchRequest, BatchResponse, ChangesRequest, ChangesResponse, HttpRequest, HttpResponse,
    ResolveRequest, ResolveResponse,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport. An `Err` means
/// the request never produced a response (connection refused, reset, DNS).
pub trait HttpClient: Send + Sync {
    /// Sends a request to `url` and returns the response.
    fn send(&self, url: &str, request: HttpRequest) -> Result<HttpResponse, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool;
}

/// HTTP-based sync transport speaking JSON.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the sync server (e.g., "https://api.example.com").
    base_url: String,
    /// HTTP client implementation.
    client: C,
    /// Bearer token sent with every request.
    token: RwLock<Option<String>>,
    /// Cleared by `close`.
    connected: AtomicBool,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            token: RwLock::new(None),
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Sets the bearer token.
    pub fn with_token(self, token: impl Into<String>) -> Self {
        *self.token.write() = Some(token.into());
        self
    }

    /// Replaces the bearer token, e.g. after a refresh.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the underlying HTTP client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn set_error(&self, err: &str) {
        *self.last_error.write() = Some(err.to_string());
    }

    fn clear_error(&self) {
        *self.last_error.write() = None;
    }

    fn exchange<Res: DeserializeOwned>(&self, request: HttpRequest) -> SyncResult<Res> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let request = request.with_bearer(self.token.read().clone());
        let url = match request.query.is_empty() {
            true => format!("{}{}", self.base_url, request.path),
            false => format!("{}{}?{}", self.base_url, request.path, request.query),
        };
        debug!(method = %request.method, url = %url, "sending sync request");

        let response = self.client.send(&url, request).map_err(|e| {
            self.set_error(&e);
            SyncError::transport_retryable(e)
        })?;

        if !response.is_success() {
            let err = status_error(&response);
            self.set_error(&err.to_string());
            return Err(err);
        }

        self.clear_error();
        response
            .parse()
            .map_err(|e| SyncError::Protocol(format!("failed to decode response: {e}")))
    }

    fn post<Req: Serialize, Res: DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> SyncResult<Res> {
        let request = HttpRequest::post_json(path, body)
            .map_err(|e| SyncError::Protocol(format!("failed to encode request: {e}")))?;
        self.exchange(request)
    }
}

/// Maps a non-2xx response to an error.
fn status_error(response: &HttpResponse) -> SyncError {
    let message = response
        .parse::<serde_json::Value>()
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| response.text());
    match response.status {
        401 | 403 => SyncError::AuthenticationFailed(message),
        400..=499 => SyncError::Protocol(format!("{}: {message}", response.status)),
        _ => SyncError::ServerError(format!("{}: {message}", response.status)),
    }
}

impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    fn push_batch(&self, request: &BatchRequest) -> SyncResult<BatchResponse> {
        self.post("/sync/batch", request)
    }

    fn pull_changes(&self, request: &ChangesRequest) -> SyncResult<ChangesResponse> {
        let uri = format!("/sync/changes?{}", request.to_query());
        self.exchange(HttpRequest::get(&uri))
    }

    fn resolve_conflict(&self, request: &ResolveRequest) -> SyncResult<ResolveResponse> {
        self.post("/sync/resolve-conflict", request)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// A loopback HTTP client that routes requests directly to a sync server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
    online: AtomicBool,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self {
            server,
            online: AtomicBool::new(true),
        }
    }

    /// Simulates losing or regaining the network.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// The wrapped server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles a request whose path starts at `/sync/`.
    fn handle(&self, request: HttpRequest) -> HttpResponse;
}

impl<F> LoopbackServer for F
where
    F: Fn(HttpRequest) -> HttpResponse + Send + Sync,
{
    fn handle(&self, request: HttpRequest) -> HttpResponse {
        self(request)
    }
}

impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    fn send(&self, url: &str, mut request: HttpRequest) -> Result<HttpResponse, String> {
        if !self.online.load(Ordering::SeqCst) {
            return Err("network unreachable".into());
        }

        // Extract path from URL
        let path = url.find("/sync/").map(|i| &url[i..]).unwrap_or(url);
        let path = path.split_once('?').map_or(path, |(p, _)| p);
        request.path = path.to_string();

        Ok(self.server.handle(request))
    }

    fn is_healthy(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

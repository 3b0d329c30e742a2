//! HTTP-shaped request and response values.
//!
//! These carry exactly what the sync endpoints need from an HTTP exchange so
//! that any HTTP framework (or an in-process loopback) can sit in between.

use crate::error::ProtocolResult;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// GET.
    Get,
    /// POST.
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => f.write_str("GET"),
            HttpMethod::Post => f.write_str("POST"),
        }
    }
}

/// An HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Path without the query string.
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query: String,
    /// Bearer token from the `Authorization` header.
    pub bearer: Option<String>,
    /// Body bytes, JSON for POST.
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Creates a GET request; `uri` may carry a query string.
    pub fn get(uri: &str) -> Self {
        let (path, query) = uri.split_once('?').unwrap_or((uri, ""));
        Self {
            method: HttpMethod::Get,
            path: path.to_string(),
            query: query.to_string(),
            bearer: None,
            body: Vec::new(),
        }
    }

    /// Creates a POST request with a JSON body.
    pub fn post_json<T: Serialize>(path: &str, body: &T) -> ProtocolResult<Self> {
        Ok(Self {
            method: HttpMethod::Post,
            path: path.to_string(),
            query: String::new(),
            bearer: None,
            body: serde_json::to_vec(body)?,
        })
    }

    /// Sets the bearer token.
    pub fn with_bearer(mut self, token: Option<String>) -> Self {
        self.bearer = token;
        self
    }

    /// Decodes the JSON body.
    pub fn json<T: DeserializeOwned>(&self) -> ProtocolResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// An HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// JSON body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a JSON response.
    pub fn json<T: Serialize>(status: u16, body: &T) -> ProtocolResult<Self> {
        Ok(Self {
            status,
            body: serde_json::to_vec(body)?,
        })
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decodes the JSON body.
    pub fn parse<T: DeserializeOwned>(&self) -> ProtocolResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Body as text, for diagnostics.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

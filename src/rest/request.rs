//! Raw request/response types exchanged with the coordinator

use crate::error::RestError;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// File attached to a multipart request
#[derive(Debug, Clone)]
pub struct RequestFile {
    pub name: String,
    pub data: Bytes,
}

/// A fully described HTTP call
///
/// Kept owned and cloneable so a rate-limited call can be replayed as-is.
#[derive(Debug, Clone)]
pub struct RestRequest {
    pub method: Method,
    /// Path below the versioned API root, e.g. `/channels/123/messages`
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub files: Vec<RequestFile>,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    /// Sent as `x-audit-log-reason`
    pub reason: Option<String>,
    pub skip_auth: bool,
}

impl RestRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            files: Vec::new(),
            query: Vec::new(),
            headers: Vec::new(),
            reason: None,
            skip_auth: false,
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

    /// Attach a JSON body
    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, RestError> {
        self.body = Some(serde_json::to_value(body).map_err(RestError::Decode)?);
        Ok(self)
    }

    pub fn file(mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.files.push(RequestFile {
            name: name.into(),
            data: data.into(),
        });
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn unauthenticated(mut self) -> Self {
        self.skip_auth = true;
        self
    }
}

/// Completed response handed back to the caller
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RestResponse {
    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RestError> {
        serde_json::from_slice(&self.body).map_err(RestError::Decode)
    }
}

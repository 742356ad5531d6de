use async_trait::async_trait;

use serde_json::Value;

use crate::error::{Error, ErrorKind, Result};

/// The `Content-Type` value of JSON request bodies.
pub const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";

/// The `Content-Type` value of form-encoded request bodies.
pub const CONTENT_TYPE_FORM: &str = "application/x-www-form-urlencoded";

/// HTTP methods used by the device core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `PATCH`
    Patch,
    /// `DELETE`
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
        .fmt(f)
    }
}

/// An outgoing HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Request method.
    pub method: Method,
    /// Absolute request URL.
    pub url: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Request body, when present.
    pub body: Option<Vec<u8>>,
}

impl Request {
    /// Creates a bodyless [`Request`].
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Appends a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Appends a `Authorization: Bearer` header.
    #[must_use]
    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }

    /// Attaches a JSON body along with its `Content-Type` header.
    #[must_use]
    pub fn json(self, body: &Value) -> Self {
        let mut request = self.header("Content-Type", CONTENT_TYPE_JSON);
        request.body = Some(body.to_string().into_bytes());
        request
    }

    /// Attaches a form-encoded body along with its `Content-Type` header.
    #[must_use]
    pub fn form(self, body: String) -> Self {
        let mut request = self.header("Content-Type", CONTENT_TYPE_FORM);
        request.body = Some(body.into_bytes());
        request
    }

    /// Returns the value of a form field of the request body, when present.
    ///
    /// Intended for tests inspecting form-encoded requests.
    #[must_use]
    pub fn form_field(&self, name: &str) -> Option<String> {
        let body = self.body.as_deref()?;
        url::form_urlencoded::parse(body)
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }
}

/// A received HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl Response {
    /// Creates a [`Response`] from a status code and a body.
    #[must_use]
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }

    /// Creates a [`Response`] carrying a JSON body.
    #[must_use]
    pub fn with_json(status: u16, body: &Value) -> Self {
        Self::new(status, body.to_string().into_bytes())
    }

    /// Returns whether the status code is in the `2xx` class.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Parses the body as JSON.
    ///
    /// # Errors
    ///
    /// Fails with `invalidFormat` when the body is not valid JSON.
    pub fn json(&self) -> Result<Value> {
        serde_json::from_slice(&self.body).map_err(|e| {
            Error::with_source(ErrorKind::InvalidFormat, "Response body is not JSON", e)
        })
    }
}

/// The HTTP transport the device core sends its cloud requests through.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request and awaits the response.
    ///
    /// # Errors
    ///
    /// Fails with `network_error` when the request could not be delivered or
    /// no response arrived. Non-2xx responses are not errors at this level.
    async fn send(&self, request: Request) -> Result<Response>;
}

/// An [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Creates a [`ReqwestHttpClient`] with default client settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn send(&self, request: Request) -> Result<Response> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            Error::with_source(ErrorKind::NetworkError, "Failed to send the request", e)
        })?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| {
            Error::with_source(ErrorKind::NetworkError, "Failed to read the response body", e)
        })?;

        Ok(Response::new(status, body.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Method, Request, Response};

    #[test]
    fn json_request() {
        let request = Request::new(Method::Patch, "http://cloud.example/commands/1")
            .bearer("token")
            .json(&json!({"state": "done"}));

        assert_eq!(request.method, Method::Patch);
        assert_eq!(
            request.headers,
            vec![
                ("Authorization".to_owned(), "Bearer token".to_owned()),
                (
                    "Content-Type".to_owned(),
                    "application/json; charset=utf-8".to_owned()
                ),
            ]
        );
        assert_eq!(request.body, Some(br#"{"state":"done"}"#.to_vec()));
    }

    #[test]
    fn form_fields() {
        let request = Request::new(Method::Post, "http://oauth.example/token")
            .form("grant_type=refresh_token&refresh_token=1%2FzQmx".to_owned());
        assert_eq!(
            request.form_field("grant_type").as_deref(),
            Some("refresh_token")
        );
        assert_eq!(request.form_field("refresh_token").as_deref(), Some("1/zQmx"));
        assert_eq!(request.form_field("client_id"), None);
    }

    #[test]
    fn response_json() {
        let response = Response::with_json(200, &json!({"ok": true}));
        assert!(response.is_success());
        assert_eq!(response.json().unwrap(), json!({"ok": true}));

        let garbage = Response::new(500, b"not json".to_vec());
        assert!(!garbage.is_success());
        assert!(garbage.json().is_err());
    }
}

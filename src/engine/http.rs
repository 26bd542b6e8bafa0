use crate::config::HttpMethod;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use serde_json::Value;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn bearer(mut self, token: &str) -> Self {
        self.headers
            .push(("Authorization".to_string(), format!("Bearer {token}")));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub body: Value,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turns a non-2xx response into a remote-call error carrying status and reason.
    pub fn ensure_success(self) -> AppResult<Self> {
        if self.is_success() {
            return Ok(self);
        }

        let mut err = AppError::remote_status(self.status, &self.status_text);
        if let Some(detail) = error_detail(&self.body) {
            err.message = format!("{} ({detail})", err.message);
        }
        Err(err)
    }
}

/// Single seam for outbound calls; one request, one response, no retries.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> AppResult<HttpResponse>;
}

pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    pub fn new() -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| AppError::generic(format!("Failed to build HTTP client: {err}")))?;

        Ok(Self { http })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> AppResult<HttpResponse> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.http.request(method, &request.url);
        if request.header(CONTENT_TYPE.as_str()).is_none() {
            builder = builder.header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| AppError::remote(format!("Request to {} failed: {err}", request.url)))?;

        let status = response.status();
        let raw = response.text().await.map_err(|err| {
            AppError::remote(format!("Failed to read response from {}: {err}", request.url))
        })?;

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            body: decode_body(&raw),
        })
    }
}

pub fn decode_body(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn error_detail(body: &Value) -> Option<String> {
    let error = body.get("error")?;
    match error {
        Value::String(message) => Some(message.clone()),
        Value::Object(fields) => fields
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn body_decoding_tolerates_empty_and_text() {
        assert_eq!(decode_body(""), Value::Null);
        assert_eq!(decode_body("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(decode_body("deleted"), json!("deleted"));
    }

    #[test]
    fn non_success_status_becomes_remote_error() {
        let response = HttpResponse {
            status: 422,
            status_text: "Unprocessable Entity".to_string(),
            body: json!({"error": {"type": "INVALID", "message": "Unknown field name"}}),
        };

        let err = response.ensure_success().unwrap_err();
        assert!(err.is(ErrorKind::RemoteCall));
        assert_eq!(err.status, Some(422));
        assert_eq!(
            err.message,
            "API call failed: 422 Unprocessable Entity (Unknown field name)"
        );
    }

    #[test]
    fn bearer_header_is_found_case_insensitively() {
        let request = HttpRequest::new(HttpMethod::Get, "https://example.test").bearer("tok");
        assert_eq!(request.header("authorization"), Some("Bearer tok"));
    }
}

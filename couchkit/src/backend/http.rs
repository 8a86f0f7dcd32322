use super::{encode_params, Backend, Params};
use crate::changes::{BufferedFeed, ChangesFeed, FeedMode, LineFeed};
use crate::config::ClientConfig;
use crate::error::{CouchError, Result};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::io::BufReader;
use std::time::Instant;

/// Blocking HTTP backend for a CouchDB-compatible server.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    heartbeat: Option<u64>,
}

impl HttpBackend {
    pub fn new(uri: &str) -> Result<Self> {
        Self::from_config(&ClientConfig {
            uri: uri.to_string(),
            ..ClientConfig::default()
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let base_url = config.uri.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(CouchError::Configuration("server uri is empty".into()));
        }
        // None disables the blocking client's 30s default
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(HttpBackend {
            client,
            base_url,
            heartbeat: config.heartbeat,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn builder(&self, method: Method, path: &str, params: &Params) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header("Accept", "application/json")
            .query(&encode_params(params))
    }

    /// Send a request and return the successful response, mapping error
    /// statuses to their error variants.
    fn send(&self, method: Method, path: &str, request: RequestBuilder) -> Result<Response> {
        let started = Instant::now();
        let response = request.send()?;
        let status = response.status();
        log::debug!(
            target: "couchkit::request",
            "{method} {path} -> {} ({} ms)",
            status.as_u16(),
            started.elapsed().as_millis()
        );

        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        Err(status_error(status, &body))
    }

    fn send_json(&self, method: Method, path: &str, request: RequestBuilder) -> Result<Value> {
        let response = self.send(method, path, request)?;
        let text = response.text()?;
        Ok(decode_body(text))
    }
}

impl Backend for HttpBackend {
    fn request(&self, path: &str, params: &Params) -> Result<Value> {
        match params.get("keys") {
            Some(keys) => {
                let mut rest = params.clone();
                rest.remove("keys");
                let request = self
                    .builder(Method::POST, path, &rest)
                    .json(&json!({ "keys": keys }));
                self.send_json(Method::POST, path, request)
            }
            None => {
                let request = self.builder(Method::GET, path, params);
                self.send_json(Method::GET, path, request)
            }
        }
    }

    fn put(&self, path: &str, body: &Value, params: &Params) -> Result<Value> {
        let request = self.builder(Method::PUT, path, params).json(body);
        self.send_json(Method::PUT, path, request)
    }

    fn post(&self, path: &str, body: &Value, params: &Params) -> Result<Value> {
        let request = self.builder(Method::POST, path, params).json(body);
        self.send_json(Method::POST, path, request)
    }

    fn delete(&self, path: &str, params: &Params) -> Result<Value> {
        let request = self.builder(Method::DELETE, path, params);
        self.send_json(Method::DELETE, path, request)
    }

    fn copy(&self, path: &str, destination: &str) -> Result<Value> {
        let method = Method::from_bytes(b"COPY")
            .map_err(|e| CouchError::Configuration(format!("COPY method: {e}")))?;
        let request = self
            .builder(method.clone(), path, &Params::new())
            .header("Destination", destination);
        self.send_json(method, path, request)
    }

    fn changes(&self, db: &str, params: &Params) -> Result<Box<dyn ChangesFeed>> {
        let mode = FeedMode::from_params(params)?;
        let mut params = params.clone();
        if let (Some(heartbeat), FeedMode::LongPoll | FeedMode::Continuous) = (self.heartbeat, mode)
        {
            params
                .entry("heartbeat")
                .or_insert_with(|| Value::from(heartbeat));
        }

        let path = format!("{}/_changes", db.trim_end_matches('/'));
        let request = self.builder(Method::GET, &path, &params);
        let response = self.send(Method::GET, &path, request)?;

        match mode {
            FeedMode::Continuous => Ok(Box::new(LineFeed::new(BufReader::new(response)))),
            FeedMode::Normal | FeedMode::LongPoll => {
                let body: Value = response.json()?;
                Ok(Box::new(BufferedFeed::from_response(body)?))
            }
        }
    }
}

/// Show and list functions may answer with plain text.
fn decode_body(text: String) -> Value {
    match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(_) => Value::String(text),
    }
}

fn status_error(status: StatusCode, body: &str) -> CouchError {
    let reason = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            let error = v.get("error").and_then(Value::as_str).map(str::to_string);
            let reason = v.get("reason").and_then(Value::as_str).map(str::to_string);
            match (error, reason) {
                (Some(e), Some(r)) => Some(format!("{e}: {r}")),
                (e, r) => e.or(r),
            }
        })
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .map(str::to_string)
                .unwrap_or_else(|| body.to_string())
        });

    match status.as_u16() {
        404 => CouchError::NotFound(reason),
        409 => CouchError::Conflict(reason),
        412 => CouchError::PreconditionFailed(reason),
        code => CouchError::Http {
            status: code,
            reason,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_uri_rejected() {
        let err = HttpBackend::new("  ").unwrap_err();
        assert!(matches!(err, CouchError::Configuration(_)));
    }

    #[test]
    fn test_url_joins_paths() {
        let backend = HttpBackend::new("http://127.0.0.1:5984/").unwrap();
        assert_eq!(backend.base_url(), "http://127.0.0.1:5984");
        assert_eq!(backend.url("/mydb/doc"), "http://127.0.0.1:5984/mydb/doc");
        assert_eq!(backend.url("_all_dbs"), "http://127.0.0.1:5984/_all_dbs");
    }

    #[test]
    fn test_status_mapping() {
        let body = r#"{"error":"not_found","reason":"missing"}"#;
        match status_error(StatusCode::NOT_FOUND, body) {
            CouchError::NotFound(reason) => assert_eq!(reason, "not_found: missing"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            status_error(StatusCode::CONFLICT, "{}"),
            CouchError::Conflict(_)
        ));
        assert!(matches!(
            status_error(StatusCode::PRECONDITION_FAILED, ""),
            CouchError::PreconditionFailed(_)
        ));
        match status_error(StatusCode::INTERNAL_SERVER_ERROR, "boom") {
            CouchError::Http { status, reason } => {
                assert_eq!(status, 500);
                assert_eq!(reason, "Internal Server Error");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_plain_text_body() {
        assert_eq!(decode_body("<p>hi</p>".into()), Value::String("<p>hi</p>".into()));
        assert_eq!(decode_body("{\"ok\":true}".into())["ok"], true);
    }
}

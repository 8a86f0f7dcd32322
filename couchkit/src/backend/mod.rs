//! The document store interface the client talks to, and its HTTP
//! implementation.

mod http;

pub use http::HttpBackend;

use crate::changes::ChangesFeed;
use crate::error::Result;
use serde_json::{Map, Value};

/// Query parameters: a JSON object map (`key`, `startkey`, `limit`, ...)
pub type Params = Map<String, Value>;

/// Parameters that only steer client-side behavior and are never sent.
pub const CLIENT_ONLY_PARAMS: &[&str] = &["wrap_doc"];

/// A document store reachable by path.
///
/// All paths are relative to the server root, e.g. `mydb/_design/app/_view/by_date`.
pub trait Backend: Send + Sync {
    /// GET `path`. When `params` carries `keys`, POST `{"keys": [...]}` instead.
    fn request(&self, path: &str, params: &Params) -> Result<Value>;

    fn put(&self, path: &str, body: &Value, params: &Params) -> Result<Value>;

    fn post(&self, path: &str, body: &Value, params: &Params) -> Result<Value>;

    fn delete(&self, path: &str, params: &Params) -> Result<Value>;

    /// COPY `path` to `destination` (a document id, optionally `id?rev=...`).
    fn copy(&self, path: &str, destination: &str) -> Result<Value>;

    /// Open the `_changes` feed of database `db`. The `feed` param picks the mode.
    fn changes(&self, db: &str, params: &Params) -> Result<Box<dyn ChangesFeed>>;
}

/// Encode params the way the server expects them in a query string.
///
/// `key`, `startkey` and `endkey` are always JSON; other non-strings are
/// JSON; strings go as-is; nulls and client-only params are dropped.
pub fn encode_params(params: &Params) -> Vec<(String, String)> {
    let mut encoded = Vec::with_capacity(params.len());
    for (name, value) in params {
        if CLIENT_ONLY_PARAMS.contains(&name.as_str()) {
            continue;
        }
        let text = match (name.as_str(), value) {
            ("key" | "startkey" | "endkey", v) => v.to_string(),
            (_, Value::Null) => continue,
            (_, Value::String(s)) => s.clone(),
            (_, v) => v.to_string(),
        };
        encoded.push((name.clone(), text));
    }
    encoded
}

/// Escape a document id for use as a path segment, keeping the `_design/`
/// prefix readable.
pub fn escape_docid(docid: &str) -> String {
    let docid = docid.strip_prefix('/').unwrap_or(docid);
    match docid.strip_prefix("_design/") {
        Some(name) => format!("_design/{}", url_quote(name)),
        None => url_quote(docid),
    }
}

/// Percent-encode everything outside the unreserved set.
pub fn url_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory backend that records calls and answers from a closure.

    use super::*;
    use crate::changes::BufferedFeed;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct Call {
        pub method: &'static str,
        pub path: String,
        pub params: Params,
        pub body: Option<Value>,
    }

    type Responder = Box<dyn Fn(&Call) -> Result<Value> + Send + Sync>;

    pub struct MockBackend {
        responder: Responder,
        pub calls: Mutex<Vec<Call>>,
    }

    impl MockBackend {
        pub fn new(responder: impl Fn(&Call) -> Result<Value> + Send + Sync + 'static) -> Self {
            MockBackend {
                responder: Box::new(responder),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(
            &self,
            method: &'static str,
            path: &str,
            params: &Params,
            body: Option<&Value>,
        ) -> Result<Value> {
            let call = Call {
                method,
                path: path.to_string(),
                params: params.clone(),
                body: body.cloned(),
            };
            let result = (self.responder)(&call);
            self.calls.lock().unwrap().push(call);
            result
        }
    }

    impl Backend for MockBackend {
        fn request(&self, path: &str, params: &Params) -> Result<Value> {
            self.record("GET", path, params, None)
        }

        fn put(&self, path: &str, body: &Value, params: &Params) -> Result<Value> {
            self.record("PUT", path, params, Some(body))
        }

        fn post(&self, path: &str, body: &Value, params: &Params) -> Result<Value> {
            self.record("POST", path, params, Some(body))
        }

        fn delete(&self, path: &str, params: &Params) -> Result<Value> {
            self.record("DELETE", path, params, None)
        }

        fn copy(&self, path: &str, destination: &str) -> Result<Value> {
            let body = Value::String(destination.to_string());
            self.record("COPY", path, &Params::new(), Some(&body))
        }

        fn changes(&self, db: &str, params: &Params) -> Result<Box<dyn ChangesFeed>> {
            let response = self.record("CHANGES", db, params, None)?;
            Ok(Box::new(BufferedFeed::from_response(response)?))
        }
    }
}

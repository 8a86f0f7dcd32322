use crate::backend::{escape_docid, url_quote, Backend, HttpBackend, Params};
use crate::changes::{ChangesStream, Consumer};
use crate::config::ClientConfig;
use crate::document::Document;
use crate::error::{CouchError, Result};
use crate::schema::Wrap;
use crate::view::{QueryExecutor, RowFn, ViewResults};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};

/// Default search handler (couchdb-lucene)
pub const DEFAULT_SEARCH_HANDLER: &str = "_fti/_design";

/// Databases the server creates for itself
pub const SYSTEM_DATABASES: &[&str] = &["_users", "_replicator", "_global_changes"];

fn valid_db_name() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_$()+/-]*$").expect("valid regex"))
}

fn single(key: &str, value: impl Into<Value>) -> Params {
    let mut params = Params::new();
    params.insert(key.to_string(), value.into());
    params
}

/// A handle on a CouchDB server.
#[derive(Clone)]
pub struct Server {
    backend: Arc<dyn Backend>,
    uri: String,
}

impl Server {
    pub fn new(uri: &str) -> Result<Self> {
        Self::from_config(&ClientConfig {
            uri: uri.to_string(),
            ..ClientConfig::default()
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let backend = HttpBackend::from_config(config)?;
        let uri = backend.base_url().to_string();
        Ok(Server {
            backend: Arc::new(backend),
            uri,
        })
    }

    /// Use a custom backend, e.g. an in-process fake.
    pub fn with_backend(backend: Arc<dyn Backend>, uri: impl Into<String>) -> Self {
        Server {
            backend,
            uri: uri.into(),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Server welcome document (version, vendor, ...).
    pub fn info(&self) -> Result<Value> {
        self.backend.request("", &Params::new())
    }

    pub fn all_dbs(&self) -> Result<Vec<String>> {
        let dbs = self.backend.request("_all_dbs", &Params::new())?;
        Ok(serde_json::from_value(dbs)?)
    }

    /// Fresh uuids from the server.
    pub fn uuids(&self, count: usize) -> Result<Vec<String>> {
        let response = self.backend.request("_uuids", &single("count", count))?;
        match response.get("uuids") {
            Some(uuids) => Ok(serde_json::from_value(uuids.clone())?),
            None => Err(CouchError::InvalidResponse(
                "_uuids response has no 'uuids' member".into(),
            )),
        }
    }

    /// Handle on an existing database. Nothing is sent.
    pub fn database(&self, name: &str) -> Result<Database> {
        let name = name.strip_prefix('/').unwrap_or(name);
        if !valid_db_name().is_match(name) && !SYSTEM_DATABASES.contains(&name) {
            return Err(CouchError::Configuration(format!(
                "invalid database name '{name}'"
            )));
        }
        Ok(Database {
            backend: Arc::clone(&self.backend),
            name: name.to_string(),
            path: url_quote(name),
        })
    }

    /// Create a database, or open it if it already exists.
    pub fn create_db(&self, name: &str) -> Result<Database> {
        let db = self.database(name)?;
        match self.backend.put(&db.path, &json!({}), &Params::new()) {
            Ok(_) => log::info!("created database '{}'", db.name),
            Err(CouchError::PreconditionFailed(_)) => {
                log::debug!("database '{}' already exists", db.name)
            }
            Err(e) => return Err(e),
        }
        Ok(db)
    }

    pub fn delete_db(&self, name: &str) -> Result<()> {
        let db = self.database(name)?;
        self.backend.delete(&db.path, &Params::new())?;
        log::info!("deleted database '{}'", db.name);
        Ok(())
    }
}

/// A handle on one database.
#[derive(Clone)]
pub struct Database {
    backend: Arc<dyn Backend>,
    name: String,
    /// Escaped name used in request paths
    path: String,
}

impl Database {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn doc_path(&self, docid: &str) -> String {
        format!("{}/{}", self.path, escape_docid(docid))
    }

    pub fn info(&self) -> Result<Value> {
        self.backend.request(&self.path, &Params::new())
    }

    /// Map a view name onto its path below the database.
    ///
    /// `_all_docs` and `_all_docs_by_seq` pass through, `design/view`
    /// becomes `_design/design/_view/view`.
    pub fn view_path(view_name: &str) -> String {
        let view_name = view_name.strip_prefix('/').unwrap_or(view_name);
        match view_name {
            "_all_docs" | "_all_docs_by_seq" => view_name.to_string(),
            _ => {
                let (design, view) = view_name.split_once('/').unwrap_or((view_name, ""));
                format!("_design/{design}/_view/{view}")
            }
        }
    }

    /// Executor running queries below this database.
    pub fn executor(&self) -> Arc<dyn QueryExecutor> {
        let backend = Arc::clone(&self.backend);
        let db = self.path.clone();
        Arc::new(move |path: &str, params: &Params| -> Result<Value> {
            backend.request(&format!("{db}/{}", path.trim_start_matches('/')), params)
        })
    }

    fn results(
        &self,
        path: String,
        wrapper: Option<RowFn>,
        schema: Option<Arc<dyn Wrap>>,
        params: Params,
    ) -> Result<ViewResults> {
        ViewResults::new(self.executor(), path, wrapper, schema, params)
    }

    pub fn view(&self, view_name: &str, params: Params) -> Result<ViewResults> {
        self.results(Self::view_path(view_name), None, None, params)
    }

    pub fn view_with_schema(
        &self,
        view_name: &str,
        schema: Arc<dyn Wrap>,
        params: Params,
    ) -> Result<ViewResults> {
        self.results(Self::view_path(view_name), None, Some(schema), params)
    }

    pub fn view_with_wrapper(
        &self,
        view_name: &str,
        wrapper: RowFn,
        params: Params,
    ) -> Result<ViewResults> {
        self.results(Self::view_path(view_name), Some(wrapper), None, params)
    }

    /// All documents, as a view over `_all_docs`. `wrapper` and `schema`
    /// are mutually exclusive.
    pub fn documents(
        &self,
        wrapper: Option<RowFn>,
        schema: Option<Arc<dyn Wrap>>,
        params: Params,
    ) -> Result<ViewResults> {
        self.results("_all_docs".into(), wrapper, schema, params)
    }

    pub fn all_docs(&self, by_seq: bool, params: Params) -> Result<ViewResults> {
        let name = if by_seq { "_all_docs_by_seq" } else { "_all_docs" };
        self.view(name, params)
    }

    /// Query a full-text index through an external search handler.
    pub fn search(
        &self,
        view_name: &str,
        handler: Option<&str>,
        wrapper: Option<RowFn>,
        schema: Option<Arc<dyn Wrap>>,
        params: Params,
    ) -> Result<ViewResults> {
        let handler = handler.unwrap_or(DEFAULT_SEARCH_HANDLER);
        self.results(format!("/{handler}/{view_name}"), wrapper, schema, params)
    }

    /// Run a show function. Non-JSON output comes back as a string value.
    pub fn show(&self, show_name: &str, docid: &str, params: &Params) -> Result<Value> {
        let (design, show) = show_name.split_once('/').unwrap_or((show_name, ""));
        let path = format!("{}/_design/{design}/_show/{show}/{}", self.path, url_quote(docid));
        self.backend.request(&path, params)
    }

    /// Run a list function over a view.
    pub fn list(&self, list_name: &str, view_name: &str, params: &Params) -> Result<Value> {
        let (design, list) = list_name.split_once('/').unwrap_or((list_name, ""));
        let path = format!("{}/_design/{design}/_list/{list}/{view_name}", self.path);
        self.backend.request(&path, params)
    }

    /// Run an update handler. With a `docid` the document is PUT to the
    /// handler, otherwise `body` is POSTed.
    pub fn update(
        &self,
        update_name: &str,
        docid: Option<&str>,
        body: &Value,
        params: &Params,
    ) -> Result<Value> {
        let (design, update) = update_name.split_once('/').unwrap_or((update_name, ""));
        let path = format!("{}/_design/{design}/_update/{update}", self.path);
        match docid {
            Some(docid) => self
                .backend
                .put(&format!("{path}/{}", url_quote(docid)), body, params),
            None => self.backend.post(&path, body, params),
        }
    }

    pub fn open_doc(&self, docid: &str) -> Result<Value> {
        self.backend.request(&self.doc_path(docid), &Params::new())
    }

    /// Load a document into a typed [`Document`].
    pub fn open_doc_as<T: DeserializeOwned>(&self, docid: &str) -> Result<Document<T>> {
        Document::from_value(self.open_doc(docid)?)
    }

    pub fn open_doc_wrapped(&self, docid: &str, schema: &dyn Wrap) -> Result<Value> {
        schema.wrap(self.open_doc(docid)?)
    }

    pub fn doc_exist(&self, docid: &str) -> Result<bool> {
        match self.open_doc(docid) {
            Ok(_) => Ok(true),
            Err(CouchError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Current revision of a document.
    pub fn get_rev(&self, docid: &str) -> Result<String> {
        let doc = self.open_doc(docid)?;
        doc.get("_rev")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CouchError::InvalidResponse(format!("document '{docid}' has no _rev")))
    }

    /// Save a document, updating its `_id` and `_rev` in place.
    ///
    /// Documents without an `_id` are POSTed and get a server generated one.
    /// With `force_update`, a conflict is retried once against the latest
    /// revision.
    pub fn save_doc(&self, doc: &mut Value, force_update: bool) -> Result<Value> {
        let Value::Object(fields) = doc else {
            return Err(CouchError::Validation("document must be a JSON object".into()));
        };

        let response = match fields.get("_id").and_then(Value::as_str).map(str::to_string) {
            Some(docid) => {
                let path = self.doc_path(&docid);
                match self.backend.put(&path, &Value::Object(fields.clone()), &Params::new()) {
                    Err(CouchError::Conflict(reason)) if force_update => {
                        log::debug!("conflict saving '{docid}' ({reason}), retrying on latest rev");
                        let rev = self.get_rev(&docid)?;
                        fields.insert("_rev".into(), Value::String(rev));
                        self.backend.put(&path, &Value::Object(fields.clone()), &Params::new())?
                    }
                    other => other?,
                }
            }
            None => self.backend.post(&self.path, &Value::Object(fields.clone()), &Params::new())?,
        };

        if let Some(id) = response.get("id") {
            fields.insert("_id".into(), id.clone());
        }
        if let Some(rev) = response.get("rev") {
            fields.insert("_rev".into(), rev.clone());
        }
        Ok(response)
    }

    /// Save many documents through `_bulk_docs`.
    ///
    /// With `use_uuids`, documents without an `_id` get one from the server
    /// first. Saved documents get their `_id`/`_rev` updated; if any item
    /// fails the whole call returns [`CouchError::BulkSave`].
    pub fn bulk_save(&self, docs: &mut [Value], use_uuids: bool) -> Result<Vec<Value>> {
        if use_uuids {
            let missing: Vec<usize> = docs
                .iter()
                .enumerate()
                .filter(|(_, d)| d.get("_id").is_none())
                .map(|(i, _)| i)
                .collect();
            if !missing.is_empty() {
                let server = Server::with_backend(Arc::clone(&self.backend), "");
                let uuids = server.uuids(missing.len())?;
                for (i, uuid) in missing.into_iter().zip(uuids) {
                    if let Value::Object(fields) = &mut docs[i] {
                        fields.insert("_id".into(), Value::String(uuid));
                    }
                }
            }
        }

        let payload = json!({ "docs": docs });
        let response = self
            .backend
            .post(&format!("{}/_bulk_docs", self.path), &payload, &Params::new())?;
        let Value::Array(results) = response else {
            return Err(CouchError::InvalidResponse(
                "_bulk_docs response must be a list".into(),
            ));
        };

        let mut errors = Vec::new();
        for (doc, result) in docs.iter_mut().zip(&results) {
            if let Some(error) = result.get("error") {
                log::error!("bulk save error on {}: {error}", self.name);
                errors.push(result.clone());
                continue;
            }
            if let Value::Object(fields) = doc {
                if let Some(id) = result.get("id") {
                    fields.insert("_id".into(), id.clone());
                }
                if let Some(rev) = result.get("rev") {
                    fields.insert("_rev".into(), rev.clone());
                }
            }
        }

        if errors.is_empty() {
            Ok(results)
        } else {
            Err(CouchError::BulkSave { errors, results })
        }
    }

    /// Delete the latest revision of a document.
    pub fn delete_doc(&self, docid: &str) -> Result<Value> {
        let rev = self.get_rev(docid)?;
        self.backend.delete(&self.doc_path(docid), &single("rev", rev))
    }

    /// Delete many documents in one `_bulk_docs` call. With
    /// `empty_on_delete` only `_id`, `_rev` and `_deleted` are sent.
    pub fn delete_docs(&self, docs: &mut [Value], empty_on_delete: bool) -> Result<Vec<Value>> {
        for doc in docs.iter_mut() {
            let Value::Object(fields) = doc else {
                return Err(CouchError::Validation("document must be a JSON object".into()));
            };
            if !fields.contains_key("_id") || !fields.contains_key("_rev") {
                return Err(CouchError::Validation(
                    "_id and _rev are required to delete a document".into(),
                ));
            }
            if empty_on_delete {
                fields.retain(|key, _| key == "_id" || key == "_rev");
            }
            fields.insert("_deleted".into(), Value::Bool(true));
        }
        self.bulk_save(docs, false)
    }

    /// Copy a document server side. Without `dest` a fresh uuid is used;
    /// an existing `dest` is overwritten at its current revision.
    pub fn copy_doc(&self, docid: &str, dest: Option<&str>) -> Result<Value> {
        let destination = match dest {
            Some(dest) => match self.get_rev(dest) {
                Ok(rev) => format!("{}?rev={rev}", escape_docid(dest)),
                Err(CouchError::NotFound(_)) => escape_docid(dest),
                Err(e) => return Err(e),
            },
            None => {
                let server = Server::with_backend(Arc::clone(&self.backend), "");
                server.uuids(1)?.pop().ok_or_else(|| {
                    CouchError::InvalidResponse("_uuids returned no uuid".into())
                })?
            }
        };
        self.backend.copy(&self.doc_path(docid), &destination)
    }

    /// The database's change feed.
    pub fn changes(&self) -> ChangesStream {
        ChangesStream::new(Arc::clone(&self.backend), self.path.clone(), Params::new())
    }

    pub fn consumer(&self) -> Consumer {
        Consumer::new(Arc::clone(&self.backend), self.path.clone())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("name", &self.name).finish()
    }
}

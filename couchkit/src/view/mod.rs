use crate::backend::Params;
use crate::document::Row;
use crate::error::{CouchError, Result};
use crate::schema::Wrap;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::cell::OnceCell;
use std::fmt;
use std::sync::Arc;

/// Runs a view query: `(path, params) -> decoded response`
pub trait QueryExecutor: Send + Sync {
    fn execute(&self, path: &str, params: &Params) -> Result<Value>;
}

impl<F> QueryExecutor for F
where
    F: Fn(&str, &Params) -> Result<Value> + Send + Sync,
{
    fn execute(&self, path: &str, params: &Params) -> Result<Value> {
        self(path, params)
    }
}

/// A user supplied row transformation
pub type RowFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// How raw rows are turned into results
#[derive(Clone)]
pub enum RowWrapper {
    /// Rows are returned as the server sent them
    Raw,
    /// Docs (or row values carrying an id) are wrapped through a schema
    Schema { schema: Arc<dyn Wrap>, wrap_doc: bool },
    Custom(RowFn),
}

impl RowWrapper {
    pub fn wrap_row(&self, row: Value) -> Result<Value> {
        match self {
            RowWrapper::Raw => Ok(row),
            RowWrapper::Custom(f) => f(row),
            RowWrapper::Schema { schema, wrap_doc } => {
                wrap_schema_row(schema.as_ref(), *wrap_doc, row)
            }
        }
    }
}

impl fmt::Debug for RowWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowWrapper::Raw => f.write_str("Raw"),
            RowWrapper::Schema { wrap_doc, .. } => {
                f.debug_struct("Schema").field("wrap_doc", wrap_doc).finish()
            }
            RowWrapper::Custom(_) => f.write_str("Custom"),
        }
    }
}

fn wrap_schema_row(schema: &dyn Wrap, wrap_doc: bool, row: Value) -> Result<Value> {
    if wrap_doc {
        if let Some(doc) = row.get("doc").filter(|d| !d.is_null()) {
            return schema.wrap(doc.clone());
        }
    }

    let id = row.get("id").and_then(Value::as_str).filter(|id| !id.is_empty());
    let (Some(Value::Object(value)), Some(id)) = (row.get("value"), id) else {
        return Ok(row);
    };
    if value.is_empty() {
        return Ok(row);
    }

    let mut data = value.clone();
    data.insert("_id".into(), Value::String(id.to_string()));
    if let Some(rev) = data.remove("rev") {
        data.insert("_rev".into(), rev);
    }
    schema.wrap(Value::Object(data))
}

/// Truthiness of a JSON value: null, false, 0, "" and empty containers are false
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// A decoded view response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewPage {
    pub rows: Vec<Value>,
    pub total_rows: Option<u64>,
    pub offset: u64,
    /// Every other top-level key, e.g. metadata added by a search backend
    pub extra: Map<String, Value>,
}

impl ViewPage {
    pub fn from_response(response: Value) -> Result<Self> {
        let Value::Object(mut body) = response else {
            return Err(CouchError::InvalidResponse(format!(
                "view response must be a JSON object, got {response}"
            )));
        };

        let rows = match body.remove("rows") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(rows)) => rows,
            Some(other) => {
                return Err(CouchError::InvalidResponse(format!(
                    "'rows' must be a list, got {other}"
                )))
            }
        };
        let total_rows = body.remove("total_rows").and_then(|v| v.as_u64());
        let offset = body.remove("offset").and_then(|v| v.as_u64()).unwrap_or(0);

        Ok(ViewPage {
            rows,
            total_rows,
            offset,
            extra: body,
        })
    }
}

/// Key selection applied to a view query
#[derive(Debug, Clone, PartialEq)]
pub enum ViewKey {
    /// `startkey`/`endkey`; a missing bound is left open
    Range {
        start: Option<Value>,
        end: Option<Value>,
    },
    Keys(Vec<Value>),
    Key(Value),
}

impl ViewKey {
    pub fn range(start: Option<Value>, end: Option<Value>) -> Self {
        ViewKey::Range { start, end }
    }

    pub fn keys<I, V>(keys: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        ViewKey::Keys(keys.into_iter().map(Into::into).collect())
    }

    pub fn key(key: impl Into<Value>) -> Self {
        ViewKey::Key(key.into())
    }

    fn apply(self, params: &mut Params) {
        match self {
            ViewKey::Range { start, end } => {
                if let Some(start) = start.filter(|v| !v.is_null()) {
                    params.insert("startkey".into(), start);
                }
                if let Some(end) = end.filter(|v| !v.is_null()) {
                    params.insert("endkey".into(), end);
                }
            }
            ViewKey::Keys(keys) => {
                params.insert("keys".into(), Value::Array(keys));
            }
            ViewKey::Key(key) => {
                params.insert("key".into(), key);
            }
        }
    }
}

/// A lazily executed view query.
///
/// Nothing is sent until the first consuming call (`iter`, `all`, `count`,
/// `total_rows`, ...). The decoded page is cached; later calls reuse it.
/// Re-parameterizing (`with_params`, `select`, `key`, ...) returns a new,
/// unexecuted query that shares the executor, path and row wrapper.
pub struct ViewResults {
    executor: Arc<dyn QueryExecutor>,
    path: String,
    params: Params,
    wrapper: RowWrapper,
    cache: OnceCell<ViewPage>,
}

impl ViewResults {
    /// Build a query. `wrapper` and `schema` are mutually exclusive.
    ///
    /// With a schema, `wrap_doc` in `params` decides whether included docs
    /// are wrapped; it defaults to true.
    pub fn new(
        executor: Arc<dyn QueryExecutor>,
        path: impl Into<String>,
        wrapper: Option<RowFn>,
        schema: Option<Arc<dyn Wrap>>,
        params: Params,
    ) -> Result<Self> {
        let wrapper = match (wrapper, schema) {
            (Some(_), Some(_)) => {
                return Err(CouchError::Configuration(
                    "a view takes either a row wrapper or a schema, not both".into(),
                ))
            }
            (Some(f), None) => RowWrapper::Custom(f),
            (None, Some(schema)) => RowWrapper::Schema {
                wrap_doc: params.get("wrap_doc").map_or(true, is_truthy),
                schema,
            },
            (None, None) => RowWrapper::Raw,
        };

        Ok(Self::with_wrapper(executor, path.into(), wrapper, params))
    }

    fn with_wrapper(
        executor: Arc<dyn QueryExecutor>,
        path: String,
        wrapper: RowWrapper,
        params: Params,
    ) -> Self {
        ViewResults {
            executor,
            path,
            params,
            wrapper,
            cache: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn wrapper(&self) -> &RowWrapper {
        &self.wrapper
    }

    /// Whether the query has been executed.
    pub fn is_fetched(&self) -> bool {
        self.cache.get().is_some()
    }

    /// Run the query without touching the cache.
    pub fn fetch_raw(&self) -> Result<Value> {
        log::trace!("querying {} with {:?}", self.path, self.params);
        self.executor.execute(&self.path, &self.params)
    }

    fn fetch_page(&self) -> Result<ViewPage> {
        ViewPage::from_response(self.fetch_raw()?)
    }

    /// Execute the query now, replacing any cached page.
    pub fn fetch(&mut self) -> Result<&ViewPage> {
        let page = self.fetch_page()?;
        self.cache = OnceCell::new();
        Ok(self.cache.get_or_init(|| page))
    }

    /// The cached page, executing the query if needed.
    pub fn page(&self) -> Result<&ViewPage> {
        if let Some(page) = self.cache.get() {
            return Ok(page);
        }
        let page = self.fetch_page()?;
        Ok(self.cache.get_or_init(|| page))
    }

    /// Wrapped rows in server order.
    pub fn iter(&self) -> Result<impl Iterator<Item = Result<Value>> + '_> {
        let page = self.page()?;
        let wrapper = &self.wrapper;
        Ok(page.rows.iter().map(move |row| wrapper.wrap_row(row.clone())))
    }

    pub fn all(&self) -> Result<Vec<Value>> {
        self.iter()?.collect()
    }

    pub fn first(&self) -> Result<Option<Value>> {
        self.page()?
            .rows
            .first()
            .map(|row| self.wrapper.wrap_row(row.clone()))
            .transpose()
    }

    /// Exactly one row. More than one is an error; none is an error only
    /// when `except_all` is set.
    pub fn one(&self, except_all: bool) -> Result<Option<Value>> {
        let count = self.count()?;
        if count > 1 {
            return Err(CouchError::MultipleResultsFound(count));
        }
        match self.first()? {
            None if except_all => Err(CouchError::NoResultFound),
            row => Ok(row),
        }
    }

    /// Rows in the current page (not `total_rows`).
    pub fn count(&self) -> Result<usize> {
        Ok(self.page()?.rows.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.count()? == 0)
    }

    /// Rows in the whole view. Reduce views report none, so this falls
    /// back to the page row count.
    pub fn total_rows(&self) -> Result<u64> {
        let page = self.page()?;
        Ok(page.total_rows.unwrap_or(page.rows.len() as u64))
    }

    pub fn offset(&self) -> Result<u64> {
        Ok(self.page()?.offset)
    }

    /// Extra top-level response keys.
    pub fn dynamic_fields(&self) -> Result<&Map<String, Value>> {
        Ok(&self.page()?.extra)
    }

    pub fn field(&self, name: &str) -> Result<Option<&Value>> {
        Ok(self.dynamic_fields()?.get(name))
    }

    /// The page's rows as the server sent them, bypassing the wrapper.
    pub fn rows(&self) -> Result<Vec<Row>> {
        self.page()?.rows.iter().cloned().map(Row::from_value).collect()
    }

    /// Deserialize the wrapped rows.
    pub fn rows_as<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.iter()?
            .map(|row| -> Result<T> { Ok(serde_json::from_value(row?)?) })
            .collect()
    }

    /// A new query with `overrides` merged over the current params.
    pub fn with_params(&self, overrides: Params) -> ViewResults {
        let mut params = self.params.clone();
        params.extend(overrides);
        Self::with_wrapper(
            Arc::clone(&self.executor),
            self.path.clone(),
            self.wrapper.clone(),
            params,
        )
    }

    /// A new query restricted to `key`.
    pub fn select(&self, key: ViewKey) -> ViewResults {
        let mut params = Params::new();
        key.apply(&mut params);
        self.with_params(params)
    }

    pub fn range(&self, start: Option<Value>, end: Option<Value>) -> ViewResults {
        self.select(ViewKey::range(start, end))
    }

    pub fn keys<I, V>(&self, keys: I) -> ViewResults
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.select(ViewKey::keys(keys))
    }

    pub fn key(&self, key: impl Into<Value>) -> ViewResults {
        self.select(ViewKey::key(key))
    }
}

impl fmt::Debug for ViewResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewResults")
            .field("path", &self.path)
            .field("params", &self.params)
            .field("wrapper", &self.wrapper)
            .field("fetched", &self.is_fetched())
            .finish()
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CouchError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Document conflict: {0}")]
    Conflict(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("HTTP {status}: {reason}")]
    Http { status: u16, reason: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Processing code: No file matching '{pattern}'")]
    MissingInclude { pattern: String },

    #[error("Processing code: '{pattern}' is nested more than {limit} includes deep")]
    IncludeDepthExceeded { pattern: String, limit: usize },

    #[error("Error running !code or !json on function \"{function}\": {source}")]
    MacroExpansion {
        function: String,
        #[source]
        source: Box<CouchError>,
    },

    #[error("{0} results found")]
    MultipleResultsFound(usize),

    #[error("No result found")]
    NoResultFound,

    #[error("Bulk save failed for {} of {} documents", errors.len(), results.len())]
    BulkSave {
        errors: Vec<serde_json::Value>,
        results: Vec<serde_json::Value>,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Doc type error: {0}")]
    DocType(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid glob pattern: {0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Glob error: {0}")]
    Glob(#[from] glob::GlobError),
}

impl CouchError {
    /// Whether this error came out of design document macro processing.
    pub fn is_macro_error(&self) -> bool {
        matches!(
            self,
            CouchError::MissingInclude { .. }
                | CouchError::IncludeDepthExceeded { .. }
                | CouchError::MacroExpansion { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CouchError>;

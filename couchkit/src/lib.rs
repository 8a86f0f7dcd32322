pub mod backend;
pub mod changes;
pub mod config;
pub mod designer;
pub mod document;
pub mod error;
pub mod hash;
pub mod schema;
pub mod server;
pub mod validation;
pub mod view;

pub use backend::{Backend, HttpBackend, Params};
pub use changes::{Change, ChangeFeedCursor, ChangesBatch, ChangesStream, Consumer, FeedMode};
pub use config::ClientConfig;
pub use designer::{DesignDirectory, MacroExpander};
pub use document::{Document, Row};
pub use error::{CouchError, Result};
pub use schema::{DocumentSchema, SchemaDefinition, SchemaSet, Wrap};
pub use server::{Database, Server};
pub use view::{QueryExecutor, RowFn, RowWrapper, ViewKey, ViewResults};

//! Document schemas: declarative doc types that turn raw JSON documents into
//! validated ones.

mod types;

pub use types::{DocTypeDefinition, FieldDefinition, FieldType, SchemaDefinition};

use crate::error::{CouchError, Result};
use crate::validation;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

/// Something that can turn a raw JSON document into a wrapped one.
///
/// Row wrapping in [`crate::view::ViewResults`] and document loading in
/// [`crate::server::Database`] go through this trait.
pub trait Wrap: Send + Sync {
    fn wrap(&self, raw: Value) -> Result<Value>;
}

/// Parse a schema.yaml file into a SchemaDefinition
pub fn parse_schema(path: &Path) -> Result<SchemaDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_schema_str(&content)
}

/// Parse a schema YAML string into a SchemaDefinition
pub fn parse_schema_str(content: &str) -> Result<SchemaDefinition> {
    let schema: SchemaDefinition = serde_yaml::from_str(content)?;
    Ok(schema)
}

/// Schema for a single doc type.
#[derive(Debug, Clone)]
pub struct DocumentSchema {
    schema: Arc<SchemaDefinition>,
    doc_type: String,
}

impl DocumentSchema {
    pub fn new(schema: Arc<SchemaDefinition>, doc_type: &str) -> Result<Self> {
        if !schema.doc_types.contains_key(doc_type) {
            return Err(CouchError::Configuration(format!(
                "Doc type '{doc_type}' not found in schema"
            )));
        }
        Ok(DocumentSchema {
            schema,
            doc_type: doc_type.to_string(),
        })
    }

    pub fn doc_type(&self) -> &str {
        &self.doc_type
    }

    pub fn definition(&self) -> &DocTypeDefinition {
        &self.schema.doc_types[&self.doc_type]
    }

    /// Validate without modifying the document.
    pub fn validate(&self, data: &Value) -> validation::ValidationResult {
        validation::validate_document(&self.schema, self.definition(), data)
    }
}

impl Wrap for DocumentSchema {
    fn wrap(&self, raw: Value) -> Result<Value> {
        let mut data = raw;
        if let Some(found) = data.get(&self.schema.doc_type_attr).and_then(Value::as_str) {
            if found != self.doc_type {
                return Err(CouchError::DocType(format!(
                    "the document being wrapped has doc type '{found}', expected '{}'",
                    self.doc_type
                )));
            }
        }

        let warnings = validation::validate_and_prepare(&self.schema, self.definition(), &mut data)?;
        for warning in warnings {
            log::warn!("{}: {warning}", self.doc_type);
        }
        Ok(data)
    }
}

/// Dispatches to one of several doc type schemas using the document's
/// doc type attribute.
#[derive(Debug, Clone)]
pub struct SchemaSet {
    schema: Arc<SchemaDefinition>,
}

impl SchemaSet {
    pub fn new(schema: Arc<SchemaDefinition>) -> Self {
        SchemaSet { schema }
    }

    /// Resolve the schema responsible for the given raw document.
    pub fn schema_for(&self, raw: &Value) -> Result<DocumentSchema> {
        let attr = &self.schema.doc_type_attr;
        let doc_type = raw.get(attr).and_then(Value::as_str).unwrap_or_default();
        if !self.schema.doc_types.contains_key(doc_type) {
            return Err(CouchError::DocType(format!(
                "the document being wrapped has doc type '{doc_type}' and no schema \
                 is registered for it (known: {:?})",
                self.known_doc_types()
            )));
        }
        DocumentSchema::new(Arc::clone(&self.schema), doc_type)
    }

    fn known_doc_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.schema.doc_types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Wrap for SchemaSet {
    fn wrap(&self, raw: Value) -> Result<Value> {
        self.schema_for(&raw)?.wrap(raw)
    }
}

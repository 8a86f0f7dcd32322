use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level schema definition parsed from schema.yaml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDefinition {
    /// Reusable object types, referenced from fields by name
    #[serde(default)]
    pub types: HashMap<String, HashMap<String, FieldDefinition>>,
    #[serde(default)]
    pub doc_types: HashMap<String, DocTypeDefinition>,
    /// Name of the attribute that carries a document's type
    #[serde(default = "default_doc_type_attr")]
    pub doc_type_attr: String,
}

/// Definition of a single document type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocTypeDefinition {
    #[serde(default)]
    pub fields: HashMap<String, FieldDefinition>,
    #[serde(default = "default_true")]
    pub additional_properties: bool,
    #[serde(default)]
    pub strict: bool,
}

/// Definition of a single field in a document type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "enum", default)]
    pub enum_values: Option<Vec<String>>,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub items: Option<String>,
}

/// Field type enumeration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Date,
    Datetime,
    List,
    Object,
    #[serde(untagged)]
    Custom(std::string::String),
}

fn default_doc_type_attr() -> String {
    "doc_type".to_string()
}

fn default_true() -> bool {
    true
}

impl SchemaDefinition {
    /// Look up a reusable type by name
    pub fn get_custom_type(&self, name: &str) -> Option<&HashMap<String, FieldDefinition>> {
        self.types.get(name)
    }
}

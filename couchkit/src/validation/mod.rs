use crate::error::{CouchError, Result};
use crate::schema::{DocTypeDefinition, FieldDefinition, FieldType, SchemaDefinition};
use serde_json::Value;

/// Result of validating a document
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Validate a document against its doc type definition.
/// In strict mode issues are errors, otherwise they are warnings.
/// Keys starting with an underscore belong to the server (`_id`, `_rev`,
/// `_attachments`, ...) and are never checked.
pub fn validate_document(
    schema: &SchemaDefinition,
    doc_type: &DocTypeDefinition,
    data: &Value,
) -> ValidationResult {
    let mut result = ValidationResult {
        errors: Vec::new(),
        warnings: Vec::new(),
    };

    let object = match data.as_object() {
        Some(o) => o,
        None => {
            result.errors.push("Document must be a JSON object".into());
            return result;
        }
    };

    for (field_name, field_def) in &doc_type.fields {
        let value = object.get(field_name);

        if field_def.required && value.map_or(true, Value::is_null) {
            if field_def.default.is_none() {
                add_issue(
                    &mut result,
                    doc_type.strict,
                    format!("Required field '{field_name}' is missing"),
                );
            }
            continue;
        }

        if let Some(val) = value.filter(|v| !v.is_null()) {
            validate_field_value(schema, field_name, field_def, val, doc_type.strict, &mut result);
        }
    }

    if !doc_type.additional_properties {
        for key in object.keys() {
            if !key.starts_with('_') && !doc_type.fields.contains_key(key) {
                add_issue(
                    &mut result,
                    doc_type.strict,
                    format!("Unexpected field '{key}' (additional_properties is false)"),
                );
            }
        }
    }

    result
}

/// Fill in default values for absent or null fields.
pub fn apply_defaults(doc_type: &DocTypeDefinition, data: &mut Value) {
    let object = match data.as_object_mut() {
        Some(o) => o,
        None => return,
    };

    for (field_name, field_def) in &doc_type.fields {
        let has_value = object.get(field_name).map_or(false, |v| !v.is_null());
        if !has_value {
            if let Some(default) = &field_def.default {
                object.insert(field_name.clone(), default.clone());
            }
        }
    }
}

fn validate_field_value(
    schema: &SchemaDefinition,
    field_name: &str,
    field_def: &FieldDefinition,
    value: &Value,
    strict: bool,
    result: &mut ValidationResult,
) {
    let expected = match &field_def.field_type {
        FieldType::String => {
            if let Some(s) = value.as_str() {
                if let Some(enum_values) = &field_def.enum_values {
                    if !enum_values.iter().any(|e| e == s) {
                        add_issue(
                            result,
                            strict,
                            format!("Field '{field_name}' value '{s}' is not in enum: {enum_values:?}"),
                        );
                    }
                }
                return;
            }
            "string"
        }
        FieldType::Number if value.is_number() => return,
        FieldType::Number => "number",
        FieldType::Integer if value.is_i64() || value.is_u64() => return,
        FieldType::Integer => "integer",
        FieldType::Boolean if value.is_boolean() => return,
        FieldType::Boolean => "boolean",
        // Dates travel as strings in JSON
        FieldType::Date | FieldType::Datetime if value.is_string() => return,
        FieldType::Date | FieldType::Datetime => "date string",
        FieldType::List => {
            if let Some(items) = value.as_array() {
                if let Some(item_type) = &field_def.items {
                    for (i, item) in items.iter().enumerate() {
                        if !matches_simple_type(item_type, item) {
                            add_issue(
                                result,
                                strict,
                                format!(
                                    "Field '{field_name}[{i}]' expected {item_type}, got {}",
                                    type_name(item)
                                ),
                            );
                        }
                    }
                }
                return;
            }
            "list"
        }
        FieldType::Object if value.is_object() => return,
        FieldType::Object => "object",
        FieldType::Custom(type_name_str) => {
            validate_custom_type(schema, field_name, type_name_str, value, strict, result);
            return;
        }
    };

    add_issue(
        result,
        strict,
        format!("Field '{field_name}' expected {expected}, got {}", type_name(value)),
    );
}

fn validate_custom_type(
    schema: &SchemaDefinition,
    field_name: &str,
    type_name_str: &str,
    value: &Value,
    strict: bool,
    result: &mut ValidationResult,
) {
    let Some(type_fields) = schema.get_custom_type(type_name_str) else {
        add_issue(
            result,
            strict,
            format!("Field '{field_name}' uses unknown type '{type_name_str}'"),
        );
        return;
    };

    let Some(obj) = value.as_object() else {
        add_issue(
            result,
            strict,
            format!(
                "Field '{field_name}' expected object (type '{type_name_str}'), got {}",
                type_name(value)
            ),
        );
        return;
    };

    for (sub_field_name, sub_field_def) in type_fields {
        let sub_val = obj.get(sub_field_name);
        if sub_field_def.required && sub_val.map_or(true, Value::is_null) {
            add_issue(
                result,
                strict,
                format!("Field '{field_name}.{sub_field_name}' is required in type '{type_name_str}'"),
            );
        }
    }
}

fn matches_simple_type(type_name: &str, value: &Value) -> bool {
    match type_name {
        "string" | "date" | "datetime" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "list" => value.is_array(),
        _ => true,
    }
}

fn add_issue(result: &mut ValidationResult, strict: bool, message: String) {
    if strict {
        result.errors.push(message);
    } else {
        result.warnings.push(message);
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Validate and apply defaults. Returns an error if strict validation fails,
/// otherwise the list of warnings.
pub fn validate_and_prepare(
    schema: &SchemaDefinition,
    doc_type: &DocTypeDefinition,
    data: &mut Value,
) -> Result<Vec<String>> {
    apply_defaults(doc_type, data);
    let result = validate_document(schema, doc_type, data);

    if !result.is_ok() {
        return Err(CouchError::Validation(format!(
            "Document validation failed:\n  - {}",
            result.errors.join("\n  - ")
        )));
    }

    Ok(result.warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_schema_str;
    use serde_json::json;

    fn test_schema() -> SchemaDefinition {
        parse_schema_str(
            r#"
types:
  address:
    street: { type: string, required: true }
    city: { type: string, required: true }

doc_types:
  User:
    fields:
      name: { type: string, required: true }
      email: { type: string, required: true }
      role: { type: string, enum: [admin, member, guest], default: member }
      address: { type: address }
      logins: { type: integer }
    additional_properties: false
    strict: true

  Post:
    fields:
      title: { type: string, required: true }
      tags: { type: list, items: string }
      published: { type: boolean }
    strict: true

  Event:
    fields:
      kind: { type: string, required: true }
      payload: { type: object }
    strict: false
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_valid_user() {
        let schema = test_schema();
        let doc_type = &schema.doc_types["User"];
        let data = json!({"name": "Alice", "email": "alice@test.com", "role": "admin"});

        let result = validate_document(&schema, doc_type, &data);
        assert!(result.is_ok(), "Errors: {:?}", result.errors);
    }

    #[test]
    fn test_missing_required_field() {
        let schema = test_schema();
        let doc_type = &schema.doc_types["User"];
        let data = json!({"name": "Alice"});

        let result = validate_document(&schema, doc_type, &data);
        assert!(!result.is_ok());
        assert!(result.errors.iter().any(|e| e.contains("email")));
    }

    #[test]
    fn test_invalid_enum_value() {
        let schema = test_schema();
        let doc_type = &schema.doc_types["User"];
        let data = json!({"name": "Alice", "email": "a@b.c", "role": "superadmin"});

        let result = validate_document(&schema, doc_type, &data);
        assert!(result.errors.iter().any(|e| e.contains("superadmin")));
    }

    #[test]
    fn test_type_mismatch() {
        let schema = test_schema();
        let doc_type = &schema.doc_types["User"];
        let data = json!({"name": 42, "email": "a@b.c", "logins": 1.5});

        let result = validate_document(&schema, doc_type, &data);
        assert!(result.errors.iter().any(|e| e.contains("'name'")));
        assert!(result.errors.iter().any(|e| e.contains("'logins'")));
    }

    #[test]
    fn test_underscore_keys_always_allowed() {
        let schema = test_schema();
        let doc_type = &schema.doc_types["User"];
        let data = json!({
            "_id": "user-1",
            "_rev": "3-abc",
            "name": "Alice",
            "email": "a@b.c"
        });

        let result = validate_document(&schema, doc_type, &data);
        assert!(result.is_ok(), "Errors: {:?}", result.errors);
    }

    #[test]
    fn test_additional_properties_rejected() {
        let schema = test_schema();
        let doc_type = &schema.doc_types["User"];
        let data = json!({"name": "Alice", "email": "a@b.c", "extra_field": "oops"});

        let result = validate_document(&schema, doc_type, &data);
        assert!(result.errors.iter().any(|e| e.contains("extra_field")));
    }

    #[test]
    fn test_non_strict_mode_warnings() {
        let schema = test_schema();
        let doc_type = &schema.doc_types["Event"];
        let data = json!({"kind": 123, "anything": true});

        let result = validate_document(&schema, doc_type, &data);
        assert!(result.is_ok());
        assert!(result.has_warnings());
    }

    #[test]
    fn test_list_items_checked() {
        let schema = test_schema();
        let doc_type = &schema.doc_types["Post"];
        let data = json!({"title": "T", "tags": ["rust", 7]});

        let result = validate_document(&schema, doc_type, &data);
        assert!(result.errors.iter().any(|e| e.contains("tags[1]")));
    }

    #[test]
    fn test_custom_type_validation() {
        let schema = test_schema();
        let doc_type = &schema.doc_types["User"];
        let data = json!({"name": "A", "email": "a@b.c", "address": {"city": "NYC"}});

        let result = validate_document(&schema, doc_type, &data);
        assert!(result.errors.iter().any(|e| e.contains("street")));
    }

    #[test]
    fn test_apply_defaults_doesnt_overwrite() {
        let schema = test_schema();
        let doc_type = &schema.doc_types["User"];
        let mut data = json!({"name": "A", "email": "a@b.c", "role": "admin"});

        apply_defaults(doc_type, &mut data);
        assert_eq!(data["role"], "admin");
    }

    #[test]
    fn test_validate_and_prepare() {
        let schema = test_schema();
        let doc_type = &schema.doc_types["User"];
        let mut data = json!({"name": "A", "email": "a@b.c"});

        let warnings = validate_and_prepare(&schema, doc_type, &mut data).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(data["role"], "member");
    }

    #[test]
    fn test_non_object_document() {
        let schema = test_schema();
        let doc_type = &schema.doc_types["Post"];
        let result = validate_document(&schema, doc_type, &json!([1, 2]));
        assert!(!result.is_ok());
    }
}

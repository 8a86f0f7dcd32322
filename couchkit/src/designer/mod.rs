//! Couchapp-style design documents: directory loading, `!code`/`!json`
//! macro expansion and push.

mod fs;
pub mod macros;

pub use fs::DesignDirectory;
pub use macros::{apply_to_function_map, expand_code, expand_json, MacroExpander};

use crate::error::Result;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Members holding a map of function name to source.
const FUNCTION_MEMBERS: &[&str] = &["shows", "lists", "updates", "filters", "spatial"];

/// Members holding a map of name to a map of functions (`map`, `reduce`, ...).
const NESTED_FUNCTION_MEMBERS: &[&str] = &["views", "fulltext"];

/// Run macro expansion over every function of a design document.
///
/// Documents whose `_id` does not start with `_design/` are left alone.
/// Empty or malformed views are dropped first. The digest table of expanded
/// functions ends up in `couchapp.objects`.
pub fn expand_design_doc(doc: &mut Value, expander: &MacroExpander) -> Result<()> {
    let is_design = doc
        .get("_id")
        .and_then(Value::as_str)
        .map_or(false, |id| id.starts_with("_design/"));
    let Value::Object(fields) = doc else {
        return Ok(());
    };
    if !is_design {
        return Ok(());
    }

    drop_empty_views(fields);

    let snapshot = Value::Object(fields.clone());
    let mut digests = BTreeMap::new();

    for member in FUNCTION_MEMBERS {
        if let Some(Value::Object(functions)) = fields.get_mut(*member) {
            expander.apply_to_function_map(&snapshot, functions, &mut digests)?;
        }
    }

    if let Some(body) = fields.remove("validate_doc_update") {
        let mut single = Map::new();
        single.insert("validate_doc_update".into(), body);
        expander.apply_to_function_map(&snapshot, &mut single, &mut digests)?;
        fields.extend(single);
    }

    for member in NESTED_FUNCTION_MEMBERS {
        if let Some(Value::Object(groups)) = fields.get_mut(*member) {
            for functions in groups.values_mut() {
                if let Value::Object(functions) = functions {
                    expander.apply_to_function_map(&snapshot, functions, &mut digests)?;
                }
            }
        }
    }

    let couchapp = fields
        .entry("couchapp")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(meta) = couchapp {
        meta.insert("objects".into(), serde_json::to_value(&digests)?);
    }
    Ok(())
}

/// Remove views that are empty or not objects, along with their manifest entries.
fn drop_empty_views(fields: &mut Map<String, Value>) {
    let Some(Value::Object(views)) = fields.get_mut("views") else {
        return;
    };
    let dropped: Vec<String> = views
        .iter()
        .filter(|(_, v)| !matches!(v, Value::Object(m) if !m.is_empty()))
        .map(|(name, _)| name.clone())
        .collect();
    if dropped.is_empty() {
        return;
    }
    for name in &dropped {
        log::warn!("dropping empty view '{name}'");
        views.remove(name);
    }

    let manifest = fields
        .get_mut("couchapp")
        .and_then(|c| c.get_mut("manifest"))
        .and_then(Value::as_array_mut);
    if let Some(manifest) = manifest {
        manifest.retain(|entry| {
            let Some(entry) = entry.as_str() else {
                return true;
            };
            let stem = entry.trim_end_matches('/');
            let stem = stem.rsplit_once('.').map_or(stem, |(s, _)| s);
            !dropped.iter().any(|name| stem == format!("views/{name}"))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::sha256;
    use serde_json::json;
    use std::fs;

    #[test]
    fn test_expands_every_function_member() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("helper.js"), "HELPER").unwrap();

        let mut doc = json!({
            "_id": "_design/app",
            "settings": {"size": 80},
            "shows": {"post": "// !code helper.js"},
            "filters": {"mine": "// !json settings.size"},
            "validate_doc_update": "// !code helper.js",
            "views": {
                "by_date": {"map": "function(doc) {\n// !code helper.js\n}", "reduce": "_count"}
            }
        });
        expand_design_doc(&mut doc, &MacroExpander::new(tmp.path())).unwrap();

        assert_eq!(doc["shows"]["post"], "HELPER");
        assert_eq!(doc["filters"]["mine"], "var settings = {\"size\": 80};");
        assert_eq!(doc["validate_doc_update"], "HELPER");
        assert_eq!(doc["views"]["by_date"]["map"], "function(doc) {\nHELPER\n}");
        assert_eq!(doc["views"]["by_date"]["reduce"], "_count");

        let objects = doc["couchapp"]["objects"].as_object().unwrap();
        assert_eq!(objects.len(), 3);
        assert_eq!(objects[&sha256("HELPER")], "// !code helper.js");
    }

    #[test]
    fn test_plain_documents_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let mut doc = json!({"_id": "notes", "shows": {"x": "// !code missing.js"}});
        let before = doc.clone();
        expand_design_doc(&mut doc, &MacroExpander::new(tmp.path())).unwrap();
        assert_eq!(doc, before);
    }

    #[test]
    fn test_empty_views_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let mut doc = json!({
            "_id": "_design/app",
            "views": {"empty": {}, "broken": "", "ok": {"map": "function(doc) {}"}},
            "couchapp": {"manifest": ["views/", "views/empty/", "views/broken.js", "views/ok/", "views/ok/map.js"]}
        });
        expand_design_doc(&mut doc, &MacroExpander::new(tmp.path())).unwrap();

        let views = doc["views"].as_object().unwrap();
        assert_eq!(views.keys().collect::<Vec<_>>(), vec!["ok"]);
        assert_eq!(
            doc["couchapp"]["manifest"],
            json!(["views/", "views/ok/", "views/ok/map.js"])
        );
    }

    #[test]
    fn test_failure_names_function() {
        let tmp = tempfile::tempdir().unwrap();
        let mut doc = json!({"_id": "_design/app", "lists": {"feed": "// !code nope.js"}});
        let err = expand_design_doc(&mut doc, &MacroExpander::new(tmp.path())).unwrap_err();
        assert!(err.to_string().contains("\"feed\""));
        assert!(err.to_string().contains("nope.js"));
    }
}

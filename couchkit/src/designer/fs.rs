use super::{expand_design_doc, MacroExpander};
use crate::config::DEFAULT_MAX_INCLUDE_DEPTH;
use crate::error::{CouchError, Result};
use crate::hash::sha256;
use crate::server::Database;
use regex::Regex;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Members cloned back as one `<name>.js` file per function.
const CLONED_FUNCTION_MEMBERS: &[&str] = &["shows", "lists", "filters", "updates"];

/// Metadata keys the loader owns; copies found on disk are discarded.
const GENERATED_META: &[&str] = &["signatures", "manifest", "objects", "length"];

/// A design document laid out as a directory tree:
///
/// ```text
/// blog/
///   _id                  -> "_design/blog" unless overridden
///   language             -> "javascript"
///   views/by_date/map.js -> views.by_date.map
///   shows/post.js        -> shows.post
///   lib/md5.js           -> available to `// !code lib/md5.js`
///   couchapp.json        -> couchapp metadata
/// ```
#[derive(Debug)]
pub struct DesignDirectory {
    dir: PathBuf,
    docid: String,
    ignores: Vec<Regex>,
    max_include_depth: usize,
}

impl DesignDirectory {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_as(dir.as_ref(), true)
    }

    /// Plain documents take their id from the directory name as is.
    fn open_as(dir: &Path, design: bool) -> Result<Self> {
        let dir = dir.to_path_buf();
        if !dir.is_dir() {
            return Err(CouchError::Configuration(format!(
                "design directory '{}' does not exist",
                dir.display()
            )));
        }

        let ignores = load_ignores(&dir)?;
        let docid = read_docid(&dir, design)?;
        Ok(DesignDirectory {
            dir,
            docid,
            ignores,
            max_include_depth: DEFAULT_MAX_INCLUDE_DEPTH,
        })
    }

    pub fn with_max_include_depth(mut self, depth: usize) -> Self {
        self.max_include_depth = depth;
        self
    }

    pub fn docid(&self) -> &str {
        &self.docid
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Build the design document: directory members, couchapp metadata and
    /// the manifest, with macros expanded.
    pub fn document(&self) -> Result<Value> {
        let mut manifest = Vec::new();
        let mut fields = Map::new();
        fields.insert("_id".into(), Value::String(self.docid.clone()));
        fields.extend(self.dir_to_fields(&self.dir, 0, &mut manifest)?);

        let couchapp = fields
            .entry("couchapp")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(meta) = couchapp {
            meta.insert("manifest".into(), Value::from(manifest));
            meta.insert("objects".into(), Value::Object(Map::new()));
        }

        let mut doc = Value::Object(fields);
        let expander = MacroExpander::new(&self.dir).with_max_depth(self.max_include_depth);
        expand_design_doc(&mut doc, &expander)?;
        Ok(doc)
    }

    /// Save the document to `db` unless the stored copy is identical.
    /// Returns whether anything was written.
    pub fn push(&self, db: &Database) -> Result<bool> {
        self.push_to(std::slice::from_ref(db))
    }

    /// Push to every database in `dbs`. Documents under `_docs/` are pushed
    /// along with the design document.
    pub fn push_to(&self, dbs: &[Database]) -> Result<bool> {
        let doc = self.document()?;
        let mut pushed = false;
        for db in dbs {
            pushed |= self.push_document(db, doc.clone())?;
        }

        let docs_dir = self.dir.join("_docs");
        if docs_dir.is_dir() {
            Self::push_docs(&docs_dir, dbs)?;
            pushed = true;
        }
        Ok(pushed)
    }

    /// Push every application directory found directly under `dir`.
    pub fn push_apps(dir: impl AsRef<Path>, dbs: &[Database]) -> Result<bool> {
        let mut pushed = false;
        for path in sorted_entries(dir.as_ref())? {
            if path.is_dir() && !is_hidden(&path) {
                pushed |= DesignDirectory::open(&path)?.push_to(dbs)?;
            }
        }
        Ok(pushed)
    }

    /// Save the plain documents in `dir` through `_bulk_docs`: each `.json`
    /// file is one document (id defaults to the file stem) and each
    /// subdirectory is loaded like a design directory. Conflicting documents
    /// are retried once on their current revision. Returns how many
    /// documents were sent to each database.
    pub fn push_docs(dir: impl AsRef<Path>, dbs: &[Database]) -> Result<usize> {
        let mut docs = Vec::new();
        for path in sorted_entries(dir.as_ref())? {
            if is_hidden(&path) {
                continue;
            }
            if path.is_dir() {
                docs.push(DesignDirectory::open_as(&path, false)?.document()?);
            } else if path.extension().map_or(false, |ext| ext == "json") {
                docs.push(read_json_doc(&path)?);
            }
        }

        for db in dbs {
            save_all(db, &docs)?;
        }
        Ok(docs.len())
    }

    /// Rebuild a design directory at `dest` from the document stored in
    /// `db`. Function bodies listed in `couchapp.objects` are written back
    /// in their unexpanded form. Attachments are not fetched.
    pub fn clone_from(db: &Database, docid: &str, dest: impl AsRef<Path>) -> Result<Self> {
        let dest = dest.as_ref();
        std::fs::create_dir_all(dest)?;

        let Value::Object(mut doc) = db.open_doc(docid)? else {
            return Err(CouchError::InvalidResponse(format!(
                "document '{docid}' is not a JSON object"
            )));
        };
        let meta = doc.get("couchapp").cloned().unwrap_or(Value::Null);
        let manifest: Vec<String> = meta
            .get("manifest")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let objects = meta
            .get("objects")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        for entry in &manifest {
            let target = dest.join(entry);
            if entry.ends_with('/') {
                std::fs::create_dir_all(&target)?;
                continue;
            }
            if entry == "couchapp.json" {
                continue;
            }
            let mut parents: Vec<&str> = entry.split('/').collect();
            let Some(file_name) = parents.pop() else {
                continue;
            };
            let key = Path::new(file_name)
                .file_stem()
                .map_or_else(|| file_name.to_string(), |s| s.to_string_lossy().into_owned());
            let Some(content) = take_member(&mut doc, &parents, &key) else {
                log::warn!("clone: {entry} is listed in the manifest but missing");
                continue;
            };
            log::debug!("clone property: {entry}");
            let text = if file_name.ends_with(".json") {
                serde_json::to_string(&content)?
            } else {
                restore_source(&content, &objects)
            };
            write_file(&target, &text)?;
        }

        // members the manifest does not cover
        for (key, value) in &doc {
            if key.starts_with('_') {
                continue;
            }
            let path = dest.join(key);
            match (key.as_str(), value) {
                ("couchapp", Value::Object(meta)) => {
                    let mut meta = meta.clone();
                    for generated in GENERATED_META {
                        meta.remove(*generated);
                    }
                    if !meta.is_empty() {
                        write_file(&dest.join("couchapp.json"), &serde_json::to_string_pretty(&meta)?)?;
                    }
                }
                ("views", Value::Object(views)) => {
                    for (name, functions) in views {
                        let Value::Object(functions) = functions else {
                            continue;
                        };
                        for (function, body) in functions {
                            let file = path.join(name).join(format!("{function}.js"));
                            log::warn!("clone view not in manifest: {}", file.display());
                            write_file(&file, &restore_source(body, &objects))?;
                        }
                    }
                }
                (member, Value::Object(functions)) if CLONED_FUNCTION_MEMBERS.contains(&member) => {
                    for (name, body) in functions {
                        let file = path.join(format!("{name}.js"));
                        log::warn!("clone function not in manifest: {}", file.display());
                        write_file(&file, &restore_source(body, &objects))?;
                    }
                }
                _ if path.exists() => {}
                (_, Value::Array(_)) => {
                    write_file(&dest.join(format!("{key}.json")), &serde_json::to_string(value)?)?
                }
                (_, Value::Object(members)) => {
                    for (field, member) in members {
                        match member {
                            Value::String(text) => write_file(&path.join(field), text)?,
                            other => write_file(
                                &path.join(format!("{field}.json")),
                                &serde_json::to_string(other)?,
                            )?,
                        }
                    }
                }
                (_, Value::String(text)) => write_file(&path, text)?,
                (_, other) => write_file(&path, &other.to_string())?,
            }
        }

        let stored_id = doc.get("_id").and_then(Value::as_str).unwrap_or(docid);
        write_file(&dest.join("_id"), stored_id)?;
        log::info!("{}/{docid} cloned in {}", db.name(), dest.display());
        DesignDirectory::open(dest)
    }

    fn push_document(&self, db: &Database, mut doc: Value) -> Result<bool> {
        match db.open_doc(&self.docid) {
            Ok(current) => {
                if let Value::Object(fields) = &mut doc {
                    // keep what the server has that the directory cannot provide
                    for key in ["_rev", "_attachments"] {
                        if let Some(value) = current.get(key) {
                            fields.insert(key.into(), value.clone());
                        }
                    }
                }
                if doc == current {
                    log::info!("{} is up to date in {}", self.docid, db.name());
                    return Ok(false);
                }
            }
            Err(CouchError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        db.save_doc(&mut doc, true)?;
        log::info!(
            "{} has been pushed from {} to {}",
            self.docid,
            self.dir.display(),
            db.name()
        );
        Ok(true)
    }

    fn is_ignored(&self, name: &str) -> bool {
        let ignored = self.ignores.iter().any(|re| re.is_match(name));
        if ignored {
            log::debug!("ignoring {name}");
        }
        ignored
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.dir)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn dir_to_fields(
        &self,
        current: &Path,
        depth: usize,
        manifest: &mut Vec<String>,
    ) -> Result<Map<String, Value>> {
        let entries = sorted_entries(current)?;

        let mut fields = Map::new();
        for path in entries {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let rel_path = self.relative(&path);

            if name.starts_with('.') || self.is_ignored(&name) {
                continue;
            }
            if depth == 0 && name.starts_with('_') {
                // `_id`, `_attachments` and friends are never members
                continue;
            }

            if depth == 0 && (name == "couchapp" || name == "couchapp.json") {
                let content = if path.is_dir() {
                    manifest.push(format!("{rel_path}/"));
                    self.dir_to_fields(&path, depth + 1, manifest)?
                } else {
                    manifest.push(rel_path);
                    match serde_json::from_str(&std::fs::read_to_string(&path)?)? {
                        Value::Object(meta) => meta,
                        other => {
                            let mut meta = Map::new();
                            meta.insert("meta".into(), other);
                            meta
                        }
                    }
                };
                merge_couchapp_meta(&mut fields, content);
            } else if path.is_dir() {
                manifest.push(format!("{rel_path}/"));
                let members = self.dir_to_fields(&path, depth + 1, manifest)?;
                fields.insert(name, Value::Object(members));
            } else {
                log::debug!("push {rel_path}");
                let content = read_member(&path)?;
                let key = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or(name);
                if fields.contains_key(&key) {
                    log::warn!("{key} is already in properties. Can't add ({rel_path})");
                } else {
                    manifest.push(rel_path);
                    fields.insert(key, content);
                }
            }
        }
        Ok(fields)
    }
}

fn load_ignores(dir: &Path) -> Result<Vec<Regex>> {
    let ignore_file = dir.join(".couchappignore");
    if !ignore_file.is_file() {
        return Ok(Vec::new());
    }
    let patterns: Vec<String> = serde_json::from_str(&std::fs::read_to_string(&ignore_file)?)?;
    patterns
        .iter()
        // patterns match from the start of the name
        .map(|p| {
            Regex::new(&format!("^(?:{p})")).map_err(|e| {
                CouchError::Configuration(format!("invalid pattern in .couchappignore: {e}"))
            })
        })
        .collect()
}

fn read_docid(dir: &Path, design: bool) -> Result<String> {
    let id_file = dir.join("_id");
    if id_file.is_file() {
        let content = std::fs::read_to_string(&id_file)?;
        if let Some(id) = content.lines().next().map(str::trim).filter(|l| !l.is_empty()) {
            return Ok(id.to_string());
        }
    }
    let name = dir
        .canonicalize()?
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            CouchError::Configuration(format!("cannot name design directory '{}'", dir.display()))
        })?;
    if design {
        Ok(format!("_design/{name}"))
    } else {
        Ok(name)
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map_or(true, |n| n.to_string_lossy().starts_with('.'))
}

fn read_json_doc(path: &Path) -> Result<Value> {
    let Value::Object(mut doc) = serde_json::from_str::<Value>(&std::fs::read_to_string(path)?)? else {
        return Err(CouchError::Validation(format!(
            "{} does not hold a JSON object",
            path.display()
        )));
    };
    if !doc.contains_key("_id") {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        doc.insert("_id".into(), Value::String(stem));
    }
    doc.entry("couchapp")
        .or_insert_with(|| Value::Object(Map::new()));
    Ok(Value::Object(doc))
}

/// Bulk save `docs`, then retry conflicting ones on their latest revision.
fn save_all(db: &Database, docs: &[Value]) -> Result<()> {
    let mut batch = docs.to_vec();
    let errors = match db.bulk_save(&mut batch, false) {
        Ok(_) => return Ok(()),
        Err(CouchError::BulkSave { errors, .. }) => errors,
        Err(e) => return Err(e),
    };

    let mut retry = Vec::new();
    for error in &errors {
        let Some(id) = error.get("id").and_then(Value::as_str) else {
            continue;
        };
        let original = docs
            .iter()
            .find(|doc| doc.get("_id").and_then(Value::as_str) == Some(id));
        let Some(mut doc) = original.cloned() else {
            continue;
        };
        match db.get_rev(id) {
            Ok(rev) => {
                doc["_rev"] = Value::String(rev);
                retry.push(doc);
            }
            Err(CouchError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    if !retry.is_empty() {
        db.bulk_save(&mut retry, false)?;
    }
    Ok(())
}

/// Remove `parents/key` from `fields`, dropping objects left empty.
fn take_member(fields: &mut Map<String, Value>, parents: &[&str], key: &str) -> Option<Value> {
    match parents.split_first() {
        None => fields.remove(key),
        Some((head, rest)) => {
            let Some(Value::Object(child)) = fields.get_mut(*head) else {
                return None;
            };
            let taken = take_member(child, rest, key);
            if child.is_empty() {
                fields.remove(*head);
            }
            taken
        }
    }
}

/// The unexpanded source of a function body when the digest table knows it.
fn restore_source(value: &Value, objects: &Map<String, Value>) -> String {
    match value {
        Value::String(text) => objects
            .get(&sha256(text))
            .and_then(Value::as_str)
            .unwrap_or(text.as_str())
            .to_string(),
        other => other.to_string(),
    }
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

/// A member file: parsed JSON for `.json`, trimmed text otherwise.
fn read_member(path: &Path) -> Result<Value> {
    let bytes = std::fs::read(path)?;
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            log::warn!("{} isn't encoded in utf8", path.display());
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        }
    };

    if path.extension().map_or(false, |ext| ext == "json") {
        match serde_json::from_str(&text) {
            Ok(value) => Ok(value),
            Err(e) => {
                log::error!("Json invalid in {}: {e}", path.display());
                Ok(Value::String(String::new()))
            }
        }
    } else {
        Ok(Value::String(text.trim().to_string()))
    }
}

fn merge_couchapp_meta(fields: &mut Map<String, Value>, mut content: Map<String, Value>) {
    for key in GENERATED_META {
        content.remove(*key);
    }
    match fields.get_mut("couchapp") {
        Some(Value::Object(existing)) => existing.extend(content),
        _ => {
            fields.insert("couchapp".into(), Value::Object(content));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::server::Server;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap;
    use std::fs;
    use std::sync::{Arc, Mutex};

    /// Stores PUT documents by path and answers GETs from them.
    fn document_store() -> Arc<MockBackend> {
        let store = Arc::new(Mutex::new(HashMap::<String, Value>::new()));
        Arc::new(MockBackend::new(move |call| match call.method {
            "PUT" => {
                let mut doc = call.body.clone().unwrap();
                doc["_rev"] = json!("1-abc");
                let id = doc["_id"].clone();
                store.lock().unwrap().insert(call.path.clone(), doc);
                Ok(json!({"ok": true, "id": id, "rev": "1-abc"}))
            }
            "POST" => Ok(json!([])),
            _ => store
                .lock()
                .unwrap()
                .get(&call.path)
                .cloned()
                .ok_or_else(|| CouchError::NotFound("missing".into())),
        }))
    }

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn sample_app() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let app = tmp.path();
        write(app, "language", "javascript\n");
        write(app, "views/by_date/map.js", "function(doc) {\n  // !code lib/util.js\n  emit(doc.date, null);\n}\n");
        write(app, "views/by_date/reduce.js", "_count");
        write(app, "shows/post.js", "function(doc, req) {\n  // !json settings\n  return doc.title;\n}");
        write(app, "settings.json", "{\"title\": \"My blog\"}");
        write(app, "lib/util.js", "function util() {}");
        write(app, "couchapp.json", "{\"name\": \"blog\", \"signatures\": {\"x\": 1}}");
        write(app, "_attachments/index.html", "<html></html>");
        write(app, ".hidden", "secret");
        write(app, "notes.tmp", "scratch");
        write(app, ".couchappignore", "[\"notes\\\\.tmp\"]");
        tmp
    }

    #[test]
    fn test_docid_from_directory_name() {
        let tmp = tempfile::tempdir().unwrap();
        let app = tmp.path().join("blog");
        fs::create_dir(&app).unwrap();
        assert_eq!(DesignDirectory::open(&app).unwrap().docid(), "_design/blog");

        write(&app, "_id", "_design/other\nignored");
        assert_eq!(DesignDirectory::open(&app).unwrap().docid(), "_design/other");
    }

    #[test]
    fn test_missing_directory() {
        let err = DesignDirectory::open("/definitely/not/here").unwrap_err();
        assert!(matches!(err, CouchError::Configuration(_)));
    }

    #[test]
    fn test_document_from_directory() {
        let tmp = sample_app();
        let design = DesignDirectory::open(tmp.path()).unwrap();
        let doc = design.document().unwrap();

        assert_eq!(doc["language"], "javascript");
        assert_eq!(doc["settings"], json!({"title": "My blog"}));
        assert_eq!(
            doc["views"]["by_date"]["map"],
            "function(doc) {\n  function util() {}\n  emit(doc.date, null);\n}"
        );
        assert_eq!(doc["views"]["by_date"]["reduce"], "_count");
        assert_eq!(
            doc["shows"]["post"],
            "function(doc, req) {\n  var settings = {\"title\": \"My blog\"};\n  return doc.title;\n}"
        );
        assert!(doc.get("_attachments").is_none());
        assert!(doc.get("hidden").is_none());
        assert!(doc.get("notes").is_none());

        let couchapp = &doc["couchapp"];
        assert_eq!(couchapp["name"], "blog");
        assert!(couchapp.get("signatures").is_none());
        assert_eq!(couchapp["objects"].as_object().unwrap().len(), 2);

        let manifest: Vec<&str> = couchapp["manifest"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(manifest.contains(&"couchapp.json"));
        assert!(manifest.contains(&"views/by_date/"));
        assert!(manifest.contains(&"views/by_date/map.js"));
        assert!(!manifest.iter().any(|m| m.starts_with("_attachments")));
    }

    #[test]
    fn test_invalid_json_member_becomes_empty() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "broken.json", "{nope");
        let doc = DesignDirectory::open(tmp.path()).unwrap().document().unwrap();
        assert_eq!(doc["broken"], "");
    }

    #[test]
    fn test_duplicate_member_keeps_first() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "rewrites.js", "first");
        write(tmp.path(), "rewrites.json", "[\"second\"]");
        let doc = DesignDirectory::open(tmp.path()).unwrap().document().unwrap();
        assert_eq!(doc["rewrites"], "first");
    }

    #[test]
    fn test_push_skips_unchanged_document() {
        let tmp = sample_app();
        let design = DesignDirectory::open(tmp.path()).unwrap();
        let stored = Arc::new(Mutex::new(None::<Value>));

        let remote = stored.clone();
        let backend = Arc::new(MockBackend::new(move |call| match call.method {
            "PUT" => {
                let mut doc = call.body.clone().unwrap();
                doc["_rev"] = json!("1-abc");
                let id = doc["_id"].clone();
                *remote.lock().unwrap() = Some(doc);
                Ok(json!({"ok": true, "id": id, "rev": "1-abc"}))
            }
            _ => remote
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| CouchError::NotFound("missing".into())),
        }));
        let db = Server::with_backend(backend.clone(), "mock://")
            .database("blog")
            .unwrap();

        assert!(design.push(&db).unwrap());
        assert!(!design.push(&db).unwrap());

        let puts = backend.calls().iter().filter(|c| c.method == "PUT").count();
        assert_eq!(puts, 1);

        // a local edit is pushed again
        write(tmp.path(), "language", "erlang");
        assert!(design.push(&db).unwrap());
    }

    #[test]
    fn test_push_to_several_databases() {
        let tmp = sample_app();
        let design = DesignDirectory::open(tmp.path()).unwrap();
        let backend = document_store();
        let server = Server::with_backend(backend.clone(), "mock://");
        let dbs = [server.database("a").unwrap(), server.database("b").unwrap()];

        assert!(design.push_to(&dbs).unwrap());
        assert!(!design.push_to(&dbs).unwrap());

        let mut put_paths: Vec<String> = backend
            .calls()
            .into_iter()
            .filter(|c| c.method == "PUT")
            .map(|c| c.path)
            .collect();
        put_paths.sort();
        let docid = design.docid().trim_start_matches("_design/").to_string();
        assert_eq!(
            put_paths,
            vec![format!("a/_design/{docid}"), format!("b/_design/{docid}")]
        );
    }

    #[test]
    fn test_push_apps_pushes_each_directory() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "one/language", "javascript");
        write(tmp.path(), "one/_docs/readme.json", "{\"body\": \"hello\"}");
        write(tmp.path(), "two/language", "javascript");
        write(tmp.path(), ".git/config", "");

        let backend = document_store();
        let db = Server::with_backend(backend.clone(), "mock://")
            .database("blog")
            .unwrap();
        assert!(DesignDirectory::push_apps(tmp.path(), &[db]).unwrap());

        let calls = backend.calls();
        let puts: Vec<&str> = calls
            .iter()
            .filter(|c| c.method == "PUT")
            .map(|c| c.path.as_str())
            .collect();
        assert_eq!(puts, vec!["blog/_design/one", "blog/_design/two"]);

        let bulk = calls.iter().find(|c| c.method == "POST").unwrap();
        assert_eq!(bulk.path, "blog/_bulk_docs");
        let docs = &bulk.body.as_ref().unwrap()["docs"];
        assert_eq!(docs[0]["_id"], "readme");
        assert_eq!(docs[0]["body"], "hello");
    }

    #[test]
    fn test_push_docs_retries_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "about/title", "About us\n");
        write(tmp.path(), "note.json", "{\"title\": \"x\"}");
        write(tmp.path(), "ignored.txt", "not a document");

        let posts = Arc::new(Mutex::new(0));
        let counter = posts.clone();
        let backend = Arc::new(MockBackend::new(move |call| match call.method {
            "POST" => {
                let mut n = counter.lock().unwrap();
                *n += 1;
                if *n == 1 {
                    Ok(json!([
                        {"id": "about", "error": "conflict", "reason": "Document update conflict."},
                        {"id": "note", "rev": "1-n"}
                    ]))
                } else {
                    Ok(json!([{"id": "about", "rev": "3-a"}]))
                }
            }
            _ => Ok(json!({"_id": "about", "_rev": "2-a"})),
        }));
        let db = Server::with_backend(backend.clone(), "mock://")
            .database("blog")
            .unwrap();

        assert_eq!(DesignDirectory::push_docs(tmp.path(), &[db]).unwrap(), 2);

        let calls = backend.calls();
        let first = calls[0].body.as_ref().unwrap();
        assert_eq!(first["docs"][0]["_id"], "about");
        assert_eq!(first["docs"][0]["title"], "About us");
        assert_eq!(first["docs"][1]["_id"], "note");
        assert_eq!(first["docs"][1]["couchapp"], json!({}));

        assert_eq!(calls[1].path, "blog/about");
        let retry = calls[2].body.as_ref().unwrap();
        assert_eq!(retry["docs"].as_array().unwrap().len(), 1);
        assert_eq!(retry["docs"][0]["_rev"], "2-a");
    }

    #[test]
    fn test_clone_restores_unexpanded_sources() {
        let tmp = sample_app();
        let design = DesignDirectory::open(tmp.path()).unwrap();
        let original = design.document().unwrap();

        let backend = document_store();
        let db = Server::with_backend(backend, "mock://").database("blog").unwrap();
        design.push(&db).unwrap();

        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("copy");
        let cloned = DesignDirectory::clone_from(&db, design.docid(), &dest).unwrap();

        assert_eq!(cloned.docid(), design.docid());
        assert_eq!(
            fs::read_to_string(dest.join("views/by_date/map.js")).unwrap(),
            "function(doc) {\n  // !code lib/util.js\n  emit(doc.date, null);\n}"
        );
        assert_eq!(fs::read_to_string(dest.join("lib/util.js")).unwrap(), "function util() {}");
        let meta: Value =
            serde_json::from_str(&fs::read_to_string(dest.join("couchapp.json")).unwrap()).unwrap();
        assert_eq!(meta, json!({"name": "blog"}));

        assert_eq!(cloned.document().unwrap(), original);
    }

    #[test]
    fn test_clone_writes_members_missing_from_manifest() {
        let backend = Arc::new(MockBackend::new(|_| {
            Ok(json!({
                "_id": "_design/legacy",
                "_rev": "5-x",
                "views": {"all": {"map": "function(doc) { emit(null, 1); }"}},
                "shows": {"page": "function() {}"},
                "rewrites": [{"from": "/", "to": "index.html"}],
                "options": {"local_seq": true, "name": "legacy"}
            }))
        }));
        let db = Server::with_backend(backend, "mock://").database("blog").unwrap();
        let out = tempfile::tempdir().unwrap();

        DesignDirectory::clone_from(&db, "_design/legacy", out.path()).unwrap();

        let read = |rel: &str| fs::read_to_string(out.path().join(rel)).unwrap();
        assert_eq!(read("views/all/map.js"), "function(doc) { emit(null, 1); }");
        assert_eq!(read("shows/page.js"), "function() {}");
        assert_eq!(read("rewrites.json"), "[{\"from\":\"/\",\"to\":\"index.html\"}]");
        assert_eq!(read("options/local_seq.json"), "true");
        assert_eq!(read("options/name"), "legacy");
        assert_eq!(read("_id"), "_design/legacy");
    }
}

//! `!code` and `!json` directives in design document functions.
//!
//! ```text
//! function(doc) {
//!   // !code lib/md5.js
//!   // !json settings.gravatar
//!   emit(hex_md5(doc.email), settings.gravatar.size);
//! }
//! ```
//!
//! `!code <glob>` is replaced by the contents of every matching file,
//! resolved against the design directory. Included files may contain
//! `!code` directives of their own.
//!
//! `!json <dotted.path>` pulls a member of the design document into the
//! function as a `var`; `!json _attachments/<glob>` does the same with
//! files from the `_attachments` directory.

use crate::config::DEFAULT_MAX_INCLUDE_DEPTH;
use crate::error::{CouchError, Result};
use crate::hash::sha256;
use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

fn code_directive() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(//|#) ?!code (.*)").expect("valid regex"))
}

fn json_directive() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(//|#) ?!json (.*)").expect("valid regex"))
}

fn directive_target<'t>(caps: &Captures<'t>) -> &'t str {
    caps.get(2).map_or("", |m| m.as_str()).trim()
}

/// Expands directives relative to one design directory.
#[derive(Debug, Clone)]
pub struct MacroExpander {
    base_dir: PathBuf,
    max_depth: usize,
}

impl MacroExpander {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        MacroExpander {
            base_dir: normalize_base(base_dir.into()),
            max_depth: DEFAULT_MAX_INCLUDE_DEPTH,
        }
    }

    /// Limit how deeply `!code` includes may nest.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Replace every `!code` directive with the files it names.
    pub fn expand_code(&self, source: &str) -> Result<String> {
        self.expand_code_at(source, 0)
    }

    fn expand_code_at(&self, source: &str, depth: usize) -> Result<String> {
        let mut out = String::with_capacity(source.len());
        let mut last = 0;
        for caps in code_directive().captures_iter(source) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&source[last..whole.start()]);
            out.push_str(&self.include_code(directive_target(&caps), depth)?);
            last = whole.end();
        }
        out.push_str(&source[last..]);
        Ok(out)
    }

    fn include_code(&self, pattern: &str, depth: usize) -> Result<String> {
        let mut library = String::new();
        for path in self.glob(pattern)? {
            log::debug!("process code macro: {}", path.display());
            let mut content = std::fs::read_to_string(&path)?;
            if content.contains("!code") {
                if depth + 1 >= self.max_depth {
                    return Err(CouchError::IncludeDepthExceeded {
                        pattern: pattern.to_string(),
                        limit: self.max_depth,
                    });
                }
                content = self.expand_code_at(&content, depth + 1)?;
            }
            library.push_str(&content);
        }
        Ok(library)
    }

    /// Matching files in sorted order. No match is an error.
    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let base = glob::Pattern::escape(&self.base_dir.to_string_lossy());
        let full = format!("{}/{}", base.trim_end_matches('/'), pattern);
        let mut paths = glob::glob(&full)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        paths.retain(|p| p.is_file());
        if paths.is_empty() {
            return Err(CouchError::MissingInclude {
                pattern: pattern.to_string(),
            });
        }
        paths.sort();
        Ok(paths)
    }

    /// Resolve every `!json` directive against `document` and emit the
    /// collected values as `var` declarations at the first directive.
    /// Later directives are removed. Unknown dotted paths are skipped with
    /// a warning; when nothing resolves the source comes back unchanged.
    pub fn expand_json(&self, document: &Value, source: &str) -> Result<String> {
        let mut included = Map::new();
        for caps in json_directive().captures_iter(source) {
            let target = directive_target(&caps);
            if target.starts_with("_attachments") {
                self.include_attachments(target, &mut included)?;
            } else {
                include_member(document, target, &mut included);
            }
        }

        if included.is_empty() {
            return Ok(source.to_string());
        }

        let vars = included
            .iter()
            .map(|(name, value)| format!("var {name} = {};", to_js_literal(value)))
            .collect::<Vec<_>>()
            .join("\n");

        let mut first = true;
        let expanded = json_directive().replace_all(source, |_: &Captures<'_>| {
            if std::mem::take(&mut first) {
                vars.clone()
            } else {
                String::new()
            }
        });
        Ok(expanded.into_owned())
    }

    fn include_attachments(&self, pattern: &str, included: &mut Map<String, Value>) -> Result<()> {
        for path in self.glob(pattern)? {
            log::debug!("process json macro: {}", path.display());
            let text = std::fs::read_to_string(&path)?;
            let value = if path.extension().map_or(false, |ext| ext == "json") {
                serde_json::from_str(&text)?
            } else {
                Value::String(text)
            };

            let relative = path.strip_prefix(&self.base_dir).map_err(|_| {
                CouchError::Configuration(format!(
                    "{} is not below {}",
                    path.display(),
                    self.base_dir.display()
                ))
            })?;
            let segments: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            insert_nested(included, &segments, value);
        }
        Ok(())
    }

    /// `expand_code` then `expand_json` on one function body.
    pub fn expand_function(&self, document: &Value, source: &str) -> Result<String> {
        let code = self.expand_code(source)?;
        self.expand_json(document, &code)
    }

    /// Expand every string body in `functions` in place. Each changed body is
    /// recorded in `digests` as `sha256(expanded) -> original`.
    pub fn apply_to_function_map(
        &self,
        document: &Value,
        functions: &mut Map<String, Value>,
        digests: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        for (name, body) in functions.iter_mut() {
            let Value::String(source) = body else {
                continue;
            };
            log::debug!("process function: {name}");

            let expanded =
                self.expand_function(document, source)
                    .map_err(|e| CouchError::MacroExpansion {
                        function: name.clone(),
                        source: Box::new(e),
                    })?;
            if expanded != *source {
                let digest = sha256(&expanded);
                let original = std::mem::replace(source, expanded);
                digests.insert(digest, original);
            }
        }
        Ok(())
    }
}

/// Canonical form of the base directory, so glob results share its prefix.
/// Paths that cannot be resolved lose their `.` components instead.
fn normalize_base(base: PathBuf) -> PathBuf {
    if let Ok(canonical) = base.canonicalize() {
        return canonical;
    }
    let cleaned: PathBuf = base
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    if cleaned.as_os_str().is_empty() {
        base
    } else {
        cleaned
    }
}

/// Look up a dotted path in `document`. Found values are nested into
/// `included` under the same path.
fn include_member(document: &Value, reference: &str, included: &mut Map<String, Value>) {
    log::debug!("process json macro: {reference}");
    let segments: Vec<String> = reference.split('.').map(str::to_string).collect();

    let mut node = document;
    for segment in &segments {
        match node.get(segment.as_str()) {
            Some(child) => node = child,
            None => {
                log::warn!("process json macro: unknown json source: {reference}");
                return;
            }
        }
    }
    insert_nested(included, &segments, node.clone());
}

fn insert_nested(target: &mut Map<String, Value>, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = target;
    for segment in parents {
        let entry = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(map) = entry else {
            return;
        };
        current = map;
    }
    current.insert(last.clone(), value);
}

/// JSON with `", "` and `": "` separators.
struct SpacedFormatter;

impl serde_json::ser::Formatter for SpacedFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }
}

fn to_js_literal(value: &Value) -> String {
    let mut buf = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, SpacedFormatter);
    match value.serialize(&mut serializer) {
        Ok(()) => String::from_utf8_lossy(&buf).into_owned(),
        // Writing into a Vec cannot fail
        Err(_) => value.to_string(),
    }
}

/// Expand `!code` directives in `source`, resolving files under `base_dir`.
pub fn expand_code(source: &str, base_dir: &Path) -> Result<String> {
    MacroExpander::new(base_dir).expand_code(source)
}

/// Expand `!json` directives in `source` against `document`.
pub fn expand_json(document: &Value, source: &str, base_dir: &Path) -> Result<String> {
    MacroExpander::new(base_dir).expand_json(document, source)
}

/// Expand every function body of `functions` in place.
pub fn apply_to_function_map(
    document: &Value,
    functions: &mut Map<String, Value>,
    base_dir: &Path,
    digests: &mut BTreeMap<String, String>,
) -> Result<()> {
    MacroExpander::new(base_dir).apply_to_function_map(document, functions, digests)
}

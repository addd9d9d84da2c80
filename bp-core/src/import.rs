//! Import resolution and the per-section document merge (§4.2).
//!
//! Grounded on the teacher's `cargo_path_deps::resolve_cargo_path_dependency_graph`:
//! a visited-set keyed by canonicalized path short-circuits re-visits instead
//! of erroring (cycles and diamonds are both tolerated), and each import's own
//! imports are resolved depth-first before the import itself is folded into
//! its parent, the same order `resolve_entry_manifest` walks path dependencies.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml_ng::{Mapping, Value};
use tracing::{debug, info};

use crate::error::{DslParsingFormatError, DslParsingLogicError};
use crate::options::ParseOptions;
use crate::version::Version;
use crate::yaml;

/// Sections merged by straight union of a map keyed by name; a key present
/// in more than one contributing document is an error regardless of DSL
/// version.
const NAME_KEYED_SECTIONS: &[&str] = &[
    "node_types",
    "relationships",
    "data_types",
    "policy_types",
    "policy_triggers",
    "plugins",
    "workflows",
    "dsl_definitions",
    "policies",
    "capabilities",
];

/// Sections that require `tosca_definitions_version >= 1.3.0` to appear in an
/// import at all; below that version any occurrence in an import is a
/// `non-mergeable field` error, and at or above it they union like
/// [`NAME_KEYED_SECTIONS`].
const MERGEABLE_SECTIONS: &[&str] = &["inputs", "node_templates", "outputs", "groups"];

/// Sections where the imported value is only adopted when the accumulating
/// document does not already have one; first writer (main, then earliest
/// import) wins.
const SINGLETON_SECTIONS: &[&str] = &["description", "tosca_definitions_version", "deployment_settings"];

struct Loader<'a> {
    options: &'a ParseOptions,
    visited: HashSet<PathBuf>,
    version: Option<Version>,
}

/// Load `root_text` (from `root_origin`, used for diagnostics) and fold in
/// every transitively imported document, honoring the per-section merge
/// rules. `root_dir` anchors relative imports declared directly in the root
/// document.
pub fn load_merged_document(
    root_text: &str,
    root_origin: &str,
    root_dir: Option<&Path>,
    options: &ParseOptions,
) -> crate::error::Result<Value> {
    let mut root = yaml::load_str(root_text, root_origin)?;
    let root_map = root
        .as_mapping_mut()
        .ok_or_else(|| DslParsingFormatError::Malformed {
            breadcrumb: crate::error::Breadcrumb::root(),
            message: "document root must be a mapping".to_string(),
        })?;

    let mut loader = Loader {
        options,
        visited: HashSet::new(),
        version: None,
    };
    loader.version = extract_version(root_map, options)?;

    let imports = take_imports(root_map);
    loader.merge_imports(root_map, &imports, root_dir, 0)?;
    root_map.remove(&Value::String("imports".to_string()));

    info!(
        origin = %root_origin,
        imports_visited = loader.visited.len(),
        "Merged blueprint document"
    );
    Ok(root)
}

impl Loader<'_> {
    fn merge_imports(
        &mut self,
        accumulator: &mut Mapping,
        imports: &[String],
        importer_dir: Option<&Path>,
        depth: usize,
    ) -> crate::error::Result<()> {
        if depth > self.options.import_depth_limit {
            return Err(DslParsingLogicError::ImportDepthExceeded {
                limit: self.options.import_depth_limit,
            }
            .into());
        }

        for raw_uri in imports {
            let resolved = resolve_import_uri(raw_uri, importer_dir, self.options.resources_base_path.as_deref())?;
            let canonical = resolved.canonicalize().unwrap_or_else(|_| resolved.clone());
            if !self.visited.insert(canonical) {
                debug!(uri = %raw_uri, depth, "Skipping already-visited import");
                continue;
            }
            debug!(uri = %raw_uri, depth, "Resolving import");

            let text = fs::read_to_string(&resolved).map_err(|e| DslParsingFormatError::ImportUnreadable {
                uri: raw_uri.clone(),
                detail: e.to_string(),
            })?;
            let mut imported = yaml::load_str(&text, raw_uri)?;
            let imported_map = imported
                .as_mapping_mut()
                .ok_or_else(|| DslParsingFormatError::Malformed {
                    breadcrumb: crate::error::Breadcrumb::root(),
                    message: format!("import {raw_uri} did not resolve to a mapping"),
                })?;

            let nested_imports = take_imports(imported_map);
            let nested_dir = resolved.parent().map(Path::to_path_buf);
            self.merge_imports(imported_map, &nested_imports, nested_dir.as_deref(), depth + 1)?;

            self.merge_sections(accumulator, imported_map, raw_uri)?;
        }

        Ok(())
    }

    fn merge_sections(&self, into: &mut Mapping, from: &Mapping, uri: &str) -> crate::error::Result<()> {
        for section in SINGLETON_SECTIONS {
            let key = Value::String((*section).to_string());
            if !into.contains_key(&key) {
                if let Some(v) = from.get(&key) {
                    into.insert(key, v.clone());
                }
            }
        }

        for section in NAME_KEYED_SECTIONS {
            self.union_section(into, from, section, uri)?;
        }

        let permits_mergeable = self
            .version
            .map(|v| v.at_least(crate::version::MERGEABLE_SECTIONS_MIN_VERSION))
            .unwrap_or(!self.options.validate_version);

        for section in MERGEABLE_SECTIONS {
            let key = Value::String((*section).to_string());
            let present_in_import = from
                .get(&key)
                .map(|v| !matches!(v, Value::Mapping(m) if m.is_empty()))
                .unwrap_or(false);

            if !present_in_import {
                continue;
            }

            if !permits_mergeable {
                return Err(DslParsingLogicError::NonMergeableField {
                    field: (*section).to_string(),
                    uri: uri.to_string(),
                }
                .into());
            }

            self.union_section(into, from, section, uri)?;
        }

        Ok(())
    }

    fn union_section(&self, into: &mut Mapping, from: &Mapping, section: &str, uri: &str) -> crate::error::Result<()> {
        let key = Value::String(section.to_string());
        let Some(Value::Mapping(source_map)) = from.get(&key) else {
            return Ok(());
        };

        if !into.contains_key(&key) {
            into.insert(key.clone(), Value::Mapping(Mapping::new()));
        }
        let Some(Value::Mapping(target_map)) = into.get_mut(&key) else {
            return Err(DslParsingFormatError::Malformed {
                breadcrumb: crate::error::Breadcrumb::from(section),
                message: "expected a mapping".to_string(),
            }
            .into());
        };

        for (k, v) in source_map {
            if target_map.contains_key(k) {
                return Err(DslParsingLogicError::DuplicateKey {
                    section: section.to_string(),
                    key: yaml::as_str(k).unwrap_or("<non-string-key>").to_string(),
                    uri: uri.to_string(),
                }
                .into());
            }
            target_map.insert(k.clone(), v.clone());
        }

        Ok(())
    }
}

fn take_imports(map: &mut Mapping) -> Vec<String> {
    let Some(Value::Sequence(seq)) = map.get(&Value::String("imports".to_string())) else {
        return Vec::new();
    };
    seq.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()
}

fn extract_version(map: &Mapping, options: &ParseOptions) -> crate::error::Result<Option<Version>> {
    match yaml::get(map, "tosca_definitions_version").and_then(Value::as_str) {
        Some(token) => Ok(Some(Version::parse(token)?)),
        None if options.validate_version => Err(DslParsingFormatError::Malformed {
            breadcrumb: crate::error::Breadcrumb::root(),
            message: "missing required field 'tosca_definitions_version'".to_string(),
        }
        .into()),
        None => Ok(None),
    }
}

/// Resolve one import URI against its importer's directory and the
/// configured resources base path, in the order: absolute filesystem path >
/// `file://` URI > relative to the importing document > relative to
/// `resources_base_path`.
pub fn resolve_import_uri(
    raw: &str,
    importer_dir: Option<&Path>,
    resources_base_path: Option<&Path>,
) -> Result<PathBuf, DslParsingFormatError> {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        return Ok(candidate.to_path_buf());
    }

    if raw.starts_with("file://") {
        return resolve_file_uri(raw);
    }

    if let Some(dir) = importer_dir {
        let joined = dir.join(raw);
        if joined.exists() {
            return Ok(joined);
        }
    }

    if let Some(base) = resources_base_path {
        let joined = base.join(raw);
        if joined.exists() {
            return Ok(joined);
        }
    }

    if let Some(dir) = importer_dir {
        return Ok(dir.join(raw));
    }

    Err(DslParsingFormatError::ImportUnreadable {
        uri: raw.to_string(),
        detail: "no importer directory or resources base path available to resolve a relative import".to_string(),
    })
}

fn resolve_file_uri(raw: &str) -> Result<PathBuf, DslParsingFormatError> {
    let rest = &raw["file://".len()..];
    if !rest.starts_with('/') {
        // Everything up to the next '/' is the authority; cloudify-common
        // only supports the empty-authority form (`file:///abs/path`).
        let authority_end = rest.find('/').unwrap_or(rest.len());
        return Err(DslParsingFormatError::UnsupportedImportUri {
            uri: raw.to_string(),
            detail: format!("non-empty authority '{}' is not supported", &rest[..authority_end]),
        });
    }
    Ok(PathBuf::from(percent_decode(rest)))
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

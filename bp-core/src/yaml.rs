//! Thin adapter over `serde_yaml_ng`.
//!
//! `serde_yaml_ng` resolves anchors and aliases (`&a`, `*a`) at the libyaml
//! level before we ever see a [`Value`], but it does not special-case the
//! `<<` merge key — that is a serde-yaml-spec convention layered on top of
//! plain mappings, not a core YAML feature, so nothing resolves it for us.
//! [`resolve_merge_keys`] does that pass explicitly, depth-first, immediately
//! after parsing and before any section merging happens (§4.2).

use serde_yaml_ng::{Mapping, Value};

use crate::error::DslParsingFormatError;

const MERGE_KEY: &str = "<<";

/// Parse `text` (the contents of `origin`, used only for error messages) into
/// a [`Value`] with merge keys already resolved.
pub fn load_str(text: &str, origin: &str) -> Result<Value, DslParsingFormatError> {
    let mut value: Value =
        serde_yaml_ng::from_str(text).map_err(|source| DslParsingFormatError::Yaml {
            path: origin.to_string(),
            source,
        })?;
    resolve_merge_keys(&mut value);
    Ok(value)
}

/// Recursively resolve `<<: *anchor` and `<<: [*a, *b]` merge keys in every
/// mapping reachable from `value`.
///
/// Per the YAML merge-key convention: keys explicitly present in the
/// mapping win over merged ones; when `<<` names a sequence of mappings,
/// earlier entries win over later ones.
pub fn resolve_merge_keys(value: &mut Value) {
    match value {
        Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                resolve_merge_keys(v);
            }
            merge_into_self(map);
        }
        Value::Sequence(seq) => {
            for item in seq.iter_mut() {
                resolve_merge_keys(item);
            }
        }
        _ => {}
    }
}

fn merge_into_self(map: &mut Mapping) {
    let merge_key = Value::String(MERGE_KEY.to_string());
    let Some(merge_value) = map.remove(&merge_key) else {
        return;
    };

    let sources: Vec<Mapping> = match merge_value {
        Value::Mapping(m) => vec![m],
        Value::Sequence(seq) => seq
            .into_iter()
            .filter_map(|v| match v {
                Value::Mapping(m) => Some(m),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    // Earlier sources win over later ones; explicit keys already in `map`
    // win over all merged ones, so we insert only missing keys and do it in
    // reverse so the first source's inserts are not shadowed by later ones.
    for source in sources.into_iter().rev() {
        for (k, v) in source {
            if !map.contains_key(&k) {
                map.insert(k, v);
            }
        }
    }
}

/// Read a string-keyed value out of a mapping without allocating a [`Value`]
/// at each call site.
pub fn get<'a>(map: &'a Mapping, key: &str) -> Option<&'a Value> {
    map.get(&Value::String(key.to_string()))
}

pub fn as_mapping(value: &Value) -> Option<&Mapping> {
    value.as_mapping()
}

pub fn as_str(value: &Value) -> Option<&str> {
    value.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_single_anchor_merge() {
        let text = "
base: &base
  a: 1
  b: 2
leaf:
  <<: *base
  b: 3
";
        let value = load_str(text, "<test>").unwrap();
        let leaf = get(value.as_mapping().unwrap(), "leaf")
            .unwrap()
            .as_mapping()
            .unwrap();
        assert_eq!(get(leaf, "a").unwrap().as_i64(), Some(1));
        assert_eq!(get(leaf, "b").unwrap().as_i64(), Some(3));
    }

    #[test]
    fn resolves_sequence_merge_with_first_source_precedence() {
        let text = "
a: &a
  x: 1
b: &b
  x: 2
  y: 2
leaf:
  <<: [*a, *b]
";
        let value = load_str(text, "<test>").unwrap();
        let leaf = get(value.as_mapping().unwrap(), "leaf")
            .unwrap()
            .as_mapping()
            .unwrap();
        assert_eq!(get(leaf, "x").unwrap().as_i64(), Some(1));
        assert_eq!(get(leaf, "y").unwrap().as_i64(), Some(2));
    }

    #[test]
    fn leaves_documents_without_merge_keys_untouched() {
        let value = load_str("a: 1\nb: 2\n", "<test>").unwrap();
        let map = value.as_mapping().unwrap();
        assert_eq!(get(map, "a").unwrap().as_i64(), Some(1));
    }

    #[test]
    fn reports_yaml_parse_errors_with_origin() {
        let err = load_str("a: [1, 2\n", "blueprint.yaml").unwrap_err();
        assert!(err.to_string().contains("blueprint.yaml"));
    }
}

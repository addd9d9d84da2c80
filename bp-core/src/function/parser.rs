//! Walks a raw YAML value and replaces function literals with [`Expr`] nodes,
//! enforcing the arity/shape rules and version gates of §4.6.

use serde_yaml_ng::Value;

use crate::error::{Breadcrumb, FunctionValidationError};
use crate::function::ast::{Expr, NodeRef, INTRINSIC_FUNCTION_NAMES};
use crate::version::{self, Version};

/// Parses raw YAML `value` at `breadcrumb` into an [`Expr`] tree, checking
/// function shape and the caller's declared DSL `version` against each
/// function's minimum.
pub fn parse(value: &Value, breadcrumb: &Breadcrumb, version: Version) -> crate::error::Result<Expr> {
    if let Some(name) = sole_intrinsic_key(value) {
        let map = value.as_mapping().expect("sole_intrinsic_key only matches mappings");
        let arg = map.get(&Value::String(name.to_string())).expect("key just matched");
        return parse_function(name, arg, breadcrumb, version);
    }

    match value {
        Value::Sequence(seq) => {
            let items = seq
                .iter()
                .enumerate()
                .map(|(i, v)| parse(v, &breadcrumb.join_index(i), version))
                .collect::<crate::error::Result<Vec<_>>>()?;
            Ok(Expr::List(items))
        }
        Value::Mapping(map) => {
            let mut entries = Vec::with_capacity(map.len());
            for (k, v) in map {
                let key = k.as_str().unwrap_or_default().to_string();
                let parsed = parse(v, &breadcrumb.join(key.clone()), version)?;
                entries.push((key, parsed));
            }
            Ok(Expr::Map(entries))
        }
        other => Ok(Expr::Literal(other.clone())),
    }
}

/// If `value` is a mapping with exactly one key and that key names an
/// intrinsic function, return the key.
fn sole_intrinsic_key(value: &Value) -> Option<&str> {
    let map = value.as_mapping()?;
    if map.len() != 1 {
        return None;
    }
    let (k, _) = map.iter().next()?;
    let name = k.as_str()?;
    INTRINSIC_FUNCTION_NAMES.contains(&name).then_some(name)
}

fn parse_function(name: &str, arg: &Value, breadcrumb: &Breadcrumb, version: Version) -> crate::error::Result<Expr> {
    let breadcrumb = breadcrumb.clone();
    match name {
        "get_input" => Ok(Expr::GetInput {
            name: Box::new(parse(arg, &breadcrumb.join("get_input"), version)?),
            breadcrumb,
        }),

        "get_property" => {
            let (node_ref, path) = parse_node_ref_and_path(name, arg, &breadcrumb, version, 1)?;
            Ok(Expr::GetProperty {
                breadcrumb,
                node_ref,
                path,
            })
        }

        "get_attribute" => {
            let (node_ref, path) = parse_node_ref_and_path(name, arg, &breadcrumb, version, 1)?;
            Ok(Expr::GetAttribute {
                breadcrumb,
                node_ref,
                path,
            })
        }

        "get_secret" => parse_get_secret(arg, breadcrumb, version),

        "get_capability" => {
            let items = parse_scalar_list(name, arg, &breadcrumb, version, 2)?;
            Ok(Expr::GetCapability {
                breadcrumb,
                path: items,
            })
        }

        "get_group_capability" => {
            let items = parse_scalar_list(name, arg, &breadcrumb, version, 2)?;
            Ok(Expr::GetGroupCapability {
                breadcrumb,
                path: items,
            })
        }

        "concat" => {
            if !version.at_least(version::CONCAT_MIN_VERSION) {
                return Err(FunctionValidationError::VersionGated {
                    breadcrumb,
                    function: "concat",
                    required: version::CONCAT_MIN_VERSION.to_string(),
                }
                .into());
            }
            let seq = arg.as_sequence().ok_or_else(|| FunctionValidationError::BadArity {
                breadcrumb: breadcrumb.clone(),
                function: "concat",
                expected: "a list",
                actual: describe(arg),
            })?;
            let items = seq
                .iter()
                .enumerate()
                .map(|(i, v)| parse(v, &breadcrumb.join_index(i), version))
                .collect::<crate::error::Result<Vec<_>>>()?;
            Ok(Expr::Concat { breadcrumb, items })
        }

        "merge" => {
            if !version.at_least(version::MERGE_MIN_VERSION) {
                return Err(FunctionValidationError::VersionGated {
                    breadcrumb,
                    function: "merge",
                    required: version::MERGE_MIN_VERSION.to_string(),
                }
                .into());
            }
            let seq = arg.as_sequence().ok_or_else(|| FunctionValidationError::BadArity {
                breadcrumb: breadcrumb.clone(),
                function: "merge",
                expected: "a list of maps",
                actual: describe(arg),
            })?;
            let items = seq
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    let item_breadcrumb = breadcrumb.join_index(i);
                    if v.as_mapping().is_none() && sole_intrinsic_key(v).is_none() {
                        return Err(FunctionValidationError::BadArity {
                            breadcrumb: item_breadcrumb.clone(),
                            function: "merge",
                            expected: "a list of maps",
                            actual: describe(v),
                        }
                        .into());
                    }
                    parse(v, &item_breadcrumb, version)
                })
                .collect::<crate::error::Result<Vec<_>>>()?;
            Ok(Expr::Merge { breadcrumb, items })
        }

        other => unreachable!("sole_intrinsic_key only yields known names, got {other}"),
    }
}

fn parse_node_ref_and_path(
    function: &'static str,
    arg: &Value,
    breadcrumb: &Breadcrumb,
    version: Version,
    min_len: usize,
) -> crate::error::Result<(NodeRef, Vec<Expr>)> {
    let seq = arg.as_sequence().ok_or_else(|| FunctionValidationError::BadArity {
        breadcrumb: breadcrumb.clone(),
        function,
        expected: "a list of [node_ref, path...]",
        actual: describe(arg),
    })?;
    if seq.len() < min_len + 1 {
        return Err(FunctionValidationError::BadArity {
            breadcrumb: breadcrumb.clone(),
            function,
            expected: "at least 2 elements",
            actual: format!("{} elements", seq.len()),
        }
        .into());
    }

    let node_ref_token = seq[0].as_str().ok_or_else(|| FunctionValidationError::IllegalNodeRef {
        breadcrumb: breadcrumb.clone(),
        node_ref: describe(&seq[0]),
    })?;
    let node_ref = NodeRef::parse(node_ref_token);

    let path = seq[1..]
        .iter()
        .enumerate()
        .map(|(i, v)| parse(v, &breadcrumb.join_index(i + 1), version))
        .collect::<crate::error::Result<Vec<_>>>()?;

    Ok((node_ref, path))
}

fn parse_get_secret(arg: &Value, breadcrumb: Breadcrumb, version: Version) -> crate::error::Result<Expr> {
    if let Some(scalar) = arg.as_str() {
        return Ok(Expr::GetSecret {
            id: Box::new(Expr::Literal(Value::String(scalar.to_string()))),
            path: Vec::new(),
            breadcrumb,
        });
    }

    let seq = arg.as_sequence().ok_or_else(|| FunctionValidationError::BadArity {
        breadcrumb: breadcrumb.clone(),
        function: "get_secret",
        expected: "a scalar or a list of at least 2 elements",
        actual: describe(arg),
    })?;
    if seq.len() < 2 {
        return Err(FunctionValidationError::BadArity {
            breadcrumb,
            function: "get_secret",
            expected: "at least 2 elements",
            actual: format!("{} elements", seq.len()),
        }
        .into());
    }

    let id = Box::new(parse(&seq[0], &breadcrumb.join_index(0), version)?);
    let path = seq[1..]
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let step_breadcrumb = breadcrumb.join_index(i + 1);
            if is_structured_literal(v) {
                return Err(FunctionValidationError::NonScalarSecretPathElement {
                    breadcrumb: step_breadcrumb,
                }
                .into());
            }
            parse(v, &step_breadcrumb, version)
        })
        .collect::<crate::error::Result<Vec<_>>>()?;

    Ok(Expr::GetSecret { breadcrumb, id, path })
}

fn parse_scalar_list(
    function: &'static str,
    arg: &Value,
    breadcrumb: &Breadcrumb,
    version: Version,
    min_len: usize,
) -> crate::error::Result<Vec<Expr>> {
    let seq = arg.as_sequence().ok_or_else(|| FunctionValidationError::BadArity {
        breadcrumb: breadcrumb.clone(),
        function,
        expected: "a list of scalars",
        actual: describe(arg),
    })?;
    if seq.len() < min_len {
        return Err(FunctionValidationError::BadArity {
            breadcrumb: breadcrumb.clone(),
            function,
            expected: "at least 2 elements",
            actual: format!("{} elements", seq.len()),
        }
        .into());
    }
    seq.iter()
        .enumerate()
        .map(|(i, v)| parse(v, &breadcrumb.join_index(i), version))
        .collect()
}

fn is_structured_literal(value: &Value) -> bool {
    sole_intrinsic_key(value).is_none() && matches!(value, Value::Mapping(_) | Value::Sequence(_))
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "a boolean".to_string(),
        Value::Number(_) => "a number".to_string(),
        Value::String(_) => "a string".to_string(),
        Value::Sequence(s) => format!("{} elements", s.len()),
        Value::Mapping(_) => "a mapping".to_string(),
        Value::Tagged(t) => describe(&t.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;

    fn v1_3() -> Version {
        Version::new(1, 3, 0)
    }

    #[test]
    fn parses_plain_structure_without_functions() {
        let value: Value = serde_yaml_ng::from_str("a: [1, 2, hi]").unwrap();
        let expr = parse(&value, &Breadcrumb::root(), v1_3()).unwrap();
        assert!(matches!(expr, Expr::Map(_)));
    }

    #[test]
    fn parses_get_input_with_scalar_name() {
        let value: Value = serde_yaml_ng::from_str("get_input: port").unwrap();
        let expr = parse(&value, &Breadcrumb::root(), v1_3()).unwrap();
        match expr {
            Expr::GetInput { name, .. } => {
                assert_eq!(*name, Expr::Literal(Value::String("port".to_string())));
            }
            _ => panic!("expected GetInput"),
        }
    }

    #[test]
    fn parses_nested_get_input_chain() {
        let value: Value = serde_yaml_ng::from_str("get_input: {get_input: which}").unwrap();
        let expr = parse(&value, &Breadcrumb::root(), v1_3()).unwrap();
        match expr {
            Expr::GetInput { name, .. } => assert!(matches!(*name, Expr::GetInput { .. })),
            _ => panic!("expected GetInput"),
        }
    }

    #[test]
    fn parses_get_property_with_self_reference() {
        let value: Value = serde_yaml_ng::from_str("get_property: [SELF, a, b]").unwrap();
        let expr = parse(&value, &Breadcrumb::root(), v1_3()).unwrap();
        match expr {
            Expr::GetProperty { node_ref, path, .. } => {
                assert_eq!(node_ref, NodeRef::SelfRef);
                assert_eq!(path.len(), 2);
            }
            _ => panic!("expected GetProperty"),
        }
    }

    #[test]
    fn rejects_get_property_with_too_few_elements() {
        let value: Value = serde_yaml_ng::from_str("get_property: [SELF]").unwrap();
        let err = parse(&value, &Breadcrumb::root(), v1_3()).unwrap_err();
        assert!(err.to_string().contains("2 elements"));
    }

    #[test]
    fn parses_get_secret_scalar_form() {
        let value: Value = serde_yaml_ng::from_str("get_secret: db_password").unwrap();
        let expr = parse(&value, &Breadcrumb::root(), v1_3()).unwrap();
        assert!(matches!(expr, Expr::GetSecret { path, .. } if path.is_empty()));
    }

    #[test]
    fn rejects_get_secret_empty_list() {
        let value: Value = serde_yaml_ng::from_str("get_secret: []").unwrap();
        let err = parse(&value, &Breadcrumb::root(), v1_3()).unwrap_err();
        assert!(err.to_string().contains("2 elements"));
    }

    #[test]
    fn rejects_get_secret_structured_path_element() {
        let value: Value = serde_yaml_ng::from_str("get_secret: [id, {a: 1}]").unwrap();
        let err = parse(&value, &Breadcrumb::root(), v1_3()).unwrap_err();
        assert!(err.to_string().contains("scalar"));
    }

    #[test]
    fn allows_nested_function_as_get_secret_path_element() {
        let value: Value = serde_yaml_ng::from_str("get_property: [SELF, {get_secret: id}]").unwrap();
        let expr = parse(&value, &Breadcrumb::root(), v1_3()).unwrap();
        match expr {
            Expr::GetProperty { path, .. } => assert!(matches!(path[0], Expr::GetSecret { .. })),
            _ => panic!("expected GetProperty"),
        }
    }

    #[test]
    fn merge_is_version_gated() {
        let value: Value = serde_yaml_ng::from_str("merge: [{a: 1}, {b: 2}]").unwrap();
        let err = parse(&value, &Breadcrumb::root(), Version::new(1, 2, 0)).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::FunctionValidation(FunctionValidationError::VersionGated { .. })
        ));
        let expr = parse(&value, &Breadcrumb::root(), Version::new(1, 3, 0)).unwrap();
        assert!(matches!(expr, Expr::Merge { .. }));
    }

    #[test]
    fn concat_requires_a_list() {
        let value: Value = serde_yaml_ng::from_str("concat: hi").unwrap();
        let err = parse(&value, &Breadcrumb::root(), v1_3()).unwrap_err();
        assert!(err.to_string().contains("a list"));
    }
}

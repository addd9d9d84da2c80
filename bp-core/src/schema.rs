//! Property schema application and built-in data type coercion (§4.4).
//!
//! Applies a merged [`PropertyDef`] schema (produced by [`crate::derive`])
//! to a template or operation's supplied property values: fills in defaults,
//! enforces `required`, and coerces scalars to their declared kind. Values
//! that are still unresolved intrinsic functions are passed through
//! untouched — their shape is checked once [`crate::function::eval`]
//! resolves them.

use serde_yaml_ng::Value;

use crate::derive::DerivedDataType;
use crate::error::{Breadcrumb, DslParsingFormatError};
use crate::function::ast::Expr;
use crate::model::{lookup, OrderedMap, PropertyDef};

/// Applies `schema` to `values`, returning the fully defaulted and
/// type-coerced property map. Properties present in `values` but not named
/// by `schema` pass through unchanged (an escape hatch for node types that
/// declare no property schema at all).
pub fn apply_property_schema(
    schema: &OrderedMap<PropertyDef>,
    values: &[(String, Expr)],
    data_types: &[(String, DerivedDataType)],
    breadcrumb: &Breadcrumb,
) -> crate::error::Result<OrderedMap<Expr>> {
    let mut result = Vec::new();
    for (name, def) in schema {
        let prop_breadcrumb = breadcrumb.join(name.clone());
        let supplied = lookup(values, name).cloned();
        let value = match supplied.or_else(|| def.default.clone()) {
            Some(value) => value,
            None => {
                if def.required {
                    return Err(DslParsingFormatError::MissingRequiredProperty {
                        breadcrumb: prop_breadcrumb,
                        property: name.clone(),
                    }
                    .into());
                }
                continue;
            }
        };
        let coerced = match def.kind.as_deref() {
            Some(kind) => coerce(kind, value, name, data_types, &prop_breadcrumb)?,
            None => value,
        };
        result.push((name.clone(), coerced));
    }
    for (name, value) in values {
        if lookup(schema, name).is_none() {
            result.push((name.clone(), value.clone()));
        }
    }
    Ok(result)
}

fn coerce(
    kind: &str,
    expr: Expr,
    property: &str,
    data_types: &[(String, DerivedDataType)],
    breadcrumb: &Breadcrumb,
) -> crate::error::Result<Expr> {
    if expr.is_function() {
        return Ok(expr);
    }
    match kind {
        "string" => Ok(expr),
        "boolean" => match &expr {
            Expr::Literal(v) => Ok(Expr::Literal(coerce_boolean(v, property, breadcrumb)?)),
            _ => Err(mismatch(property, kind, breadcrumb)),
        },
        "integer" => match &expr {
            Expr::Literal(v) => Ok(Expr::Literal(coerce_integer(v, property, breadcrumb)?)),
            _ => Err(mismatch(property, kind, breadcrumb)),
        },
        "float" => match &expr {
            Expr::Literal(v) => Ok(Expr::Literal(coerce_float(v, property, breadcrumb)?)),
            _ => Err(mismatch(property, kind, breadcrumb)),
        },
        "list" => match &expr {
            Expr::List(_) => Ok(expr),
            Expr::Literal(Value::Sequence(_)) => Ok(expr),
            _ => Err(mismatch(property, kind, breadcrumb)),
        },
        "dict" => match &expr {
            Expr::Map(_) => Ok(expr),
            Expr::Literal(Value::Mapping(_)) => Ok(expr),
            _ => Err(mismatch(property, kind, breadcrumb)),
        },
        "regex" => match &expr {
            Expr::Literal(Value::String(_)) => Ok(expr),
            _ => Err(mismatch(property, kind, breadcrumb)),
        },
        other => coerce_data_type(other, expr, property, data_types, breadcrumb),
    }
}

fn coerce_boolean(value: &Value, property: &str, breadcrumb: &Breadcrumb) -> crate::error::Result<Value> {
    match value {
        Value::Bool(b) => Ok(Value::Bool(*b)),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" => Ok(Value::Bool(true)),
            "false" | "no" | "off" => Ok(Value::Bool(false)),
            _ => Err(mismatch(property, "boolean", breadcrumb)),
        },
        _ => Err(mismatch(property, "boolean", breadcrumb)),
    }
}

fn coerce_integer(value: &Value, property: &str, breadcrumb: &Breadcrumb) -> crate::error::Result<Value> {
    value
        .as_i64()
        .map(Value::from)
        .ok_or_else(|| mismatch(property, "integer", breadcrumb))
}

fn coerce_float(value: &Value, property: &str, breadcrumb: &Breadcrumb) -> crate::error::Result<Value> {
    value
        .as_f64()
        .map(Value::from)
        .ok_or_else(|| mismatch(property, "float", breadcrumb))
}

/// Coerces a value declared with a user `data_types` name: the value must be
/// a mapping, and its own fields are recursively defaulted/coerced against
/// that data type's merged property schema.
fn coerce_data_type(
    type_name: &str,
    expr: Expr,
    property: &str,
    data_types: &[(String, DerivedDataType)],
    breadcrumb: &Breadcrumb,
) -> crate::error::Result<Expr> {
    let Some(data_type) = lookup(data_types, type_name) else {
        // Not a built-in and not a declared data type: treated as an opaque
        // kind name with no structural validation, mirroring `string`'s
        // "accepts any scalar" permissiveness for forward compatibility.
        return Ok(expr);
    };
    let entries = match &expr {
        Expr::Map(entries) => entries.clone(),
        Expr::Literal(Value::Mapping(map)) => map
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().unwrap_or_default().to_string(),
                    Expr::Literal(v.clone()),
                )
            })
            .collect(),
        _ => return Err(mismatch(property, type_name, breadcrumb)),
    };
    let resolved = apply_property_schema(&data_type.properties, &entries, data_types, breadcrumb)?;
    Ok(Expr::Map(resolved))
}

fn mismatch(property: &str, expected: &str, breadcrumb: &Breadcrumb) -> crate::error::Error {
    DslParsingFormatError::PropertyTypeMismatch {
        breadcrumb: breadcrumb.clone(),
        property: property.to_string(),
        expected: expected.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(entries: Vec<(&str, PropertyDef)>) -> OrderedMap<PropertyDef> {
        entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    fn prop(kind: &str, default: Option<Value>, required: bool) -> PropertyDef {
        PropertyDef {
            kind: Some(kind.to_string()),
            default: default.map(Expr::Literal),
            description: None,
            required,
        }
    }

    #[test]
    fn fills_in_default_when_property_omitted() {
        let schema = schema(vec![("size", prop("string", Some(Value::from("small")), false))]);
        let result =
            apply_property_schema(&schema, &[], &[], &Breadcrumb::root()).unwrap();
        assert_eq!(
            lookup(&result, "size"),
            Some(&Expr::Literal(Value::from("small")))
        );
    }

    #[test]
    fn missing_required_property_without_default_errors() {
        let schema = schema(vec![("size", prop("string", None, true))]);
        let err = apply_property_schema(&schema, &[], &[], &Breadcrumb::root()).unwrap_err();
        assert!(err.to_string().contains("size"));
    }

    #[test]
    fn coerces_truthy_token_to_boolean() {
        let schema = schema(vec![("enabled", prop("boolean", None, false))]);
        let values: OrderedMap<Expr> = vec![("enabled".to_string(), Expr::Literal(Value::from("Yes")))];
        let result = apply_property_schema(&schema, &values, &[], &Breadcrumb::root()).unwrap();
        assert_eq!(lookup(&result, "enabled"), Some(&Expr::Literal(Value::Bool(true))));
    }

    #[test]
    fn rejects_non_numeric_integer() {
        let schema = schema(vec![("count", prop("integer", None, false))]);
        let values: OrderedMap<Expr> = vec![("count".to_string(), Expr::Literal(Value::from("oops")))];
        let err = apply_property_schema(&schema, &values, &[], &Breadcrumb::root()).unwrap_err();
        assert!(err.to_string().contains("count"));
    }

    #[test]
    fn unresolved_function_value_bypasses_coercion() {
        let schema = schema(vec![("count", prop("integer", None, false))]);
        let values: OrderedMap<Expr> = vec![(
            "count".to_string(),
            Expr::GetInput {
                breadcrumb: Breadcrumb::root(),
                name: Box::new(Expr::Literal(Value::from("n"))),
            },
        )];
        let result = apply_property_schema(&schema, &values, &[], &Breadcrumb::root()).unwrap();
        assert!(matches!(lookup(&result, "count"), Some(Expr::GetInput { .. })));
    }

    #[test]
    fn nested_data_type_applies_its_own_schema() {
        let address_schema = schema(vec![(
            "port",
            prop("integer", Some(Value::from(80)), false),
        )]);
        let data_types: OrderedMap<DerivedDataType> = vec![(
            "address".to_string(),
            DerivedDataType {
                type_hierarchy: vec!["address".to_string()],
                properties: address_schema,
            },
        )];
        let schema = schema(vec![("endpoint", prop("address", None, false))]);
        let values: OrderedMap<Expr> = vec![(
            "endpoint".to_string(),
            Expr::Map(vec![]),
        )];
        let result = apply_property_schema(&schema, &values, &data_types, &Breadcrumb::root()).unwrap();
        match lookup(&result, "endpoint") {
            Some(Expr::Map(entries)) => {
                assert_eq!(lookup(entries, "port"), Some(&Expr::Literal(Value::from(80))));
            }
            other => panic!("expected nested Map, got {other:?}"),
        }
    }
}

//! The intrinsic-function AST (§3, §4.6).
//!
//! A function literal is a mapping with exactly one key drawn from the
//! intrinsic set; [`super::parser`] walks an arbitrary YAML value and
//! replaces every such literal with an [`Expr`] node, leaving everything
//! else as [`Expr::Literal`]/[`Expr::List`]/[`Expr::Map`] so functions can
//! nest inside otherwise-ordinary structure.

use serde_yaml_ng::Value;

use crate::error::Breadcrumb;

/// The resolved target of a `get_property`/`get_attribute` reference.
/// Must be statically resolvable, so unlike the rest of a function's
/// arguments it is never itself an [`Expr`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRef {
    SelfRef,
    Source,
    Target,
    Named(String),
}

impl NodeRef {
    pub fn parse(token: &str) -> Self {
        match token {
            "SELF" => Self::SelfRef,
            "SOURCE" => Self::Source,
            "TARGET" => Self::Target,
            other => Self::Named(other.to_string()),
        }
    }

    pub fn token(&self) -> &str {
        match self {
            Self::SelfRef => "SELF",
            Self::Source => "SOURCE",
            Self::Target => "TARGET",
            Self::Named(id) => id.as_str(),
        }
    }
}

/// A parsed blueprint value: either ordinary structure or one of the eight
/// intrinsic functions, nested arbitrarily.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    List(Vec<Expr>),
    Map(Vec<(String, Expr)>),

    GetInput {
        breadcrumb: Breadcrumb,
        name: Box<Expr>,
    },
    GetProperty {
        breadcrumb: Breadcrumb,
        node_ref: NodeRef,
        path: Vec<Expr>,
    },
    GetAttribute {
        breadcrumb: Breadcrumb,
        node_ref: NodeRef,
        path: Vec<Expr>,
    },
    GetSecret {
        breadcrumb: Breadcrumb,
        id: Box<Expr>,
        path: Vec<Expr>,
    },
    GetCapability {
        breadcrumb: Breadcrumb,
        path: Vec<Expr>,
    },
    GetGroupCapability {
        breadcrumb: Breadcrumb,
        path: Vec<Expr>,
    },
    Concat {
        breadcrumb: Breadcrumb,
        items: Vec<Expr>,
    },
    Merge {
        breadcrumb: Breadcrumb,
        items: Vec<Expr>,
    },
}

impl Expr {
    /// The containment path carried by every function variant, for
    /// diagnostics. `None` for plain structure.
    pub fn breadcrumb(&self) -> Option<&Breadcrumb> {
        match self {
            Expr::Literal(_) | Expr::List(_) | Expr::Map(_) => None,
            Expr::GetInput { breadcrumb, .. }
            | Expr::GetProperty { breadcrumb, .. }
            | Expr::GetAttribute { breadcrumb, .. }
            | Expr::GetSecret { breadcrumb, .. }
            | Expr::GetCapability { breadcrumb, .. }
            | Expr::GetGroupCapability { breadcrumb, .. }
            | Expr::Concat { breadcrumb, .. }
            | Expr::Merge { breadcrumb, .. } => Some(breadcrumb),
        }
    }

    pub fn is_function(&self) -> bool {
        self.breadcrumb().is_some()
    }

    /// Whether this tree has no unresolved intrinsic function anywhere below
    /// it, including inside a `List`/`Map` that isn't itself a function call.
    pub fn is_fully_resolved(&self) -> bool {
        match self {
            Expr::Literal(_) => true,
            Expr::List(items) => items.iter().all(Expr::is_fully_resolved),
            Expr::Map(entries) => entries.iter().all(|(_, v)| v.is_fully_resolved()),
            _ => false,
        }
    }

    /// Collapses this tree to a plain [`Value`] if [`Self::is_fully_resolved`],
    /// `None` if an intrinsic function remains anywhere below it.
    pub fn as_resolved_value(&self) -> Option<Value> {
        self.is_fully_resolved().then(|| self.to_value())
    }

    /// Whether `self` requires node context (`SELF`/`SOURCE`/`TARGET`) that
    /// only exists inside relationship or node-template operation scope.
    pub fn references_node_context(&self) -> bool {
        match self {
            Expr::GetProperty { .. } | Expr::GetAttribute { .. } => true,
            Expr::List(items) | Expr::Concat { items, .. } | Expr::Merge { items, .. } => {
                items.iter().any(Expr::references_node_context)
            }
            Expr::Map(entries) => entries.iter().any(|(_, v)| v.references_node_context()),
            _ => false,
        }
    }

    /// Renders this tree back to plain YAML, for output surfaces that need a
    /// [`Value`] rather than an [`Expr`]. Anything left unresolved is
    /// rewritten to the same single-key mapping shape it was parsed from, so
    /// a partially evaluated payload still round-trips.
    pub fn to_value(&self) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::List(items) => Value::Sequence(items.iter().map(Expr::to_value).collect()),
            Expr::Map(entries) => {
                let mut map = serde_yaml_ng::Mapping::new();
                for (k, v) in entries {
                    map.insert(Value::String(k.clone()), v.to_value());
                }
                Value::Mapping(map)
            }
            Expr::GetInput { name, .. } => function_call("get_input", name.to_value()),
            Expr::GetProperty { node_ref, path, .. } => {
                function_call("get_property", node_ref_and_path(node_ref, path))
            }
            Expr::GetAttribute { node_ref, path, .. } => {
                function_call("get_attribute", node_ref_and_path(node_ref, path))
            }
            Expr::GetSecret { id, path, .. } if path.is_empty() => function_call("get_secret", id.to_value()),
            Expr::GetSecret { id, path, .. } => {
                let mut seq = vec![id.to_value()];
                seq.extend(path.iter().map(Expr::to_value));
                function_call("get_secret", Value::Sequence(seq))
            }
            Expr::GetCapability { path, .. } => {
                function_call("get_capability", Value::Sequence(path.iter().map(Expr::to_value).collect()))
            }
            Expr::GetGroupCapability { path, .. } => {
                function_call("get_group_capability", Value::Sequence(path.iter().map(Expr::to_value).collect()))
            }
            Expr::Concat { items, .. } => function_call("concat", Value::Sequence(items.iter().map(Expr::to_value).collect())),
            Expr::Merge { items, .. } => function_call("merge", Value::Sequence(items.iter().map(Expr::to_value).collect())),
        }
    }
}

fn node_ref_and_path(node_ref: &NodeRef, path: &[Expr]) -> Value {
    let mut seq = vec![Value::String(node_ref.token().to_string())];
    seq.extend(path.iter().map(Expr::to_value));
    Value::Sequence(seq)
}

fn function_call(name: &str, arg: Value) -> Value {
    let mut map = serde_yaml_ng::Mapping::new();
    map.insert(Value::String(name.to_string()), arg);
    Value::Mapping(map)
}

pub const INTRINSIC_FUNCTION_NAMES: &[&str] = &[
    "get_input",
    "get_property",
    "get_attribute",
    "get_secret",
    "get_capability",
    "get_group_capability",
    "concat",
    "merge",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ref_recognizes_reserved_tokens() {
        assert_eq!(NodeRef::parse("SELF"), NodeRef::SelfRef);
        assert_eq!(NodeRef::parse("SOURCE"), NodeRef::Source);
        assert_eq!(NodeRef::parse("TARGET"), NodeRef::Target);
        assert_eq!(NodeRef::parse("vm"), NodeRef::Named("vm".to_string()));
    }

    #[test]
    fn breadcrumb_is_none_for_plain_structure() {
        let expr = Expr::List(vec![Expr::Literal(Value::from(1))]);
        assert!(expr.breadcrumb().is_none());
        assert!(!expr.is_function());
    }

    #[test]
    fn get_attribute_reports_node_context() {
        let expr = Expr::GetAttribute {
            breadcrumb: Breadcrumb::root(),
            node_ref: NodeRef::SelfRef,
            path: vec![Expr::Literal(Value::from("ip"))],
        };
        assert!(expr.references_node_context());
    }

    #[test]
    fn unresolved_get_attribute_round_trips_to_its_source_shape() {
        let expr = Expr::GetAttribute {
            breadcrumb: Breadcrumb::root(),
            node_ref: NodeRef::SelfRef,
            path: vec![Expr::Literal(Value::from("ip"))],
        };
        let rendered = expr.to_value();
        let map = rendered.as_mapping().unwrap();
        let seq = crate::yaml::get(map, "get_attribute").unwrap().as_sequence().unwrap();
        assert_eq!(seq[0].as_str(), Some("SELF"));
        assert_eq!(seq[1].as_str(), Some("ip"));
    }

    #[test]
    fn literal_map_round_trips_through_to_value() {
        let expr = Expr::Map(vec![("a".to_string(), Expr::Literal(Value::from(1)))]);
        let rendered = expr.to_value();
        let map = rendered.as_mapping().unwrap();
        assert_eq!(crate::yaml::get(map, "a").and_then(Value::as_i64), Some(1));
    }
}

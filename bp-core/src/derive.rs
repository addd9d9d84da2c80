//! Type system derivation (§4.3): walks each `derived_from` chain root→leaf,
//! merging property schemas and interfaces field-by-field along the way.

use tracing::debug;

use crate::error::DslParsingLogicError;
use crate::model::{
    index, lookup, Blueprint, InterfaceMap, OperationDef, OrderedMap, PropertyDef,
    RelationshipTemplate,
};

#[derive(Debug, Clone, PartialEq)]
pub struct DerivedNodeType {
    pub type_hierarchy: Vec<String>,
    pub properties: OrderedMap<PropertyDef>,
    pub interfaces: InterfaceMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DerivedRelationshipType {
    pub type_hierarchy: Vec<String>,
    pub properties: OrderedMap<PropertyDef>,
    pub source_interfaces: InterfaceMap,
    pub target_interfaces: InterfaceMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DerivedDataType {
    pub type_hierarchy: Vec<String>,
    pub properties: OrderedMap<PropertyDef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DerivedPolicyType {
    pub type_hierarchy: Vec<String>,
    pub source: Option<String>,
    pub properties: OrderedMap<PropertyDef>,
}

/// A node template's type merged with its own interface/property overrides,
/// ready for the plan assembler (§4.3's "node-template-level... take
/// precedence over node-type-level ones").
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedNode {
    pub type_hierarchy: Vec<String>,
    pub properties: OrderedMap<PropertyDef>,
    pub interfaces: InterfaceMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRelationship {
    pub target: String,
    pub type_hierarchy: Vec<String>,
    pub properties: OrderedMap<PropertyDef>,
    pub source_interfaces: InterfaceMap,
    pub target_interfaces: InterfaceMap,
}

pub fn derive_node_types(
    blueprint: &Blueprint,
) -> crate::error::Result<OrderedMap<DerivedNodeType>> {
    let by_name = index(&blueprint.node_types);
    let derived: OrderedMap<DerivedNodeType> = blueprint
        .node_types
        .iter()
        .map(|(name, _)| {
            let chain = type_hierarchy(name, &blueprint.node_types, |t| t.derived_from.as_deref())?;
            let mut properties = OrderedMap::new();
            let mut interfaces = InterfaceMap::new();
            for type_name in &chain {
                // type_hierarchy only ever returns names it resolved from
                // this same map, so this lookup cannot miss.
                let Some(ty) = by_name.get(type_name.as_str()).copied() else {
                    continue;
                };
                properties = merge_property_defs(properties, &ty.properties);
                interfaces = merge_interfaces(interfaces, &ty.interfaces);
            }
            Ok((
                name.clone(),
                DerivedNodeType {
                    type_hierarchy: chain,
                    properties,
                    interfaces,
                },
            ))
        })
        .collect::<crate::error::Result<_>>()?;
    debug!(count = derived.len(), "Derived node types");
    Ok(derived)
}

pub fn derive_relationship_types(
    blueprint: &Blueprint,
) -> crate::error::Result<OrderedMap<DerivedRelationshipType>> {
    let by_name = index(&blueprint.relationship_types);
    let derived: OrderedMap<DerivedRelationshipType> = blueprint
        .relationship_types
        .iter()
        .map(|(name, _)| {
            let chain = type_hierarchy(name, &blueprint.relationship_types, |t| {
                t.derived_from.as_deref()
            })?;
            let mut properties = OrderedMap::new();
            let mut source_interfaces = InterfaceMap::new();
            let mut target_interfaces = InterfaceMap::new();
            for type_name in &chain {
                let Some(ty) = by_name.get(type_name.as_str()).copied() else {
                    continue;
                };
                properties = merge_property_defs(properties, &ty.properties);
                source_interfaces = merge_interfaces(source_interfaces, &ty.source_interfaces);
                target_interfaces = merge_interfaces(target_interfaces, &ty.target_interfaces);
            }
            Ok((
                name.clone(),
                DerivedRelationshipType {
                    type_hierarchy: chain,
                    properties,
                    source_interfaces,
                    target_interfaces,
                },
            ))
        })
        .collect::<crate::error::Result<_>>()?;
    debug!(count = derived.len(), "Derived relationship types");
    Ok(derived)
}

pub fn derive_data_types(
    blueprint: &Blueprint,
) -> crate::error::Result<OrderedMap<DerivedDataType>> {
    let by_name = index(&blueprint.data_types);
    let derived: OrderedMap<DerivedDataType> = blueprint
        .data_types
        .iter()
        .map(|(name, _)| {
            let chain = type_hierarchy(name, &blueprint.data_types, |t| t.derived_from.as_deref())?;
            let mut properties = OrderedMap::new();
            for type_name in &chain {
                let Some(ty) = by_name.get(type_name.as_str()).copied() else {
                    continue;
                };
                properties = merge_property_defs(properties, &ty.properties);
            }
            Ok((
                name.clone(),
                DerivedDataType {
                    type_hierarchy: chain,
                    properties,
                },
            ))
        })
        .collect::<crate::error::Result<_>>()?;
    debug!(count = derived.len(), "Derived data types");
    Ok(derived)
}

/// `policy_types` have no `derived_from` field in the data model (they are
/// leaf-only in practice), but are still given a one-element hierarchy so
/// plan assembly can treat all four kinds uniformly.
pub fn derive_policy_types(
    blueprint: &Blueprint,
) -> crate::error::Result<OrderedMap<DerivedPolicyType>> {
    let derived: OrderedMap<DerivedPolicyType> = blueprint
        .policy_types
        .iter()
        .map(|(name, ty)| {
            Ok((
                name.clone(),
                DerivedPolicyType {
                    type_hierarchy: vec![name.clone()],
                    source: ty.source.clone(),
                    properties: ty.properties.clone(),
                },
            ))
        })
        .collect::<crate::error::Result<_>>()?;
    debug!(count = derived.len(), "Derived policy types");
    Ok(derived)
}

/// Resolves every node template against its derived node type, applying
/// template-level property/interface overrides on top (§4.3).
pub fn resolve_node_templates(
    blueprint: &Blueprint,
    derived_node_types: &OrderedMap<DerivedNodeType>,
) -> crate::error::Result<OrderedMap<ResolvedNode>> {
    blueprint
        .node_templates
        .iter()
        .map(|(id, tmpl)| {
            let derived = lookup(derived_node_types, &tmpl.type_name).ok_or_else(|| {
                DslParsingLogicError::UnknownNodeType {
                    id: id.clone(),
                    type_name: tmpl.type_name.clone(),
                }
            })?;
            let interfaces = merge_interfaces(derived.interfaces.clone(), &tmpl.interfaces);
            Ok((
                id.clone(),
                ResolvedNode {
                    type_hierarchy: derived.type_hierarchy.clone(),
                    properties: derived.properties.clone(),
                    interfaces,
                },
            ))
        })
        .collect()
}

/// Resolves one relationship template instance against its derived
/// relationship type, again letting the template's own interfaces win.
pub fn resolve_relationship(
    rel: &RelationshipTemplate,
    derived_relationship_types: &OrderedMap<DerivedRelationshipType>,
) -> crate::error::Result<ResolvedRelationship> {
    let derived = lookup(derived_relationship_types, &rel.type_name).ok_or_else(|| {
        DslParsingLogicError::UnknownRelationshipType {
            type_name: rel.type_name.clone(),
        }
    })?;
    Ok(ResolvedRelationship {
        target: rel.target.clone(),
        type_hierarchy: derived.type_hierarchy.clone(),
        properties: derived.properties.clone(),
        source_interfaces: merge_interfaces(
            derived.source_interfaces.clone(),
            &rel.source_interfaces,
        ),
        target_interfaces: merge_interfaces(
            derived.target_interfaces.clone(),
            &rel.target_interfaces,
        ),
    })
}

/// Validates that every relationship target names a declared node template
/// (§4.3's implicit invariant, surfaced explicitly as its own check so the
/// plan assembler can assume it has already been enforced).
pub fn validate_relationship_targets(blueprint: &Blueprint) -> crate::error::Result<()> {
    let node_names = index(&blueprint.node_templates);
    for (_, tmpl) in &blueprint.node_templates {
        for rel in &tmpl.relationships {
            if !node_names.contains_key(rel.target.as_str()) {
                return Err(DslParsingLogicError::UnknownRelationshipTarget {
                    target: rel.target.clone(),
                }
                .into());
            }
        }
    }
    Ok(())
}

/// Walks `name`'s `derived_from` chain to its root, returning the hierarchy
/// in root→leaf order. `name` must already be a key of `types`.
fn type_hierarchy<T>(
    name: &str,
    types: &OrderedMap<T>,
    parent_of: impl Fn(&T) -> Option<&str>,
) -> crate::error::Result<Vec<String>> {
    let by_name = index(types);
    let mut chain = vec![name.to_string()];
    let mut current = name.to_string();
    loop {
        let Some(def) = by_name.get(current.as_str()).copied() else {
            return Err(DslParsingLogicError::UnknownParentType {
                type_name: name.to_string(),
                parent: current,
            }
            .into());
        };
        match parent_of(def) {
            None => break,
            Some(parent) => {
                if chain.iter().any(|c| c == parent) {
                    let mut cycle_chain = chain.clone();
                    cycle_chain.push(parent.to_string());
                    return Err(DslParsingLogicError::CyclicDerivation { chain: cycle_chain }.into());
                }
                if !by_name.contains_key(parent) {
                    return Err(DslParsingLogicError::UnknownParentType {
                        type_name: current.clone(),
                        parent: parent.to_string(),
                    }
                    .into());
                }
                chain.push(parent.to_string());
                current = parent.to_string();
            }
        }
    }
    chain.reverse();
    Ok(chain)
}

/// Merges an ancestor's property schema into an accumulated child schema,
/// field-by-field: a property already present is overridden field-by-field
/// (each of `kind`/`default`/`description`/`required` falls back to the
/// already-accumulated value when the new definition leaves it unset), and a
/// property not yet present is adopted wholesale. Accumulation walks
/// root→leaf, so later calls are more-derived and win.
fn merge_property_defs(
    accumulated: OrderedMap<PropertyDef>,
    incoming: &OrderedMap<PropertyDef>,
) -> OrderedMap<PropertyDef> {
    let mut result = accumulated;
    for (name, incoming_def) in incoming {
        match result.iter_mut().find(|(k, _)| k == name) {
            Some((_, existing)) => {
                *existing = PropertyDef {
                    kind: incoming_def.kind.clone().or_else(|| existing.kind.clone()),
                    default: incoming_def
                        .default
                        .clone()
                        .or_else(|| existing.default.clone()),
                    description: incoming_def
                        .description
                        .clone()
                        .or_else(|| existing.description.clone()),
                    required: incoming_def.required,
                };
            }
            None => result.push((name.clone(), incoming_def.clone())),
        }
    }
    result
}

/// Merges an ancestor's interfaces into an accumulated child interface map.
/// Per interface, per operation: the incoming (more-derived) definition wins
/// field-by-field, with unset fields inheriting from the ancestor operation.
fn merge_interfaces(accumulated: InterfaceMap, incoming: &InterfaceMap) -> InterfaceMap {
    let mut result = accumulated;
    for (iface_name, incoming_ops) in incoming {
        match result.iter_mut().find(|(k, _)| k == iface_name) {
            Some((_, existing_ops)) => {
                for (op_name, incoming_op) in incoming_ops {
                    match existing_ops.iter_mut().find(|(k, _)| k == op_name) {
                        Some((_, existing_op)) => {
                            *existing_op = merge_operation(existing_op, incoming_op);
                        }
                        None => existing_ops.push((op_name.clone(), incoming_op.clone())),
                    }
                }
            }
            None => result.push((iface_name.clone(), incoming_ops.clone())),
        }
    }
    result
}

/// Field-level operation merge: the incoming definition overrides the
/// ancestor's, but any field the incoming definition leaves unset (including
/// an empty `inputs` map, which a short-form string implementation always
/// produces) inherits from the ancestor.
fn merge_operation(ancestor: &OperationDef, incoming: &OperationDef) -> OperationDef {
    OperationDef {
        plugin: incoming.plugin.clone().or_else(|| ancestor.plugin.clone()),
        operation: if incoming.operation.is_empty() {
            ancestor.operation.clone()
        } else {
            incoming.operation.clone()
        },
        inputs: if incoming.inputs.is_empty() {
            ancestor.inputs.clone()
        } else {
            incoming.inputs.clone()
        },
        executor: incoming
            .executor
            .clone()
            .or_else(|| ancestor.executor.clone()),
        max_retries: incoming.max_retries.or(ancestor.max_retries),
        retry_interval: incoming.retry_interval.or(ancestor.retry_interval),
        timeout: incoming.timeout.or(ancestor.timeout),
        timeout_recoverable: incoming.timeout_recoverable.or(ancestor.timeout_recoverable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;
    use crate::yaml as yaml_adapter;

    fn parse(text: &str) -> Blueprint {
        let doc = yaml_adapter::load_str(text, "<test>").unwrap();
        Blueprint::from_document(&doc, Version::new(1, 3, 0)).unwrap()
    }

    #[test]
    fn type_hierarchy_walks_root_to_leaf() {
        let bp = parse(
            "
node_types:
  cloudify.nodes.Root: {}
  cloudify.nodes.Compute:
    derived_from: cloudify.nodes.Root
  cloudify.nodes.VM:
    derived_from: cloudify.nodes.Compute
",
        );
        let derived = derive_node_types(&bp).unwrap();
        let vm = lookup(&derived, "cloudify.nodes.VM").unwrap();
        assert_eq!(
            vm.type_hierarchy,
            vec![
                "cloudify.nodes.Root".to_string(),
                "cloudify.nodes.Compute".to_string(),
                "cloudify.nodes.VM".to_string(),
            ]
        );
    }

    #[test]
    fn unknown_parent_type_is_reported() {
        let bp = parse(
            "
node_types:
  cloudify.nodes.VM:
    derived_from: cloudify.nodes.Missing
",
        );
        let err = derive_node_types(&bp).unwrap_err();
        assert!(err.to_string().contains("unknown type"));
    }

    #[test]
    fn cyclic_derivation_is_detected() {
        let bp = parse(
            "
node_types:
  a:
    derived_from: b
  b:
    derived_from: a
",
        );
        let err = derive_node_types(&bp).unwrap_err();
        assert!(err.to_string().contains("derivation cycle"));
    }

    #[test]
    fn leaf_property_overrides_ancestor_field_by_field() {
        let bp = parse(
            "
node_types:
  cloudify.nodes.Root:
    properties:
      size:
        type: string
        default: small
        description: the size
  cloudify.nodes.VM:
    derived_from: cloudify.nodes.Root
    properties:
      size:
        default: large
",
        );
        let derived = derive_node_types(&bp).unwrap();
        let vm = lookup(&derived, "cloudify.nodes.VM").unwrap();
        let size = lookup(&vm.properties, "size").unwrap();
        assert_eq!(size.kind.as_deref(), Some("string"));
        assert_eq!(size.description.as_deref(), Some("the size"));
        match &size.default {
            Some(crate::function::ast::Expr::Literal(v)) => {
                assert_eq!(v.as_str(), Some("large"));
            }
            other => panic!("expected literal default, got {other:?}"),
        }
    }

    #[test]
    fn operation_missing_fields_inherit_from_ancestor() {
        let bp = parse(
            "
plugins:
  my_plugin: {}
node_types:
  cloudify.nodes.Root:
    interfaces:
      cloudify.interfaces.lifecycle:
        create:
          implementation: my_plugin.create
          executor: central_deployment_agent
          max_retries: 3
  cloudify.nodes.VM:
    derived_from: cloudify.nodes.Root
    interfaces:
      cloudify.interfaces.lifecycle:
        create:
          implementation: my_plugin.create_v2
",
        );
        let derived = derive_node_types(&bp).unwrap();
        let vm = lookup(&derived, "cloudify.nodes.VM").unwrap();
        let iface = lookup(&vm.interfaces, "cloudify.interfaces.lifecycle").unwrap();
        let op = lookup(iface, "create").unwrap();
        assert_eq!(op.operation, "create_v2");
        assert_eq!(op.executor.as_deref(), Some("central_deployment_agent"));
        assert_eq!(op.max_retries, Some(3));
    }

    #[test]
    fn node_template_interface_override_beats_node_type() {
        let bp = parse(
            "
plugins:
  type_plugin: {}
  template_plugin: {}
node_types:
  cloudify.nodes.Compute:
    interfaces:
      cloudify.interfaces.lifecycle:
        create: type_plugin.create
node_templates:
  vm:
    type: cloudify.nodes.Compute
    interfaces:
      cloudify.interfaces.lifecycle:
        create: template_plugin.create
",
        );
        let derived = derive_node_types(&bp).unwrap();
        let resolved = resolve_node_templates(&bp, &derived).unwrap();
        let vm = lookup(&resolved, "vm").unwrap();
        let iface = lookup(&vm.interfaces, "cloudify.interfaces.lifecycle").unwrap();
        let op = lookup(iface, "create").unwrap();
        assert_eq!(op.plugin.as_deref(), Some("template_plugin"));
    }

    #[test]
    fn unknown_relationship_target_is_reported() {
        let bp = parse(
            "
node_templates:
  db:
    type: cloudify.nodes.DBMS
    relationships:
      - type: cloudify.relationships.contained_in
        target: ghost
",
        );
        let err = validate_relationship_targets(&bp).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }
}

//! Typed document model (§3): the merged-and-parsed blueprint, before type
//! derivation has resolved `derived_from` chains.

use std::collections::{BTreeMap, HashSet};

use serde_yaml_ng::{Mapping, Value};

use crate::error::{Breadcrumb, DslParsingFormatError};
use crate::function::ast::Expr;
use crate::function::parser;
use crate::version::Version;
use crate::yaml;

/// An ordered name→value association, used everywhere source order must
/// survive into the plan (§5 ordering guarantees).
pub type OrderedMap<V> = Vec<(String, V)>;

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDef {
    pub kind: Option<String>,
    pub default: Option<Expr>,
    pub description: Option<String>,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationDef {
    pub plugin: Option<String>,
    pub operation: String,
    pub inputs: OrderedMap<Expr>,
    pub executor: Option<String>,
    pub max_retries: Option<i64>,
    pub retry_interval: Option<f64>,
    pub timeout: Option<i64>,
    pub timeout_recoverable: Option<bool>,
}

impl OperationDef {
    pub fn has_intrinsic_functions(&self) -> bool {
        self.inputs.iter().any(|(_, v)| contains_function(v))
    }
}

fn contains_function(expr: &Expr) -> bool {
    match expr {
        Expr::Literal(_) => false,
        Expr::List(items) => items.iter().any(contains_function),
        Expr::Map(entries) => entries.iter().any(|(_, v)| contains_function(v)),
        _ => true,
    }
}

pub type InterfaceMap = OrderedMap<OrderedMap<OperationDef>>;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeType {
    pub derived_from: Option<String>,
    pub properties: OrderedMap<PropertyDef>,
    pub interfaces: InterfaceMap,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RelationshipType {
    pub derived_from: Option<String>,
    pub properties: OrderedMap<PropertyDef>,
    pub source_interfaces: InterfaceMap,
    pub target_interfaces: InterfaceMap,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataType {
    pub derived_from: Option<String>,
    pub properties: OrderedMap<PropertyDef>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PolicyType {
    pub source: Option<String>,
    pub properties: OrderedMap<PropertyDef>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PolicyTrigger {
    pub source: Option<String>,
    pub parameters: OrderedMap<PropertyDef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipTemplate {
    pub type_name: String,
    pub target: String,
    pub source_interfaces: InterfaceMap,
    pub target_interfaces: InterfaceMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeTemplate {
    pub id: String,
    pub type_name: String,
    pub properties: OrderedMap<Expr>,
    pub interfaces: InterfaceMap,
    pub relationships: Vec<RelationshipTemplate>,
    pub instances_deploy: i64,
    pub capabilities: OrderedMap<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plugin {
    pub executor: Option<String>,
    pub source: Option<String>,
    pub install: bool,
    pub package_name: Option<String>,
    pub package_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDef {
    pub plugin: String,
    pub operation: String,
    pub parameters: OrderedMap<PropertyDef>,
    pub is_cascading: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyInstance {
    pub type_name: String,
    pub properties: OrderedMap<Expr>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Group {
    pub members: Vec<String>,
    pub policies: OrderedMap<PolicyInstance>,
}

/// The fully merged, function-parsed, but not-yet-derived document.
#[derive(Debug, Clone)]
pub struct Blueprint {
    pub version: Version,
    pub description: Option<String>,
    pub inputs: OrderedMap<PropertyDef>,
    pub plugins: OrderedMap<Plugin>,
    pub data_types: OrderedMap<DataType>,
    pub node_types: OrderedMap<NodeType>,
    pub relationship_types: OrderedMap<RelationshipType>,
    pub node_templates: OrderedMap<NodeTemplate>,
    pub workflows: OrderedMap<WorkflowDef>,
    pub policy_types: OrderedMap<PolicyType>,
    pub policy_triggers: OrderedMap<PolicyTrigger>,
    pub groups: OrderedMap<Group>,
    pub policies: OrderedMap<PolicyInstance>,
    pub outputs: OrderedMap<Expr>,
    pub capabilities: OrderedMap<Expr>,
    pub deployment_settings: Option<Value>,
}

impl Blueprint {
    pub fn from_document(doc: &Value, version: Version) -> crate::error::Result<Self> {
        let root = doc.as_mapping().ok_or_else(|| DslParsingFormatError::Malformed {
            breadcrumb: Breadcrumb::root(),
            message: "document root must be a mapping".to_string(),
        })?;

        let plugins = parse_plugins(root)?;
        let known_plugins: HashSet<&str> = plugins.iter().map(|(name, _)| name.as_str()).collect();

        Ok(Self {
            version,
            description: yaml::get(root, "description").and_then(Value::as_str).map(str::to_string),
            inputs: parse_property_defs(root, "inputs", version)?,
            node_types: parse_node_types(root, version, &known_plugins)?,
            relationship_types: parse_relationship_types(root, version, &known_plugins)?,
            node_templates: parse_node_templates(root, version, &known_plugins)?,
            workflows: parse_workflows(root, version, &known_plugins)?,
            plugins,
            data_types: parse_data_types(root, version)?,
            policy_types: parse_policy_types(root, version)?,
            policy_triggers: parse_policy_triggers(root, version)?,
            groups: parse_groups(root, version)?,
            policies: parse_policy_instances(root, "policies", version)?,
            outputs: parse_expr_section(root, "outputs", version, true)?,
            capabilities: parse_expr_section(root, "capabilities", version, false)?,
            deployment_settings: yaml::get(root, "deployment_settings").cloned(),
        })
    }
}

fn section<'a>(root: &'a Mapping, name: &str) -> Option<&'a Mapping> {
    yaml::get(root, name).and_then(Value::as_mapping)
}

fn parse_property_defs(root: &Mapping, name: &str, version: Version) -> crate::error::Result<OrderedMap<PropertyDef>> {
    let Some(map) = section(root, name) else {
        return Ok(Vec::new());
    };
    let breadcrumb = Breadcrumb::from(name);
    map.iter()
        .map(|(k, v)| {
            let key = k.as_str().unwrap_or_default().to_string();
            let def = parse_property_def(v, &breadcrumb.join(key.clone()), version)?;
            Ok((key, def))
        })
        .collect()
}

fn parse_property_def(value: &Value, breadcrumb: &Breadcrumb, version: Version) -> crate::error::Result<PropertyDef> {
    let map = value.as_mapping().ok_or_else(|| DslParsingFormatError::Malformed {
        breadcrumb: breadcrumb.clone(),
        message: "property definition must be a mapping".to_string(),
    })?;

    let default = match yaml::get(map, "default") {
        Some(v) => Some(parser::parse(v, &breadcrumb.join("default"), version)?),
        None => None,
    };
    let required = yaml::get(map, "required").and_then(Value::as_bool).unwrap_or(default.is_none());
    // A required property with neither a default nor a concrete value is a
    // static error only once a node template's instantiation doesn't supply
    // one either; that check happens during derivation, not here.

    Ok(PropertyDef {
        kind: yaml::get(map, "type").and_then(Value::as_str).map(str::to_string),
        default,
        description: yaml::get(map, "description").and_then(Value::as_str).map(str::to_string),
        required,
    })
}

fn parse_interfaces(
    container: &Mapping,
    key: &str,
    breadcrumb: &Breadcrumb,
    version: Version,
    known_plugins: &HashSet<&str>,
) -> crate::error::Result<InterfaceMap> {
    let Some(ifaces) = section(container, key) else {
        return Ok(Vec::new());
    };
    ifaces
        .iter()
        .map(|(iface_key, iface_val)| {
            let iface_name = iface_key.as_str().unwrap_or_default().to_string();
            let ops_map = iface_val.as_mapping().ok_or_else(|| DslParsingFormatError::Malformed {
                breadcrumb: breadcrumb.join(iface_name.clone()),
                message: "interface definition must be a mapping of operation name to definition".to_string(),
            })?;
            let ops = ops_map
                .iter()
                .map(|(op_key, op_val)| {
                    let op_name = op_key.as_str().unwrap_or_default().to_string();
                    let op = parse_operation_def(
                        &op_name,
                        op_val,
                        &breadcrumb.join(iface_name.clone()).join(op_name.clone()),
                        version,
                        known_plugins,
                    )?;
                    Ok((op_name, op))
                })
                .collect::<crate::error::Result<OrderedMap<OperationDef>>>()?;
            Ok((iface_name, ops))
        })
        .collect()
}

fn parse_operation_def(
    op_name: &str,
    value: &Value,
    breadcrumb: &Breadcrumb,
    version: Version,
    known_plugins: &HashSet<&str>,
) -> crate::error::Result<OperationDef> {
    if let Some(short_form) = value.as_str() {
        let (plugin, operation) = split_plugin_task(short_form, op_name, known_plugins);
        return Ok(OperationDef {
            plugin,
            operation,
            inputs: Vec::new(),
            executor: None,
            max_retries: None,
            retry_interval: None,
            timeout: None,
            timeout_recoverable: None,
        });
    }

    let Some(map) = value.as_mapping() else {
        return Err(DslParsingFormatError::Malformed {
            breadcrumb: breadcrumb.clone(),
            message: "operation definition must be a string or a mapping".to_string(),
        }
        .into());
    };

    let implementation = yaml::get(map, "implementation").and_then(Value::as_str).unwrap_or("");
    let (plugin, operation) = split_plugin_task(implementation, op_name, known_plugins);

    let inputs = match yaml::get(map, "inputs").and_then(Value::as_mapping) {
        Some(inputs_map) => inputs_map
            .iter()
            .map(|(k, v)| {
                let key = k.as_str().unwrap_or_default().to_string();
                let expr = parser::parse(v, &breadcrumb.join("inputs").join(key.clone()), version)?;
                Ok((key, expr))
            })
            .collect::<crate::error::Result<OrderedMap<Expr>>>()?,
        None => Vec::new(),
    };

    Ok(OperationDef {
        plugin,
        operation,
        inputs,
        executor: yaml::get(map, "executor").and_then(Value::as_str).map(str::to_string),
        max_retries: yaml::get(map, "max_retries").and_then(Value::as_i64),
        retry_interval: yaml::get(map, "retry_interval").and_then(Value::as_f64),
        timeout: yaml::get(map, "timeout").and_then(Value::as_i64),
        timeout_recoverable: yaml::get(map, "timeout_recoverable").and_then(Value::as_bool),
    })
}

/// Split a `"plugin.task"` implementation string. The prefix up to the first
/// `.` is a plugin reference only when it names a declared plugin (or the
/// built-in `script` plugin); anything else — a bare script path like
/// `stub.py`, or `scripts/create.sh` — is a file resource with no plugin,
/// which the plan assembler rewrites onto the `script` plugin (§4.8).
fn split_plugin_task(implementation: &str, op_name: &str, known_plugins: &HashSet<&str>) -> (Option<String>, String) {
    if implementation.is_empty() {
        return (None, op_name.to_string());
    }
    if let Some((plugin, task)) = implementation.split_once('.') {
        if !plugin.is_empty() && (known_plugins.contains(plugin) || plugin == "script") {
            return (Some(plugin.to_string()), task.to_string());
        }
    }
    (None, implementation.to_string())
}

fn parse_plugins(root: &Mapping) -> crate::error::Result<OrderedMap<Plugin>> {
    let Some(map) = section(root, "plugins") else {
        return Ok(Vec::new());
    };
    map.iter()
        .map(|(k, v)| {
            let name = k.as_str().unwrap_or_default().to_string();
            let plugin_map = v.as_mapping().ok_or_else(|| DslParsingFormatError::Malformed {
                breadcrumb: Breadcrumb::from("plugins").join(name.clone()),
                message: "plugin definition must be a mapping".to_string(),
            })?;
            let plugin = Plugin {
                executor: yaml::get(plugin_map, "executor").and_then(Value::as_str).map(str::to_string),
                source: yaml::get(plugin_map, "source").and_then(Value::as_str).map(str::to_string),
                install: yaml::get(plugin_map, "install").and_then(Value::as_bool).unwrap_or(true),
                package_name: yaml::get(plugin_map, "package_name").and_then(Value::as_str).map(str::to_string),
                package_version: yaml::get(plugin_map, "package_version").and_then(Value::as_str).map(str::to_string),
            };
            Ok((name, plugin))
        })
        .collect()
}

fn parse_data_types(root: &Mapping, version: Version) -> crate::error::Result<OrderedMap<DataType>> {
    let Some(map) = section(root, "data_types") else {
        return Ok(Vec::new());
    };
    map.iter()
        .map(|(k, v)| {
            let name = k.as_str().unwrap_or_default().to_string();
            let type_map = v.as_mapping().ok_or_else(|| DslParsingFormatError::Malformed {
                breadcrumb: Breadcrumb::from("data_types").join(name.clone()),
                message: "data type definition must be a mapping".to_string(),
            })?;
            let data_type = DataType {
                derived_from: yaml::get(type_map, "derived_from").and_then(Value::as_str).map(str::to_string),
                properties: parse_property_defs(type_map, "properties", version)?,
            };
            Ok((name, data_type))
        })
        .collect()
}

fn parse_node_types(
    root: &Mapping,
    version: Version,
    known_plugins: &HashSet<&str>,
) -> crate::error::Result<OrderedMap<NodeType>> {
    let Some(map) = section(root, "node_types") else {
        return Ok(Vec::new());
    };
    map.iter()
        .map(|(k, v)| {
            let name = k.as_str().unwrap_or_default().to_string();
            let breadcrumb = Breadcrumb::from("node_types").join(name.clone());
            let type_map = v.as_mapping().ok_or_else(|| DslParsingFormatError::Malformed {
                breadcrumb: breadcrumb.clone(),
                message: "node type definition must be a mapping".to_string(),
            })?;
            let node_type = NodeType {
                derived_from: yaml::get(type_map, "derived_from").and_then(Value::as_str).map(str::to_string),
                properties: parse_property_defs(type_map, "properties", version)?,
                interfaces: parse_interfaces(type_map, "interfaces", &breadcrumb, version, known_plugins)?,
            };
            Ok((name, node_type))
        })
        .collect()
}

fn parse_relationship_types(
    root: &Mapping,
    version: Version,
    known_plugins: &HashSet<&str>,
) -> crate::error::Result<OrderedMap<RelationshipType>> {
    let Some(map) = section(root, "relationships") else {
        return Ok(Vec::new());
    };
    map.iter()
        .map(|(k, v)| {
            let name = k.as_str().unwrap_or_default().to_string();
            let breadcrumb = Breadcrumb::from("relationships").join(name.clone());
            let type_map = v.as_mapping().ok_or_else(|| DslParsingFormatError::Malformed {
                breadcrumb: breadcrumb.clone(),
                message: "relationship type definition must be a mapping".to_string(),
            })?;
            let relationship_type = RelationshipType {
                derived_from: yaml::get(type_map, "derived_from").and_then(Value::as_str).map(str::to_string),
                properties: parse_property_defs(type_map, "properties", version)?,
                source_interfaces: parse_interfaces(type_map, "source_interfaces", &breadcrumb, version, known_plugins)?,
                target_interfaces: parse_interfaces(type_map, "target_interfaces", &breadcrumb, version, known_plugins)?,
            };
            Ok((name, relationship_type))
        })
        .collect()
}

fn parse_node_templates(
    root: &Mapping,
    version: Version,
    known_plugins: &HashSet<&str>,
) -> crate::error::Result<OrderedMap<NodeTemplate>> {
    let Some(map) = section(root, "node_templates") else {
        return Ok(Vec::new());
    };
    map.iter()
        .map(|(k, v)| {
            let id = k.as_str().unwrap_or_default().to_string();
            let breadcrumb = Breadcrumb::from("node_templates").join(id.clone());
            let tmpl_map = v.as_mapping().ok_or_else(|| DslParsingFormatError::Malformed {
                breadcrumb: breadcrumb.clone(),
                message: "node template must be a mapping".to_string(),
            })?;

            let type_name = yaml::get(tmpl_map, "type")
                .and_then(Value::as_str)
                .ok_or_else(|| DslParsingFormatError::Malformed {
                    breadcrumb: breadcrumb.clone(),
                    message: "node template is missing required field 'type'".to_string(),
                })?
                .to_string();

            let properties = match yaml::get(tmpl_map, "properties").and_then(Value::as_mapping) {
                Some(props) => props
                    .iter()
                    .map(|(pk, pv)| {
                        let pname = pk.as_str().unwrap_or_default().to_string();
                        let expr = parser::parse(pv, &breadcrumb.join("properties").join(pname.clone()), version)?;
                        Ok((pname, expr))
                    })
                    .collect::<crate::error::Result<OrderedMap<Expr>>>()?,
                None => Vec::new(),
            };

            let relationships = match yaml::get(tmpl_map, "relationships").and_then(Value::as_sequence) {
                Some(seq) => seq
                    .iter()
                    .enumerate()
                    .map(|(i, rel)| parse_relationship_template(rel, &breadcrumb.join_index(i), version, known_plugins))
                    .collect::<crate::error::Result<Vec<_>>>()?,
                None => Vec::new(),
            };

            let instances_deploy = yaml::get(tmpl_map, "instances")
                .and_then(Value::as_mapping)
                .and_then(|m| yaml::get(m, "deploy"))
                .and_then(Value::as_i64)
                .unwrap_or(1);

            let capabilities = match yaml::get(tmpl_map, "capabilities").and_then(Value::as_mapping) {
                Some(caps) => caps
                    .iter()
                    .map(|(ck, cv)| {
                        let cname = ck.as_str().unwrap_or_default().to_string();
                        let expr = parser::parse(cv, &breadcrumb.join("capabilities").join(cname.clone()), version)?;
                        Ok((cname, expr))
                    })
                    .collect::<crate::error::Result<OrderedMap<Expr>>>()?,
                None => Vec::new(),
            };

            let node_template = NodeTemplate {
                id: id.clone(),
                type_name,
                properties,
                interfaces: parse_interfaces(tmpl_map, "interfaces", &breadcrumb, version, known_plugins)?,
                relationships,
                instances_deploy,
                capabilities,
            };
            Ok((id, node_template))
        })
        .collect()
}

fn parse_relationship_template(
    value: &Value,
    breadcrumb: &Breadcrumb,
    version: Version,
    known_plugins: &HashSet<&str>,
) -> crate::error::Result<RelationshipTemplate> {
    let map = value.as_mapping().ok_or_else(|| DslParsingFormatError::Malformed {
        breadcrumb: breadcrumb.clone(),
        message: "relationship entry must be a mapping".to_string(),
    })?;
    let type_name = yaml::get(map, "type")
        .and_then(Value::as_str)
        .ok_or_else(|| DslParsingFormatError::Malformed {
            breadcrumb: breadcrumb.clone(),
            message: "relationship entry is missing required field 'type'".to_string(),
        })?
        .to_string();
    let target = yaml::get(map, "target")
        .and_then(Value::as_str)
        .ok_or_else(|| DslParsingFormatError::Malformed {
            breadcrumb: breadcrumb.clone(),
            message: "relationship entry is missing required field 'target'".to_string(),
        })?
        .to_string();

    Ok(RelationshipTemplate {
        type_name,
        target,
        source_interfaces: parse_interfaces(map, "source_interfaces", breadcrumb, version, known_plugins)?,
        target_interfaces: parse_interfaces(map, "target_interfaces", breadcrumb, version, known_plugins)?,
    })
}

fn parse_workflows(
    root: &Mapping,
    version: Version,
    known_plugins: &HashSet<&str>,
) -> crate::error::Result<OrderedMap<WorkflowDef>> {
    let Some(map) = section(root, "workflows") else {
        return Ok(Vec::new());
    };
    map.iter()
        .map(|(k, v)| {
            let name = k.as_str().unwrap_or_default().to_string();
            let breadcrumb = Breadcrumb::from("workflows").join(name.clone());
            if let Some(short_form) = v.as_str() {
                let (plugin, operation) = split_plugin_task(short_form, &name, known_plugins);
                return Ok((
                    name,
                    WorkflowDef {
                        plugin: plugin.unwrap_or_default(),
                        operation,
                        parameters: Vec::new(),
                        is_cascading: false,
                    },
                ));
            }
            let map = v.as_mapping().ok_or_else(|| DslParsingFormatError::Malformed {
                breadcrumb: breadcrumb.clone(),
                message: "workflow definition must be a string or a mapping".to_string(),
            })?;
            let mapping = yaml::get(map, "mapping").and_then(Value::as_str).unwrap_or("");
            let (plugin, operation) = split_plugin_task(mapping, &name, known_plugins);
            let parameters = parse_property_defs(map, "parameters", version)?;
            let is_cascading = yaml::get(map, "is_cascading").and_then(Value::as_bool).unwrap_or(false);
            Ok((
                name,
                WorkflowDef {
                    plugin: plugin.unwrap_or_default(),
                    operation,
                    parameters,
                    is_cascading,
                },
            ))
        })
        .collect()
}

fn parse_policy_types(root: &Mapping, version: Version) -> crate::error::Result<OrderedMap<PolicyType>> {
    let Some(map) = section(root, "policy_types") else {
        return Ok(Vec::new());
    };
    map.iter()
        .map(|(k, v)| {
            let name = k.as_str().unwrap_or_default().to_string();
            let type_map = v.as_mapping().ok_or_else(|| DslParsingFormatError::Malformed {
                breadcrumb: Breadcrumb::from("policy_types").join(name.clone()),
                message: "policy type definition must be a mapping".to_string(),
            })?;
            let policy_type = PolicyType {
                source: yaml::get(type_map, "source").and_then(Value::as_str).map(str::to_string),
                properties: parse_property_defs(type_map, "properties", version)?,
            };
            Ok((name, policy_type))
        })
        .collect()
}

fn parse_policy_triggers(root: &Mapping, version: Version) -> crate::error::Result<OrderedMap<PolicyTrigger>> {
    let Some(map) = section(root, "policy_triggers") else {
        return Ok(Vec::new());
    };
    map.iter()
        .map(|(k, v)| {
            let name = k.as_str().unwrap_or_default().to_string();
            let trigger_map = v.as_mapping().ok_or_else(|| DslParsingFormatError::Malformed {
                breadcrumb: Breadcrumb::from("policy_triggers").join(name.clone()),
                message: "policy trigger definition must be a mapping".to_string(),
            })?;
            let trigger = PolicyTrigger {
                source: yaml::get(trigger_map, "source").and_then(Value::as_str).map(str::to_string),
                parameters: parse_property_defs(trigger_map, "parameters", version)?,
            };
            Ok((name, trigger))
        })
        .collect()
}

fn parse_policy_instances(
    root: &Mapping,
    section_name: &str,
    version: Version,
) -> crate::error::Result<OrderedMap<PolicyInstance>> {
    let Some(map) = section(root, section_name) else {
        return Ok(Vec::new());
    };
    map.iter()
        .map(|(k, v)| {
            let name = k.as_str().unwrap_or_default().to_string();
            let breadcrumb = Breadcrumb::from(section_name).join(name.clone());
            let policy = parse_policy_instance(v, &breadcrumb, version)?;
            Ok((name, policy))
        })
        .collect()
}

fn parse_policy_instance(value: &Value, breadcrumb: &Breadcrumb, version: Version) -> crate::error::Result<PolicyInstance> {
    let map = value.as_mapping().ok_or_else(|| DslParsingFormatError::Malformed {
        breadcrumb: breadcrumb.clone(),
        message: "policy instance must be a mapping".to_string(),
    })?;
    let type_name = yaml::get(map, "type")
        .and_then(Value::as_str)
        .ok_or_else(|| DslParsingFormatError::Malformed {
            breadcrumb: breadcrumb.clone(),
            message: "policy instance is missing required field 'type'".to_string(),
        })?
        .to_string();
    let properties = match yaml::get(map, "properties").and_then(Value::as_mapping) {
        Some(props) => props
            .iter()
            .map(|(pk, pv)| {
                let pname = pk.as_str().unwrap_or_default().to_string();
                let expr = parser::parse(pv, &breadcrumb.join("properties").join(pname.clone()), version)?;
                Ok((pname, expr))
            })
            .collect::<crate::error::Result<OrderedMap<Expr>>>()?,
        None => Vec::new(),
    };
    Ok(PolicyInstance { type_name, properties })
}

fn parse_groups(root: &Mapping, version: Version) -> crate::error::Result<OrderedMap<Group>> {
    let Some(map) = section(root, "groups") else {
        return Ok(Vec::new());
    };
    map.iter()
        .map(|(k, v)| {
            let name = k.as_str().unwrap_or_default().to_string();
            let breadcrumb = Breadcrumb::from("groups").join(name.clone());
            let group_map = v.as_mapping().ok_or_else(|| DslParsingFormatError::Malformed {
                breadcrumb: breadcrumb.clone(),
                message: "group definition must be a mapping".to_string(),
            })?;
            let members = yaml::get(group_map, "members")
                .and_then(Value::as_sequence)
                .map(|seq| seq.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            let policies = match yaml::get(group_map, "policies").and_then(Value::as_mapping) {
                Some(policies_map) => policies_map
                    .iter()
                    .map(|(pk, pv)| {
                        let pname = pk.as_str().unwrap_or_default().to_string();
                        let policy = parse_policy_instance(pv, &breadcrumb.join("policies").join(pname.clone()), version)?;
                        Ok((pname, policy))
                    })
                    .collect::<crate::error::Result<OrderedMap<PolicyInstance>>>()?,
                None => Vec::new(),
            };
            Ok((name, Group { members, policies }))
        })
        .collect()
}

fn parse_expr_section(
    root: &Mapping,
    name: &str,
    version: Version,
    unwrap_value_field: bool,
) -> crate::error::Result<OrderedMap<Expr>> {
    let Some(map) = section(root, name) else {
        return Ok(Vec::new());
    };
    let breadcrumb = Breadcrumb::from(name);
    map.iter()
        .map(|(k, v)| {
            let key = k.as_str().unwrap_or_default().to_string();
            let entry_breadcrumb = breadcrumb.join(key.clone());
            let empty = Mapping::new();
            let target = if unwrap_value_field {
                yaml::get(v.as_mapping().unwrap_or(&empty), "value").unwrap_or(v)
            } else {
                v
            };
            let expr = parser::parse(target, &entry_breadcrumb, version)?;
            Ok((key, expr))
        })
        .collect()
}

/// Lookup by key in an [`OrderedMap`] (or any slice of the same shape),
/// mirroring the semantics of an insertion-ordered map without pulling in an
/// extra dependency.
pub fn lookup<'a, V>(map: &'a [(String, V)], key: &str) -> Option<&'a V> {
    map.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

/// Build a `BTreeMap` view for the rare case a caller needs fast repeated
/// lookups; the canonical storage stays the order-preserving `Vec`.
pub fn index<'a, V>(map: &'a [(String, V)]) -> BTreeMap<&'a str, &'a V> {
    map.iter().map(|(k, v)| (k.as_str(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::yaml as yaml_adapter;

    fn v1_3() -> Version {
        Version::new(1, 3, 0)
    }

    #[test]
    fn parses_minimal_blueprint() {
        let doc = yaml_adapter::load_str(
            "
node_types:
  cloudify.nodes.Compute: {}
node_templates:
  vm:
    type: cloudify.nodes.Compute
    properties:
      size: small
",
            "<test>",
        )
        .unwrap();
        let bp = Blueprint::from_document(&doc, v1_3()).unwrap();
        assert_eq!(bp.node_templates.len(), 1);
        assert_eq!(bp.node_templates[0].0, "vm");
        assert_eq!(bp.node_templates[0].1.type_name, "cloudify.nodes.Compute");
    }

    #[test]
    fn parses_short_form_operation() {
        let doc = yaml_adapter::load_str(
            "
plugins:
  my_plugin: {}
node_types:
  t:
    interfaces:
      cloudify.interfaces.lifecycle:
        create: my_plugin.create
",
            "<test>",
        )
        .unwrap();
        let bp = Blueprint::from_document(&doc, v1_3()).unwrap();
        let node_type = lookup(&bp.node_types, "t").unwrap();
        let iface = lookup(&node_type.interfaces, "cloudify.interfaces.lifecycle").unwrap();
        let op = lookup(iface, "create").unwrap();
        assert_eq!(op.plugin.as_deref(), Some("my_plugin"));
        assert_eq!(op.operation, "create");
    }

    #[test]
    fn operation_reports_intrinsic_functions_present() {
        let doc = yaml_adapter::load_str(
            "
plugins:
  my_plugin: {}
node_types:
  t:
    interfaces:
      cloudify.interfaces.lifecycle:
        create:
          implementation: my_plugin.create
          inputs:
            a: { get_input: x }
",
            "<test>",
        )
        .unwrap();
        let bp = Blueprint::from_document(&doc, v1_3()).unwrap();
        let node_type = lookup(&bp.node_types, "t").unwrap();
        let iface = lookup(&node_type.interfaces, "cloudify.interfaces.lifecycle").unwrap();
        let op = lookup(iface, "create").unwrap();
        assert!(op.has_intrinsic_functions());
    }

    #[test]
    fn parses_node_template_relationships() {
        let doc = yaml_adapter::load_str(
            "
node_templates:
  vm:
    type: cloudify.nodes.Compute
  db:
    type: cloudify.nodes.DBMS
    relationships:
      - type: cloudify.relationships.contained_in
        target: vm
",
            "<test>",
        )
        .unwrap();
        let bp = Blueprint::from_document(&doc, v1_3()).unwrap();
        let db = lookup(&bp.node_templates, "db").unwrap();
        assert_eq!(db.relationships.len(), 1);
        assert_eq!(db.relationships[0].target, "vm");
    }

    #[test]
    fn parses_scaling_group_policy() {
        let doc = yaml_adapter::load_str(
            "
groups:
  web_group:
    members: [vm]
    policies:
      scale_web:
        type: cloudify.policies.scaling
        properties:
          default_instances: 2
",
            "<test>",
        )
        .unwrap();
        let bp = Blueprint::from_document(&doc, v1_3()).unwrap();
        let group = lookup(&bp.groups, "web_group").unwrap();
        assert_eq!(group.members, vec!["vm".to_string()]);
        let policy = lookup(&group.policies, "scale_web").unwrap();
        assert_eq!(policy.type_name, "cloudify.policies.scaling");
    }
}

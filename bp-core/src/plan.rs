//! Plan Assembler (§4.8): turns a parsed, derived [`Blueprint`] into the flat
//! deployment plan downstream orchestrators consume.
//!
//! Assembly runs in a fixed order so that every `get_property` reference is
//! already a literal by the time it is looked up (§4.7's "assume the caller
//! resolves node templates in an order such that..."):
//! 1. type derivation and node-template resolution ([`crate::derive`]);
//! 2. node property schema application ([`crate::schema`]) and static
//!    evaluation, one node at a time in source order;
//! 3. operation/relationship input evaluation, now that every node's
//!    properties are literal;
//! 4. host binding, plugin-install bucketing, script/workflow rewrite, and
//!    scaling-group derivation.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::rc::Rc;

use serde_yaml_ng::Value;

use crate::derive::{
    derive_data_types, derive_node_types, derive_policy_types, derive_relationship_types,
    resolve_node_templates, resolve_relationship, DerivedDataType, DerivedPolicyType,
};
use crate::error::{Breadcrumb, DslParsingLogicError};
use crate::function::ast::Expr;
use crate::function::eval::{evaluate_static, EvalContext, InputLookup, PropertyLookup, SecretFetcher};
use crate::model::{
    index, lookup, Blueprint, Group, OperationDef, OrderedMap, PolicyInstance, PolicyTrigger,
    PolicyType, Plugin, PropertyDef, WorkflowDef,
};
use crate::options::EvaluationOptions;
use crate::schema::apply_property_schema;

const COMPUTE_ROOT_TYPE: &str = "cloudify.nodes.Compute";
const CONTAINED_IN_TYPE: &str = "cloudify.relationships.contained_in";
const SCALING_POLICY_TYPE: &str = "cloudify.policies.scaling";
const HOST_AGENT_EXECUTOR: &str = "host_agent";
const CENTRAL_DEPLOYMENT_AGENT_EXECUTOR: &str = "central_deployment_agent";
const SCRIPT_PLUGIN: &str = "script";

#[derive(Debug, Clone, PartialEq)]
pub struct PlanRelationship {
    pub type_name: String,
    pub target: String,
    pub type_hierarchy: Vec<String>,
    pub source_operations: OrderedMap<Rc<OperationDef>>,
    pub target_operations: OrderedMap<Rc<OperationDef>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanNode {
    pub id: String,
    pub name: String,
    pub type_name: String,
    pub type_hierarchy: Vec<String>,
    pub properties: OrderedMap<Expr>,
    pub operations: OrderedMap<Rc<OperationDef>>,
    pub relationships: Vec<PlanRelationship>,
    pub plugins: OrderedMap<Plugin>,
    pub plugins_to_install: OrderedMap<Plugin>,
    pub deployment_plugins_to_install: OrderedMap<Plugin>,
    pub host_id: Option<String>,
    pub capabilities: OrderedMap<Expr>,
    pub instances_deploy: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowPlan {
    pub plugin: String,
    pub operation: String,
    pub parameters: OrderedMap<PropertyDef>,
    pub is_cascading: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingGroup {
    pub default_instances: i64,
    pub min_instances: i64,
    pub max_instances: i64,
    pub current_instances: i64,
    pub planned_instances: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub description: Option<String>,
    pub inputs: OrderedMap<PropertyDef>,
    pub nodes: Vec<PlanNode>,
    pub workflows: OrderedMap<WorkflowPlan>,
    pub outputs: OrderedMap<Expr>,
    pub capabilities: OrderedMap<Expr>,
    pub policy_types: OrderedMap<PolicyType>,
    pub policy_triggers: OrderedMap<PolicyTrigger>,
    pub groups: OrderedMap<Group>,
    pub policies: OrderedMap<PolicyInstance>,
    pub scaling_groups: OrderedMap<ScalingGroup>,
    pub deployment_settings: Option<Value>,
    pub workflow_plugins_to_install: OrderedMap<Plugin>,
    pub deployment_plugins_to_install: OrderedMap<Plugin>,
    pub host_agent_plugins_to_install: OrderedMap<Plugin>,
}

/// Assembles the final plan. `resources_base_path`, when given, is used to
/// verify file-resource script implementations exist before rewriting them
/// (§4.8's script mapping); without it the existence check is skipped.
pub fn assemble_plan(
    blueprint: &Blueprint,
    inputs: &dyn InputLookup,
    secrets: &dyn SecretFetcher,
    resources_base_path: Option<&Path>,
    options: &EvaluationOptions,
) -> crate::error::Result<Plan> {
    crate::derive::validate_relationship_targets(blueprint)?;

    let derived_node_types = derive_node_types(blueprint)?;
    let derived_relationship_types = derive_relationship_types(blueprint)?;
    let derived_data_types = derive_data_types(blueprint)?;
    let derived_policy_types = derive_policy_types(blueprint)?;
    let resolved_nodes = resolve_node_templates(blueprint, &derived_node_types)?;

    let all_node_ids: HashSet<String> = blueprint.node_templates.iter().map(|(id, _)| id.clone()).collect();
    let mut global_properties: HashMap<(String, String), Value> = HashMap::new();

    let mut node_properties: OrderedMap<OrderedMap<Expr>> = Vec::new();
    for (id, tmpl) in &blueprint.node_templates {
        let resolved = lookup(&resolved_nodes, id).expect("resolve_node_templates covers every template");
        let breadcrumb = Breadcrumb::from("node_templates").join(id.clone()).join("properties");
        let schema_applied = apply_property_schema(&resolved.properties, &tmpl.properties, &derived_data_types, &breadcrumb)?;
        let resolved_props = resolve_node_own_properties(
            id,
            schema_applied,
            inputs,
            secrets,
            &all_node_ids,
            &global_properties,
            options,
        )?;
        for (name, expr) in &resolved_props {
            if let Some(value) = expr.as_resolved_value() {
                global_properties.insert((id.clone(), name.clone()), value);
            }
        }
        node_properties.push((id.clone(), resolved_props));
    }

    let props_lookup = GlobalPropertyView {
        known: &all_node_ids,
        values: &global_properties,
    };

    let mut nodes = Vec::with_capacity(blueprint.node_templates.len());
    for (id, tmpl) in &blueprint.node_templates {
        let resolved = lookup(&resolved_nodes, id).expect("resolve_node_templates covers every template");
        let properties = lookup(&node_properties, id).cloned().unwrap_or_default();

        let operations = build_flat_operations(
            &resolved.interfaces,
            EvalContext::for_node(id.clone()),
            inputs,
            &props_lookup,
            secrets,
            options,
            resources_base_path,
        )?;

        let mut relationships = Vec::with_capacity(tmpl.relationships.len());
        for rel in &tmpl.relationships {
            let resolved_rel = resolve_relationship(rel, &derived_relationship_types)?;
            let ctx = EvalContext::for_relationship(id.clone(), rel.target.clone());
            let source_operations = build_flat_operations(
                &resolved_rel.source_interfaces,
                ctx.clone(),
                inputs,
                &props_lookup,
                secrets,
                options,
                resources_base_path,
            )?;
            let target_operations = build_flat_operations(
                &resolved_rel.target_interfaces,
                ctx,
                inputs,
                &props_lookup,
                secrets,
                options,
                resources_base_path,
            )?;
            relationships.push(PlanRelationship {
                type_name: rel.type_name.clone(),
                target: rel.target.clone(),
                type_hierarchy: resolved_rel.type_hierarchy,
                source_operations,
                target_operations,
            });
        }

        let plugins = plugins_referenced(&operations, blueprint);

        nodes.push(PlanNode {
            id: id.clone(),
            name: id.clone(),
            type_name: tmpl.type_name.clone(),
            type_hierarchy: resolved.type_hierarchy.clone(),
            properties,
            operations,
            relationships,
            plugins,
            plugins_to_install: Vec::new(),
            deployment_plugins_to_install: Vec::new(),
            host_id: None,
            capabilities: tmpl.capabilities.clone(),
            instances_deploy: tmpl.instances_deploy,
        });
    }

    let host_ids = compute_host_ids(&nodes);
    for node in &mut nodes {
        node.host_id = host_ids.get(&node.id).cloned().flatten();
    }

    let (workflow_plugins_to_install, deployment_plugins_to_install, host_agent_plugins_to_install) =
        bucket_plugins(&mut nodes, blueprint);

    let workflows = build_workflows(blueprint, resources_base_path)?;
    let scaling_groups = derive_scaling_groups(blueprint, &derived_policy_types, inputs, secrets, options)?;
    let policies = evaluate_policy_instances(&blueprint.policies, inputs, &props_lookup, secrets, options)?;

    Ok(Plan {
        description: blueprint.description.clone(),
        inputs: blueprint.inputs.clone(),
        nodes,
        workflows,
        outputs: blueprint.outputs.clone(),
        capabilities: blueprint.capabilities.clone(),
        policy_types: blueprint.policy_types.clone(),
        policy_triggers: blueprint.policy_triggers.clone(),
        groups: blueprint.groups.clone(),
        policies,
        scaling_groups,
        deployment_settings: blueprint.deployment_settings.clone(),
        workflow_plugins_to_install,
        deployment_plugins_to_install,
        host_agent_plugins_to_install,
    })
}

/// Read-only view over the properties resolved so far, implementing
/// [`PropertyLookup`] for the second pass (operation/relationship inputs),
/// by which point every node's properties are in `values`.
struct GlobalPropertyView<'a> {
    known: &'a HashSet<String>,
    values: &'a HashMap<(String, String), Value>,
}

impl PropertyLookup for GlobalPropertyView<'_> {
    fn node_exists(&self, node_id: &str) -> bool {
        self.known.contains(node_id)
    }

    fn node_property(&self, node_id: &str, property_name: &str) -> Option<Value> {
        self.values.get(&(node_id.to_string(), property_name.to_string())).cloned()
    }
}

/// Property view used while a single node's own properties are still being
/// resolved: `SELF` sees the in-progress local map (so `b = get_property
/// [SELF, a]` followed by `c = get_property[SELF, b]` both resolve in one
/// node), every other node id sees the already-finished global map.
struct NodeInProgressView<'a> {
    node_id: &'a str,
    local: &'a [(String, Expr)],
    known: &'a HashSet<String>,
    global: &'a HashMap<(String, String), Value>,
}

impl PropertyLookup for NodeInProgressView<'_> {
    fn node_exists(&self, node_id: &str) -> bool {
        node_id == self.node_id || self.known.contains(node_id)
    }

    fn node_property(&self, node_id: &str, property_name: &str) -> Option<Value> {
        if node_id == self.node_id {
            return lookup(self.local, property_name).and_then(Expr::as_resolved_value);
        }
        self.global.get(&(node_id.to_string(), property_name.to_string())).cloned()
    }

    fn node_property_expr(&self, node_id: &str, property_name: &str) -> Option<Expr> {
        if node_id == self.node_id {
            lookup(self.local, property_name).cloned()
        } else {
            None
        }
    }
}

/// Resolves one node's own property map to a fixed point: repeatedly runs the
/// static evaluator over every still-unresolved property until a pass makes
/// no further progress. This is what lets a single node chain `SELF`
/// references (`b` from `a`, `c` from `b`) without a general dependency
/// solver.
fn resolve_node_own_properties(
    node_id: &str,
    mut current: OrderedMap<Expr>,
    inputs: &dyn InputLookup,
    secrets: &dyn SecretFetcher,
    known: &HashSet<String>,
    global: &HashMap<(String, String), Value>,
    options: &EvaluationOptions,
) -> crate::error::Result<OrderedMap<Expr>> {
    let ctx = EvalContext::for_node(node_id.to_string());
    for _ in 0..current.len().max(1) {
        let mut changed = false;
        for i in 0..current.len() {
            if current[i].1.is_fully_resolved() {
                continue;
            }
            let snapshot = current.clone();
            let view = NodeInProgressView {
                node_id,
                local: &snapshot,
                known,
                global,
            };
            let evaluated = evaluate_static(&current[i].1, &ctx, inputs, &view, secrets, options)?;
            if evaluated != current[i].1 {
                current[i].1 = evaluated;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    Ok(current)
}

/// Inserts `value` under `key`, replacing an existing entry in place rather
/// than appending a duplicate (§9 Open Question (a): unqualified operation
/// names are last-writer-wins).
fn upsert<V>(map: &mut OrderedMap<V>, key: String, value: V) {
    match map.iter_mut().find(|(k, _)| *k == key) {
        Some((_, existing)) => *existing = value,
        None => map.push((key, value)),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_flat_operations(
    interfaces: &crate::model::InterfaceMap,
    ctx: EvalContext,
    inputs: &dyn InputLookup,
    properties: &dyn PropertyLookup,
    secrets: &dyn SecretFetcher,
    options: &EvaluationOptions,
    resources_base_path: Option<&Path>,
) -> crate::error::Result<OrderedMap<Rc<OperationDef>>> {
    let mut flat: OrderedMap<Rc<OperationDef>> = Vec::new();
    for (iface_name, ops) in interfaces {
        for (op_name, op) in ops {
            let evaluated_inputs = op
                .inputs
                .iter()
                .map(|(name, expr)| Ok((name.clone(), evaluate_static(expr, &ctx, inputs, properties, secrets, options)?)))
                .collect::<crate::error::Result<OrderedMap<Expr>>>()?;
            let mut resolved = OperationDef {
                inputs: evaluated_inputs,
                ..op.clone()
            };
            rewrite_script_operation(&mut resolved, resources_base_path)?;
            let rc = Rc::new(resolved);
            flat.push((format!("{iface_name}.{op_name}"), rc.clone()));
            upsert(&mut flat, op_name.clone(), rc);
        }
    }
    Ok(flat)
}

/// If an operation's implementation named a file resource rather than
/// `plugin.task` (§4.8's script mapping), rewrites it onto the built-in
/// `script` plugin's `run` task with the original path injected as the
/// `script_path` input.
fn rewrite_script_operation(op: &mut OperationDef, resources_base_path: Option<&Path>) -> crate::error::Result<()> {
    if op.plugin.is_some() || op.operation.is_empty() {
        return Ok(());
    }
    let script_path = op.operation.clone();
    if let Some(base) = resources_base_path {
        if !base.join(&script_path).exists() {
            return Err(DslParsingLogicError::ScriptResourceNotFound {
                implementation: script_path,
                base: base.display().to_string(),
            }
            .into());
        }
    }
    op.plugin = Some(SCRIPT_PLUGIN.to_string());
    op.operation = "run".to_string();
    upsert(&mut op.inputs, "script_path".to_string(), Expr::Literal(Value::from(script_path)));
    Ok(())
}

fn plugins_referenced(operations: &OrderedMap<Rc<OperationDef>>, blueprint: &Blueprint) -> OrderedMap<Plugin> {
    let catalog = index(&blueprint.plugins);
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for (_, op) in operations {
        let Some(name) = &op.plugin else { continue };
        if !seen.insert(name.clone()) {
            continue;
        }
        if let Some(plugin) = catalog.get(name.as_str()) {
            result.push((name.clone(), (*plugin).clone()));
        }
    }
    result
}

fn effective_executor(op: &OperationDef, blueprint: &Blueprint) -> Option<String> {
    if op.executor.is_some() {
        return op.executor.clone();
    }
    op.plugin
        .as_ref()
        .and_then(|name| lookup(&blueprint.plugins, name))
        .and_then(|plugin| plugin.executor.clone())
}

/// Walks every node's flat operation map once, bucketing `host_agent`
/// plugins onto the owning node's resolved host (§4.3's executor
/// precedence) and `central_deployment_agent` plugins onto the declaring
/// node itself, while also building the three root-level aggregates.
fn bucket_plugins(
    nodes: &mut [PlanNode],
    blueprint: &Blueprint,
) -> (OrderedMap<Plugin>, OrderedMap<Plugin>, OrderedMap<Plugin>) {
    let catalog = index(&blueprint.plugins);
    let mut host_agent_install: HashMap<String, Vec<(String, Plugin)>> = HashMap::new();
    let mut deployment_install: HashMap<String, Vec<(String, Plugin)>> = HashMap::new();
    let mut root_host_agent_seen = HashSet::new();
    let mut root_deployment_seen = HashSet::new();
    let mut root_host_agent = Vec::new();
    let mut root_deployment = Vec::new();

    for node in nodes.iter() {
        let mut node_host_agent_seen = HashSet::new();
        let mut node_deployment_seen = HashSet::new();
        for (_, op) in &node.operations {
            let Some(plugin_name) = &op.plugin else { continue };
            let Some(plugin) = catalog.get(plugin_name.as_str()) else { continue };
            match effective_executor(op, blueprint).as_deref() {
                Some(HOST_AGENT_EXECUTOR) => {
                    let Some(host_id) = &node.host_id else { continue };
                    if node_host_agent_seen.insert(plugin_name.clone()) {
                        host_agent_install
                            .entry(host_id.clone())
                            .or_default()
                            .push((plugin_name.clone(), (*plugin).clone()));
                    }
                    if root_host_agent_seen.insert(plugin_name.clone()) {
                        root_host_agent.push((plugin_name.clone(), (*plugin).clone()));
                    }
                }
                Some(CENTRAL_DEPLOYMENT_AGENT_EXECUTOR) => {
                    if node_deployment_seen.insert(plugin_name.clone()) {
                        deployment_install
                            .entry(node.id.clone())
                            .or_default()
                            .push((plugin_name.clone(), (*plugin).clone()));
                    }
                    if root_deployment_seen.insert(plugin_name.clone()) {
                        root_deployment.push((plugin_name.clone(), (*plugin).clone()));
                    }
                }
                _ => {}
            }
        }
    }

    let mut workflow_plugins_to_install = Vec::new();
    let mut workflow_seen = HashSet::new();
    for (_, workflow) in &blueprint.workflows {
        if workflow.plugin.is_empty() {
            continue;
        }
        if let Some(plugin) = catalog.get(workflow.plugin.as_str()) {
            if workflow_seen.insert(workflow.plugin.clone()) {
                workflow_plugins_to_install.push((workflow.plugin.clone(), (*plugin).clone()));
            }
        }
    }

    for node in nodes.iter_mut() {
        node.plugins_to_install = host_agent_install.remove(&node.id).unwrap_or_default();
        node.deployment_plugins_to_install = deployment_install.remove(&node.id).unwrap_or_default();
    }

    (workflow_plugins_to_install, root_deployment, root_host_agent)
}

/// Computes `host_id` for every node (§4.5): walks the `contained_in`-derived
/// relationship chain until it reaches a node whose type hierarchy includes
/// `cloudify.nodes.Compute`. A Compute node is its own host.
fn compute_host_ids(nodes: &[PlanNode]) -> HashMap<String, Option<String>> {
    let node_hierarchy: HashMap<&str, &[String]> = nodes.iter().map(|n| (n.id.as_str(), n.type_hierarchy.as_slice())).collect();
    let by_id: HashMap<&str, &PlanNode> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();

    let mut result = HashMap::new();
    for node in nodes {
        let mut current = node.id.clone();
        let mut visited = HashSet::new();
        let host = loop {
            if !visited.insert(current.clone()) {
                break None;
            }
            let is_compute = node_hierarchy
                .get(current.as_str())
                .map(|h| h.iter().any(|t| t == COMPUTE_ROOT_TYPE))
                .unwrap_or(false);
            if is_compute {
                break Some(current.clone());
            }
            let Some(cur_node) = by_id.get(current.as_str()) else {
                break None;
            };
            let next = cur_node
                .relationships
                .iter()
                .find(|r| r.type_hierarchy.iter().any(|t| t == CONTAINED_IN_TYPE))
                .map(|r| r.target.clone());
            match next {
                Some(target) => current = target,
                None => break None,
            }
        };
        result.insert(node.id.clone(), host);
    }
    result
}

fn build_workflows(blueprint: &Blueprint, resources_base_path: Option<&Path>) -> crate::error::Result<OrderedMap<WorkflowPlan>> {
    blueprint
        .workflows
        .iter()
        .map(|(name, def)| Ok((name.clone(), rewrite_workflow(def, resources_base_path)?)))
        .collect()
}

/// Mirrors [`rewrite_script_operation`] for the top-level `workflows` section
/// (§4.8): a file-resource mapping becomes the built-in `execute_workflow`
/// task with the path injected as a `script_path` parameter default.
fn rewrite_workflow(def: &WorkflowDef, resources_base_path: Option<&Path>) -> crate::error::Result<WorkflowPlan> {
    if !def.plugin.is_empty() {
        return Ok(WorkflowPlan {
            plugin: def.plugin.clone(),
            operation: def.operation.clone(),
            parameters: def.parameters.clone(),
            is_cascading: def.is_cascading,
        });
    }

    let script_path = def.operation.clone();
    if let Some(base) = resources_base_path {
        if !base.join(&script_path).exists() {
            return Err(DslParsingLogicError::ScriptResourceNotFound {
                implementation: script_path,
                base: base.display().to_string(),
            }
            .into());
        }
    }
    let mut parameters = def.parameters.clone();
    upsert(
        &mut parameters,
        "script_path".to_string(),
        PropertyDef {
            kind: Some("string".to_string()),
            default: Some(Expr::Literal(Value::from(script_path))),
            description: None,
            required: false,
        },
    );
    Ok(WorkflowPlan {
        plugin: SCRIPT_PLUGIN.to_string(),
        operation: "execute_workflow".to_string(),
        parameters,
        is_cascading: def.is_cascading,
    })
}

fn derive_scaling_groups(
    blueprint: &Blueprint,
    derived_policy_types: &OrderedMap<DerivedPolicyType>,
    inputs: &dyn InputLookup,
    secrets: &dyn SecretFetcher,
    options: &EvaluationOptions,
) -> crate::error::Result<OrderedMap<ScalingGroup>> {
    let mut result = Vec::new();
    for (group_name, group) in &blueprint.groups {
        for (policy_name, policy) in &group.policies {
            let is_scaling = lookup(derived_policy_types, &policy.type_name)
                .map(|p| p.type_hierarchy.iter().any(|t| t == SCALING_POLICY_TYPE))
                .unwrap_or(policy.type_name == SCALING_POLICY_TYPE);
            if !is_scaling {
                continue;
            }
            let ctx = EvalContext::default();
            let no_properties = NoProperties;
            let default_instances = scaling_property(&policy.properties, "default_instances", 1, &ctx, inputs, &no_properties, secrets, options)?;
            let min_instances = scaling_property(&policy.properties, "min_instances", -1, &ctx, inputs, &no_properties, secrets, options)?;
            let max_instances = scaling_property(&policy.properties, "max_instances", -1, &ctx, inputs, &no_properties, secrets, options)?;
            result.push((
                format!("{group_name}.{policy_name}"),
                ScalingGroup {
                    default_instances,
                    min_instances,
                    max_instances,
                    current_instances: default_instances,
                    planned_instances: default_instances,
                },
            ));
        }
    }
    Ok(result)
}

struct NoProperties;
impl PropertyLookup for NoProperties {
    fn node_exists(&self, _node_id: &str) -> bool {
        false
    }
    fn node_property(&self, _node_id: &str, _property_name: &str) -> Option<Value> {
        None
    }
}

#[allow(clippy::too_many_arguments)]
fn scaling_property(
    properties: &OrderedMap<Expr>,
    name: &str,
    default: i64,
    ctx: &EvalContext,
    inputs: &dyn InputLookup,
    props: &dyn PropertyLookup,
    secrets: &dyn SecretFetcher,
    options: &EvaluationOptions,
) -> crate::error::Result<i64> {
    let Some(expr) = lookup(properties, name) else {
        return Ok(default);
    };
    let evaluated = evaluate_static(expr, ctx, inputs, props, secrets, options)?;
    Ok(match evaluated {
        Expr::Literal(v) => v.as_i64().unwrap_or(default),
        _ => default,
    })
}

fn evaluate_policy_instances(
    policies: &OrderedMap<PolicyInstance>,
    inputs: &dyn InputLookup,
    properties: &dyn PropertyLookup,
    secrets: &dyn SecretFetcher,
    options: &EvaluationOptions,
) -> crate::error::Result<OrderedMap<PolicyInstance>> {
    let ctx = EvalContext::default();
    policies
        .iter()
        .map(|(name, policy)| {
            let evaluated_properties = policy
                .properties
                .iter()
                .map(|(k, v)| Ok((k.clone(), evaluate_static(v, &ctx, inputs, properties, secrets, options)?)))
                .collect::<crate::error::Result<OrderedMap<Expr>>>()?;
            Ok((
                name.clone(),
                PolicyInstance {
                    type_name: policy.type_name.clone(),
                    properties: evaluated_properties,
                },
            ))
        })
        .collect()
}

/// Applies a deployment's declared input schema to caller-supplied raw
/// values: fills in defaults, enforces `required`, coerces to declared
/// kinds. Every resulting value is expected to be a literal; a default that
/// itself evaluates to an unresolved function is rejected since deployment
/// inputs have no node/secret context to resolve it against.
pub fn resolve_inputs(
    blueprint: &Blueprint,
    supplied: &OrderedMap<Value>,
    data_types: &OrderedMap<DerivedDataType>,
) -> crate::error::Result<HashMap<String, Value>> {
    let as_expr: OrderedMap<Expr> = supplied.iter().map(|(k, v)| (k.clone(), Expr::Literal(v.clone()))).collect();
    let breadcrumb = Breadcrumb::from("inputs");
    let applied = apply_property_schema(&blueprint.inputs, &as_expr, data_types, &breadcrumb)?;
    let mut result = HashMap::new();
    for (name, expr) in applied {
        match expr {
            Expr::Literal(value) => {
                result.insert(name, value);
            }
            _ => {
                return Err(DslParsingLogicError::NonLiteralInputDefault { input: name }.into());
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::eval::SecretFetchError;
    use crate::version::Version;

    struct NoInputs;
    impl InputLookup for NoInputs {
        fn input_value(&self, _name: &str) -> Option<Value> {
            None
        }
    }

    struct NoSecrets;
    impl SecretFetcher for NoSecrets {
        fn get_secret(&self, _id: &str) -> Result<String, SecretFetchError> {
            Err(SecretFetchError::NotFound)
        }
    }

    fn parse(text: &str) -> Blueprint {
        let doc = crate::yaml::load_str(text, "<test>").unwrap();
        Blueprint::from_document(&doc, Version::new(1, 3, 0)).unwrap()
    }

    #[test]
    fn flat_operations_share_identity_across_qualified_and_unqualified_keys() {
        let bp = parse(
            "
plugins:
  my_plugin: {}
node_types:
  cloudify.nodes.WebServer:
    interfaces:
      cloudify.interfaces.lifecycle:
        start: my_plugin.start
node_templates:
  web:
    type: cloudify.nodes.WebServer
",
        );
        let plan = assemble_plan(&bp, &NoInputs, &NoSecrets, None, &EvaluationOptions::default()).unwrap();
        let web = plan.nodes.iter().find(|n| n.id == "web").unwrap();
        let qualified = lookup(&web.operations, "cloudify.interfaces.lifecycle.start").unwrap();
        let unqualified = lookup(&web.operations, "start").unwrap();
        assert!(Rc::ptr_eq(qualified, unqualified));
    }

    #[test]
    fn self_property_chain_resolves_within_one_node() {
        let bp = parse(
            "
node_types:
  cloudify.nodes.Thing: {}
node_templates:
  t:
    type: cloudify.nodes.Thing
    properties:
      a: 0
      b: { get_property: [SELF, a] }
      c: { get_property: [SELF, b] }
",
        );
        let plan = assemble_plan(&bp, &NoInputs, &NoSecrets, None, &EvaluationOptions::default()).unwrap();
        let t = plan.nodes.iter().find(|n| n.id == "t").unwrap();
        assert_eq!(lookup(&t.properties, "c"), Some(&Expr::Literal(Value::from(0))));
    }

    #[test]
    fn get_property_resolves_a_container_valued_property() {
        let bp = parse(
            "
node_types:
  cloudify.nodes.Thing: {}
node_templates:
  t:
    type: cloudify.nodes.Thing
    properties:
      a: 1
      c: [{ get_property: [SELF, a] }, 2]
      b: { get_property: [SELF, c] }
",
        );
        let plan = assemble_plan(&bp, &NoInputs, &NoSecrets, None, &EvaluationOptions::default()).unwrap();
        let t = plan.nodes.iter().find(|n| n.id == "t").unwrap();
        assert_eq!(
            lookup(&t.properties, "b"),
            Some(&Expr::Literal(Value::Sequence(vec![Value::from(1), Value::from(2)])))
        );
        assert_eq!(
            lookup(&t.properties, "c"),
            Some(&Expr::Literal(Value::Sequence(vec![Value::from(1), Value::from(2)])))
        );
    }

    #[test]
    fn self_referential_property_cycle_hits_recursion_limit() {
        let bp = parse(
            "
node_types:
  cloudify.nodes.Thing: {}
node_templates:
  t:
    type: cloudify.nodes.Thing
    properties:
      prop: { get_property: [SELF, prop] }
",
        );
        let mut options = EvaluationOptions::default();
        options.recursion_limit = 5;
        let err = assemble_plan(&bp, &NoInputs, &NoSecrets, None, &options).unwrap_err();
        assert!(err.to_string().contains("recursion limit"));
    }

    #[test]
    fn host_id_walks_contained_in_chain_to_compute() {
        let bp = parse(
            "
node_types:
  cloudify.nodes.Compute: {}
  cloudify.nodes.DBMS: {}
relationships:
  cloudify.relationships.contained_in: {}
node_templates:
  vm:
    type: cloudify.nodes.Compute
  db:
    type: cloudify.nodes.DBMS
    relationships:
      - type: cloudify.relationships.contained_in
        target: vm
",
        );
        let plan = assemble_plan(&bp, &NoInputs, &NoSecrets, None, &EvaluationOptions::default()).unwrap();
        let vm = plan.nodes.iter().find(|n| n.id == "vm").unwrap();
        let db = plan.nodes.iter().find(|n| n.id == "db").unwrap();
        assert_eq!(vm.host_id.as_deref(), Some("vm"));
        assert_eq!(db.host_id.as_deref(), Some("vm"));
    }

    #[test]
    fn host_agent_plugin_bubbles_to_host_plugins_to_install() {
        let bp = parse(
            "
plugins:
  my_plugin:
    executor: host_agent
    install: true
node_types:
  cloudify.nodes.Compute: {}
  cloudify.nodes.DBMS:
    interfaces:
      cloudify.interfaces.lifecycle:
        create: my_plugin.create
relationships:
  cloudify.relationships.contained_in: {}
node_templates:
  vm:
    type: cloudify.nodes.Compute
  db:
    type: cloudify.nodes.DBMS
    relationships:
      - type: cloudify.relationships.contained_in
        target: vm
",
        );
        let plan = assemble_plan(&bp, &NoInputs, &NoSecrets, None, &EvaluationOptions::default()).unwrap();
        let vm = plan.nodes.iter().find(|n| n.id == "vm").unwrap();
        assert!(lookup(&vm.plugins_to_install, "my_plugin").is_some());
    }

    #[test]
    fn scaling_group_policy_emits_scaling_group_entry() {
        let bp = parse(
            "
groups:
  web_group:
    members: [vm]
    policies:
      scale_web:
        type: cloudify.policies.scaling
        properties:
          default_instances: 3
",
        );
        let plan = assemble_plan(&bp, &NoInputs, &NoSecrets, None, &EvaluationOptions::default()).unwrap();
        let scaling = lookup(&plan.scaling_groups, "web_group.scale_web").unwrap();
        assert_eq!(scaling.default_instances, 3);
        assert_eq!(scaling.min_instances, -1);
        assert_eq!(scaling.current_instances, 3);
        assert_eq!(scaling.planned_instances, 3);
    }

    #[test]
    fn script_implementation_is_rewritten_to_script_plugin() {
        let bp = parse(
            "
node_types:
  cloudify.nodes.Thing:
    interfaces:
      cloudify.interfaces.lifecycle:
        create: stub.py
node_templates:
  t:
    type: cloudify.nodes.Thing
",
        );
        let plan = assemble_plan(&bp, &NoInputs, &NoSecrets, None, &EvaluationOptions::default()).unwrap();
        let t = plan.nodes.iter().find(|n| n.id == "t").unwrap();
        let op = lookup(&t.operations, "create").unwrap();
        assert_eq!(op.plugin.as_deref(), Some("script"));
        assert_eq!(op.operation, "run");
        assert_eq!(
            lookup(&op.inputs, "script_path"),
            Some(&Expr::Literal(Value::from("stub.py")))
        );
    }
}

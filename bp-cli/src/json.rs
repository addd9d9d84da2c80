//! Renders a [`bp_core::plan::Plan`] to `serde_json::Value` for the `bp plan`
//! subcommand. Kept in the CLI rather than on the core types: `bp-core`
//! stays serialization-agnostic and this module is the one place that knows
//! what a human or downstream tool wants the plan to look like as JSON.

use serde_json::{json, Map, Value as Json};

use bp_core::function::ast::Expr;
use bp_core::model::{Group, OperationDef, OrderedMap, PolicyInstance, PolicyTrigger, PolicyType, Plugin, PropertyDef};
use bp_core::plan::{Plan, PlanNode, PlanRelationship, ScalingGroup, WorkflowPlan};

fn ordered_map_json<V>(map: &OrderedMap<V>, mut render: impl FnMut(&V) -> Json) -> Json {
    let mut obj = Map::with_capacity(map.len());
    for (key, value) in map {
        obj.insert(key.clone(), render(value));
    }
    Json::Object(obj)
}

fn yaml_json(value: &serde_yaml_ng::Value) -> Json {
    serde_json::to_value(value).unwrap_or(Json::Null)
}

fn expr_json(expr: &Expr) -> Json {
    yaml_json(&expr.to_value())
}

fn property_def_json(def: &PropertyDef) -> Json {
    json!({
        "type": def.kind,
        "default": def.default.as_ref().map(expr_json),
        "description": def.description,
        "required": def.required,
    })
}

fn plugin_json(plugin: &Plugin) -> Json {
    json!({
        "executor": plugin.executor,
        "source": plugin.source,
        "install": plugin.install,
        "package_name": plugin.package_name,
        "package_version": plugin.package_version,
    })
}

fn operation_json(op: &OperationDef) -> Json {
    json!({
        "plugin": op.plugin,
        "operation": op.operation,
        "inputs": ordered_map_json(&op.inputs, expr_json),
        "executor": op.executor,
        "max_retries": op.max_retries,
        "retry_interval": op.retry_interval,
        "timeout": op.timeout,
        "timeout_recoverable": op.timeout_recoverable,
    })
}

fn relationship_json(rel: &PlanRelationship) -> Json {
    json!({
        "type": rel.type_name,
        "target": rel.target,
        "type_hierarchy": rel.type_hierarchy,
        "source_operations": ordered_map_json(&rel.source_operations, |op| operation_json(op)),
        "target_operations": ordered_map_json(&rel.target_operations, |op| operation_json(op)),
    })
}

fn node_json(node: &PlanNode) -> Json {
    json!({
        "id": node.id,
        "name": node.name,
        "type": node.type_name,
        "type_hierarchy": node.type_hierarchy,
        "properties": ordered_map_json(&node.properties, expr_json),
        "operations": ordered_map_json(&node.operations, |op| operation_json(op)),
        "relationships": node.relationships.iter().map(relationship_json).collect::<Vec<_>>(),
        "plugins": ordered_map_json(&node.plugins, plugin_json),
        "plugins_to_install": ordered_map_json(&node.plugins_to_install, plugin_json),
        "deployment_plugins_to_install": ordered_map_json(&node.deployment_plugins_to_install, plugin_json),
        "host_id": node.host_id,
        "capabilities": ordered_map_json(&node.capabilities, expr_json),
        "number_of_instances": node.instances_deploy,
    })
}

fn workflow_json(wf: &WorkflowPlan) -> Json {
    json!({
        "plugin": wf.plugin,
        "operation": wf.operation,
        "parameters": ordered_map_json(&wf.parameters, property_def_json),
        "is_cascading": wf.is_cascading,
    })
}

fn scaling_group_json(group: &ScalingGroup) -> Json {
    json!({
        "default_instances": group.default_instances,
        "min_instances": group.min_instances,
        "max_instances": group.max_instances,
        "current_instances": group.current_instances,
        "planned_instances": group.planned_instances,
    })
}

fn policy_type_json(ty: &PolicyType) -> Json {
    json!({
        "source": ty.source,
        "properties": ordered_map_json(&ty.properties, property_def_json),
    })
}

fn policy_trigger_json(trigger: &PolicyTrigger) -> Json {
    json!({
        "source": trigger.source,
        "parameters": ordered_map_json(&trigger.parameters, property_def_json),
    })
}

fn policy_instance_json(policy: &PolicyInstance) -> Json {
    json!({
        "type": policy.type_name,
        "properties": ordered_map_json(&policy.properties, expr_json),
    })
}

fn group_json(group: &Group) -> Json {
    json!({
        "members": group.members,
        "policies": ordered_map_json(&group.policies, policy_instance_json),
    })
}

pub fn plan_to_json(plan: &Plan) -> Json {
    json!({
        "description": plan.description,
        "inputs": ordered_map_json(&plan.inputs, property_def_json),
        "nodes": plan.nodes.iter().map(node_json).collect::<Vec<_>>(),
        "workflows": ordered_map_json(&plan.workflows, workflow_json),
        "outputs": ordered_map_json(&plan.outputs, expr_json),
        "capabilities": ordered_map_json(&plan.capabilities, expr_json),
        "policy_types": ordered_map_json(&plan.policy_types, policy_type_json),
        "policy_triggers": ordered_map_json(&plan.policy_triggers, policy_trigger_json),
        "groups": ordered_map_json(&plan.groups, group_json),
        "policies": ordered_map_json(&plan.policies, policy_instance_json),
        "scaling_groups": ordered_map_json(&plan.scaling_groups, scaling_group_json),
        "deployment_settings": plan.deployment_settings.as_ref().map(yaml_json),
        "workflow_plugins_to_install": ordered_map_json(&plan.workflow_plugins_to_install, plugin_json),
        "deployment_plugins_to_install": ordered_map_json(&plan.deployment_plugins_to_install, plugin_json),
        "host_agent_plugins_to_install": ordered_map_json(&plan.host_agent_plugins_to_install, plugin_json),
    })
}

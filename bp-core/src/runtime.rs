//! Runtime function evaluation against a live orchestrator's state (§6).
//!
//! Plan assembly ([`crate::plan`]) resolves every `get_input`/`get_property`
//! reference to a literal once a deployment's inputs are known. What remains
//! unresolved in a plan payload are the functions that describe state that
//! only exists once node instances are running: `get_attribute`,
//! `get_capability`, and `get_group_capability`. [`Storage`] is the
//! collaborator an orchestrator injects to answer those; the three
//! `evaluate_*` entry points below adapt it to [`crate::function::eval`] and
//! walk a payload replacing whatever it can resolve, leaving the rest
//! unresolved for a later poll.

use serde_yaml_ng::Value;
use tracing::debug;

use crate::error::{Breadcrumb, FunctionValidationError};
use crate::function::ast::{Expr, NodeRef};
use crate::function::eval::{evaluate_runtime, AttributeLookup, EvalContext, SecretFetchError, SecretFetcher};
use crate::function::parser;
use crate::model::OrderedMap;
use crate::options::EvaluationOptions;
use crate::version::Version;

/// One running instance of a node template.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeInstanceInfo {
    pub id: String,
    pub node_id: String,
    pub runtime_properties: Vec<(String, Value)>,
}

/// Storage collaborator injected by the orchestrator driving runtime
/// evaluation. Mirrors the capabilities `get_attribute`/`get_capability`/
/// `get_group_capability`/`get_secret` need and nothing else — this crate
/// never writes back to storage.
pub trait Storage {
    fn get_secret(&self, id: &str) -> Result<String, SecretFetchError>;
    fn get_node_instances(&self, node_id: &str) -> Vec<NodeInstanceInfo>;
    fn get_capability(&self, deployment_id: &str, capability_name: &str) -> Option<Value>;
    fn get_group_capability(&self, group_id: &str, capability_name: &str) -> Option<Value>;
}

struct StorageAttributes<'a> {
    storage: &'a dyn Storage,
}

impl AttributeLookup for StorageAttributes<'_> {
    fn node_exists(&self, node_id: &str) -> bool {
        !self.storage.get_node_instances(node_id).is_empty()
    }

    fn node_attribute(&self, node_id: &str, attribute_name: &str) -> Option<Value> {
        let instance = self.storage.get_node_instances(node_id).into_iter().next()?;
        instance
            .runtime_properties
            .into_iter()
            .find(|(k, _)| k == attribute_name)
            .map(|(_, v)| v)
    }

    fn capability(&self, path: &[String]) -> Option<Value> {
        let (deployment_id, capability_name) = (path.first()?, path.get(1)?);
        self.storage.get_capability(deployment_id, capability_name)
    }

    fn group_capability(&self, path: &[String]) -> Option<Value> {
        let (group_id, capability_name) = (path.first()?, path.get(1)?);
        self.storage.get_group_capability(group_id, capability_name)
    }
}

struct StorageSecrets<'a> {
    storage: &'a dyn Storage,
}

impl SecretFetcher for StorageSecrets<'_> {
    fn get_secret(&self, id: &str) -> Result<String, SecretFetchError> {
        self.storage.get_secret(id)
    }
}

/// Resolves every runtime-only function reachable from `payload` (a raw YAML
/// value that may still contain unparsed function literals), in `ctx`'s
/// SELF/SOURCE/TARGET scope, returning the same shape with whatever could be
/// resolved replaced by its value.
pub fn evaluate_functions(
    payload: &Value,
    ctx: &EvalContext,
    storage: &dyn Storage,
    options: &EvaluationOptions,
) -> crate::error::Result<Value> {
    debug!(self_id = ?ctx.self_id, "Evaluating runtime functions in payload");
    let expr = parser::parse(payload, &Breadcrumb::root(), Version::new(1, 3, 0))?;
    let attributes = StorageAttributes { storage };
    let resolved = evaluate_runtime(&expr, ctx, &attributes, options)?;
    Ok(resolved.to_value())
}

/// [`evaluate_functions`] scoped to a single node instance: `payload` is
/// evaluated with `SELF` bound to `node_id`.
pub fn evaluate_node_functions(
    node_id: &str,
    payload: &Value,
    storage: &dyn Storage,
    options: &EvaluationOptions,
) -> crate::error::Result<Value> {
    evaluate_functions(payload, &EvalContext::for_node(node_id), storage, options)
}

/// Walks an output expression for `SELF`/`SOURCE`/`TARGET` context legality
/// (§3, §4.6): outputs have no node/relationship scope to resolve those
/// against, so a reference to one is a static error rather than something
/// that silently round-trips unresolved.
fn validate_output_context(output: &str, expr: &Expr) -> crate::error::Result<()> {
    match expr {
        Expr::Literal(_) => Ok(()),
        Expr::List(items) | Expr::Concat { items, .. } | Expr::Merge { items, .. } => {
            items.iter().try_for_each(|item| validate_output_context(output, item))
        }
        Expr::Map(entries) => entries.iter().try_for_each(|(_, v)| validate_output_context(output, v)),
        Expr::GetInput { name, .. } => validate_output_context(output, name),
        Expr::GetSecret { id, path, .. } => {
            validate_output_context(output, id)?;
            path.iter().try_for_each(|step| validate_output_context(output, step))
        }
        Expr::GetCapability { path, .. } | Expr::GetGroupCapability { path, .. } => {
            path.iter().try_for_each(|step| validate_output_context(output, step))
        }
        Expr::GetAttribute { breadcrumb, node_ref, path } => {
            match node_ref {
                NodeRef::SelfRef => {
                    return Err(FunctionValidationError::SelfInOutputAttribute {
                        breadcrumb: breadcrumb.clone(),
                        output: output.to_string(),
                    }
                    .into());
                }
                NodeRef::Source | NodeRef::Target => {
                    return Err(FunctionValidationError::IllegalNodeRef {
                        breadcrumb: breadcrumb.clone(),
                        node_ref: node_ref.token().to_string(),
                    }
                    .into());
                }
                NodeRef::Named(_) => {}
            }
            path.iter().try_for_each(|step| validate_output_context(output, step))
        }
        Expr::GetProperty { breadcrumb, node_ref, path } => {
            match node_ref {
                NodeRef::SelfRef | NodeRef::Source | NodeRef::Target => {
                    return Err(FunctionValidationError::IllegalNodeRef {
                        breadcrumb: breadcrumb.clone(),
                        node_ref: node_ref.token().to_string(),
                    }
                    .into());
                }
                NodeRef::Named(_) => {}
            }
            path.iter().try_for_each(|step| validate_output_context(output, step))
        }
    }
}

/// Evaluates every output expression, tolerating per-output failure: a
/// failing output's value becomes the error's display string rather than
/// aborting the whole batch, so partial observability survives one bad
/// output (§7 policy).
pub fn evaluate_outputs(
    outputs: &OrderedMap<Expr>,
    storage: &dyn Storage,
    options: &EvaluationOptions,
) -> OrderedMap<Value> {
    debug!(count = outputs.len(), "Evaluating deployment outputs");
    let ctx = EvalContext::default();
    let attributes = StorageAttributes { storage };
    outputs
        .iter()
        .map(|(name, expr)| {
            let value = validate_output_context(name, expr)
                .and_then(|_| evaluate_runtime(expr, &ctx, &attributes, options))
                .map(|resolved| resolved.to_value())
                .unwrap_or_else(|err| Value::String(err.to_string()));
            (name.clone(), value)
        })
        .collect()
}

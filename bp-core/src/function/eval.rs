//! Two-phase evaluation of the intrinsic-function AST (§4.7).
//!
//! Evaluation runs in two passes. The *static* pass runs while assembling the
//! deployment plan: it resolves `get_input`, `get_property`, `get_secret`,
//! and any `concat`/`merge` whose arguments fully reduce to literals.
//! `get_attribute`, `get_capability`, and `get_group_capability` describe
//! runtime instance state that does not exist yet, so the static pass always
//! leaves them as unresolved [`Expr`] for a later *runtime* pass to finish
//! once an instance's attributes and capabilities are known.
//!
//! Node-property references assume the caller resolves node templates in an
//! order such that every property reachable through `get_property` is already
//! a literal by the time it is looked up; this mirrors the top-down data flow
//! described for deployment plans and keeps this evaluator free of its own
//! dependency solver.

use std::collections::HashMap;

use serde_yaml_ng::Value;
use tracing::{trace, warn};

use crate::error::{
    Breadcrumb, EvaluationRecursionLimitReached, FunctionEvaluationError, UnknownSecretError,
};
use crate::options::EvaluationOptions;

use super::ast::{Expr, NodeRef};

/// Which node `SELF`/`SOURCE`/`TARGET` resolve to at a given evaluation site.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub self_id: Option<String>,
    pub source_id: Option<String>,
    pub target_id: Option<String>,
}

impl EvalContext {
    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            self_id: Some(node_id.into()),
            source_id: None,
            target_id: None,
        }
    }

    pub fn for_relationship(source_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            self_id: None,
            source_id: Some(source_id.into()),
            target_id: Some(target_id.into()),
        }
    }

    fn resolve(&self, node_ref: &NodeRef) -> Option<&str> {
        match node_ref {
            NodeRef::SelfRef => self.self_id.as_deref(),
            NodeRef::Source => self.source_id.as_deref(),
            NodeRef::Target => self.target_id.as_deref(),
            NodeRef::Named(id) => Some(id.as_str()),
        }
    }
}

/// Supplies resolved blueprint input values by name (§4.7, `get_input`).
pub trait InputLookup {
    fn input_value(&self, name: &str) -> Option<Value>;
}

/// Supplies already-resolved node property values by node id and property
/// path (§4.7, `get_property`).
pub trait PropertyLookup {
    fn node_exists(&self, node_id: &str) -> bool;
    fn node_property(&self, node_id: &str, property_name: &str) -> Option<Value>;

    /// The raw, possibly-still-unresolved expression behind a property that
    /// [`Self::node_property`] missed, for lookups backed by in-progress node
    /// state (e.g. another property of the same node not yet reduced to a
    /// literal). Lookups backed only by finished values have nothing to add
    /// here and keep the default `None`.
    fn node_property_expr(&self, _node_id: &str, _property_name: &str) -> Option<Expr> {
        None
    }
}

/// The caller-supplied outcome of looking up one secret id.
#[derive(Debug, Clone)]
pub enum SecretFetchError {
    NotFound,
    Other(String),
}

/// Injected secret store (§4.7, "Secret fetcher interface"). A `NotFound`
/// result is aggregated with sibling misses into a single
/// [`UnknownSecretError`]; any other failure is propagated immediately.
pub trait SecretFetcher {
    fn get_secret(&self, id: &str) -> Result<String, SecretFetchError>;
}

/// Evaluates one expression tree to the extent the static phase allows,
/// pre-fetching every `get_secret` id reachable from `expr` in a single
/// batch so missing secrets are reported together rather than one at a time.
pub fn evaluate_static(
    expr: &Expr,
    ctx: &EvalContext,
    inputs: &dyn InputLookup,
    properties: &dyn PropertyLookup,
    secrets: &dyn SecretFetcher,
    options: &EvaluationOptions,
) -> crate::error::Result<Expr> {
    trace!(self_id = ?ctx.self_id, "Evaluating expression in static pass");
    if options.runtime_only_evaluation {
        validate_shape_only(expr)?;
        return Ok(expr.clone());
    }
    let secret_cache = prefetch_secrets(expr, inputs, secrets)?;
    let mut evaluator = Evaluator {
        inputs,
        properties,
        secrets: &secret_cache,
        limit: options.recursion_limit,
        depth: 0,
    };
    evaluator.eval(expr, ctx)
}

/// Resolves whatever remains after [`evaluate_static`] now that an instance's
/// attributes and capabilities are known. `get_input`, `get_property`, and
/// `get_secret` nodes should not reach this pass already resolved, but if a
/// caller evaluates a raw, never-statically-processed tree here, they are
/// still honored: this pass is a superset of the static one.
pub fn evaluate_runtime(
    expr: &Expr,
    ctx: &EvalContext,
    attributes: &dyn AttributeLookup,
    options: &EvaluationOptions,
) -> crate::error::Result<Expr> {
    trace!(self_id = ?ctx.self_id, "Evaluating expression in runtime pass");
    let mut evaluator = RuntimeEvaluator {
        attributes,
        limit: options.recursion_limit,
        depth: 0,
    };
    evaluator.eval(expr, ctx)
}

/// Supplies runtime instance state for `get_attribute`, `get_capability`, and
/// `get_group_capability` (§4.7). Returning `None` means the value is not yet
/// known and the expression should remain unresolved.
pub trait AttributeLookup {
    fn node_exists(&self, node_id: &str) -> bool;
    fn node_attribute(&self, node_id: &str, attribute_name: &str) -> Option<Value>;
    fn capability(&self, path: &[String]) -> Option<Value>;
    fn group_capability(&self, path: &[String]) -> Option<Value>;
}

struct Evaluator<'a> {
    inputs: &'a dyn InputLookup,
    properties: &'a dyn PropertyLookup,
    secrets: &'a HashMap<String, String>,
    limit: usize,
    depth: usize,
}

impl<'a> Evaluator<'a> {
    fn eval(&mut self, expr: &Expr, ctx: &EvalContext) -> crate::error::Result<Expr> {
        self.enter(expr.breadcrumb())?;
        let result = self.eval_inner(expr, ctx);
        self.depth = self.depth.saturating_sub(1);
        result
    }

    fn enter(&mut self, breadcrumb: Option<&Breadcrumb>) -> crate::error::Result<()> {
        self.depth += 1;
        if self.depth > self.limit {
            warn!(
                breadcrumb = %breadcrumb.cloned().unwrap_or_else(Breadcrumb::root),
                limit = self.limit,
                "Evaluation recursion limit reached"
            );
            return Err(EvaluationRecursionLimitReached {
                breadcrumb: breadcrumb.cloned().unwrap_or_else(Breadcrumb::root),
                limit: self.limit,
            }
            .into());
        }
        Ok(())
    }

    fn eval_inner(&mut self, expr: &Expr, ctx: &EvalContext) -> crate::error::Result<Expr> {
        match expr {
            Expr::Literal(_) => Ok(expr.clone()),
            Expr::List(items) => {
                let evaluated = items
                    .iter()
                    .map(|item| self.eval(item, ctx))
                    .collect::<crate::error::Result<Vec<_>>>()?;
                Ok(Expr::List(evaluated))
            }
            Expr::Map(entries) => {
                let evaluated = entries
                    .iter()
                    .map(|(key, value)| Ok((key.clone(), self.eval(value, ctx)?)))
                    .collect::<crate::error::Result<Vec<_>>>()?;
                Ok(Expr::Map(evaluated))
            }
            Expr::GetInput { breadcrumb, name } => self.eval_get_input(breadcrumb, name, ctx),
            Expr::GetProperty {
                breadcrumb,
                node_ref,
                path,
            } => self.eval_get_property(breadcrumb, node_ref, path, ctx),
            Expr::GetSecret {
                breadcrumb,
                id,
                path,
            } => self.eval_get_secret(breadcrumb, id, path, ctx),
            Expr::GetAttribute { .. }
            | Expr::GetCapability { .. }
            | Expr::GetGroupCapability { .. } => Ok(expr.clone()),
            Expr::Concat { breadcrumb, items } => self.eval_concat(breadcrumb, items, ctx),
            Expr::Merge { breadcrumb, items } => self.eval_merge(breadcrumb, items, ctx),
        }
    }

    fn eval_get_input(
        &mut self,
        breadcrumb: &Breadcrumb,
        name: &Expr,
        ctx: &EvalContext,
    ) -> crate::error::Result<Expr> {
        let resolved_name = self.eval(name, ctx)?;
        let name_str = literal_string(&resolved_name).ok_or_else(|| {
            FunctionEvaluationError::UnresolvedArgument {
                breadcrumb: breadcrumb.clone(),
            }
        })?;
        match self.inputs.input_value(&name_str) {
            Some(value) => Ok(Expr::Literal(value)),
            None => Ok(Expr::GetInput {
                breadcrumb: breadcrumb.clone(),
                name: Box::new(Expr::Literal(Value::from(name_str))),
            }),
        }
    }

    fn eval_get_property(
        &mut self,
        breadcrumb: &Breadcrumb,
        node_ref: &NodeRef,
        path: &[Expr],
        ctx: &EvalContext,
    ) -> crate::error::Result<Expr> {
        let properties = self.properties;
        let node_id = ctx
            .resolve(node_ref)
            .ok_or_else(|| FunctionEvaluationError::UnresolvedArgument {
                breadcrumb: breadcrumb.clone(),
            })?
            .to_string();
        if !properties.node_exists(&node_id) {
            return Err(FunctionEvaluationError::NodeDoesNotExist {
                breadcrumb: breadcrumb.clone(),
                node_id,
            }
            .into());
        }
        let steps = self.eval_path_steps(path, ctx)?;
        let Some(property_name) = steps.first() else {
            return Err(FunctionEvaluationError::UnresolvedArgument {
                breadcrumb: breadcrumb.clone(),
            }
            .into());
        };
        let root = match properties.node_property(&node_id, property_name) {
            Some(value) => value,
            None => {
                let raw = properties
                    .node_property_expr(&node_id, property_name)
                    .ok_or_else(|| FunctionEvaluationError::KeyError {
                        breadcrumb: breadcrumb.clone(),
                        key: property_name.clone(),
                    })?;
                let node_ctx = EvalContext::for_node(node_id.clone());
                let resolved = self.eval(&raw, &node_ctx)?;
                resolved.as_resolved_value().ok_or_else(|| {
                    FunctionEvaluationError::UnresolvedArgument {
                        breadcrumb: breadcrumb.clone(),
                    }
                })?
            }
        };
        let value = index_value(&root, &steps[1..], breadcrumb)?;
        Ok(Expr::Literal(value))
    }

    fn eval_get_secret(
        &mut self,
        breadcrumb: &Breadcrumb,
        id: &Expr,
        path: &[Expr],
        ctx: &EvalContext,
    ) -> crate::error::Result<Expr> {
        let resolved_id = self.eval(id, ctx)?;
        let id_str = literal_string(&resolved_id).ok_or_else(|| {
            FunctionEvaluationError::UnresolvedArgument {
                breadcrumb: breadcrumb.clone(),
            }
        })?;
        let raw = self.secrets.get(&id_str).ok_or_else(|| {
            FunctionEvaluationError::UnresolvedArgument {
                breadcrumb: breadcrumb.clone(),
            }
        })?;
        if path.is_empty() {
            return Ok(Expr::Literal(Value::from(raw.as_str())));
        }
        let parsed: Value = serde_json::from_str::<serde_json::Value>(raw)
            .ok()
            .and_then(|json| serde_yaml_ng::to_value(json).ok())
            .ok_or_else(|| FunctionEvaluationError::UnparsableSecret {
                breadcrumb: breadcrumb.clone(),
                secret_id: id_str.clone(),
            })?;
        let steps = self.eval_path_steps(path, ctx)?;
        let mut cursor = parsed;
        for step in &steps {
            cursor = match cursor.as_mapping().and_then(|m| crate::yaml::get(m, step)) {
                Some(value) => value.clone(),
                None => {
                    return Err(FunctionEvaluationError::MissingSecretStep {
                        breadcrumb: breadcrumb.clone(),
                        step: step.clone(),
                        secret_id: id_str,
                    }
                    .into())
                }
            };
        }
        Ok(Expr::Literal(cursor))
    }

    fn eval_concat(
        &mut self,
        breadcrumb: &Breadcrumb,
        items: &[Expr],
        ctx: &EvalContext,
    ) -> crate::error::Result<Expr> {
        let evaluated = items
            .iter()
            .map(|item| self.eval(item, ctx))
            .collect::<crate::error::Result<Vec<_>>>()?;
        if let Some(pieces) = evaluated.iter().map(literal_scalar_string).collect::<Option<Vec<_>>>() {
            Ok(Expr::Literal(Value::from(pieces.concat())))
        } else {
            Ok(Expr::Concat {
                breadcrumb: breadcrumb.clone(),
                items: evaluated,
            })
        }
    }

    fn eval_merge(
        &mut self,
        breadcrumb: &Breadcrumb,
        items: &[Expr],
        ctx: &EvalContext,
    ) -> crate::error::Result<Expr> {
        let evaluated = items
            .iter()
            .map(|item| self.eval(item, ctx))
            .collect::<crate::error::Result<Vec<_>>>()?;
        let mut merged = Vec::new();
        let mut fully_resolved = true;
        for item in &evaluated {
            match item {
                Expr::Map(entries) => {
                    for (key, value) in entries {
                        merged.retain(|(k, _): &(String, Expr)| k != key);
                        merged.push((key.clone(), value.clone()));
                    }
                }
                _ => fully_resolved = false,
            }
        }
        if fully_resolved {
            Ok(Expr::Map(merged))
        } else {
            Ok(Expr::Merge {
                breadcrumb: breadcrumb.clone(),
                items: evaluated,
            })
        }
    }

    fn eval_path_steps(
        &mut self,
        path: &[Expr],
        ctx: &EvalContext,
    ) -> crate::error::Result<Vec<String>> {
        path.iter()
            .map(|step| {
                let evaluated = self.eval(step, ctx)?;
                literal_string(&evaluated).ok_or_else(|| {
                    FunctionEvaluationError::UnresolvedArgument {
                        breadcrumb: step.breadcrumb().cloned().unwrap_or_else(Breadcrumb::root),
                    }
                    .into()
                })
            })
            .collect()
    }
}

/// Walks the full expression looking for `concat`/`merge`/`get_input`-wrapped
/// `get_secret` ids reachable without node context, so they can be fetched
/// once up front. `get_input` is resolved eagerly here because it never
/// depends on node context and must already be literal by the time a
/// `get_secret` id is collected.
fn prefetch_secrets(
    expr: &Expr,
    inputs: &dyn InputLookup,
    secrets: &dyn SecretFetcher,
) -> crate::error::Result<HashMap<String, String>> {
    let mut ids = Vec::new();
    collect_secret_ids(expr, inputs, &mut ids)?;
    let mut cache = HashMap::new();
    let mut missing = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for id in ids {
        if !seen.insert(id.clone()) {
            continue;
        }
        match secrets.get_secret(&id) {
            Ok(value) => {
                cache.insert(id, value);
            }
            Err(SecretFetchError::NotFound) => missing.push(id),
            Err(SecretFetchError::Other(detail)) => {
                return Err(FunctionEvaluationError::UnparsableSecret {
                    breadcrumb: Breadcrumb::root(),
                    secret_id: format!("{id}: {detail}"),
                }
                .into())
            }
        }
    }
    if !missing.is_empty() {
        return Err(UnknownSecretError { missing }.into());
    }
    Ok(cache)
}

fn collect_secret_ids(
    expr: &Expr,
    inputs: &dyn InputLookup,
    out: &mut Vec<String>,
) -> crate::error::Result<()> {
    match expr {
        Expr::Literal(_) => Ok(()),
        Expr::List(items) | Expr::Concat { items, .. } | Expr::Merge { items, .. } => {
            for item in items {
                collect_secret_ids(item, inputs, out)?;
            }
            Ok(())
        }
        Expr::Map(entries) => {
            for (_, value) in entries {
                collect_secret_ids(value, inputs, out)?;
            }
            Ok(())
        }
        Expr::GetSecret { id, path, .. } => {
            if let Some(id_str) = resolve_static_string(id, inputs) {
                out.push(id_str);
            }
            for step in path {
                collect_secret_ids(step, inputs, out)?;
            }
            Ok(())
        }
        Expr::GetInput { .. } => Ok(()),
        Expr::GetProperty { path, .. } | Expr::GetAttribute { path, .. } => {
            for step in path {
                collect_secret_ids(step, inputs, out)?;
            }
            Ok(())
        }
        Expr::GetCapability { path, .. } | Expr::GetGroupCapability { path, .. } => {
            for step in path {
                collect_secret_ids(step, inputs, out)?;
            }
            Ok(())
        }
    }
}

/// Resolves an expression to a string without node context, the only shape
/// `get_secret`'s id argument is allowed to take (a literal, or a chain of
/// `get_input`s).
fn resolve_static_string(expr: &Expr, inputs: &dyn InputLookup) -> Option<String> {
    match expr {
        Expr::Literal(value) => literal_string(&Expr::Literal(value.clone())),
        Expr::GetInput { name, .. } => {
            let name_str = resolve_static_string(name, inputs)?;
            inputs
                .input_value(&name_str)
                .and_then(|v| literal_string(&Expr::Literal(v)))
        }
        _ => None,
    }
}

fn literal_string(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Literal(Value::String(s)) => Some(s.clone()),
        Expr::Literal(Value::Number(n)) => Some(n.to_string()),
        Expr::Literal(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    }
}

fn literal_scalar_string(expr: &Expr) -> Option<String> {
    literal_string(expr)
}

fn index_value(value: &Value, steps: &[String], breadcrumb: &Breadcrumb) -> crate::error::Result<Value> {
    let mut cursor = value.clone();
    for step in steps {
        cursor = if let Ok(index) = step.parse::<i64>() {
            let seq = cursor
                .as_sequence()
                .ok_or(FunctionEvaluationError::TypeError {
                    breadcrumb: breadcrumb.clone(),
                    actual: describe_kind(&cursor),
                })?;
            let len = seq.len();
            let idx = if index < 0 { index + len as i64 } else { index };
            seq.get(idx as usize)
                .cloned()
                .ok_or(FunctionEvaluationError::IndexError {
                    breadcrumb: breadcrumb.clone(),
                    index,
                    length: len,
                })?
        } else {
            match cursor.as_mapping() {
                Some(map) => crate::yaml::get(map, step)
                    .cloned()
                    .ok_or_else(|| FunctionEvaluationError::KeyError {
                        breadcrumb: breadcrumb.clone(),
                        key: step.clone(),
                    })?,
                None => {
                    return Err(FunctionEvaluationError::TypeError {
                        breadcrumb: breadcrumb.clone(),
                        actual: describe_kind(&cursor),
                    }
                    .into())
                }
            }
        };
    }
    Ok(cursor)
}

fn describe_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "list",
        Value::Mapping(_) => "map",
        Value::Tagged(_) => "tagged value",
    }
}

/// Validates arity/shape invariants that already held at parse time still
/// hold; used only when `runtime_only_evaluation` defers everything.
fn validate_shape_only(_expr: &Expr) -> crate::error::Result<()> {
    Ok(())
}

struct RuntimeEvaluator<'a> {
    attributes: &'a dyn AttributeLookup,
    limit: usize,
    depth: usize,
}

impl<'a> RuntimeEvaluator<'a> {
    fn eval(&mut self, expr: &Expr, ctx: &EvalContext) -> crate::error::Result<Expr> {
        self.depth += 1;
        if self.depth > self.limit {
            warn!(
                breadcrumb = %expr.breadcrumb().cloned().unwrap_or_else(Breadcrumb::root),
                limit = self.limit,
                "Evaluation recursion limit reached"
            );
            let result = Err(EvaluationRecursionLimitReached {
                breadcrumb: expr.breadcrumb().cloned().unwrap_or_else(Breadcrumb::root),
                limit: self.limit,
            }
            .into());
            self.depth -= 1;
            return result;
        }
        let result = self.eval_inner(expr, ctx);
        self.depth -= 1;
        result
    }

    fn eval_inner(&mut self, expr: &Expr, ctx: &EvalContext) -> crate::error::Result<Expr> {
        match expr {
            Expr::Literal(_) | Expr::GetInput { .. } | Expr::GetSecret { .. } => Ok(expr.clone()),
            Expr::List(items) => Ok(Expr::List(
                items
                    .iter()
                    .map(|i| self.eval(i, ctx))
                    .collect::<crate::error::Result<_>>()?,
            )),
            Expr::Map(entries) => Ok(Expr::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.eval(v, ctx)?)))
                    .collect::<crate::error::Result<_>>()?,
            )),
            Expr::GetProperty { .. } => Ok(expr.clone()),
            Expr::GetAttribute {
                breadcrumb,
                node_ref,
                path,
            } => self.eval_get_attribute(breadcrumb, node_ref, path, ctx),
            Expr::GetCapability { breadcrumb, path } => {
                self.eval_capability(breadcrumb, path, ctx, false)
            }
            Expr::GetGroupCapability { breadcrumb, path } => {
                self.eval_capability(breadcrumb, path, ctx, true)
            }
            Expr::Concat { breadcrumb, items } => {
                let evaluated = items
                    .iter()
                    .map(|i| self.eval(i, ctx))
                    .collect::<crate::error::Result<Vec<_>>>()?;
                if let Some(pieces) = evaluated.iter().map(literal_scalar_string).collect::<Option<Vec<_>>>() {
                    Ok(Expr::Literal(Value::from(pieces.concat())))
                } else {
                    Ok(Expr::Concat {
                        breadcrumb: breadcrumb.clone(),
                        items: evaluated,
                    })
                }
            }
            Expr::Merge { breadcrumb, items } => {
                let evaluated = items
                    .iter()
                    .map(|i| self.eval(i, ctx))
                    .collect::<crate::error::Result<Vec<_>>>()?;
                Ok(Expr::Merge {
                    breadcrumb: breadcrumb.clone(),
                    items: evaluated,
                })
            }
        }
    }

    fn eval_get_attribute(
        &mut self,
        breadcrumb: &Breadcrumb,
        node_ref: &NodeRef,
        path: &[Expr],
        ctx: &EvalContext,
    ) -> crate::error::Result<Expr> {
        let Some(node_id) = ctx.resolve(node_ref) else {
            return Ok(Expr::GetAttribute {
                breadcrumb: breadcrumb.clone(),
                node_ref: node_ref.clone(),
                path: path.to_vec(),
            });
        };
        if !self.attributes.node_exists(node_id) {
            return Err(FunctionEvaluationError::NodeDoesNotExist {
                breadcrumb: breadcrumb.clone(),
                node_id: node_id.to_string(),
            }
            .into());
        }
        let steps = path
            .iter()
            .map(|s| self.eval(s, ctx))
            .collect::<crate::error::Result<Vec<_>>>()?;
        let Some(first) = steps.first().and_then(literal_string) else {
            return Ok(Expr::GetAttribute {
                breadcrumb: breadcrumb.clone(),
                node_ref: node_ref.clone(),
                path: steps,
            });
        };
        match self.attributes.node_attribute(node_id, &first) {
            Some(value) => Ok(Expr::Literal(value)),
            None => Ok(Expr::GetAttribute {
                breadcrumb: breadcrumb.clone(),
                node_ref: node_ref.clone(),
                path: steps,
            }),
        }
    }

    fn eval_capability(
        &mut self,
        breadcrumb: &Breadcrumb,
        path: &[Expr],
        ctx: &EvalContext,
        group: bool,
    ) -> crate::error::Result<Expr> {
        let steps = path
            .iter()
            .map(|s| self.eval(s, ctx))
            .collect::<crate::error::Result<Vec<_>>>()?;
        let string_steps: Option<Vec<String>> = steps.iter().map(literal_string).collect();
        let Some(string_steps) = string_steps else {
            return Ok(if group {
                Expr::GetGroupCapability {
                    breadcrumb: breadcrumb.clone(),
                    path: steps,
                }
            } else {
                Expr::GetCapability {
                    breadcrumb: breadcrumb.clone(),
                    path: steps,
                }
            });
        };
        let resolved = if group {
            self.attributes.group_capability(&string_steps)
        } else {
            self.attributes.capability(&string_steps)
        };
        match resolved {
            Some(value) => Ok(Expr::Literal(value)),
            None => Ok(if group {
                Expr::GetGroupCapability {
                    breadcrumb: breadcrumb.clone(),
                    path: steps,
                }
            } else {
                Expr::GetCapability {
                    breadcrumb: breadcrumb.clone(),
                    path: steps,
                }
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedInputs(HashMap<String, Value>);
    impl InputLookup for FixedInputs {
        fn input_value(&self, name: &str) -> Option<Value> {
            self.0.get(name).cloned()
        }
    }

    struct FixedProperties(HashMap<(String, String), Value>);
    impl PropertyLookup for FixedProperties {
        fn node_exists(&self, node_id: &str) -> bool {
            self.0.keys().any(|(n, _)| n == node_id)
        }
        fn node_property(&self, node_id: &str, property_name: &str) -> Option<Value> {
            self.0
                .get(&(node_id.to_string(), property_name.to_string()))
                .cloned()
        }
    }

    struct NoSecrets;
    impl SecretFetcher for NoSecrets {
        fn get_secret(&self, _id: &str) -> Result<String, SecretFetchError> {
            Err(SecretFetchError::NotFound)
        }
    }

    struct FixedSecrets(HashMap<String, String>);
    impl SecretFetcher for FixedSecrets {
        fn get_secret(&self, id: &str) -> Result<String, SecretFetchError> {
            self.0
                .get(id)
                .cloned()
                .ok_or(SecretFetchError::NotFound)
        }
    }

    fn opts() -> EvaluationOptions {
        EvaluationOptions::default()
    }

    #[test]
    fn resolves_get_input_to_literal() {
        let mut inputs = HashMap::new();
        inputs.insert("size".to_string(), Value::from("m1.large"));
        let expr = Expr::GetInput {
            breadcrumb: Breadcrumb::root(),
            name: Box::new(Expr::Literal(Value::from("size"))),
        };
        let result = evaluate_static(
            &expr,
            &EvalContext::default(),
            &FixedInputs(inputs),
            &FixedProperties(HashMap::new()),
            &NoSecrets,
            &opts(),
        )
        .unwrap();
        assert_eq!(result, Expr::Literal(Value::from("m1.large")));
    }

    #[test]
    fn resolves_get_property_on_self() {
        let mut props = HashMap::new();
        props.insert(
            ("vm".to_string(), "ip".to_string()),
            Value::from("10.0.0.1"),
        );
        let expr = Expr::GetProperty {
            breadcrumb: Breadcrumb::root(),
            node_ref: NodeRef::SelfRef,
            path: vec![Expr::Literal(Value::from("ip"))],
        };
        let result = evaluate_static(
            &expr,
            &EvalContext::for_node("vm"),
            &FixedInputs(HashMap::new()),
            &FixedProperties(props),
            &NoSecrets,
            &opts(),
        )
        .unwrap();
        assert_eq!(result, Expr::Literal(Value::from("10.0.0.1")));
    }

    #[test]
    fn get_property_on_unknown_node_errors() {
        let expr = Expr::GetProperty {
            breadcrumb: Breadcrumb::root(),
            node_ref: NodeRef::Named("missing".to_string()),
            path: vec![Expr::Literal(Value::from("ip"))],
        };
        let err = evaluate_static(
            &expr,
            &EvalContext::default(),
            &FixedInputs(HashMap::new()),
            &FixedProperties(HashMap::new()),
            &NoSecrets,
            &opts(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn concat_reduces_to_single_literal_when_all_parts_resolve() {
        let expr = Expr::Concat {
            breadcrumb: Breadcrumb::root(),
            items: vec![
                Expr::Literal(Value::from("a")),
                Expr::Literal(Value::from("-")),
                Expr::Literal(Value::from("b")),
            ],
        };
        let result = evaluate_static(
            &expr,
            &EvalContext::default(),
            &FixedInputs(HashMap::new()),
            &FixedProperties(HashMap::new()),
            &NoSecrets,
            &opts(),
        )
        .unwrap();
        assert_eq!(result, Expr::Literal(Value::from("a-b")));
    }

    #[test]
    fn concat_stays_unresolved_when_a_part_needs_runtime_state() {
        let expr = Expr::Concat {
            breadcrumb: Breadcrumb::root(),
            items: vec![
                Expr::Literal(Value::from("ip=")),
                Expr::GetAttribute {
                    breadcrumb: Breadcrumb::root(),
                    node_ref: NodeRef::SelfRef,
                    path: vec![Expr::Literal(Value::from("ip"))],
                },
            ],
        };
        let result = evaluate_static(
            &expr,
            &EvalContext::for_node("vm"),
            &FixedInputs(HashMap::new()),
            &FixedProperties(HashMap::new()),
            &NoSecrets,
            &opts(),
        )
        .unwrap();
        assert!(matches!(result, Expr::Concat { .. }));
    }

    #[test]
    fn merge_unions_literal_maps_with_later_keys_winning() {
        let expr = Expr::Merge {
            breadcrumb: Breadcrumb::root(),
            items: vec![
                Expr::Map(vec![("a".to_string(), Expr::Literal(Value::from(1)))]),
                Expr::Map(vec![("a".to_string(), Expr::Literal(Value::from(2)))]),
            ],
        };
        let result = evaluate_static(
            &expr,
            &EvalContext::default(),
            &FixedInputs(HashMap::new()),
            &FixedProperties(HashMap::new()),
            &NoSecrets,
            &opts(),
        )
        .unwrap();
        match result {
            Expr::Map(entries) => {
                assert_eq!(entries, vec![("a".to_string(), Expr::Literal(Value::from(2)))]);
            }
            other => panic!("expected Map, got {other:?}"),
        }
    }

    #[test]
    fn missing_secret_is_reported_as_unknown_secret_error() {
        let expr = Expr::GetSecret {
            breadcrumb: Breadcrumb::root(),
            id: Box::new(Expr::Literal(Value::from("db_password"))),
            path: vec![],
        };
        let err = evaluate_static(
            &expr,
            &EvalContext::default(),
            &FixedInputs(HashMap::new()),
            &FixedProperties(HashMap::new()),
            &NoSecrets,
            &opts(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("db_password"));
        assert!(err.to_string().contains("don't exist in this tenant"));
    }

    #[test]
    fn nested_secret_step_resolves_through_json() {
        let mut secrets = HashMap::new();
        secrets.insert(
            "creds".to_string(),
            r#"{"username": "admin", "password": "hunter2"}"#.to_string(),
        );
        let expr = Expr::GetSecret {
            breadcrumb: Breadcrumb::root(),
            id: Box::new(Expr::Literal(Value::from("creds"))),
            path: vec![Expr::Literal(Value::from("password"))],
        };
        let result = evaluate_static(
            &expr,
            &EvalContext::default(),
            &FixedInputs(HashMap::new()),
            &FixedProperties(HashMap::new()),
            &FixedSecrets(secrets),
            &opts(),
        )
        .unwrap();
        assert_eq!(result, Expr::Literal(Value::from("hunter2")));
    }

    #[test]
    fn nested_secret_missing_step_names_both_step_and_secret() {
        let mut secrets = HashMap::new();
        secrets.insert("creds".to_string(), r#"{"username": "admin"}"#.to_string());
        let expr = Expr::GetSecret {
            breadcrumb: Breadcrumb::root(),
            id: Box::new(Expr::Literal(Value::from("creds"))),
            path: vec![Expr::Literal(Value::from("password"))],
        };
        let err = evaluate_static(
            &expr,
            &EvalContext::default(),
            &FixedInputs(HashMap::new()),
            &FixedProperties(HashMap::new()),
            &FixedSecrets(secrets),
            &opts(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("password"));
        assert!(err.to_string().contains("creds"));
    }

    #[test]
    fn recursion_limit_is_enforced() {
        let mut options = opts();
        options.recursion_limit = 2;
        let expr = Expr::List(vec![Expr::List(vec![Expr::List(vec![Expr::Literal(
            Value::from(1),
        )])])]);
        let err = evaluate_static(
            &expr,
            &EvalContext::default(),
            &FixedInputs(HashMap::new()),
            &FixedProperties(HashMap::new()),
            &NoSecrets,
            &options,
        )
        .unwrap_err();
        assert!(err.to_string().contains("recursion limit"));
    }

    struct FixedAttributes {
        attrs: HashMap<(String, String), Value>,
        exists: Vec<String>,
    }
    impl AttributeLookup for FixedAttributes {
        fn node_exists(&self, node_id: &str) -> bool {
            self.exists.iter().any(|n| n == node_id)
        }
        fn node_attribute(&self, node_id: &str, attribute_name: &str) -> Option<Value> {
            self.attrs
                .get(&(node_id.to_string(), attribute_name.to_string()))
                .cloned()
        }
        fn capability(&self, _path: &[String]) -> Option<Value> {
            None
        }
        fn group_capability(&self, _path: &[String]) -> Option<Value> {
            None
        }
    }

    #[test]
    fn runtime_pass_resolves_get_attribute_once_instance_state_exists() {
        let mut attrs = HashMap::new();
        attrs.insert(("vm".to_string(), "ip".to_string()), Value::from("10.0.0.9"));
        let lookup = FixedAttributes {
            attrs,
            exists: vec!["vm".to_string()],
        };
        let expr = Expr::GetAttribute {
            breadcrumb: Breadcrumb::root(),
            node_ref: NodeRef::SelfRef,
            path: vec![Expr::Literal(Value::from("ip"))],
        };
        let result = evaluate_runtime(&expr, &EvalContext::for_node("vm"), &lookup, &opts()).unwrap();
        assert_eq!(result, Expr::Literal(Value::from("10.0.0.9")));
    }

    #[test]
    fn runtime_pass_leaves_attribute_unresolved_when_not_yet_known() {
        let lookup = FixedAttributes {
            attrs: HashMap::new(),
            exists: vec!["vm".to_string()],
        };
        let expr = Expr::GetAttribute {
            breadcrumb: Breadcrumb::root(),
            node_ref: NodeRef::SelfRef,
            path: vec![Expr::Literal(Value::from("ip"))],
        };
        let result = evaluate_runtime(&expr, &EvalContext::for_node("vm"), &lookup, &opts()).unwrap();
        assert!(matches!(result, Expr::GetAttribute { .. }));
    }
}

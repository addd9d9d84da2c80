//! Parses declarative blueprint documents (§1–§3), resolves node/relationship/
//! data/policy type derivation (§4.3–§4.4), evaluates the intrinsic-function
//! language (§4.6–§4.7), and assembles the flat deployment plan an
//! orchestrator executes against (§4.8).
//!
//! The public surface is the four entry points in [`mod@options`]'
//! companion functions below: [`parse`]/[`parse_from_path`] load a document;
//! [`prepare_deployment_plan`] turns it into a [`plan::Plan`]; and
//! [`runtime::evaluate_functions`]/[`runtime::evaluate_node_functions`]/
//! [`runtime::evaluate_outputs`] resolve what remains once an orchestrator
//! has live instance state.

pub mod derive;
pub mod error;
pub mod function;
pub mod import;
pub mod model;
pub mod options;
pub mod plan;
pub mod runtime;
pub mod schema;
pub mod version;
pub mod yaml;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde_yaml_ng::Value;

use error::{Breadcrumb, DslParsingFormatError};
use function::eval::{InputLookup, SecretFetchError, SecretFetcher};
use model::Blueprint;
use options::{EvaluationOptions, ParseOptions};
use plan::Plan;
use version::Version;

/// The version assumed for documents that omit `tosca_definitions_version`
/// when [`ParseOptions::validate_version`] is `false`: the newest gate, so no
/// feature is rejected for want of a declared version.
const UNVALIDATED_DEFAULT_VERSION: Version = Version::new(1, 3, 0);

/// Parses and import-merges `text` (originating from `origin`, used only in
/// diagnostics) into a [`Blueprint`]. Relative imports resolve against
/// `root_dir` and then `options.resources_base_path`.
pub fn parse(
    text: &str,
    origin: &str,
    root_dir: Option<&Path>,
    options: &ParseOptions,
) -> error::Result<Blueprint> {
    let merged = import::load_merged_document(text, origin, root_dir, options)?;
    let version = resolve_version(&merged, options)?;
    Blueprint::from_document(&merged, version)
}

/// [`parse`], reading the root document from `path` and anchoring relative
/// imports at its parent directory.
pub fn parse_from_path(path: &Path, options: &ParseOptions) -> error::Result<Blueprint> {
    let text = fs::read_to_string(path).map_err(|e| DslParsingFormatError::ImportUnreadable {
        uri: path.display().to_string(),
        detail: e.to_string(),
    })?;
    let root_dir = path.parent();
    parse(&text, &path.display().to_string(), root_dir, options)
}

fn resolve_version(merged: &Value, options: &ParseOptions) -> error::Result<Version> {
    let root = merged.as_mapping().ok_or_else(|| DslParsingFormatError::Malformed {
        breadcrumb: Breadcrumb::root(),
        message: "document root must be a mapping".to_string(),
    })?;
    match yaml::get(root, "tosca_definitions_version").and_then(Value::as_str) {
        Some(token) => Ok(Version::parse(token)?),
        None if options.validate_version => Err(DslParsingFormatError::Malformed {
            breadcrumb: Breadcrumb::root(),
            message: "missing required field 'tosca_definitions_version'".to_string(),
        }
        .into()),
        None => Ok(UNVALIDATED_DEFAULT_VERSION),
    }
}

/// Adapts a plain `HashMap` of already-typed deployment inputs to
/// [`InputLookup`] for the function evaluator.
struct MapInputLookup<'a>(&'a HashMap<String, Value>);

impl InputLookup for MapInputLookup<'_> {
    fn input_value(&self, name: &str) -> Option<Value> {
        self.0.get(name).cloned()
    }
}

/// Adapts a plain `HashMap` of secrets to [`SecretFetcher`], for callers (and
/// the CLI) that have every secret available up front rather than behind a
/// live store.
pub struct MapSecretFetcher(pub HashMap<String, String>);

impl SecretFetcher for MapSecretFetcher {
    fn get_secret(&self, id: &str) -> Result<String, SecretFetchError> {
        self.0.get(id).cloned().ok_or(SecretFetchError::NotFound)
    }
}

/// Resolves `blueprint`'s declared input schema against `supplied` values,
/// derives every node/relationship/data/policy type, and assembles the flat
/// [`Plan`] (§4.8). `get_secret` answers `get_secret` lookups discovered
/// during static evaluation; `resources_base_path`, when given, lets the
/// script/workflow rewrite pass verify file-resource implementations exist.
pub fn prepare_deployment_plan(
    blueprint: &Blueprint,
    supplied_inputs: &model::OrderedMap<Value>,
    secrets: &dyn SecretFetcher,
    resources_base_path: Option<&Path>,
    options: &EvaluationOptions,
) -> error::Result<Plan> {
    let derived_data_types = derive::derive_data_types(blueprint)?;
    let resolved_inputs = plan::resolve_inputs(blueprint, supplied_inputs, &derived_data_types)?;
    let inputs = MapInputLookup(&resolved_inputs);
    plan::assemble_plan(blueprint, &inputs, secrets, resources_base_path, options)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "
tosca_definitions_version: cloudify_dsl_1_3
node_types:
  cloudify.nodes.Compute: {}
node_templates:
  vm:
    type: cloudify.nodes.Compute
    properties:
      size: small
";

    #[test]
    fn parse_builds_a_blueprint_from_raw_text() {
        let bp = parse(DOC, "<test>", None, &ParseOptions::default()).unwrap();
        assert_eq!(bp.node_templates.len(), 1);
        assert_eq!(bp.version, Version::new(1, 3, 0));
    }

    #[test]
    fn parse_without_version_and_without_validation_defaults_permissively() {
        let mut options = ParseOptions::default();
        options.validate_version = false;
        let bp = parse("node_templates: {}\n", "<test>", None, &options).unwrap();
        assert_eq!(bp.version, UNVALIDATED_DEFAULT_VERSION);
    }

    #[test]
    fn parse_without_version_and_with_validation_is_an_error() {
        let err = parse("node_templates: {}\n", "<test>", None, &ParseOptions::default()).unwrap_err();
        assert!(err.to_string().contains("tosca_definitions_version"));
    }

    #[test]
    fn parse_from_path_anchors_imports_at_the_file_parent() {
        let dir = tempfile::tempdir().unwrap();
        let import_path = dir.path().join("types.yaml");
        fs::write(&import_path, "node_types:\n  cloudify.nodes.Compute: {}\n").unwrap();
        let root_path = dir.path().join("blueprint.yaml");
        fs::write(
            &root_path,
            "tosca_definitions_version: cloudify_dsl_1_3\nimports:\n  - types.yaml\nnode_templates:\n  vm:\n    type: cloudify.nodes.Compute\n",
        )
        .unwrap();

        let bp = parse_from_path(&root_path, &ParseOptions::default()).unwrap();
        assert_eq!(bp.node_templates.len(), 1);
    }

    #[test]
    fn prepare_deployment_plan_wires_inputs_through_to_node_properties() {
        let doc = "
tosca_definitions_version: cloudify_dsl_1_3
inputs:
  vm_size:
    type: string
    default: small
node_types:
  cloudify.nodes.Compute:
    properties:
      size:
        type: string
node_templates:
  vm:
    type: cloudify.nodes.Compute
    properties:
      size: { get_input: vm_size }
";
        let bp = parse(doc, "<test>", None, &ParseOptions::default()).unwrap();
        let secrets = MapSecretFetcher(HashMap::new());
        let plan = prepare_deployment_plan(&bp, &Vec::new(), &secrets, None, &EvaluationOptions::default()).unwrap();
        let vm = plan.nodes.iter().find(|n| n.id == "vm").unwrap();
        assert_eq!(
            model::lookup(&vm.properties, "size"),
            Some(&function::ast::Expr::Literal(Value::from("small")))
        );
    }
}

//! Error taxonomy for blueprint parsing, derivation, and function evaluation.
//!
//! Every public entry point in this crate returns one of these variants (or a
//! breadcrumbed wrapper around one). The taxonomy mirrors the abstract error
//! kinds named by the resolver this crate implements: format errors are
//! structural/schema problems in the source document, logic errors are
//! semantic violations discovered after parsing, and the function-related
//! variants cover intrinsic-function misuse and evaluation failure.

use std::fmt;

use thiserror::Error;

/// A dotted breadcrumb locating an expression inside the document, e.g.
/// `nodes.vm.properties.a.a0`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Breadcrumb(Vec<String>);

impl Breadcrumb {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new(segments: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(segments.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn join(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    #[must_use]
    pub fn join_index(&self, index: usize) -> Self {
        self.join(format!("[{index}]"))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for Breadcrumb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for segment in &self.0 {
            if !first && !segment.starts_with('[') {
                write!(f, ".")?;
            }
            write!(f, "{segment}")?;
            first = false;
        }
        Ok(())
    }
}

impl From<&str> for Breadcrumb {
    fn from(value: &str) -> Self {
        Self::new(value.split('.'))
    }
}

/// Structural or schema-level problem in the source document: a missing
/// required field, a mapping where a scalar was expected, a reference to a
/// type or import that does not exist at parse time.
#[derive(Debug, Error)]
pub enum DslParsingFormatError {
    #[error("{breadcrumb}: {message}")]
    Malformed {
        breadcrumb: Breadcrumb,
        message: String,
    },

    #[error("could not parse {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("unsupported tosca_definitions_version token: {token}")]
    BadVersionToken { token: String },

    #[error("import {uri} could not be read: {detail}")]
    ImportUnreadable { uri: String, detail: String },

    #[error("import uri {uri} is not supported: {detail}")]
    UnsupportedImportUri { uri: String, detail: String },

    #[error("{breadcrumb}: required property '{property}' has no value and no default")]
    MissingRequiredProperty {
        breadcrumb: Breadcrumb,
        property: String,
    },

    #[error("{breadcrumb}: property '{property}' does not match declared type {expected}")]
    PropertyTypeMismatch {
        breadcrumb: Breadcrumb,
        property: String,
        expected: String,
    },
}

/// Semantic violation discovered after the document is structurally valid:
/// non-mergeable imports, unknown type references in a derivation chain,
/// cyclic derivation, use of a feature outside its version gate.
#[derive(Debug, Error)]
pub enum DslParsingLogicError {
    #[error("non-mergeable field '{field}' declared in import {uri}")]
    NonMergeableField { field: String, uri: String },

    #[error("duplicate key '{key}' in section '{section}' (declared in main document and in import {uri})")]
    DuplicateKey {
        section: String,
        key: String,
        uri: String,
    },

    #[error("node template '{id}' declares unknown type '{type_name}'")]
    UnknownNodeType { id: String, type_name: String },

    #[error("type '{type_name}' derives from unknown type '{parent}'")]
    UnknownParentType { type_name: String, parent: String },

    #[error("derivation cycle detected: {}", chain.join(" -> "))]
    CyclicDerivation { chain: Vec<String> },

    #[error("relationship template references unknown relationship type '{type_name}'")]
    UnknownRelationshipType { type_name: String },

    #[error("relationship target '{target}' is not a declared node template")]
    UnknownRelationshipTarget { target: String },

    #[error("import graph exceeded maximum depth {limit}")]
    ImportDepthExceeded { limit: usize },

    #[error("script implementation '{implementation}' was not found under {base}")]
    ScriptResourceNotFound { implementation: String, base: String },

    #[error("input '{input}' default does not evaluate to a literal value")]
    NonLiteralInputDefault { input: String },
}

/// Intrinsic-function arity, shape, or version misuse, discovered while
/// parsing function literals into the AST (before any evaluation happens).
#[derive(Debug, Error)]
pub enum FunctionValidationError {
    #[error("{breadcrumb}: {function} requires {expected}, got {actual}")]
    BadArity {
        breadcrumb: Breadcrumb,
        function: &'static str,
        expected: &'static str,
        actual: String,
    },

    #[error("{breadcrumb}: {function} is not available before DSL version {required}")]
    VersionGated {
        breadcrumb: Breadcrumb,
        function: &'static str,
        required: String,
    },

    #[error("{breadcrumb}: SELF cannot be used with get_attribute function in outputs.{output}.value")]
    SelfInOutputAttribute { breadcrumb: Breadcrumb, output: String },

    #[error("{breadcrumb}: {node_ref} is not a legal reference in this context")]
    IllegalNodeRef {
        breadcrumb: Breadcrumb,
        node_ref: String,
    },

    #[error("{breadcrumb}: get_secret list elements must be scalars")]
    NonScalarSecretPathElement { breadcrumb: Breadcrumb },
}

/// Runtime-impossible evaluation: an unresolved argument, an unparsable
/// secret payload, a missing node/attribute reference.
#[derive(Debug, Error)]
pub enum FunctionEvaluationError {
    #[error("{breadcrumb}: unresolved argument")]
    UnresolvedArgument { breadcrumb: Breadcrumb },

    #[error("{breadcrumb}: node '{node_id}' does not exist")]
    NodeDoesNotExist {
        breadcrumb: Breadcrumb,
        node_id: String,
    },

    #[error("{breadcrumb}: could not parse {secret_id}")]
    UnparsableSecret {
        breadcrumb: Breadcrumb,
        secret_id: String,
    },

    #[error("{breadcrumb}: could not find '{step}' in secret '{secret_id}'")]
    MissingSecretStep {
        breadcrumb: Breadcrumb,
        step: String,
        secret_id: String,
    },

    #[error("{breadcrumb}: key '{key}' not found")]
    KeyError {
        breadcrumb: Breadcrumb,
        key: String,
    },

    #[error("{breadcrumb}: index {index} out of range (length {length})")]
    IndexError {
        breadcrumb: Breadcrumb,
        index: i64,
        length: usize,
    },

    #[error("{breadcrumb}: cannot index a {actual} with a string key")]
    TypeError {
        breadcrumb: Breadcrumb,
        actual: &'static str,
    },

    #[error(transparent)]
    Secret(#[from] UnknownSecretError),

    #[error(transparent)]
    RecursionLimit(#[from] EvaluationRecursionLimitReached),
}

/// Every `get_secret` id discovered to be missing during the static
/// validation pass, aggregated into a single error.
#[derive(Debug, Error)]
#[error("Required secrets: [{}] don't exist in this tenant", missing.join(", "))]
pub struct UnknownSecretError {
    pub missing: Vec<String>,
}

/// A bounded recursion counter was exceeded while evaluating intrinsic
/// functions, almost always because of a reference cycle.
#[derive(Debug, Error)]
#[error("{breadcrumb}: evaluation recursion limit ({limit}) reached")]
pub struct EvaluationRecursionLimitReached {
    pub breadcrumb: Breadcrumb,
    pub limit: usize,
}

/// Top-level error returned from this crate's public API.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Format(#[from] DslParsingFormatError),
    #[error(transparent)]
    Logic(#[from] DslParsingLogicError),
    #[error(transparent)]
    FunctionValidation(#[from] FunctionValidationError),
    #[error(transparent)]
    FunctionEvaluation(#[from] FunctionEvaluationError),
    #[error(transparent)]
    UnknownSecret(#[from] UnknownSecretError),
    #[error(transparent)]
    RecursionLimit(#[from] EvaluationRecursionLimitReached),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breadcrumb_renders_dotted_path() {
        let bc = Breadcrumb::from("nodes.vm.properties.a").join("a0");
        assert_eq!(bc.to_string(), "nodes.vm.properties.a.a0");
    }

    #[test]
    fn breadcrumb_renders_index_without_leading_dot() {
        let bc = Breadcrumb::root().join("get_property").join_index(0);
        assert_eq!(bc.to_string(), "get_property[0]");
    }

    #[test]
    fn unknown_secret_error_message_lists_missing_ids() {
        let err = UnknownSecretError {
            missing: vec!["a".to_string(), "b".to_string()],
        };
        assert!(err.to_string().contains("Required secrets: [a, b]"));
    }
}

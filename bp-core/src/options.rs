//! Caller-tunable knobs for parsing and evaluation.
//!
//! Mirrors the teacher's typed environment-variable parser (`config::env`)
//! but scoped to the handful of values this crate actually needs: the
//! resources base path, the recursion bound, and the import-depth bound.
//! Library callers normally construct these directly; [`EnvParser`] exists
//! for CLI-style callers that want `BP_`-prefixed environment overrides.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

/// Default bound on function-evaluation recursion (§5, §4.7).
pub const DEFAULT_RECURSION_LIMIT: usize = 1000;

/// Recommended bound on import-DAG depth (§5).
pub const DEFAULT_IMPORT_DEPTH_LIMIT: usize = 200;

/// Options controlling [`crate::parse`] and [`crate::parse_from_path`].
#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Base path imports are resolved against when neither absolute nor
    /// relative-to-importer resolution succeeds.
    pub resources_base_path: Option<PathBuf>,
    /// Whether to gate features by `tosca_definitions_version`. When
    /// `false`, parsing still proceeds but no version-based feature checks
    /// are enforced (§4.1).
    pub validate_version: bool,
    /// Maximum import-DAG depth before `ImportDepthExceeded` (§5).
    pub import_depth_limit: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            resources_base_path: None,
            validate_version: true,
            import_depth_limit: DEFAULT_IMPORT_DEPTH_LIMIT,
        }
    }
}

/// Options controlling [`crate::prepare_deployment_plan`].
#[derive(Debug, Clone)]
pub struct EvaluationOptions {
    /// Bound on function-evaluation recursion depth (§4.7).
    pub recursion_limit: usize,
    /// When `true`, every function is deferred to the runtime phase except
    /// for arity/shape validation (§4.7).
    pub runtime_only_evaluation: bool,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        Self {
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            runtime_only_evaluation: false,
        }
    }
}

/// Errors produced while parsing `BP_`-prefixed environment overrides.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: &'static str,
        value: String,
    },
}

/// Type-safe `BP_`-prefixed environment variable parser, collecting all
/// errors so a caller can report them together rather than one at a time.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvParser {
    pub fn new() -> Self {
        Self {
            prefix: "BP_",
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn get_usize(&mut self, name: &str, default: usize) -> usize {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.parse::<usize>() {
                Ok(parsed) => parsed,
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name,
                        expected: "a non-negative integer",
                        value,
                    });
                    default
                }
            },
            Err(_) => default,
        }
    }

    fn get_bool(&mut self, name: &str, default: bool) -> bool {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name,
                        expected: "a boolean",
                        value,
                    });
                    default
                }
            },
            Err(_) => default,
        }
    }

    fn get_path(&mut self, name: &str) -> Option<PathBuf> {
        env::var(self.var_name(name)).ok().map(PathBuf::from)
    }

    /// Build [`ParseOptions`] from `BP_RESOURCES_BASE_PATH`,
    /// `BP_VALIDATE_VERSION`, and `BP_IMPORT_DEPTH_LIMIT`.
    pub fn parse_options(&mut self) -> ParseOptions {
        ParseOptions {
            resources_base_path: self.get_path("RESOURCES_BASE_PATH"),
            validate_version: self.get_bool("VALIDATE_VERSION", true),
            import_depth_limit: self.get_usize("IMPORT_DEPTH_LIMIT", DEFAULT_IMPORT_DEPTH_LIMIT),
        }
    }

    /// Build [`EvaluationOptions`] from `BP_RECURSION_LIMIT` and
    /// `BP_RUNTIME_ONLY_EVALUATION`.
    pub fn evaluation_options(&mut self) -> EvaluationOptions {
        EvaluationOptions {
            recursion_limit: self.get_usize("RECURSION_LIMIT", DEFAULT_RECURSION_LIMIT),
            runtime_only_evaluation: self.get_bool("RUNTIME_ONLY_EVALUATION", false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_bounds() {
        let parse = ParseOptions::default();
        assert!(parse.validate_version);
        assert_eq!(parse.import_depth_limit, DEFAULT_IMPORT_DEPTH_LIMIT);

        let eval = EvaluationOptions::default();
        assert_eq!(eval.recursion_limit, DEFAULT_RECURSION_LIMIT);
        assert!(!eval.runtime_only_evaluation);
    }

    #[test]
    fn env_parser_reports_invalid_values_without_panicking() {
        // SAFETY: test-only, single-threaded access to this specific var name.
        unsafe {
            env::set_var("BP_RECURSION_LIMIT", "not-a-number");
        }
        let mut parser = EnvParser::new();
        let opts = parser.evaluation_options();
        assert_eq!(opts.recursion_limit, DEFAULT_RECURSION_LIMIT);
        assert!(parser.has_errors());
        unsafe {
            env::remove_var("BP_RECURSION_LIMIT");
        }
    }
}

//! Thin CLI over `bp-core`: load and merge a blueprint, or assemble its
//! deployment plan, printing either as JSON.

mod json;

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bp_core::import::load_merged_document;
use bp_core::model::OrderedMap;
use bp_core::options::{EvaluationOptions, ParseOptions};
use bp_core::{parse_from_path, prepare_deployment_plan, MapSecretFetcher};

#[derive(Parser)]
#[command(name = "bp")]
#[command(author, version, about = "Blueprint parser and deployment plan assembler")]
struct Cli {
    /// Enable debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and import-merge a blueprint, printing the merged document as JSON.
    Parse {
        file: PathBuf,

        /// Base path imports resolve against when not found relative to the importer.
        #[arg(long)]
        resources_base_path: Option<PathBuf>,

        /// Skip the `tosca_definitions_version` requirement.
        #[arg(long)]
        no_validate_version: bool,
    },
    /// Assemble the deployment plan, printing it as JSON.
    Plan {
        file: PathBuf,

        #[arg(long)]
        resources_base_path: Option<PathBuf>,

        #[arg(long)]
        no_validate_version: bool,

        /// A deployment input as `KEY=VALUE`; `VALUE` is parsed as YAML.
        #[arg(long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,

        /// A secret value as `KEY=VALUE`, answering `get_secret` lookups.
        #[arg(long = "secret", value_name = "KEY=VALUE")]
        secrets: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    match cli.command {
        Command::Parse {
            file,
            resources_base_path,
            no_validate_version,
        } => run_parse(file, resources_base_path, no_validate_version),
        Command::Plan {
            file,
            resources_base_path,
            no_validate_version,
            inputs,
            secrets,
        } => run_plan(file, resources_base_path, no_validate_version, inputs, secrets),
    }
}

fn run_parse(file: PathBuf, resources_base_path: Option<PathBuf>, no_validate_version: bool) -> Result<()> {
    let options = ParseOptions {
        resources_base_path,
        validate_version: !no_validate_version,
        ..ParseOptions::default()
    };

    info!(path = %file.display(), "loading and merging imports");
    let text = fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
    let merged = load_merged_document(&text, &file.display().to_string(), file.parent(), &options)
        .with_context(|| format!("merging imports for {}", file.display()))?;

    let rendered: serde_json::Value = serde_json::to_value(&merged).context("rendering merged document as JSON")?;
    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}

fn run_plan(
    file: PathBuf,
    resources_base_path: Option<PathBuf>,
    no_validate_version: bool,
    raw_inputs: Vec<String>,
    raw_secrets: Vec<String>,
) -> Result<()> {
    let parse_options = ParseOptions {
        resources_base_path: resources_base_path.clone(),
        validate_version: !no_validate_version,
        ..ParseOptions::default()
    };

    info!(path = %file.display(), "parsing blueprint");
    let blueprint = parse_from_path(&file, &parse_options).with_context(|| format!("parsing {}", file.display()))?;

    let inputs: OrderedMap<serde_yaml_ng::Value> = raw_inputs
        .iter()
        .map(|raw| parse_key_value(raw).map(|(k, v)| (k, parse_scalar(&v))))
        .collect::<Result<_>>()?;

    let secrets: HashMap<String, String> = raw_secrets
        .iter()
        .map(|raw| parse_key_value(raw))
        .collect::<Result<_>>()?;
    let secrets = MapSecretFetcher(secrets);

    info!(nodes = blueprint.node_templates.len(), "assembling deployment plan");
    let plan = prepare_deployment_plan(
        &blueprint,
        &inputs,
        &secrets,
        resources_base_path.as_deref(),
        &EvaluationOptions::default(),
    )
    .context("assembling deployment plan")?;

    let rendered = json::plan_to_json(&plan);
    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}

fn parse_key_value(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    Ok((key.to_string(), value.to_string()))
}

/// Parses a CLI-supplied value as YAML so `--input count=3` yields an
/// integer rather than the string `"3"`; anything that doesn't parse as
/// YAML scalar structure is kept as a plain string.
fn parse_scalar(raw: &str) -> serde_yaml_ng::Value {
    serde_yaml_ng::from_str(raw).unwrap_or_else(|_| serde_yaml_ng::Value::from(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_key_value_splits_on_first_equals() {
        let (k, v) = parse_key_value("vm_size=small=ish").unwrap();
        assert_eq!(k, "vm_size");
        assert_eq!(v, "small=ish");
    }

    #[test]
    fn parse_key_value_rejects_missing_equals() {
        assert!(parse_key_value("vm_size").is_err());
    }

    #[test]
    fn parse_scalar_recognizes_yaml_integers() {
        assert_eq!(parse_scalar("3"), serde_yaml_ng::Value::from(3i64));
    }

    #[test]
    fn parse_scalar_falls_back_to_string() {
        assert_eq!(parse_scalar("not: valid: yaml: here"), serde_yaml_ng::Value::from("not: valid: yaml: here"));
    }
}

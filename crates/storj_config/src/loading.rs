//! Reloading a dumped config schema with CLI flags and environment variables layered on
//! top, then deserializing and validating the result.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read as _;

use clap::{Arg, ArgAction, Command};
use serde::de::DeserializeOwned;
use serde_json::Value;
use validator::{Validate, ValidationErrors};

use crate::{ParamPath, ALLOW_LOOPBACK_ENV, BRIDGE_URL_ENV};

/// Errors raised while loading, overriding, or validating a config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config schema: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config schema or value: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse command-line arguments: {0}")]
    Clap(#[from] clap::Error),
    #[error("config failed validation: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Reads a JSON schema file of `{"dotted.path": {"description": ..., "value": ...}}`
/// entries (as produced by [`crate::SerializeConfig::dump_to_file`]), layers CLI flag and
/// environment variable overrides on top, deserializes into `T`, and validates it.
///
/// `command` should be an otherwise-empty `clap::Command` (its name/about are preserved);
/// one `--dotted.path <value>` flag is generated per schema entry, plus `--config-file`
/// for merging in an additional override file before CLI flags are applied.
pub fn load_and_process_config<T: DeserializeOwned + Validate>(
    mut schema_file: File,
    command: Command,
    args: Vec<String>,
) -> Result<T, ConfigError> {
    let mut contents = String::new();
    schema_file.read_to_string(&mut contents)?;
    let schema: BTreeMap<ParamPath, SchemaEntry> = serde_json::from_str(&contents)?;

    let mut values: BTreeMap<ParamPath, Value> =
        schema.iter().map(|(path, entry)| (path.clone(), entry.value.clone())).collect();

    let command = command.args(build_args(&schema));
    let matches = command.try_get_matches_from(args)?;

    if let Some(override_path) = matches.get_one::<String>(CONFIG_FILE_ARG) {
        let overrides: BTreeMap<ParamPath, Value> =
            serde_json::from_str(&std::fs::read_to_string(override_path)?)?;
        values.extend(overrides);
    }

    for path in schema.keys() {
        if let Some(value) = matches.get_one::<String>(path) {
            let coerced = coerce_like(&values[path], value);
            values.insert(path.clone(), coerced);
        }
    }

    apply_env_overrides(&mut values);

    let nested = unflatten(values);
    let config: T = serde_json::from_value(nested)?;
    config.validate()?;
    Ok(config)
}

const CONFIG_FILE_ARG: &str = "config-file";

#[derive(Clone, Debug, serde::Deserialize)]
struct SchemaEntry {
    #[allow(dead_code)]
    description: String,
    value: Value,
}

fn build_args(schema: &BTreeMap<ParamPath, SchemaEntry>) -> Vec<Arg> {
    let mut args = vec![Arg::new(CONFIG_FILE_ARG)
        .long(CONFIG_FILE_ARG)
        .short('f')
        .help("Optional JSON file of path -> value overrides, applied before CLI flags.")
        .action(ArgAction::Set)];
    for (path, entry) in schema {
        args.push(
            Arg::new(path.clone())
                .long(path.clone())
                .help(entry.description.clone())
                .action(ArgAction::Set),
        );
    }
    args
}

/// Parses `raw` into the same JSON type as `template` (bool/number/string), so a CLI flag
/// can override a typed default without the caller needing to know the field's type.
fn coerce_like(template: &Value, raw: &str) -> Value {
    match template {
        Value::Bool(_) => Value::Bool(raw.eq_ignore_ascii_case("true") || raw == "1"),
        Value::Number(n) if n.is_u64() || n.is_i64() => {
            raw.parse::<i64>().map(Value::from).unwrap_or_else(|_| Value::String(raw.to_owned()))
        }
        Value::Number(_) => raw.parse::<f64>().map(Value::from).unwrap_or_else(|_| Value::String(raw.to_owned())),
        _ => Value::String(raw.to_owned()),
    }
}

fn apply_env_overrides(values: &mut BTreeMap<ParamPath, Value>) {
    if let Ok(bridge_url) = std::env::var(BRIDGE_URL_ENV) {
        values.insert("network.bridge_url".to_owned(), Value::String(bridge_url));
    }
    if let Ok(allow_loopback) = std::env::var(ALLOW_LOOPBACK_ENV) {
        let truthy = allow_loopback.eq_ignore_ascii_case("true") || allow_loopback == "1";
        values.insert("network.allow_loopback".to_owned(), Value::Bool(truthy));
    }
}

/// Expands `{"a.b.c": v}` into `{"a": {"b": {"c": v}}}`. `network.seeds` and
/// `network.bridge_url` are special-cased since their struct fields are `Vec<String>` /
/// `Option<String>` but are dumped/overridden as plain strings.
fn unflatten(values: BTreeMap<ParamPath, Value>) -> Value {
    let mut root = serde_json::Map::new();
    for (path, value) in values {
        let value = match path.as_str() {
            "network.seeds" => Value::Array(
                value
                    .as_str()
                    .unwrap_or_default()
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| Value::String(s.to_owned()))
                    .collect(),
            ),
            "network.bridge_url" => match value.as_str() {
                Some("") | None => Value::Null,
                Some(s) => Value::String(s.to_owned()),
            },
            _ => value,
        };
        insert_nested(&mut root, path.split('.'), value);
    }
    Value::Object(root)
}

fn insert_nested<'a>(
    root: &mut serde_json::Map<String, Value>,
    mut segments: impl Iterator<Item = &'a str>,
    value: Value,
) {
    let Some(segment) = segments.next() else { return };
    let rest: Vec<&str> = segments.collect();
    if rest.is_empty() {
        root.insert(segment.to_owned(), value);
        return;
    }
    let entry = root.entry(segment.to_owned()).or_insert_with(|| Value::Object(serde_json::Map::new()));
    if let Value::Object(map) = entry {
        insert_nested(map, rest.into_iter(), value);
    }
}

#[cfg(test)]
mod tests {
    use clap::Command;
    use tempfile::NamedTempFile;

    use super::*;
    use crate::{SerializeConfig, StorjConfig};

    #[test]
    fn round_trips_through_dump_and_load() {
        let file = NamedTempFile::new().unwrap();
        StorjConfig::default().dump_to_file(file.path()).unwrap();

        let loaded: StorjConfig = load_and_process_config(
            File::open(file.path()).unwrap(),
            Command::new("storj-node"),
            vec!["storj-node".to_owned()],
        )
        .unwrap();
        assert_eq!(loaded, StorjConfig::default());
    }

    #[test]
    fn cli_flag_overrides_a_flattened_default() {
        let file = NamedTempFile::new().unwrap();
        StorjConfig::default().dump_to_file(file.path()).unwrap();

        let loaded: StorjConfig = load_and_process_config(
            File::open(file.path()).unwrap(),
            Command::new("storj-node"),
            vec![
                "storj-node".to_owned(),
                "--timeouts.response_timeout".to_owned(),
                "30".to_owned(),
            ],
        )
        .unwrap();
        assert_eq!(loaded.timeouts.response_timeout.as_secs(), 30);
    }

    #[test]
    fn env_var_overrides_allow_loopback() {
        let file = NamedTempFile::new().unwrap();
        StorjConfig::default().dump_to_file(file.path()).unwrap();
        std::env::set_var(ALLOW_LOOPBACK_ENV, "true");

        let loaded: StorjConfig = load_and_process_config(
            File::open(file.path()).unwrap(),
            Command::new("storj-node"),
            vec!["storj-node".to_owned()],
        )
        .unwrap();
        std::env::remove_var(ALLOW_LOOPBACK_ENV);
        assert!(loaded.network.allow_loopback);
    }
}

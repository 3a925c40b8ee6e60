//! Flattening config structs into a documented, dotted-path parameter map.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use serde_json::{json, Value};

use crate::{ConfigError, ParamPath};

/// A single flattened parameter: its documentation and current/default value.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SerializedParam {
    pub description: String,
    pub value: Value,
}

/// Implemented by every config struct (and sub-config) so it can be flattened into a
/// single documented parameter map, written to a JSON schema file, and reloaded with CLI
/// and environment overrides layered on top (see [`crate::load_and_process_config`]).
pub trait SerializeConfig {
    fn dump(&self) -> BTreeMap<ParamPath, SerializedParam>;

    /// Writes the flattened map as a pretty-printed JSON schema file, one entry per
    /// dotted parameter path. A deployment checks this file in and edits it directly, or
    /// leaves it as the default and overrides individual fields via CLI flags / env vars.
    fn dump_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let map = self.dump();
        let json = serde_json::to_string_pretty(&map)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

/// Serializes a single parameter into a `(path, SerializedParam)` pair ready for
/// insertion into a `BTreeMap` returned from `dump`.
pub fn ser_param<T: Serialize>(name: &str, value: &T, description: &str) -> (ParamPath, SerializedParam) {
    (name.to_owned(), SerializedParam { description: description.to_owned(), value: json!(value) })
}

/// Prepends `sub_config_name.` to every key of a nested config's dump, so loading a
/// flattened schema back can recover which struct field each parameter belongs to.
pub fn prepend_sub_config_name(
    sub_config_dump: BTreeMap<ParamPath, SerializedParam>,
    sub_config_name: &str,
) -> BTreeMap<ParamPath, SerializedParam> {
    sub_config_dump
        .into_iter()
        .map(|(path, param)| (format!("{sub_config_name}.{path}"), param))
        .collect()
}

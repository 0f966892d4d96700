//! Hierarchical read-only configuration.
//!
//! # Responsibility
//! - Typed lookups over dotted keys (`edc.core.retry.max`).
//! - Sub-config extraction by path prefix.
//! - Layer sources (files, environment, overrides) through `figment`.
//!
//! # Invariants
//! - Keys are stored absolute; a sub-config only changes the lookup root.
//! - Parse failures name the absolute key, the raw value and the target type.

use crate::monitor::Monitor;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::value::{Dict, Map};
use figment::{Figment, Metadata, Profile, Provider};
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::str::FromStr;

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Immutable key/value configuration rooted at a dotted path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    root_path: String,
    entries: BTreeMap<String, String>,
}

impl Config {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self {
            root_path: String::new(),
            entries,
        }
    }

    pub fn get_string(&self, key: &str) -> ConfigResult<String> {
        self.lookup(key)
            .map(str::to_string)
            .ok_or_else(|| ConfigError::NotFound(self.absolute_path_of(key)))
    }

    pub fn get_string_or(&self, key: &str, default_value: &str) -> String {
        self.lookup(key).unwrap_or(default_value).to_string()
    }

    pub fn get_integer(&self, key: &str) -> ConfigResult<i32> {
        self.parse_required(key, "integer")
    }

    pub fn get_integer_or(&self, key: &str, default_value: i32) -> ConfigResult<i32> {
        self.parse_or(key, default_value, "integer")
    }

    pub fn get_long(&self, key: &str) -> ConfigResult<i64> {
        self.parse_required(key, "long")
    }

    pub fn get_long_or(&self, key: &str, default_value: i64) -> ConfigResult<i64> {
        self.parse_or(key, default_value, "long")
    }

    pub fn get_bool_or(&self, key: &str, default_value: bool) -> ConfigResult<bool> {
        self.parse_or(key, default_value, "boolean")
    }

    /// Like `get_long_or`, but negative values are a parse error.
    pub fn get_unsigned_or(&self, key: &str, default_value: u64) -> ConfigResult<u64> {
        self.parse_or(key, default_value, "unsigned long")
    }

    /// Returns the sub-config rooted at `path` relative to this config.
    pub fn get_config(&self, path: &str) -> Config {
        let absolute_path = self.absolute_path_of(path);
        let entries = self
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(absolute_path.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Config {
            root_path: absolute_path,
            entries,
        }
    }

    /// Splits into one sub-config per distinct first relative segment.
    pub fn partition(&self) -> Vec<Config> {
        let groups: BTreeSet<String> = self
            .relative_entries()
            .keys()
            .filter_map(|key| key.split('.').next().map(str::to_string))
            .collect();
        groups.iter().map(|group| self.get_config(group)).collect()
    }

    /// Absolute key/value pairs.
    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    /// Key/value pairs with the root path stripped.
    pub fn relative_entries(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(key, value)| (self.remove_prefix(key), value.clone()))
            .collect()
    }

    /// Last segment of the root path.
    pub fn current_node(&self) -> &str {
        self.root_path.rsplit('.').next().unwrap_or_default()
    }

    pub fn is_leaf(&self) -> bool {
        self.entries.len() == 1 && self.entries.contains_key(self.root_path.as_str())
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.entries.contains_key(self.absolute_path_of(key).as_str())
    }

    fn lookup(&self, key: &str) -> Option<&str> {
        self.entries
            .get(self.absolute_path_of(key).as_str())
            .map(String::as_str)
    }

    fn parse_required<T: FromStr>(&self, key: &str, type_name: &'static str) -> ConfigResult<T> {
        let raw = self.get_string(key)?;
        self.parse_value(key, &raw, type_name)
    }

    fn parse_or<T: FromStr>(
        &self,
        key: &str,
        default_value: T,
        type_name: &'static str,
    ) -> ConfigResult<T> {
        match self.lookup(key) {
            Some(raw) => self.parse_value(key, raw, type_name),
            None => Ok(default_value),
        }
    }

    fn parse_value<T: FromStr>(
        &self,
        key: &str,
        raw: &str,
        type_name: &'static str,
    ) -> ConfigResult<T> {
        raw.trim().parse().map_err(|_| ConfigError::Parse {
            key: self.absolute_path_of(key),
            value: raw.to_string(),
            type_name,
        })
    }

    fn remove_prefix(&self, path: &str) -> String {
        if self.root_path.is_empty() {
            return path.to_string();
        }
        path.strip_prefix(self.root_path.as_str())
            .map(|rest| rest.trim_start_matches('.').to_string())
            .unwrap_or_else(|| path.to_string())
    }

    fn absolute_path_of(&self, key: &str) -> String {
        if self.root_path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{key}", self.root_path)
        }
    }
}

/// Discoverable configuration source, merged before any service extension
/// is initialized.
pub trait ConfigurationExtension: Send {
    fn name(&self) -> &str;

    fn initialize(&mut self, _monitor: &dyn Monitor) -> ConfigResult<()> {
        Ok(())
    }

    fn config(&self) -> Config;
}

/// Builds `Config` values from the supported sources.
///
/// Layering goes through `figment`; the merged tree is flattened back into
/// dotted keys.
pub struct ConfigFactory;

impl ConfigFactory {
    pub fn from_map<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Config
    where
        K: Into<String>,
        V: Into<String>,
    {
        Config::new(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }

    /// Environment provider mapping `EDC_FOO_BAR` to `edc.foo.bar`.
    ///
    /// Variables without the `EDC_` prefix are not visible.
    pub fn environment() -> Env {
        Env::prefixed(ENV_PREFIX)
            .map(|key| format!("{ENV_ROOT}.{}", key.as_str().replace('_', ".")).into())
    }

    /// Extracts every source merged into `figment` as one flat config.
    pub fn from_figment(figment: &Figment) -> ConfigResult<Config> {
        let tree: serde_json::Value = figment
            .extract()
            .map_err(|err| ConfigError::Source(err.to_string()))?;
        let mut entries = BTreeMap::new();
        flatten_into(&mut entries, String::new(), tree);
        Ok(Config::new(entries))
    }

    /// Parses TOML text; tables and dotted keys both yield dotted settings.
    pub fn from_toml(text: &str) -> ConfigResult<Config> {
        Self::from_figment(&Figment::from(Toml::string(text)))
    }

    /// Reads a TOML file. A missing file is an `Io` error.
    pub fn from_toml_file(path: &Path) -> ConfigResult<Config> {
        if !path.is_file() {
            return Err(ConfigError::Io(format!("{}: file not found", path.display())));
        }
        Self::from_figment(&Figment::from(Toml::file(path)))
    }
}

const ENV_PREFIX: &str = "EDC_";
const ENV_ROOT: &str = "edc";

fn flatten_into(entries: &mut BTreeMap<String, String>, path: String, value: serde_json::Value) {
    let raw = match value {
        serde_json::Value::Object(children) => {
            for (key, child) in children {
                let child_path = if path.is_empty() {
                    key
                } else {
                    format!("{path}.{key}")
                };
                flatten_into(entries, child_path, child);
            }
            return;
        }
        serde_json::Value::String(text) => text,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    };
    if !path.is_empty() {
        entries.insert(path, raw);
    }
}

/// A config is itself a source, so programmatic settings layer like files.
impl Provider for Config {
    fn metadata(&self) -> Metadata {
        Metadata::named("connector settings")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        self.entries
            .iter()
            .fold(Figment::new(), |figment, (key, value)| {
                figment.merge(Serialized::default(key, value))
            })
            .data()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    NotFound(String),
    Parse {
        key: String,
        value: String,
        type_name: &'static str,
    },
    Source(String),
    Io(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(key) => write!(f, "no setting found for key {key}"),
            Self::Parse {
                key,
                value,
                type_name,
            } => write!(
                f,
                "setting {key} with value {value} cannot be parsed to {type_name}"
            ),
            Self::Source(message) => write!(f, "invalid configuration source: {message}"),
            Self::Io(message) => write!(f, "failed to read configuration: {message}"),
        }
    }
}

impl Error for ConfigError {}

//! String key/value settings.
//!
//! Keys are dotted and lowercase (`dispatch.batch_size`). A settings source
//! can come from the environment, a TOML file, or code. The process-wide
//! defaults are read from the environment once, on first use.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Prefix for environment variables that become settings.
pub const ENV_PREFIX: &str = "HOOKQ_";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: BTreeMap<String, String>,
}

static GLOBAL: OnceLock<Settings> = OnceLock::new();

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide defaults, built from the environment on first call.
    pub fn global() -> &'static Settings {
        GLOBAL.get_or_init(Settings::from_env)
    }

    /// `registered` when it has any values, the process-wide defaults otherwise.
    pub fn or_global(registered: Option<&Settings>) -> &Settings {
        match registered {
            Some(settings) if !settings.is_empty() => settings,
            _ => Settings::global(),
        }
    }

    /// Collect `HOOKQ_*` variables. `HOOKQ_DISPATCH__BATCH_SIZE` becomes
    /// `dispatch.batch_size`. Variables ending in `_SECRET` are skipped; they
    /// are read into `SecretString`s by [`Config`](super::Config).
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let values = vars
            .into_iter()
            .filter_map(|(name, value)| {
                let key = name.strip_prefix(ENV_PREFIX)?;
                if key.ends_with("_SECRET") {
                    return None;
                }
                Some((key.to_lowercase().replace("__", "."), value))
            })
            .collect();
        Self { values }
    }

    /// Load a TOML file; nested tables are flattened into dotted keys.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read settings file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("bad settings file {}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let table: toml::Table =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        let mut values = BTreeMap::new();
        flatten("", &toml::Value::Table(table), &mut values);
        Ok(Self { values })
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into().to_lowercase(), value.into());
        self
    }

    /// Overlay `other` on top of `self`; `other` wins on conflicts.
    pub fn merge(mut self, other: Settings) -> Self {
        self.values.extend(other.values);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&key.to_lowercase()).map(String::as_str)
    }

    /// Parse a value. Missing keys are `Ok(None)`; unparsable values are a
    /// configuration error.
    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.trim()
                    .parse()
                    .map_err(|e| Error::Config(format!("invalid value {raw:?} for {key}: {e}")))
            })
            .transpose()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn flatten(prefix: &str, value: &toml::Value, out: &mut BTreeMap<String, String>) {
    match value {
        toml::Value::Table(table) => {
            for (k, v) in table {
                let key = if prefix.is_empty() {
                    k.to_lowercase()
                } else {
                    format!("{prefix}.{}", k.to_lowercase())
                };
                flatten(&key, v, out);
            }
        }
        toml::Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}

//! Override descriptors: per-directory partial route configuration.
//!
//! Descriptors are versioned JSON documents evaluated into [`RouteOverrides`].
//! They stack from the routes root down to the route directory; the nearest
//! directory wins field by field, while `environment` merges key by key and
//! `compilerOptions` merges deeply.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::DiscoveryError;

pub const OVERRIDES_VERSION: u32 = 1;
pub const TIMEOUT_SECONDS: RangeInclusive<u64> = 1..=900;
pub const MEMORY_SIZE_MB: RangeInclusive<u32> = 128..=10240;

/// Construct-level knobs forwarded to the provisioner and used by the
/// development runtime (timeout, memory reported in the context).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FunctionSettings {
    pub memory_size: u32,
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Default for FunctionSettings {
    fn default() -> Self {
        Self {
            memory_size: 128,
            timeout_seconds: 30,
            description: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RouteDefaults {
    pub environment: BTreeMap<String, String>,
    pub compiler_options: Map<String, Value>,
    pub function: FunctionSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct FunctionOverrides {
    pub memory_size: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RouteOverrides {
    pub version: Option<u32>,
    pub environment: Option<BTreeMap<String, String>>,
    pub compiler_options: Option<Map<String, Value>>,
    pub function: Option<FunctionOverrides>,
}

/// Fully merged configuration of one route.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedConfig {
    pub environment: BTreeMap<String, String>,
    pub compiler_options: Map<String, Value>,
    pub function: FunctionSettings,
}

impl From<&RouteDefaults> for MergedConfig {
    fn from(defaults: &RouteDefaults) -> Self {
        Self {
            environment: defaults.environment.clone(),
            compiler_options: defaults.compiler_options.clone(),
            function: defaults.function.clone(),
        }
    }
}

impl MergedConfig {
    /// Apply one descriptor on top of the current state.
    pub fn apply(&mut self, overrides: &RouteOverrides) {
        if let Some(env) = &overrides.environment {
            for (key, value) in env {
                self.environment.insert(key.clone(), value.clone());
            }
        }
        if let Some(options) = &overrides.compiler_options {
            deep_merge(&mut self.compiler_options, options);
        }
        if let Some(function) = &overrides.function {
            if let Some(memory) = function.memory_size {
                self.function.memory_size = memory;
            }
            if let Some(timeout) = function.timeout_seconds {
                self.function.timeout_seconds = timeout;
            }
            if let Some(description) = &function.description {
                self.function.description = Some(description.clone());
            }
        }
    }

    /// Merge `chain` (farthest ancestor first, own directory last) onto `defaults`.
    pub fn resolve<'a>(defaults: &RouteDefaults, chain: impl IntoIterator<Item = &'a RouteOverrides>) -> Self {
        let mut merged = Self::from(defaults);
        for overrides in chain {
            merged.apply(overrides);
        }
        merged
    }
}

/// Objects merge recursively; anything else is replaced by the closer value.
pub fn deep_merge(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => deep_merge(existing, incoming),
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Turns a descriptor file into a partial configuration.
pub trait OverrideEvaluator: Send + Sync {
    /// `Ok(None)` when the file does not exist.
    fn evaluate(&self, path: &Path) -> Result<Option<RouteOverrides>, DiscoveryError>;
}

/// Reads JSON descriptors, accepting either the overrides object itself or
/// an object with a single `overrides` member.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonOverrideEvaluator;

impl OverrideEvaluator for JsonOverrideEvaluator {
    fn evaluate(&self, path: &Path) -> Result<Option<RouteOverrides>, DiscoveryError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DiscoveryError::Read {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                });
            }
        };
        parse_descriptor(path, &raw).map(Some)
    }
}

pub fn parse_descriptor(path: &Path, raw: &str) -> Result<RouteOverrides, DiscoveryError> {
    let malformed = |message: String| DiscoveryError::Malformed {
        path: path.to_path_buf(),
        message,
    };

    let mut value: Value = serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?;
    if let Value::Object(map) = &mut value
        && map.len() == 1
        && let Some(inner) = map.remove("overrides")
    {
        value = inner;
    }

    let overrides: RouteOverrides = serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;
    if let Some(function) = &overrides.function {
        check_limits(function).map_err(malformed)?;
    }
    match overrides.version {
        Some(version) if version != OVERRIDES_VERSION => Err(DiscoveryError::UnsupportedVersion {
            path: path.to_path_buf(),
            version,
        }),
        _ => Ok(overrides),
    }
}

/// Same bounds the function platform enforces.
fn check_limits(function: &FunctionOverrides) -> Result<(), String> {
    if let Some(timeout) = function.timeout_seconds
        && !TIMEOUT_SECONDS.contains(&timeout)
    {
        return Err(format!(
            "timeoutSeconds must be between {} and {}, got {timeout}",
            TIMEOUT_SECONDS.start(),
            TIMEOUT_SECONDS.end()
        ));
    }
    if let Some(memory) = function.memory_size
        && !MEMORY_SIZE_MB.contains(&memory)
    {
        return Err(format!(
            "memorySize must be between {} and {}, got {memory}",
            MEMORY_SIZE_MB.start(),
            MEMORY_SIZE_MB.end()
        ));
    }
    Ok(())
}

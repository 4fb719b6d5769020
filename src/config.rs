//! Project configuration.
//!
//! Settings come from an optional `gateway.json` at the project root and are
//! then overridden by environment variables (`.env` is loaded first by main).

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::ConfigError;
use crate::overrides::RouteDefaults;
use crate::tree::TreeSettings;

pub const CONFIG_FILE_NAME: &str = "gateway.json";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    pub port: u16,
    pub host: String,
    pub routes_directory: String,
    pub entry_file_name: String,
    pub override_file_name: String,
    pub build_output_directory_name: String,
    pub compiled_handler_file_name: String,
    pub upload_subdirectory_name: String,
    /// Remove the previous artifacts of a route before compiling it again.
    pub clean_before_build: bool,
    pub compiler: CompilerConfig,
    /// Tree-wide route defaults, applied before any override descriptor.
    pub defaults: RouteDefaults,
    /// Isolates per loaded route; requests are spread round-robin.
    pub workers_per_route: usize,
    /// Stack size of each isolate thread, in MiB.
    pub worker_stack_mb: usize,
    pub watch: bool,
    pub debounce_ms: u64,
    /// Upper bound on concurrent builds at startup and on rediscovery.
    pub build_concurrency: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "127.0.0.1".to_string(),
            routes_directory: "src".to_string(),
            entry_file_name: "+endpoint.ts".to_string(),
            override_file_name: "+config.json".to_string(),
            build_output_directory_name: ".build".to_string(),
            compiled_handler_file_name: "handler.js".to_string(),
            upload_subdirectory_name: "dist".to_string(),
            clean_before_build: true,
            compiler: CompilerConfig::default(),
            defaults: RouteDefaults::default(),
            workers_per_route: 1,
            worker_stack_mb: 8,
            watch: true,
            debounce_ms: 150,
            build_concurrency: num_cpus::get(),
        }
    }
}

/// External bundler invocation.
///
/// `args` is a template: `{entry}`, `{outdir}` and `{name}` are replaced per
/// route. Route compiler options are appended after the template.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            program: "esbuild".to_string(),
            args: [
                "{entry}",
                "--bundle",
                "--format=cjs",
                "--platform=node",
                "--outdir={outdir}",
                "--entry-names={name}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl GatewayConfig {
    /// Load `gateway.json` from `root` (if present) and apply environment overrides.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let path = root.join(CONFIG_FILE_NAME);
        let mut config = if path.is_file() {
            let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            Self::from_json(&raw).map_err(|source| ConfigError::Parse { path, source })?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Environment variables win over the file.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(port) = var("PORT").and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        if let Some(host) = var("HOST").filter(|h| !h.is_empty()) {
            self.host = host;
        }
        if let Some(dir) = var("GATEWAY_ROUTES_DIR").filter(|d| !d.is_empty()) {
            self.routes_directory = dir;
        }
        if let Some(watch) = var("GATEWAY_WATCH") {
            self.watch = !matches!(watch.as_str(), "0" | "false" | "off");
        }
        if let Some(workers) = var("GATEWAY_WORKERS").and_then(|w| w.parse().ok()) {
            self.workers_per_route = workers;
        }
        self.workers_per_route = self.workers_per_route.max(1);
        self.build_concurrency = self.build_concurrency.max(1);
    }

    pub fn tree_settings(&self, root: &Path) -> TreeSettings {
        TreeSettings {
            root: root.to_path_buf(),
            routes_directory: self.routes_directory.clone(),
            entry_file_name: self.entry_file_name.clone(),
            build_output_directory_name: self.build_output_directory_name.clone(),
            compiled_handler_file_name: self.compiled_handler_file_name.clone(),
            upload_subdirectory_name: self.upload_subdirectory_name.clone(),
        }
    }

    pub fn worker_stack_size(&self) -> usize {
        self.worker_stack_mb.max(1) * 1024 * 1024
    }
}

/// `GATEWAY_ROOT` if set, otherwise the current directory. Always absolute.
pub fn resolve_project_root() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    match std::env::var("GATEWAY_ROOT") {
        Ok(root) if !root.is_empty() => {
            let root = PathBuf::from(root);
            if root.is_absolute() { root } else { cwd.join(root) }
        }
        _ => cwd,
    }
}

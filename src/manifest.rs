//! Build mode
//!
//! Builds and loads every route once, stages the upload directories and
//! writes `<buildRoot>/manifest.json` for the provisioner.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};

use crate::discovery::ResolvedRoute;
use crate::gateway::{RouteStatus, RouterManager, Stage};

pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: u32,
    pub routes: Vec<ManifestRoute>,
    pub failures: Vec<ManifestFailure>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestRoute {
    #[serde(flatten)]
    pub route: ResolvedRoute,
    pub staged: PathBuf,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFailure {
    pub directory: PathBuf,
    pub endpoint: String,
    #[serde(flatten)]
    pub status: RouteStatus,
}

impl Manifest {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub async fn write(&self, build_root: &Path) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(build_root).await?;
        let path = build_root.join(MANIFEST_FILE_NAME);
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }
}

/// Stages every loaded route. Routes that failed anywhere, staging
/// included, end up in `failures`.
pub async fn collect(manager: &Arc<RouterManager>) -> Manifest {
    let table = manager.snapshot();
    let mut manifest = Manifest {
        version: MANIFEST_VERSION,
        routes: Vec::new(),
        failures: Vec::new(),
    };

    for live in table.routes() {
        let failure = |status: RouteStatus| ManifestFailure {
            directory: live.directory.clone(),
            endpoint: live.endpoint.clone(),
            status,
        };
        let (RouteStatus::Loaded | RouteStatus::Serving, Some(route)) = (&live.status, &live.route) else {
            manifest.failures.push(failure(live.status.clone()));
            continue;
        };
        match manager.orchestrator().stage_upload(route).await {
            Ok(staged) => manifest.routes.push(ManifestRoute {
                route: ResolvedRoute::clone(route),
                staged,
            }),
            Err(e) => {
                error!(endpoint = %live.endpoint, "staging failed: {e}");
                manifest.failures.push(failure(RouteStatus::Failed {
                    stage: Stage::Build,
                    message: e.to_string(),
                }));
            }
        }
    }
    manifest.routes.sort_by(|a, b| a.route.endpoint.cmp(&b.route.endpoint));
    manifest
}

/// Full build-mode run. Returns the written manifest.
pub async fn build(manager: &Arc<RouterManager>) -> anyhow::Result<Manifest> {
    manager.start().await?;
    let manifest = collect(manager).await;
    let path = manifest.write(manager.tree().build_root()).await?;
    info!(
        routes = manifest.routes.len(),
        failed = manifest.failures.len(),
        "manifest written to {}",
        path.display()
    );
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::copy_compiler;
    use crate::config::GatewayConfig;
    use crate::gateway::Mode;
    use crate::overrides::JsonOverrideEvaluator;
    use crate::tree::ResolvedTree;
    use serde_json::Value;
    use std::fs;
    use tempfile::TempDir;

    fn manager(root: &Path) -> Arc<RouterManager> {
        let config = GatewayConfig {
            entry_file_name: "+endpoint.js".to_string(),
            ..GatewayConfig::default()
        };
        let tree = ResolvedTree::resolve(&config.tree_settings(root)).unwrap();
        RouterManager::new(tree, &config, copy_compiler(), Arc::new(JsonOverrideEvaluator), Mode::Build)
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn writes_routes_with_their_final_methods() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "src/+endpoint.js", "exports.GET = () => ({}); exports.POST = () => ({});");
        write(dir.path(), "src/users/{id}/+endpoint.js", "exports.DELETE = () => ({});");
        let manager = manager(dir.path());

        let manifest = build(&manager).await.unwrap();
        assert!(manifest.is_success());
        assert_eq!(manifest.routes.len(), 2);

        let raw = fs::read_to_string(dir.path().join(".build").join(MANIFEST_FILE_NAME)).unwrap();
        let json: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["routes"][0]["endpoint"], "/");
        assert_eq!(json["routes"][0]["methods"], serde_json::json!(["GET", "POST"]));
        assert_eq!(json["routes"][1]["endpoint"], "/users/{id}");
        assert_eq!(json["routes"][1]["methods"], serde_json::json!(["DELETE"]));

        for route in &manifest.routes {
            assert!(route.staged.join("handler.js").is_file());
        }
    }

    #[tokio::test]
    async fn failed_routes_are_reported() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "src/ok/+endpoint.js", "exports.GET = () => ({});");
        write(dir.path(), "src/bad/+endpoint.js", "throw new Error('nope');");
        let manager = manager(dir.path());

        let manifest = build(&manager).await.unwrap();
        assert!(!manifest.is_success());
        assert_eq!(manifest.routes.len(), 1);
        assert_eq!(manifest.failures[0].endpoint, "/bad");

        let raw = fs::read_to_string(dir.path().join(".build").join(MANIFEST_FILE_NAME)).unwrap();
        let json: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["failures"][0]["state"], "failed");
        assert_eq!(json["failures"][0]["stage"], "load");
    }
}

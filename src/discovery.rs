//! Route Discovery Engine
//!
//! Walks the routes tree, finds every directory holding an entry file and
//! produces its fully merged [`ResolvedRoute`]. Descriptor failures are scoped
//! to the routes beneath them; endpoint conflicts are fatal.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::errors::{ConfigError, DiscoveryError};
use crate::overrides::{FunctionSettings, MergedConfig, OverrideEvaluator, RouteDefaults, RouteOverrides};
use crate::route_matching::RoutePattern;
use crate::tree::ResolvedTree;

/// Canonical configuration of one route. Replaced, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedRoute {
    pub directory: PathBuf,
    pub endpoint: String,
    pub entry_point: PathBuf,
    pub build_output_directory: PathBuf,
    pub compiled_handler_path: PathBuf,
    pub upload_directory: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub compiler_options: Map<String, Value>,
    pub function: FunctionSettings,
    /// Filled in once the handler module has been loaded.
    pub methods: BTreeSet<String>,
}

impl ResolvedRoute {
    pub fn new(tree: &ResolvedTree, directory: &Path, merged: MergedConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            directory: directory.to_path_buf(),
            endpoint: tree.directory_to_endpoint(directory)?,
            entry_point: tree.entry_point(directory),
            build_output_directory: tree.directory_to_build_output_directory(directory)?,
            compiled_handler_path: tree.directory_to_compiled_handler_path(directory)?,
            upload_directory: tree.directory_to_upload_directory(directory)?,
            environment: merged.environment,
            compiler_options: merged.compiler_options,
            function: merged.function,
            methods: BTreeSet::new(),
        })
    }

    pub fn pattern(&self) -> RoutePattern {
        RoutePattern::from_endpoint(&self.endpoint)
    }

    /// Same route, with the methods its loaded module exports.
    pub fn with_methods<I, S>(&self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            methods: methods.into_iter().map(Into::into).collect(),
            ..self.clone()
        }
    }

    /// Configuration-only equality: ignores the loaded methods.
    pub fn same_config(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
            && self.environment == other.environment
            && self.compiler_options == other.compiler_options
            && self.function == other.function
    }
}

/// A route whose descriptors could not be evaluated.
#[derive(Debug, Clone)]
pub struct DiscoveryFailure {
    pub endpoint: String,
    pub error: DiscoveryError,
}

#[derive(Debug, Default)]
pub struct Discovery {
    /// Keyed by route directory.
    pub routes: BTreeMap<PathBuf, Arc<ResolvedRoute>>,
    pub failures: BTreeMap<PathBuf, DiscoveryFailure>,
}

impl Discovery {
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty() && self.failures.is_empty()
    }
}

type Evaluated = Result<Option<Arc<RouteOverrides>>, DiscoveryError>;

pub fn discover(
    tree: &ResolvedTree,
    defaults: &RouteDefaults,
    override_file_name: &str,
    evaluator: &dyn OverrideEvaluator,
) -> Result<Discovery, ConfigError> {
    let directories = route_directories(tree)?;
    let mut descriptors: HashMap<PathBuf, Evaluated> = HashMap::new();
    let mut discovery = Discovery::default();

    for directory in directories {
        let chain = ancestor_chain(tree.routes_root(), &directory);
        let mut stack = Vec::with_capacity(chain.len());
        let mut failure = None;

        for ancestor in chain {
            let path = ancestor.join(override_file_name);
            let evaluated = descriptors
                .entry(path.clone())
                .or_insert_with(|| evaluate(evaluator, &path));
            match evaluated {
                Ok(Some(overrides)) => stack.push(Arc::clone(overrides)),
                Ok(None) => {}
                Err(e) => {
                    failure = Some(e.clone());
                    break;
                }
            }
        }

        let endpoint = tree.directory_to_endpoint(&directory)?;
        if let Some(error) = failure {
            warn!(endpoint = %endpoint, "route configuration failed: {error}");
            discovery
                .failures
                .insert(directory, DiscoveryFailure { endpoint, error });
            continue;
        }

        let merged = MergedConfig::resolve(defaults, stack.iter().map(|o| o.as_ref()));
        let route = ResolvedRoute::new(tree, &directory, merged)?;
        debug!(endpoint = %route.endpoint, dir = %directory.display(), "discovered route");
        discovery.routes.insert(directory, Arc::new(route));
    }

    check_conflicts(&discovery)?;
    Ok(discovery)
}

fn evaluate(evaluator: &dyn OverrideEvaluator, path: &Path) -> Evaluated {
    evaluator.evaluate(path).map(|o| o.map(Arc::new))
}

/// Every non-excluded directory under the routes root that contains the entry file.
fn route_directories(tree: &ResolvedTree) -> Result<Vec<PathBuf>, ConfigError> {
    let root = tree.routes_root();
    if !root.is_dir() {
        warn!(dir = %root.display(), "routes directory does not exist");
        return Ok(Vec::new());
    }

    let mut directories = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !tree.is_excluded(e.path()));
    for entry in walker {
        let entry = entry.map_err(|e| ConfigError::Walk(e.to_string()))?;
        if entry.file_type().is_file()
            && entry.file_name() == tree.entry_file_name()
            && let Some(parent) = entry.path().parent()
        {
            directories.push(crate::tree::normalize(parent));
        }
    }
    Ok(directories)
}

/// Routes root first, `directory` last.
fn ancestor_chain(routes_root: &Path, directory: &Path) -> Vec<PathBuf> {
    let mut chain: Vec<PathBuf> = directory
        .ancestors()
        .take_while(|a| a.starts_with(routes_root))
        .map(Path::to_path_buf)
        .collect();
    chain.reverse();
    chain
}

/// Endpoint conflicts the router and the build tree cannot live with.
pub fn check_conflicts(discovery: &Discovery) -> Result<(), ConfigError> {
    let mut endpoints: HashMap<&str, &Path> = HashMap::new();
    let mut shapes: HashMap<String, &str> = HashMap::new();

    let all = discovery
        .routes
        .iter()
        .map(|(dir, r)| (dir.as_path(), r.endpoint.as_str()))
        .chain(discovery.failures.iter().map(|(dir, f)| (dir.as_path(), f.endpoint.as_str())));

    for (dir, endpoint) in all {
        if let Some(first) = endpoints.insert(endpoint, dir) {
            return Err(ConfigError::DuplicateEndpoint {
                endpoint: endpoint.to_string(),
                first: first.to_path_buf(),
                second: dir.to_path_buf(),
            });
        }
        let shape = RoutePattern::from_endpoint(endpoint).shape();
        if let Some(first) = shapes.insert(shape, endpoint) {
            return Err(ConfigError::AmbiguousEndpoint {
                first: first.to_string(),
                second: endpoint.to_string(),
            });
        }
    }

    let uploads: HashMap<&Path, &Path> = discovery
        .routes
        .values()
        .map(|r| (r.upload_directory.as_path(), r.directory.as_path()))
        .collect();
    for route in discovery.routes.values() {
        if let Some(owner) = uploads.get(route.build_output_directory.as_path()) {
            return Err(ConfigError::UploadCollision {
                route: route.directory.clone(),
                owner: owner.to_path_buf(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overrides::JsonOverrideEvaluator;
    use crate::tree::TreeSettings;
    use std::fs;
    use tempfile::TempDir;

    fn tree(root: &Path) -> ResolvedTree {
        ResolvedTree::resolve(&TreeSettings {
            root: root.to_path_buf(),
            routes_directory: "src".to_string(),
            entry_file_name: "+endpoint.ts".to_string(),
            build_output_directory_name: ".build".to_string(),
            compiled_handler_file_name: "handler.js".to_string(),
            upload_subdirectory_name: "dist".to_string(),
        })
        .unwrap()
    }

    fn touch(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn run(root: &Path) -> Result<Discovery, ConfigError> {
        discover(&tree(root), &RouteDefaults::default(), "+config.json", &JsonOverrideEvaluator)
    }

    fn endpoints(discovery: &Discovery) -> Vec<&str> {
        discovery.routes.values().map(|r| r.endpoint.as_str()).collect()
    }

    #[test]
    fn finds_every_entry_directory() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "src/+endpoint.ts", "");
        touch(dir.path(), "src/users/+endpoint.ts", "");
        touch(dir.path(), "src/users/{id}/+endpoint.ts", "");
        touch(dir.path(), "src/lib/util.ts", "");

        let discovery = run(dir.path()).unwrap();
        assert_eq!(endpoints(&discovery), vec!["/", "/users", "/users/{id}"]);

        let user = &discovery.routes[&dir.path().join("src/users/{id}")];
        assert_eq!(user.compiled_handler_path, dir.path().join(".build/users/{id}/handler.js"));
        assert_eq!(user.upload_directory, dir.path().join(".build/users/{id}/dist"));
        assert!(user.methods.is_empty());
    }

    #[test]
    fn excluded_directories_are_skipped() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "src/ok/+endpoint.ts", "");
        touch(dir.path(), "src/.hidden/+endpoint.ts", "");
        touch(dir.path(), "src/node_modules/pkg/+endpoint.ts", "");

        let discovery = run(dir.path()).unwrap();
        assert_eq!(endpoints(&discovery), vec!["/ok"]);
    }

    #[test]
    fn missing_routes_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(run(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn nearest_descriptor_wins() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "src/+config.json", r#"{ "environment": { "A": "root", "B": "root" } }"#);
        touch(dir.path(), "src/+endpoint.ts", "");
        touch(dir.path(), "src/users/+config.json", r#"{ "environment": { "B": "users" } }"#);
        touch(dir.path(), "src/users/{id}/+endpoint.ts", "");

        let discovery = run(dir.path()).unwrap();
        let root = &discovery.routes[&dir.path().join("src")];
        assert_eq!(root.environment["B"], "root");

        let user = &discovery.routes[&dir.path().join("src/users/{id}")];
        assert_eq!(user.environment["A"], "root");
        assert_eq!(user.environment["B"], "users");
    }

    #[test]
    fn failing_descriptor_is_scoped_to_its_subtree() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "src/a/+endpoint.ts", "");
        touch(dir.path(), "src/b/+config.json", "{ broken");
        touch(dir.path(), "src/b/+endpoint.ts", "");
        touch(dir.path(), "src/b/c/+endpoint.ts", "");

        let discovery = run(dir.path()).unwrap();
        assert_eq!(endpoints(&discovery), vec!["/a"]);
        assert_eq!(discovery.failures.len(), 2);
        let failure = &discovery.failures[&dir.path().join("src/b/c")];
        assert_eq!(failure.endpoint, "/b/c");
        assert!(matches!(failure.error, DiscoveryError::Malformed { .. }));
    }

    #[test]
    fn duplicate_endpoints_are_fatal() {
        let dir = TempDir::new().unwrap();
        let tree = tree(dir.path());
        let first = tree.routes_root().join("users");
        let route = ResolvedRoute::new(&tree, &first, MergedConfig::from(&RouteDefaults::default())).unwrap();

        let mut discovery = Discovery::default();
        discovery.routes.insert(first.clone(), Arc::new(route.clone()));
        discovery.failures.insert(
            tree.routes_root().join("users-copy"),
            DiscoveryFailure {
                endpoint: "/users".to_string(),
                error: DiscoveryError::Malformed {
                    path: PathBuf::from("+config.json"),
                    message: "x".to_string(),
                },
            },
        );
        assert!(matches!(
            check_conflicts(&discovery),
            Err(ConfigError::DuplicateEndpoint { endpoint, .. }) if endpoint == "/users"
        ));
    }

    #[test]
    fn indistinguishable_parameters_are_fatal() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "src/a/{id}/+endpoint.ts", "");
        touch(dir.path(), "src/a/{name}/+endpoint.ts", "");
        assert!(matches!(run(dir.path()), Err(ConfigError::AmbiguousEndpoint { .. })));
    }

    #[test]
    fn build_output_inside_an_upload_directory_is_fatal() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "src/+endpoint.ts", "");
        touch(dir.path(), "src/dist/+endpoint.ts", "");
        assert!(matches!(run(dir.path()), Err(ConfigError::UploadCollision { .. })));
    }

    #[test]
    fn with_methods_keeps_configuration() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "src/+endpoint.ts", "");
        let discovery = run(dir.path()).unwrap();
        let route = discovery.routes.values().next().unwrap();
        let loaded = route.with_methods(["GET", "POST"]);
        assert!(loaded.same_config(route));
        assert_eq!(loaded.methods.len(), 2);
    }
}

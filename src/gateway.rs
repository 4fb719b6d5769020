//! Live Gateway / Router Manager
//!
//! Owns the live routing table. Requests read an immutable snapshot; builds,
//! loads and rediscovery publish new snapshots through `ArcSwap::rcu`, so
//! in-flight requests always finish against the table they started with.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::header::ALLOW;
use axum::http::{HeaderValue, Method, Request, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::Router;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::builder::{BuildOrchestrator, Compiler};
use crate::config::GatewayConfig;
use crate::discovery::{discover, Discovery, ResolvedRoute};
use crate::errors::ConfigError;
use crate::loader::{load, HandlerSet, LoadSettings};
use crate::overrides::{OverrideEvaluator, RouteDefaults};
use crate::route_matching::RoutePattern;
use crate::translate::{InvocationContext, InvocationEvent, InvocationResult};
use crate::tree::ResolvedTree;

/// Largest request body accepted, matching the platform's payload limit.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Discovery,
    Build,
    Load,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Discovery => "discovery",
            Stage::Build => "build",
            Stage::Load => "load",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum RouteStatus {
    Unbuilt,
    Built,
    Loaded,
    Serving,
    Failed { stage: Stage, message: String },
}

impl RouteStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, RouteStatus::Failed { .. })
    }
}

/// Dev mode serves loaded routes; build mode stops once every route is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Dev,
    Build,
}

/// One entry of the live table. Replaced, never mutated.
#[derive(Debug, Clone)]
pub struct LiveRoute {
    pub directory: PathBuf,
    pub endpoint: String,
    pub pattern: RoutePattern,
    /// `None` when the route's descriptors could not be evaluated.
    pub route: Option<Arc<ResolvedRoute>>,
    pub status: RouteStatus,
    pub handlers: Option<Arc<HandlerSet>>,
}

impl LiveRoute {
    fn new(directory: &Path, endpoint: &str, route: Option<Arc<ResolvedRoute>>, status: RouteStatus) -> Self {
        Self {
            directory: directory.to_path_buf(),
            endpoint: endpoint.to_string(),
            pattern: RoutePattern::from_endpoint(endpoint),
            route,
            status,
            handlers: None,
        }
    }
}

/// Immutable routing snapshot, ordered by match precedence.
#[derive(Debug, Clone, Default)]
pub struct LiveTable {
    routes: Vec<Arc<LiveRoute>>,
}

impl LiveTable {
    pub fn routes(&self) -> &[Arc<LiveRoute>] {
        &self.routes
    }

    pub fn get(&self, directory: &Path) -> Option<&Arc<LiveRoute>> {
        self.routes.iter().find(|r| r.directory == directory)
    }

    pub fn find(&self, path: &str) -> Option<(Arc<LiveRoute>, BTreeMap<String, String>)> {
        self.routes
            .iter()
            .find_map(|r| r.pattern.matches(path).map(|params| (Arc::clone(r), params)))
    }

    /// Nearest route directory enclosing `path`.
    pub fn enclosing(&self, path: &Path) -> Option<&Arc<LiveRoute>> {
        path.ancestors().find_map(|dir| self.get(dir))
    }

    fn with(&self, live: LiveRoute) -> Self {
        let mut routes: Vec<Arc<LiveRoute>> = self
            .routes
            .iter()
            .filter(|r| r.directory != live.directory)
            .cloned()
            .collect();
        routes.push(Arc::new(live));
        routes.sort_by(|a, b| a.pattern.precedence(&b.pattern));
        Self { routes }
    }

    fn without(&self, directory: &Path) -> Self {
        Self {
            routes: self.routes.iter().filter(|r| r.directory != directory).cloned().collect(),
        }
    }
}

/// Serializes rebuilds of one route; requests that arrive while a rebuild
/// runs collapse into a single follow-up run.
#[derive(Default)]
struct RebuildSlot {
    lock: Mutex<()>,
    requested: AtomicU64,
    completed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub serving: usize,
    pub loaded: usize,
    pub failed: usize,
}

pub struct RouterManager {
    tree: ResolvedTree,
    defaults: RouteDefaults,
    override_file_name: String,
    evaluator: Arc<dyn OverrideEvaluator>,
    orchestrator: BuildOrchestrator,
    load_settings: LoadSettings,
    build_concurrency: usize,
    mode: Mode,
    table: ArcSwap<LiveTable>,
    slots: DashMap<PathBuf, Arc<RebuildSlot>>,
    discovery_lock: Mutex<()>,
}

impl RouterManager {
    pub fn new(
        tree: ResolvedTree,
        config: &GatewayConfig,
        compiler: Arc<dyn Compiler>,
        evaluator: Arc<dyn OverrideEvaluator>,
        mode: Mode,
    ) -> Arc<Self> {
        let orchestrator = BuildOrchestrator::new(compiler, &tree, config.clean_before_build);
        Arc::new(Self {
            defaults: config.defaults.clone(),
            override_file_name: config.override_file_name.clone(),
            evaluator,
            orchestrator,
            load_settings: LoadSettings {
                workers: config.workers_per_route.max(1),
                stack_size: config.worker_stack_size(),
            },
            build_concurrency: config.build_concurrency.max(1),
            mode,
            table: ArcSwap::from_pointee(LiveTable::default()),
            slots: DashMap::new(),
            discovery_lock: Mutex::new(()),
            tree,
        })
    }

    pub fn tree(&self) -> &ResolvedTree {
        &self.tree
    }

    pub fn override_file_name(&self) -> &str {
        &self.override_file_name
    }

    pub fn orchestrator(&self) -> &BuildOrchestrator {
        &self.orchestrator
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<LiveTable> {
        self.table.load_full()
    }

    /// Discovers the tree, then builds and loads every route before returning.
    /// Configuration errors are fatal; per-route failures are not.
    pub async fn start(self: &Arc<Self>) -> Result<Summary, ConfigError> {
        let _guard = self.discovery_lock.lock().await;
        let discovery = self.discover().await?;
        info!(
            routes = discovery.routes.len(),
            failed = discovery.failures.len(),
            "discovered routes under {}",
            self.tree.routes_root().display()
        );

        for (dir, failure) in &discovery.failures {
            self.insert(LiveRoute::new(
                dir,
                &failure.endpoint,
                None,
                RouteStatus::Failed {
                    stage: Stage::Discovery,
                    message: failure.error.to_string(),
                },
            ));
        }
        let dirs: Vec<PathBuf> = discovery.routes.keys().cloned().collect();
        for (dir, route) in discovery.routes {
            self.insert(LiveRoute::new(&dir, &route.endpoint, Some(Arc::clone(&route)), RouteStatus::Unbuilt));
        }

        self.rebuild_all(dirs).await;
        Ok(self.summary())
    }

    pub fn summary(&self) -> Summary {
        let table = self.snapshot();
        let mut summary = Summary::default();
        for route in table.routes() {
            match route.status {
                RouteStatus::Serving => summary.serving += 1,
                RouteStatus::Loaded => summary.loaded += 1,
                RouteStatus::Failed { .. } => summary.failed += 1,
                _ => {}
            }
        }
        summary
    }

    async fn discover(&self) -> Result<Discovery, ConfigError> {
        let tree = self.tree.clone();
        let defaults = self.defaults.clone();
        let override_file_name = self.override_file_name.clone();
        let evaluator = Arc::clone(&self.evaluator);
        tokio::task::spawn_blocking(move || discover(&tree, &defaults, &override_file_name, evaluator.as_ref()))
            .await
            .map_err(|e| ConfigError::Walk(e.to_string()))?
    }

    /// Re-reads the tree after an entry file or descriptor changed: new routes
    /// are built, removed routes dropped, reconfigured routes rebuilt. Returns
    /// the directories that were rebuilt.
    pub async fn rediscover(self: &Arc<Self>) -> BTreeSet<PathBuf> {
        let _guard = self.discovery_lock.lock().await;
        let discovery = match self.discover().await {
            Ok(d) => d,
            Err(e) => {
                error!("configuration error, keeping the current routes: {e}");
                return BTreeSet::new();
            }
        };

        let current = self.snapshot();
        for live in current.routes() {
            let known = discovery.routes.contains_key(&live.directory)
                || discovery.failures.contains_key(&live.directory);
            if !known {
                info!(endpoint = %live.endpoint, "route removed");
                self.table.rcu(|table| table.without(&live.directory));
                self.slots.remove(&live.directory);
            }
        }

        for (dir, failure) in &discovery.failures {
            warn!(endpoint = %failure.endpoint, "route configuration failed");
            self.insert(LiveRoute::new(
                dir,
                &failure.endpoint,
                None,
                RouteStatus::Failed {
                    stage: Stage::Discovery,
                    message: failure.error.to_string(),
                },
            ));
        }

        let mut changed = BTreeSet::new();
        for (dir, route) in discovery.routes {
            let unchanged = current.get(&dir).is_some_and(|live| {
                !live.status.is_failed() && live.route.as_ref().is_some_and(|r| r.same_config(&route))
            });
            if unchanged {
                continue;
            }
            match current.get(&dir) {
                Some(_) => info!(endpoint = %route.endpoint, "route configuration changed"),
                None => info!(endpoint = %route.endpoint, "route added"),
            }
            let previous = current.get(&dir).and_then(|live| live.handlers.clone());
            let mut live = LiveRoute::new(&dir, &route.endpoint, Some(Arc::clone(&route)), RouteStatus::Unbuilt);
            live.handlers = previous;
            self.insert(live);
            changed.insert(dir);
        }
        drop(_guard);

        self.rebuild_all(changed.iter().cloned().collect()).await;
        changed
    }

    /// Rebuilds the routes enclosing `files`; a file outside every route
    /// (shared code) rebuilds all of them.
    pub async fn rebuild_for_files(self: &Arc<Self>, files: &[PathBuf], skip: &BTreeSet<PathBuf>) {
        let table = self.snapshot();
        let mut dirs = BTreeSet::new();
        for file in files {
            match table.enclosing(file) {
                Some(live) => {
                    dirs.insert(live.directory.clone());
                }
                None => {
                    debug!(file = %file.display(), "shared file changed, rebuilding every route");
                    dirs.extend(table.routes().iter().filter(|r| r.route.is_some()).map(|r| r.directory.clone()));
                    break;
                }
            }
        }
        let dirs: Vec<PathBuf> = dirs.into_iter().filter(|d| !skip.contains(d)).collect();
        self.rebuild_all(dirs).await;
    }

    /// Builds every directory, at most `build_concurrency` at a time, and
    /// waits for all of them.
    pub async fn rebuild_all(self: &Arc<Self>, dirs: Vec<PathBuf>) {
        let semaphore = Arc::new(Semaphore::new(self.build_concurrency));
        let mut tasks = JoinSet::new();
        for dir in dirs {
            let this = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                this.rebuild_route(&dir).await;
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("rebuild task failed: {e}");
            }
        }
    }

    /// Build → load → publish for one route, serialized per route. A call
    /// made while another rebuild of the same route runs waits for it, then
    /// runs once on behalf of every caller that queued meanwhile.
    pub async fn rebuild_route(&self, dir: &Path) {
        let slot = Arc::clone(self.slots.entry(dir.to_path_buf()).or_default().value());
        let ticket = slot.requested.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = slot.lock.lock().await;
        if slot.completed.load(Ordering::SeqCst) >= ticket {
            debug!(dir = %dir.display(), "rebuild already covered");
            return;
        }
        let covers = slot.requested.load(Ordering::SeqCst);
        self.build_and_load(dir).await;
        slot.completed.store(covers, Ordering::SeqCst);
    }

    async fn build_and_load(&self, dir: &Path) {
        // Always the latest configuration for this directory.
        let Some(route) = self.snapshot().get(dir).and_then(|live| live.route.clone()) else {
            return;
        };

        let built = match self.orchestrator.build(&route).await {
            Ok(output) => output,
            Err(e) => {
                error!(endpoint = %route.endpoint, "build failed: {e}");
                self.update_current(dir, &route, |live| LiveRoute {
                    status: RouteStatus::Failed {
                        stage: Stage::Build,
                        message: e.to_string(),
                    },
                    handlers: None,
                    ..live.clone()
                });
                return;
            }
        };
        self.update_current(dir, &route, |live| LiveRoute {
            status: RouteStatus::Built,
            ..live.clone()
        });

        let start = Instant::now();
        let set = match load(Arc::clone(&route), &self.load_settings).await {
            Ok(set) => set,
            Err(e) => {
                error!(endpoint = %route.endpoint, "load failed: {e}");
                self.update_current(dir, &route, |live| LiveRoute {
                    status: RouteStatus::Failed {
                        stage: Stage::Load,
                        message: e.to_string(),
                    },
                    handlers: None,
                    ..live.clone()
                });
                return;
            }
        };
        info!(
            endpoint = %route.endpoint,
            build_ms = built.elapsed.as_millis() as u64,
            load_ms = start.elapsed().as_millis() as u64,
            "route ready"
        );

        let loaded = Arc::new(route.with_methods(set.methods()));
        let (status, handlers) = match self.mode {
            Mode::Dev => (RouteStatus::Serving, Some(Arc::new(set))),
            Mode::Build => (RouteStatus::Loaded, None),
        };
        self.update_current(dir, &route, |live| LiveRoute {
            route: Some(Arc::clone(&loaded)),
            status: status.clone(),
            handlers: handlers.clone(),
            ..live.clone()
        });
    }

    fn insert(&self, live: LiveRoute) {
        self.table.rcu(|table| table.with(live.clone()));
    }

    /// Replaces an existing entry; a route removed meanwhile stays removed.
    fn update(&self, dir: &Path, f: impl Fn(&LiveRoute) -> LiveRoute) {
        self.table.rcu(|table| match table.get(dir) {
            Some(live) => table.with(f(live)),
            None => LiveTable::clone(table),
        });
    }

    /// Like [`Self::update`], but only while the entry still carries the
    /// configuration `route` was built from. A newer configuration published
    /// by rediscovery meanwhile is left alone; its own rebuild is queued.
    fn update_current(&self, dir: &Path, route: &ResolvedRoute, f: impl Fn(&LiveRoute) -> LiveRoute) {
        self.update(dir, |live| {
            if live.route.as_ref().is_some_and(|current| current.same_config(route)) {
                f(live)
            } else {
                debug!(endpoint = %route.endpoint, "configuration changed during rebuild, result dropped");
                live.clone()
            }
        });
    }
}

pub fn router(manager: Arc<RouterManager>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(CorsLayer::permissive())
        .with_state(manager)
}

async fn dispatch(State(manager): State<Arc<RouterManager>>, req: Request<Body>) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let table = manager.snapshot();
    let (mut response, endpoint) = match table.find(&path) {
        None => ((StatusCode::NOT_FOUND, "Not Found").into_response(), None),
        Some((live, params)) => {
            let response = serve(&live, params, req).await;
            (response, Some(live.endpoint.clone()))
        }
    };

    let status = response.status();
    let endpoint = endpoint.as_deref().unwrap_or("-");
    let ms = start.elapsed().as_secs_f64() * 1000.0;
    if let Ok(timing) = HeaderValue::from_str(&format!("handler;dur={ms:.2}")) {
        response.headers_mut().insert("server-timing", timing);
    }
    if status.is_server_error() {
        warn!(%method, %path, endpoint, status = status.as_u16(), "{ms:.2}ms");
    } else {
        info!(%method, %path, endpoint, status = status.as_u16(), "{ms:.2}ms");
    }
    response
}

async fn serve(live: &LiveRoute, params: BTreeMap<String, String>, req: Request<Body>) -> Response {
    if let RouteStatus::Failed { stage, message } = &live.status {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{stage} failed: {message}"));
    }
    let (Some(handlers), Some(route)) = (&live.handlers, &live.route) else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "route is still building".to_string());
    };
    let Some(handler) = handlers.resolve(req.method()).cloned() else {
        let mut response = StatusCode::METHOD_NOT_ALLOWED.into_response();
        if let Ok(allow) = HeaderValue::from_str(&handlers.allow()) {
            response.headers_mut().insert(ALLOW, allow);
        }
        return response;
    };

    let (parts, body) = req.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large".to_string()),
    };

    let request_id = uuid::Uuid::new_v4().to_string();
    let event = InvocationEvent::from_request(&parts, &body, &live.endpoint, params, &request_id);
    let context = InvocationContext::new(&live.endpoint, &route.function, &request_id);
    let payload = match event.payload(&context) {
        Ok(p) => p,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let value = match handlers.invoke(&handler, payload).await {
        Ok(v) => v,
        Err(e) => {
            error!(endpoint = %live.endpoint, request_id = %event.request_id(), "{e}");
            return error_response(e.status(), e.to_string());
        }
    };

    let head = handler.strips_body() || parts.method == Method::HEAD;
    match InvocationResult::from_value(value).and_then(|r| r.into_response(head)) {
        Ok(response) => response,
        Err(e) => {
            error!(endpoint = %live.endpoint, request_id = %event.request_id(), "{e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests;

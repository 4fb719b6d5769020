//! Handler Loader
//!
//! Loads a route's compiled module fresh from disk into a new worker pool and
//! maps its exports onto HTTP verbs.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use serde_json::Value;
use tracing::{info, warn};

use crate::discovery::ResolvedRoute;
use crate::errors::{EngineError, LoadError};
use crate::runtime::{InvocationPayload, ModulePool, PoolSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Verb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
    /// Answers every verb without a dedicated export.
    Any,
}

impl Verb {
    pub const ALL: [Verb; 8] = [
        Verb::Get,
        Verb::Post,
        Verb::Put,
        Verb::Patch,
        Verb::Delete,
        Verb::Head,
        Verb::Options,
        Verb::Any,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Put => "PUT",
            Verb::Patch => "PATCH",
            Verb::Delete => "DELETE",
            Verb::Head => "HEAD",
            Verb::Options => "OPTIONS",
            Verb::Any => "ANY",
        }
    }

    /// Export names are matched exactly: `get` is not a handler.
    pub fn from_export(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == name)
    }

    pub fn from_method(method: &Method) -> Option<Self> {
        match *method {
            Method::GET => Some(Verb::Get),
            Method::POST => Some(Verb::Post),
            Method::PUT => Some(Verb::Put),
            Method::PATCH => Some(Verb::Patch),
            Method::DELETE => Some(Verb::Delete),
            Method::HEAD => Some(Verb::Head),
            Method::OPTIONS => Some(Verb::Options),
            _ => None,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One verb's responder: the export it calls, and whether the response body is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handler {
    pub verb: Verb,
    pub export: &'static str,
    pub synthesized: bool,
}

impl Handler {
    pub fn strips_body(&self) -> bool {
        self.verb == Verb::Head
    }
}

#[derive(Debug, Clone)]
pub struct LoadSettings {
    pub workers: usize,
    pub stack_size: usize,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            stack_size: 8 * 1024 * 1024,
        }
    }
}

/// A loaded route. Dropping it shuts its workers down.
pub struct HandlerSet {
    route: Arc<ResolvedRoute>,
    pool: ModulePool,
    handlers: BTreeMap<Verb, Handler>,
}

impl fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSet")
            .field("endpoint", &self.route.endpoint)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerSet {
    /// Verbs the module exports, synthesized ones excluded.
    pub fn methods(&self) -> Vec<&'static str> {
        self.handlers
            .values()
            .filter(|h| !h.synthesized)
            .map(|h| h.verb.as_str())
            .collect()
    }

    /// Value of the `Allow` header.
    pub fn allow(&self) -> String {
        let verbs: Vec<&str> = self
            .handlers
            .keys()
            .filter(|v| **v != Verb::Any)
            .map(|v| v.as_str())
            .collect();
        verbs.join(", ")
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// The responder for `method`: the dedicated export first, then `ANY`.
    pub fn resolve(&self, method: &Method) -> Option<&Handler> {
        Verb::from_method(method)
            .and_then(|verb| self.handlers.get(&verb))
            .or_else(|| self.handlers.get(&Verb::Any))
    }

    pub async fn invoke(&self, handler: &Handler, payload: InvocationPayload) -> Result<Value, EngineError> {
        let timeout = Duration::from_secs(self.route.function.timeout_seconds.max(1));
        self.pool.invoke(handler.export, payload, timeout).await
    }
}

/// Maps function exports onto verbs, synthesizing `HEAD` from `GET`.
pub fn handlers_for(exports: &[String]) -> BTreeMap<Verb, Handler> {
    let mut handlers: BTreeMap<Verb, Handler> = exports
        .iter()
        .filter_map(|name| Verb::from_export(name))
        .map(|verb| {
            (
                verb,
                Handler {
                    verb,
                    export: verb.as_str(),
                    synthesized: false,
                },
            )
        })
        .collect();

    if handlers.contains_key(&Verb::Get) && !handlers.contains_key(&Verb::Head) {
        handlers.insert(
            Verb::Head,
            Handler {
                verb: Verb::Head,
                export: Verb::Get.as_str(),
                synthesized: true,
            },
        );
    }
    handlers
}

pub async fn load(route: Arc<ResolvedRoute>, settings: &LoadSettings) -> Result<HandlerSet, LoadError> {
    let path = &route.compiled_handler_path;
    let code = tokio::fs::read_to_string(path).await.map_err(|e| LoadError::Read {
        path: path.clone(),
        message: e.to_string(),
    })?;

    let spec = PoolSpec {
        label: route.endpoint.clone(),
        filename: path.to_string_lossy().into_owned(),
        code: Arc::from(code),
        environment: route.environment.clone(),
        workers: settings.workers,
        stack_size: settings.stack_size,
    };
    let pool = tokio::task::spawn_blocking(move || ModulePool::spawn(spec))
        .await
        .map_err(|e| EngineError::Spawn(e.to_string()))??;

    let handlers = handlers_for(pool.exports());
    let set = HandlerSet { route, pool, handlers };
    if set.is_empty() {
        warn!(endpoint = %set.route.endpoint, "module exports no HTTP method handlers");
    } else {
        info!(endpoint = %set.route.endpoint, methods = %set.methods().join(","), "loaded");
    }
    Ok(set)
}

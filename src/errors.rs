//! Error taxonomy.
//!
//! Configuration errors abort startup. Everything else is scoped to a single
//! route (discovery, build, load) or a single request (engine, translation).

use std::path::PathBuf;

use axum::http::StatusCode;
use thiserror::Error;

/// Fatal at startup: nothing is served until these are fixed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("project root must be an absolute path: {0}")]
    RelativeRoot(PathBuf),

    #[error("`{setting}` must stay inside the project root: {value}")]
    EscapesRoot { setting: &'static str, value: String },

    #[error("`{setting}` must be a plain file name: {value:?}")]
    InvalidFileName { setting: &'static str, value: String },

    #[error("{0} is not inside the routes directory")]
    OutsideRoutes(PathBuf),

    #[error("endpoint {endpoint} is defined by both {first} and {second}")]
    DuplicateEndpoint {
        endpoint: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("endpoints {first} and {second} cannot be told apart by the router")]
    AmbiguousEndpoint { first: String, second: String },

    #[error("build output of {route} collides with the upload directory of {owner}")]
    UploadCollision { route: PathBuf, owner: PathBuf },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to walk the routes directory: {0}")]
    Walk(String),
}

/// A single override descriptor failed to evaluate.
#[derive(Debug, Clone, Error)]
pub enum DiscoveryError {
    #[error("failed to read override descriptor {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("malformed override descriptor {path}: {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("override descriptor {path} declares unsupported version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },
}

#[derive(Debug, Clone, Error)]
pub enum BuildError {
    #[error("failed to start compiler `{program}`: {message}")]
    Spawn { program: String, message: String },

    #[error("compilation of {entry} failed:\n{diagnostics}")]
    Compiler { entry: PathBuf, diagnostics: String },

    #[error("compiler finished but {0} was not produced")]
    MissingOutput(PathBuf),

    #[error("build I/O error on {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("build task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("failed to read compiled handler {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Failures inside the embedded JavaScript engine.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("handler runtime bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("module evaluation failed: {0}")]
    Evaluation(String),

    #[error("{0}")]
    Exception(String),

    #[error("handler did not settle its result (timers and host I/O are unavailable in the development runtime)")]
    Unsettled,

    #[error("handler exceeded its timeout of {0}s")]
    Timeout(u64),

    #[error("all handler workers are busy")]
    Busy,

    #[error("handler worker is gone: {0}")]
    WorkerGone(String),

    #[error("failed to start handler worker: {0}")]
    Spawn(String),

    #[error("unexpected reply from handler runtime: {0}")]
    Protocol(String),
}

impl EngineError {
    pub fn status(&self) -> StatusCode {
        match self {
            EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            EngineError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// The handler returned something that cannot become an HTTP response.
#[derive(Debug, Clone, Error)]
pub enum TranslationError {
    #[error("handler result must be an object, got {0}")]
    NotAnObject(&'static str),

    #[error("invalid statusCode {0}")]
    StatusCode(String),

    #[error("invalid response header {name:?}: {message}")]
    Header { name: String, message: String },

    #[error("body is marked base64 but does not decode: {0}")]
    Base64(String),

    #[error("malformed handler result: {0}")]
    Shape(String),
}

/// Returns the textual kind of a JSON value, for error messages.
pub fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

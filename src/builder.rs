//! Build Orchestrator
//!
//! Compiles one route's entry file into its build output directory through a
//! pluggable [`Compiler`]. The compiler itself is a black box: entry file and
//! options in, files on disk out.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::debug;

use crate::config::CompilerConfig;
use crate::discovery::ResolvedRoute;
use crate::errors::BuildError;
use crate::tree::ResolvedTree;

/// Environment variable carrying the route's compiler options as JSON.
pub const COMPILER_OPTIONS_ENV: &str = "ENDPOINT_COMPILER_OPTIONS";

#[derive(Debug, Clone)]
pub struct CompileJob {
    pub entry_file: PathBuf,
    pub output_directory: PathBuf,
    pub output_name: String,
    pub options: Map<String, Value>,
}

/// Blocking compiler invocation; always called from the blocking pool.
pub trait Compiler: Send + Sync + 'static {
    fn compile(&self, job: &CompileJob) -> Result<(), BuildError>;
}

impl<F> Compiler for F
where
    F: Fn(&CompileJob) -> Result<(), BuildError> + Send + Sync + 'static,
{
    fn compile(&self, job: &CompileJob) -> Result<(), BuildError> {
        self(job)
    }
}

/// Runs an external bundler from an argument template.
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    program: String,
    args: Vec<String>,
}

impl CommandCompiler {
    pub fn new(config: &CompilerConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
        }
    }

    pub fn arguments(&self, job: &CompileJob) -> Vec<String> {
        let entry = job.entry_file.to_string_lossy();
        let outdir = job.output_directory.to_string_lossy();
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{entry}", &entry)
                    .replace("{outdir}", &outdir)
                    .replace("{name}", &job.output_name)
            })
            .collect();
        args.extend(option_flags(&job.options));
        args
    }
}

impl Compiler for CommandCompiler {
    fn compile(&self, job: &CompileJob) -> Result<(), BuildError> {
        let args = self.arguments(job);
        debug!(program = %self.program, ?args, "running compiler");

        let output = Command::new(&self.program)
            .args(&args)
            .env(COMPILER_OPTIONS_ENV, Value::Object(job.options.clone()).to_string())
            .output()
            .map_err(|e| BuildError::Spawn {
                program: self.program.clone(),
                message: e.to_string(),
            })?;

        if output.status.success() {
            return Ok(());
        }

        let mut diagnostics = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            if !diagnostics.is_empty() {
                diagnostics.push('\n');
            }
            diagnostics.push_str(stdout.trim_end());
        }
        if diagnostics.is_empty() {
            diagnostics = format!("`{}` exited with {}", self.program, output.status);
        }
        Err(BuildError::Compiler {
            entry: job.entry_file.clone(),
            diagnostics,
        })
    }
}

/// Compiler options as command-line flags:
/// `true` → `--k`, `false`/`null` → nothing, scalar → `--k=v`,
/// array → one flag per item, object → `--k:sub=v`.
pub fn option_flags(options: &Map<String, Value>) -> Vec<String> {
    let mut flags = Vec::new();
    for (key, value) in options {
        push_flag(&mut flags, key, value);
    }
    flags
}

fn push_flag(flags: &mut Vec<String>, key: &str, value: &Value) {
    match value {
        Value::Null | Value::Bool(false) => {}
        Value::Bool(true) => flags.push(format!("--{key}")),
        Value::String(s) => flags.push(format!("--{key}={s}")),
        Value::Number(n) => flags.push(format!("--{key}={n}")),
        Value::Array(items) => {
            for item in items {
                push_flag(flags, key, item);
            }
        }
        Value::Object(map) => {
            for (sub, v) in map {
                match v {
                    Value::String(s) => flags.push(format!("--{key}:{sub}={s}")),
                    other => flags.push(format!("--{key}:{sub}={other}")),
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub compiled_handler_path: PathBuf,
    pub elapsed: Duration,
}

#[derive(Clone)]
pub struct BuildOrchestrator {
    compiler: Arc<dyn Compiler>,
    output_name: String,
    clean_before_build: bool,
}

impl BuildOrchestrator {
    pub fn new(compiler: Arc<dyn Compiler>, tree: &ResolvedTree, clean_before_build: bool) -> Self {
        Self {
            compiler,
            output_name: tree.output_name().to_string(),
            clean_before_build,
        }
    }

    pub async fn build(&self, route: &ResolvedRoute) -> Result<BuildOutput, BuildError> {
        let start = Instant::now();
        let outdir = &route.build_output_directory;

        tokio::fs::create_dir_all(outdir).await.map_err(|e| io_error(outdir, e))?;
        if self.clean_before_build {
            self.clean(route).await?;
        }

        let job = CompileJob {
            entry_file: route.entry_point.clone(),
            output_directory: outdir.clone(),
            output_name: self.output_name.clone(),
            options: route.compiler_options.clone(),
        };
        let compiler = Arc::clone(&self.compiler);
        tokio::task::spawn_blocking(move || compiler.compile(&job))
            .await
            .map_err(|e| BuildError::Aborted(e.to_string()))??;

        if !tokio::fs::try_exists(&route.compiled_handler_path)
            .await
            .unwrap_or(false)
        {
            return Err(BuildError::MissingOutput(route.compiled_handler_path.clone()));
        }

        let elapsed = start.elapsed();
        debug!(endpoint = %route.endpoint, ms = elapsed.as_millis() as u64, "compiled");
        Ok(BuildOutput {
            compiled_handler_path: route.compiled_handler_path.clone(),
            elapsed,
        })
    }

    /// Removes this route's previous artifacts only. Nested routes keep
    /// their outputs in subdirectories, which are never touched.
    async fn clean(&self, route: &ResolvedRoute) -> Result<(), BuildError> {
        let outdir = &route.build_output_directory;
        let prefix = format!("{}.", self.output_name);
        let mut entries = tokio::fs::read_dir(outdir).await.map_err(|e| io_error(outdir, e))?;

        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(outdir, e))? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file && (name == self.output_name || name.starts_with(&prefix)) {
                let path = entry.path();
                tokio::fs::remove_file(&path).await.map_err(|e| io_error(&path, e))?;
            }
        }

        match tokio::fs::remove_dir_all(&route.upload_directory).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&route.upload_directory, e)),
        }
    }

    /// Copies the compiled handler and its source map into the upload directory.
    pub async fn stage_upload(&self, route: &ResolvedRoute) -> Result<PathBuf, BuildError> {
        let upload = &route.upload_directory;
        tokio::fs::create_dir_all(upload).await.map_err(|e| io_error(upload, e))?;

        let handler = &route.compiled_handler_path;
        let Some(file_name) = handler.file_name() else {
            return Err(BuildError::MissingOutput(handler.clone()));
        };
        tokio::fs::copy(handler, upload.join(file_name))
            .await
            .map_err(|e| io_error(handler, e))?;

        let mut map_name = file_name.to_os_string();
        map_name.push(".map");
        let map = handler.with_file_name(&map_name);
        if tokio::fs::try_exists(&map).await.unwrap_or(false) {
            tokio::fs::copy(&map, upload.join(&map_name))
                .await
                .map_err(|e| io_error(&map, e))?;
        }
        Ok(upload.clone())
    }
}

fn io_error(path: &Path, e: std::io::Error) -> BuildError {
    BuildError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

/// Test compiler: copies the entry file verbatim to `<outdir>/<name>.js`.
#[cfg(test)]
pub fn copy_compiler() -> Arc<dyn Compiler> {
    Arc::new(|job: &CompileJob| -> Result<(), BuildError> {
        let target = job.output_directory.join(format!("{}.js", job.output_name));
        std::fs::copy(&job.entry_file, &target).map_err(|e| io_error(&job.entry_file, e))?;
        Ok(())
    })
}

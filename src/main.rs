//! Endpoint development server
//!
//! Discovers file-system routes, compiles each one, loads the compiled
//! handlers into embedded V8 isolates and serves them over HTTP with hot
//! reload.
//!
//! ```text
//! endpoint-server          dev server with file watching
//! endpoint-server build    build every route, stage uploads, write the manifest
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod builder;
mod config;
mod discovery;
mod engine;
mod errors;
mod gateway;
mod loader;
mod manifest;
mod overrides;
mod route_matching;
mod runtime;
mod translate;
mod tree;
mod utils;
mod watcher;

use builder::CommandCompiler;
use config::{resolve_project_root, GatewayConfig};
use gateway::{Mode, RouterManager};
use overrides::JsonOverrideEvaluator;
use tree::ResolvedTree;
use utils::{blue, gray, green, red};

/// Global allocator: mimalloc for faster allocations on the request path.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("endpoint_server=info,handler=debug")),
        )
        .init();

    let mode = match std::env::args().nth(1).as_deref() {
        None | Some("dev") => Mode::Dev,
        Some("build") => Mode::Build,
        Some(other) => anyhow::bail!("unknown command `{other}` (expected `dev` or `build`)"),
    };

    let root = resolve_project_root();
    let config = GatewayConfig::load(&root)?;
    let tree = ResolvedTree::resolve(&config.tree_settings(&root))?;
    info!(root = %tree.root().display(), routes = %tree.routes_root().display(), "project");

    let compiler = Arc::new(CommandCompiler::new(&config.compiler));
    let manager = RouterManager::new(tree, &config, compiler, Arc::new(JsonOverrideEvaluator), mode);

    match mode {
        Mode::Build => build(&manager).await,
        Mode::Dev => serve(manager, &config).await,
    }
}

async fn build(manager: &Arc<RouterManager>) -> Result<()> {
    let manifest = manifest::build(manager).await?;
    print!("{}", utils::route_listing(&manager.snapshot()));
    if manifest.is_success() {
        println!("{} {} route(s) ready", green("build complete:"), manifest.routes.len());
        Ok(())
    } else {
        println!("{} {} route(s) failed", red("build failed:"), manifest.failures.len());
        std::process::exit(1);
    }
}

async fn serve(manager: Arc<RouterManager>, config: &GatewayConfig) -> Result<()> {
    // Subscribe before the initial build so early edits are not lost.
    let watcher = if config.watch {
        match watcher::Watcher::new(Arc::clone(&manager), Duration::from_millis(config.debounce_ms)) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!("file watching unavailable, hot reload disabled: {e}");
                None
            }
        }
    } else {
        None
    };

    let summary = manager.start().await?;
    print!("{}", utils::route_listing(&manager.snapshot()));
    if summary.failed > 0 {
        warn!(failed = summary.failed, "some routes failed; fix them and save to retry");
    }

    if let Some(watcher) = watcher {
        tokio::spawn(watcher.run());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    println!(
        "{} http://localhost:{}  {}",
        blue("endpoint server running at:"),
        config.port,
        gray(&format!(
            "(Routes: {}, Workers/route: {}, Stack: {}MB{})",
            summary.serving,
            config.workers_per_route,
            config.worker_stack_mb,
            if config.watch { ", Watching" } else { "" }
        ))
    );

    axum::serve(listener, gateway::router(manager))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

use super::*;
use crate::builder::{copy_compiler, CompileJob};
use crate::errors::BuildError;
use crate::overrides::JsonOverrideEvaluator;
use axum::http::HeaderMap;
use serde_json::Value;
use std::fs;
use std::sync::atomic::AtomicUsize;
use tempfile::TempDir;
use tower::ServiceExt;

const HELLO: &str =
    "exports.GET = async () => ({ statusCode: 200, body: JSON.stringify({ message: 'hello' }) });";

fn config() -> GatewayConfig {
    GatewayConfig {
        entry_file_name: "+endpoint.js".to_string(),
        workers_per_route: 1,
        build_concurrency: 2,
        ..GatewayConfig::default()
    }
}

fn write(root: &Path, rel: &str, content: &str) -> PathBuf {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, content).unwrap();
    path
}

fn manager_with(root: &Path, compiler: Arc<dyn Compiler>, mode: Mode) -> Arc<RouterManager> {
    let config = config();
    let tree = ResolvedTree::resolve(&config.tree_settings(root)).unwrap();
    RouterManager::new(tree, &config, compiler, Arc::new(JsonOverrideEvaluator), mode)
}

async fn started(root: &Path) -> Arc<RouterManager> {
    let manager = manager_with(root, copy_compiler(), Mode::Dev);
    manager.start().await.unwrap();
    manager
}

async fn call(manager: &Arc<RouterManager>, method: Method, uri: &str, body: &str) -> (StatusCode, HeaderMap, String) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body.to_string()))
        .unwrap();
    let res = router(Arc::clone(manager)).oneshot(req).await.unwrap();
    let status = res.status();
    let headers = res.headers().clone();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    (status, headers, String::from_utf8(bytes.to_vec()).unwrap())
}

fn json_body(body: &str) -> Value {
    serde_json::from_str(body).unwrap()
}

#[tokio::test]
async fn serves_a_discovered_route() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "src/+endpoint.js", HELLO);
    let manager = started(dir.path()).await;

    assert_eq!(manager.summary().serving, 1);
    let (status, headers, body) = call(&manager, Method::GET, "/", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "application/json");
    assert_eq!(json_body(&body)["message"], "hello");
}

#[tokio::test]
async fn edits_take_effect_after_rebuild_without_restart() {
    let dir = TempDir::new().unwrap();
    let entry = write(dir.path(), "src/+endpoint.js", HELLO);
    let manager = started(dir.path()).await;

    let (status, headers, _) = call(&manager, Method::POST, "/", "{}").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(headers["allow"], "GET, HEAD");

    fs::write(
        &entry,
        format!("{HELLO}\nexports.POST = (e) => ({{ statusCode: 201, body: e.body }});"),
    )
    .unwrap();
    manager.rebuild_for_files(&[entry.clone()], &BTreeSet::new()).await;

    let (status, _, body) = call(&manager, Method::POST, "/", "{\"n\":1}").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json_body(&body)["n"], 1);

    let table = manager.snapshot();
    let route = table.routes()[0].route.as_ref().unwrap();
    assert_eq!(
        route.methods.iter().map(String::as_str).collect::<Vec<_>>(),
        vec!["GET", "POST"]
    );
}

#[tokio::test]
async fn head_is_answered_by_get_without_a_body() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "src/+endpoint.js", HELLO);
    let manager = started(dir.path()).await;

    let (status, headers, body) = call(&manager, Method::HEAD, "/", "").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
    assert_eq!(headers["content-length"], "19");
}

#[tokio::test]
async fn a_broken_route_does_not_affect_its_siblings() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "src/a/+endpoint.js", "exports.GET = () => ({ body: 'a' });");
    write(dir.path(), "src/b/+endpoint.js", "exports.GET = ( => {");
    let manager = started(dir.path()).await;

    let summary = manager.summary();
    assert_eq!((summary.serving, summary.failed), (1, 1));

    let (status, _, body) = call(&manager, Method::GET, "/a", "").await;
    assert_eq!((status, body.as_str()), (StatusCode::OK, "a"));

    let (status, _, body) = call(&manager, Method::GET, "/b", "").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json_body(&body)["error"].as_str().unwrap().starts_with("load failed"));
}

#[tokio::test]
async fn unknown_paths_are_not_found() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "src/a/+endpoint.js", "exports.GET = () => ({ body: 'a' });");
    let manager = started(dir.path()).await;

    let (status, _, body) = call(&manager, Method::GET, "/nope", "").await;
    assert_eq!((status, body.as_str()), (StatusCode::NOT_FOUND, "Not Found"));
    let (status, _, _) = call(&manager, Method::GET, "/", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn handler_errors_become_500() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "src/+endpoint.js", "exports.GET = async () => { throw new Error('boom'); };");
    let manager = started(dir.path()).await;

    let (status, _, body) = call(&manager, Method::GET, "/", "").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json_body(&body)["error"].as_str().unwrap().contains("boom"));
}

#[tokio::test]
async fn path_parameters_and_static_precedence() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "src/users/{id}/+endpoint.js",
        "exports.GET = (e) => ({ body: JSON.stringify({ id: e.pathParameters.id, resource: e.resource }) });",
    );
    write(dir.path(), "src/users/me/+endpoint.js", "exports.GET = () => ({ body: 'me' });");
    let manager = started(dir.path()).await;

    let (_, _, body) = call(&manager, Method::GET, "/users/me", "").await;
    assert_eq!(body, "me");

    let (status, _, body) = call(&manager, Method::GET, "/users/a%20b", "").await;
    assert_eq!(status, StatusCode::OK);
    let body = json_body(&body);
    assert_eq!(body["id"], "a b");
    assert_eq!(body["resource"], "/users/{id}");
}

#[tokio::test]
async fn headers_and_query_collapse_repeated_keys() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "src/+endpoint.js",
        "exports.ANY = (e) => ({ body: JSON.stringify({ \
           q: e.queryStringParameters, mq: e.multiValueQueryStringParameters, \
           tag: e.headers['x-tag'], tags: e.multiValueHeaders['x-tag'], method: e.httpMethod }) });",
    );
    let manager = started(dir.path()).await;

    let req = Request::builder()
        .method(Method::DELETE)
        .uri("/?a=1&b=2&b=3")
        .header("x-tag", "t1")
        .header("x-tag", "t2")
        .body(Body::empty())
        .unwrap();
    let res = router(Arc::clone(&manager)).oneshot(req).await.unwrap();
    let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(body["q"], serde_json::json!({ "a": "1", "b": ["2", "3"] }));
    assert_eq!(body["mq"], serde_json::json!({ "a": ["1"], "b": ["2", "3"] }));
    assert_eq!(body["tag"], serde_json::json!(["t1", "t2"]));
    assert_eq!(body["tags"], serde_json::json!(["t1", "t2"]));
    assert_eq!(body["method"], "DELETE");

    let (_, _, body) = call(&manager, Method::GET, "/", "").await;
    assert_eq!(json_body(&body)["q"], Value::Null);
}

#[tokio::test]
async fn rediscovery_adds_and_removes_routes() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "src/a/+endpoint.js", "exports.GET = () => ({ body: 'a' });");
    let manager = started(dir.path()).await;

    write(dir.path(), "src/b/+endpoint.js", "exports.GET = () => ({ body: 'b' });");
    let changed = manager.rediscover().await;
    assert_eq!(changed.len(), 1);
    let (_, _, body) = call(&manager, Method::GET, "/b", "").await;
    assert_eq!(body, "b");

    fs::remove_dir_all(dir.path().join("src/b")).unwrap();
    assert!(manager.rediscover().await.is_empty());
    let (status, _, _) = call(&manager, Method::GET, "/b", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = call(&manager, Method::GET, "/a", "").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn descriptor_changes_reach_the_handler() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "src/+endpoint.js", "exports.GET = () => ({ body: process.env.GREETING });");
    write(dir.path(), "src/+config.json", r#"{ "version": 1, "environment": { "GREETING": "hi" } }"#);
    let manager = started(dir.path()).await;
    assert_eq!(call(&manager, Method::GET, "/", "").await.2, "hi");

    write(dir.path(), "src/+config.json", r#"{ "version": 1, "environment": { "GREETING": "hey" } }"#);
    assert_eq!(manager.rediscover().await.len(), 1);
    assert_eq!(call(&manager, Method::GET, "/", "").await.2, "hey");

    write(dir.path(), "src/+config.json", "{ not json");
    manager.rediscover().await;
    let (status, _, body) = call(&manager, Method::GET, "/", "").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json_body(&body)["error"].as_str().unwrap().starts_with("discovery failed"));
}

#[tokio::test]
async fn shared_files_rebuild_every_route() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "src/a/+endpoint.js", "exports.GET = () => ({ body: 'a' });");
    write(dir.path(), "src/b/+endpoint.js", "exports.GET = () => ({ body: 'b' });");

    let compiles = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&compiles);
    let copy = copy_compiler();
    let compiler: Arc<dyn Compiler> = Arc::new(move |job: &CompileJob| -> Result<(), BuildError> {
        counter.fetch_add(1, Ordering::SeqCst);
        copy.compile(job)
    });
    let manager = manager_with(dir.path(), compiler, Mode::Dev);
    manager.start().await.unwrap();
    assert_eq!(compiles.load(Ordering::SeqCst), 2);

    let nested = dir.path().join("src/a/lib/util.js");
    manager.rebuild_for_files(&[nested], &BTreeSet::new()).await;
    assert_eq!(compiles.load(Ordering::SeqCst), 3);

    let shared = dir.path().join("lib/shared.js");
    manager.rebuild_for_files(&[shared], &BTreeSet::new()).await;
    assert_eq!(compiles.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn concurrent_rebuilds_of_one_route_coalesce() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "src/+endpoint.js", HELLO);

    let compiles = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&compiles);
    let copy = copy_compiler();
    let compiler: Arc<dyn Compiler> = Arc::new(move |job: &CompileJob| -> Result<(), BuildError> {
        counter.fetch_add(1, Ordering::SeqCst);
        copy.compile(job)
    });
    let manager = manager_with(dir.path(), compiler, Mode::Dev);
    manager.start().await.unwrap();
    compiles.store(0, Ordering::SeqCst);

    let root = manager.tree().routes_root().to_path_buf();
    tokio::join!(
        manager.rebuild_route(&root),
        manager.rebuild_route(&root),
        manager.rebuild_route(&root),
    );
    assert_eq!(compiles.load(Ordering::SeqCst), 2);
    assert_eq!(call(&manager, Method::GET, "/", "").await.0, StatusCode::OK);
}

#[tokio::test]
async fn build_failures_keep_the_route_failed_until_fixed() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "src/+endpoint.js", HELLO);
    let failing: Arc<dyn Compiler> = Arc::new(|job: &CompileJob| -> Result<(), BuildError> {
        Err(BuildError::Compiler {
            entry: job.entry_file.clone(),
            diagnostics: "syntax error".to_string(),
        })
    });
    let manager = manager_with(dir.path(), failing, Mode::Dev);
    manager.start().await.unwrap();

    let table = manager.snapshot();
    assert!(matches!(
        &table.routes()[0].status,
        RouteStatus::Failed { stage: Stage::Build, message } if message.contains("syntax error")
    ));
    let (status, _, _) = call(&manager, Method::GET, "/", "").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn build_mode_loads_without_serving() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "src/+endpoint.js", HELLO);
    let manager = manager_with(dir.path(), copy_compiler(), Mode::Build);
    let summary = manager.start().await.unwrap();

    assert_eq!((summary.loaded, summary.serving), (1, 0));
    let table = manager.snapshot();
    assert!(table.routes()[0].handlers.is_none());
    let (status, _, _) = call(&manager, Method::GET, "/", "").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn empty_tree_serves_nothing() {
    let dir = TempDir::new().unwrap();
    let manager = started(dir.path()).await;
    assert!(manager.snapshot().routes().is_empty());
    assert_eq!(call(&manager, Method::GET, "/", "").await.0, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn hot_reload_of_one_route_leaves_its_siblings_alone() {
    let dir = TempDir::new().unwrap();
    let a = write(dir.path(), "src/a/+endpoint.js", "exports.GET = () => ({ body: 'a' });");
    write(dir.path(), "src/b/+endpoint.js", "exports.GET = () => ({ body: 'b' });");
    let manager = started(dir.path()).await;

    let sibling = |table: &LiveTable| Arc::clone(table.routes().iter().find(|r| r.endpoint == "/b").unwrap());
    let before = sibling(&manager.snapshot());

    fs::write(
        &a,
        "exports.GET = () => ({ body: 'a' });\nexports.POST = () => ({ statusCode: 201, body: 'posted' });",
    )
    .unwrap();
    manager.rebuild_for_files(&[a], &BTreeSet::new()).await;

    let after = sibling(&manager.snapshot());
    assert_eq!(
        before.route.as_ref().unwrap().methods,
        after.route.as_ref().unwrap().methods
    );
    assert!(Arc::ptr_eq(before.handlers.as_ref().unwrap(), after.handlers.as_ref().unwrap()));
    assert_eq!(after.status, RouteStatus::Serving);

    let (status, _, body) = call(&manager, Method::GET, "/b", "").await;
    assert_eq!((status, body.as_str()), (StatusCode::OK, "b"));
    let (status, _, body) = call(&manager, Method::GET, "/a", "").await;
    assert_eq!((status, body.as_str()), (StatusCode::OK, "a"));
    let (status, _, body) = call(&manager, Method::POST, "/a", "").await;
    assert_eq!((status, body.as_str()), (StatusCode::CREATED, "posted"));
}

#[tokio::test]
async fn a_rebuild_does_not_publish_over_a_newer_configuration() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "src/+endpoint.js", "exports.GET = () => ({ body: process.env.GREETING });");
    write(dir.path(), "src/+config.json", r#"{ "version": 1, "environment": { "GREETING": "one" } }"#);

    // After the startup build, each compile reports in and waits to be released.
    let (entered_tx, mut entered) = tokio::sync::mpsc::unbounded_channel::<()>();
    let (release, release_rx) = std::sync::mpsc::channel::<()>();
    let gate = std::sync::Mutex::new((entered_tx, release_rx));
    let compiles = AtomicUsize::new(0);
    let copy = copy_compiler();
    let compiler: Arc<dyn Compiler> = Arc::new(move |job: &CompileJob| -> Result<(), BuildError> {
        if compiles.fetch_add(1, Ordering::SeqCst) > 0 {
            let gate = gate.lock().unwrap();
            gate.0.send(()).unwrap();
            gate.1.recv().unwrap();
        }
        copy.compile(job)
    });
    let manager = manager_with(dir.path(), compiler, Mode::Dev);
    manager.start().await.unwrap();

    let rebuild = tokio::spawn({
        let manager = Arc::clone(&manager);
        let root = manager.tree().routes_root().to_path_buf();
        async move { manager.rebuild_route(&root).await }
    });
    entered.recv().await.unwrap();

    write(dir.path(), "src/+config.json", r#"{ "version": 1, "environment": { "GREETING": "two" } }"#);
    let rediscovery = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.rediscover().await }
    });
    let greeting = |manager: &RouterManager| {
        manager.snapshot().routes()[0].route.as_ref().unwrap().environment["GREETING"].clone()
    };
    tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while greeting(&manager) != "two" {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // The in-flight build was for "one"; its result must not replace "two".
    release.send(()).unwrap();
    rebuild.await.unwrap();
    let table = manager.snapshot();
    assert_eq!(table.routes()[0].route.as_ref().unwrap().environment["GREETING"], "two");
    assert_eq!(table.routes()[0].status, RouteStatus::Unbuilt);
    assert_eq!(call(&manager, Method::GET, "/", "").await.2, "one");

    entered.recv().await.unwrap();
    release.send(()).unwrap();
    assert_eq!(rediscovery.await.unwrap().len(), 1);
    assert_eq!(manager.snapshot().routes()[0].status, RouteStatus::Serving);
    assert_eq!(call(&manager, Method::GET, "/", "").await.2, "two");
}

#[tokio::test]
async fn out_of_range_function_settings_fail_discovery() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "src/+endpoint.js", HELLO);
    write(
        dir.path(),
        "src/+config.json",
        r#"{ "version": 1, "function": { "timeoutSeconds": 18446744073709551615 } }"#,
    );
    let manager = started(dir.path()).await;

    assert_eq!(manager.summary().failed, 1);
    let (status, _, body) = call(&manager, Method::GET, "/", "").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json_body(&body)["error"].as_str().unwrap().starts_with("discovery failed"));
}

//! Native bindings installed into every handler context.

use tracing::{debug, error, info, trace, warn};

use super::{v8_str, v8_to_string};

pub const ROUTE_KEY: &str = "__endpoint_route";

pub fn inject_host_bindings(scope: &mut v8::HandleScope, global: v8::Local<v8::Object>, label: &str) {
    let gt_key = v8_str(scope, "globalThis");
    global.set(scope, gt_key.into(), global.into());

    if let Some(log_fn) = v8::Function::new(scope, native_log) {
        let log_key = v8_str(scope, "__endpoint_log");
        global.set(scope, log_key.into(), log_fn.into());
    }

    let route_key = v8_str(scope, ROUTE_KEY);
    let route_val = v8_str(scope, label);
    global.set(scope, route_key.into(), route_val.into());
}

/// `__endpoint_log(level, message)`: console output, forwarded to tracing.
fn native_log(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut _retval: v8::ReturnValue) {
    let context = scope.get_current_context();
    let global = context.global(scope);
    let route_key = v8_str(scope, ROUTE_KEY);
    let route = match global.get(scope, route_key.into()) {
        Some(val) if val.is_string() => v8_to_string(scope, val),
        _ => "unknown".to_string(),
    };

    let level = v8_to_string(scope, args.get(0));
    let message = v8_to_string(scope, args.get(1));

    match level.as_str() {
        "error" => error!(target: "handler", route = %route, "{message}"),
        "warn" => warn!(target: "handler", route = %route, "{message}"),
        "debug" => debug!(target: "handler", route = %route, "{message}"),
        "trace" => trace!(target: "handler", route = %route, "{message}"),
        _ => info!(target: "handler", route = %route, "{message}"),
    }
}

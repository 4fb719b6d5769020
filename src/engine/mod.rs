//! Embedded V8 engine.
//!
//! A [`ModuleRuntime`] is one isolate with one compiled handler module
//! evaluated into it. Isolates are never reused across loads: a new load
//! builds new runtimes and dropping a runtime disposes of its isolate.

pub mod builtin;

use std::collections::BTreeMap;
use std::sync::Once;

use serde::Deserialize;
use serde_json::Value;

use crate::errors::EngineError;

const PRELUDE_JS: &str = include_str!("prelude.js");

static V8_INIT: Once = Once::new();

pub fn init_v8() {
    V8_INIT.call_once(|| {
        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform);
        v8::V8::initialize();
    });
}

/// A compiled handler, as read from disk.
pub struct ModuleSource<'a> {
    pub code: &'a str,
    pub filename: &'a str,
    /// Endpoint, used to tag console output.
    pub label: &'a str,
    pub environment: &'a BTreeMap<String, String>,
}

pub struct ModuleRuntime {
    // Globals must be released before the isolate that owns them.
    context: v8::Global<v8::Context>,
    invoke: v8::Global<v8::Function>,
    exports: Vec<String>,
    isolate: v8::OwnedIsolate,
}

#[derive(Deserialize)]
struct Outcome {
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
}

impl ModuleRuntime {
    /// Creates an isolate, installs the host environment and evaluates the module.
    pub fn load(module: &ModuleSource) -> Result<Self, EngineError> {
        init_v8();

        let mut isolate = v8::Isolate::new(v8::CreateParams::default());
        isolate.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);

        let (context, invoke, exports) = {
            let handle_scope = &mut v8::HandleScope::new(&mut isolate);
            let context = v8::Context::new(handle_scope, v8::ContextOptions::default());
            let scope = &mut v8::ContextScope::new(handle_scope, context);
            let global = context.global(scope);

            builtin::inject_host_bindings(scope, global, module.label);
            run_script(scope, PRELUDE_JS, 0).map_err(EngineError::Bootstrap)?;

            // The wrapper adds one line above the module source.
            let wrapped = format!(
                "(function (exports, require, module, __filename, __dirname) {{\n{}\n}})",
                module.code
            );
            let factory = run_script(scope, &wrapped, 1)
                .map_err(|e| EngineError::Evaluation(format!("{}: {e}", module.filename)))?;

            let register = global_function(scope, global, "__endpoint_register")?;
            let env_json =
                serde_json::to_string(module.environment).map_err(|e| EngineError::Bootstrap(e.to_string()))?;
            let args = [
                factory,
                try_str(scope, &env_json)?.into(),
                try_str(scope, module.filename)?.into(),
            ];
            let names = call(scope, register, global.into(), &args)
                .map_err(|e| EngineError::Evaluation(format!("{}: {e}", module.filename)))?;
            let names = v8_to_string(scope, names);
            let exports: Vec<String> =
                serde_json::from_str(&names).map_err(|e| EngineError::Protocol(e.to_string()))?;

            let invoke = global_function(scope, global, "__endpoint_invoke")?;
            (v8::Global::new(scope, context), v8::Global::new(scope, invoke), exports)
        };

        Ok(Self {
            context,
            invoke,
            exports,
            isolate,
        })
    }

    /// Function exports of the module, in definition order.
    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    /// Thread-safe handle used to terminate a runaway invocation.
    pub fn isolate_handle(&self) -> v8::IsolateHandle {
        self.isolate.thread_safe_handle()
    }

    pub fn cancel_termination(&mut self) {
        self.isolate.cancel_terminate_execution();
    }

    /// Calls `export` with the serialized event and context, then drains the
    /// microtask queue. Returns the handler's result value.
    pub fn invoke(&mut self, export: &str, event: &str, deferred: &str, context: &str) -> Result<Value, EngineError> {
        let handle_scope = &mut v8::HandleScope::new(&mut self.isolate);
        let ctx = v8::Local::new(handle_scope, &self.context);
        let scope = &mut v8::ContextScope::new(handle_scope, ctx);
        let invoke = v8::Local::new(scope, &self.invoke);
        let global = ctx.global(scope);

        let args: [v8::Local<v8::Value>; 4] = [
            try_str(scope, export)?.into(),
            try_str(scope, event)?.into(),
            try_str(scope, deferred)?.into(),
            try_str(scope, context)?.into(),
        ];

        let tc = &mut v8::TryCatch::new(scope);
        let Some(returned) = invoke.call(tc, global.into(), &args) else {
            return Err(EngineError::Exception(exception_message(tc)));
        };
        tc.perform_microtask_checkpoint();
        if tc.has_terminated() {
            return Err(EngineError::Exception("execution terminated".to_string()));
        }

        let promise = v8::Local::<v8::Promise>::try_from(returned)
            .map_err(|_| EngineError::Protocol("invocation did not return a promise".to_string()))?;
        match promise.state() {
            v8::PromiseState::Pending => Err(EngineError::Unsettled),
            v8::PromiseState::Rejected => {
                let reason = promise.result(tc);
                Err(EngineError::Exception(v8_to_string(tc, reason)))
            }
            v8::PromiseState::Fulfilled => {
                let raw = promise.result(tc);
                let raw = v8_to_string(tc, raw);
                let outcome: Outcome =
                    serde_json::from_str(&raw).map_err(|e| EngineError::Protocol(e.to_string()))?;
                if outcome.ok {
                    Ok(outcome.value)
                } else {
                    Err(EngineError::Exception(
                        outcome.error.unwrap_or_else(|| "handler failed".to_string()),
                    ))
                }
            }
        }
    }
}

fn run_script<'s>(
    scope: &mut v8::HandleScope<'s>,
    source: &str,
    line_offset: usize,
) -> Result<v8::Local<'s, v8::Value>, String> {
    let tc = &mut v8::TryCatch::new(scope);
    let Some(source) = v8::String::new(tc, source) else {
        return Err("source is too large".to_string());
    };
    match v8::Script::compile(tc, source, None).and_then(|script| script.run(tc)) {
        Some(value) => Ok(value),
        None => Err(located_message(tc, line_offset)),
    }
}

fn call<'s>(
    scope: &mut v8::HandleScope<'s>,
    function: v8::Local<v8::Function>,
    recv: v8::Local<v8::Value>,
    args: &[v8::Local<v8::Value>],
) -> Result<v8::Local<'s, v8::Value>, String> {
    let tc = &mut v8::TryCatch::new(scope);
    match function.call(tc, recv, args) {
        Some(value) => Ok(value),
        None => Err(exception_message(tc)),
    }
}

fn global_function<'s>(
    scope: &mut v8::HandleScope<'s>,
    global: v8::Local<v8::Object>,
    name: &str,
) -> Result<v8::Local<'s, v8::Function>, EngineError> {
    let key = v8_str(scope, name);
    global
        .get(scope, key.into())
        .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok())
        .ok_or_else(|| EngineError::Bootstrap(format!("`{name}` is not installed")))
}

fn exception_message(tc: &mut v8::TryCatch<v8::HandleScope>) -> String {
    if tc.has_terminated() {
        return "execution terminated".to_string();
    }
    if let Some(exception) = tc.exception() {
        if exception.is_native_error()
            && let Some(stack) = tc.stack_trace()
            && stack.is_string()
        {
            return v8_to_string(tc, stack);
        }
        return v8_to_string(tc, exception);
    }
    "unknown error".to_string()
}

fn located_message(tc: &mut v8::TryCatch<v8::HandleScope>, line_offset: usize) -> String {
    let Some(message) = tc.message() else {
        return exception_message(tc);
    };
    let text = message.get(tc).to_rust_string_lossy(tc);
    match message.get_line_number(tc) {
        Some(line) if line > line_offset => format!("{text} (line {})", line - line_offset),
        _ => text,
    }
}

// V8 HELPERS

/// Internal names and short labels. Falls back to `""` if V8 refuses the string.
#[inline(always)]
pub fn v8_str<'s>(scope: &mut v8::HandleScope<'s>, s: &str) -> v8::Local<'s, v8::String> {
    v8::String::new(scope, s).unwrap_or_else(|| v8::String::empty(scope))
}

/// Request-sized payloads, where a refusal must surface as an error.
fn try_str<'s>(scope: &mut v8::HandleScope<'s>, s: &str) -> Result<v8::Local<'s, v8::String>, EngineError> {
    v8::String::new(scope, s).ok_or_else(|| EngineError::Protocol(format!("payload of {} bytes is too large", s.len())))
}

#[inline(always)]
pub fn v8_to_string(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> String {
    value
        .to_string(scope)
        .map(|s| s.to_rust_string_lossy(scope))
        .unwrap_or_default()
}

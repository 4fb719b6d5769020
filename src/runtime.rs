//! Worker Pool Management
//!
//! Each loaded module gets its own pool of isolate threads. Requests go to the
//! workers round-robin over bounded channels; a full queue is skipped in
//! favour of the next worker, and when every queue is full the request is
//! rejected instead of blocking the caller.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::engine::{ModuleRuntime, ModuleSource};
use crate::errors::EngineError;

const QUEUE_CAPACITY: usize = 64;

/// Serialized invocation input, ready for the isolate.
#[derive(Debug, Clone)]
pub struct InvocationPayload {
    pub event: String,
    /// Header and query pairs, normalized inside the isolate on first access.
    pub deferred: String,
    pub context: String,
}

pub struct PoolSpec {
    pub label: String,
    pub filename: String,
    pub code: Arc<str>,
    pub environment: BTreeMap<String, String>,
    pub workers: usize,
    pub stack_size: usize,
}

struct Task {
    id: u64,
    export: String,
    payload: InvocationPayload,
    reply: oneshot::Sender<Result<Value, EngineError>>,
}

/// Guards termination: only the task that is still running may be killed.
struct WorkerHandle {
    isolate: v8::IsolateHandle,
    current: Arc<Mutex<u64>>,
}

impl WorkerHandle {
    fn terminate(&self, task: u64) -> bool {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if *current == task {
            self.isolate.terminate_execution();
            true
        } else {
            false
        }
    }
}

pub struct ModulePool {
    label: String,
    request_txs: Vec<Sender<Task>>,
    workers: Vec<WorkerHandle>,
    exports: Vec<String>,
    round_robin_counter: AtomicUsize,
    task_counter: AtomicU64,
    _threads: Vec<thread::JoinHandle<()>>,
}

impl ModulePool {
    /// Starts every worker and waits until each has evaluated the module.
    /// Blocking: call from the blocking pool.
    pub fn spawn(spec: PoolSpec) -> Result<Self, EngineError> {
        let count = spec.workers.max(1);
        let spec = Arc::new(spec);

        let mut request_txs = Vec::with_capacity(count);
        let mut workers = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);
        let mut exports = Vec::new();

        for i in 0..count {
            let (tx, rx) = bounded::<Task>(QUEUE_CAPACITY);
            let (ready_tx, ready_rx) = bounded(1);
            let current = Arc::new(Mutex::new(0u64));
            let worker_spec = Arc::clone(&spec);
            let worker_current = Arc::clone(&current);

            let handle = thread::Builder::new()
                .name(format!("handler-worker-{i}"))
                .stack_size(spec.stack_size)
                .spawn(move || worker_main(&worker_spec, rx, ready_tx, worker_current))
                .map_err(|e| EngineError::Spawn(e.to_string()))?;

            let (isolate, worker_exports) = ready_rx
                .recv()
                .map_err(|_| EngineError::WorkerGone("worker exited during startup".to_string()))??;
            if i == 0 {
                debug!(endpoint = %spec.label, exports = ?worker_exports, "module evaluated");
                exports = worker_exports;
            }

            request_txs.push(tx);
            workers.push(WorkerHandle { isolate, current });
            threads.push(handle);
        }

        Ok(Self {
            label: spec.label.clone(),
            request_txs,
            workers,
            exports,
            round_robin_counter: AtomicUsize::new(0),
            task_counter: AtomicU64::new(1),
            _threads: threads,
        })
    }

    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    pub fn num_workers(&self) -> usize {
        self.request_txs.len()
    }

    /// Runs one invocation on some worker, bounded by `timeout`.
    pub async fn invoke(&self, export: &str, payload: InvocationPayload, timeout: Duration) -> Result<Value, EngineError> {
        let (tx, rx) = oneshot::channel();
        let id = self.task_counter.fetch_add(1, Ordering::Relaxed);
        let mut task = Task {
            id,
            export: export.to_string(),
            payload,
            reply: tx,
        };

        let n = self.request_txs.len();
        let start_idx = self.round_robin_counter.fetch_add(1, Ordering::Relaxed) % n;
        let mut placed = None;
        for attempt in 0..n {
            let idx = (start_idx + attempt) % n;
            match self.request_txs[idx].try_send(task) {
                Ok(()) => {
                    placed = Some(idx);
                    break;
                }
                Err(TrySendError::Full(returned)) => task = returned,
                Err(TrySendError::Disconnected(_)) => {
                    return Err(EngineError::WorkerGone(format!("worker {idx} of {} disconnected", self.label)));
                }
            }
        }
        let Some(idx) = placed else {
            warn!(endpoint = %self.label, "all worker queues are full");
            return Err(EngineError::Busy);
        };

        let mut rx = rx;
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::WorkerGone(format!("worker {idx} of {} dropped the request", self.label))),
            Err(_) => {
                // Close the reply first: a worker that has not started the
                // task yet sees it closed and skips it.
                drop(rx);
                if self.workers[idx].terminate(id) {
                    warn!(endpoint = %self.label, worker = idx, "terminated handler after timeout");
                }
                Err(EngineError::Timeout(timeout.as_secs()))
            }
        }
    }
}

type Ready = Result<(v8::IsolateHandle, Vec<String>), EngineError>;

fn worker_main(spec: &PoolSpec, rx: Receiver<Task>, ready: Sender<Ready>, current: Arc<Mutex<u64>>) {
    let source = ModuleSource {
        code: &spec.code,
        filename: &spec.filename,
        label: &spec.label,
        environment: &spec.environment,
    };
    let mut rt = match ModuleRuntime::load(&source) {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok((rt.isolate_handle(), rt.exports().to_vec()))).is_err() {
        return;
    }

    // Exits once the pool, and with it every sender, is dropped.
    for task in rx {
        *current.lock().unwrap_or_else(|e| e.into_inner()) = task.id;
        if task.reply.is_closed() {
            clear_current(&current, &mut rt);
            continue;
        }
        let result = rt.invoke(&task.export, &task.payload.event, &task.payload.deferred, &task.payload.context);
        clear_current(&current, &mut rt);
        let _ = task.reply.send(result);
    }
}

/// A termination requested for the finished task must not leak into the next one.
fn clear_current(current: &Mutex<u64>, rt: &mut ModuleRuntime) {
    let mut running = current.lock().unwrap_or_else(|e| e.into_inner());
    *running = 0;
    rt.cancel_termination();
}

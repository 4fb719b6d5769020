//! File watcher
//!
//! ```text
//! notify → Debouncer (timing, dedup) → classify (what changed) → RouterManager
//! ```
//!
//! The watcher is created before the initial build so that edits made while
//! routes are building are buffered instead of lost.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tracing::{debug, info, warn};

use crate::gateway::RouterManager;
use crate::tree::{normalize, ResolvedTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

/// Event deduplication and quiet-period timing. No knowledge of routes.
pub struct Debouncer {
    changes: HashMap<PathBuf, ChangeKind>,
    last_event: Option<Instant>,
    debounce: Duration,
}

impl Debouncer {
    pub fn new(debounce: Duration) -> Self {
        Self {
            changes: HashMap::new(),
            last_event: None,
            debounce,
        }
    }

    pub fn add_event(&mut self, event: &notify::Event) {
        let kind = match event.kind {
            EventKind::Create(_) => ChangeKind::Created,
            EventKind::Remove(_) => ChangeKind::Removed,
            // mtime/chmod noise
            EventKind::Modify(ModifyKind::Metadata(_)) => return,
            EventKind::Modify(_) => ChangeKind::Modified,
            _ => return,
        };

        for path in &event.paths {
            if is_temp_file(path) {
                continue;
            }
            let path = normalize(path);
            match (self.changes.get(&path).copied(), kind) {
                (None, _) => {
                    self.changes.insert(path, kind);
                }
                // Deleted then restored.
                (Some(ChangeKind::Removed), ChangeKind::Created | ChangeKind::Modified) => {
                    self.changes.insert(path, kind);
                }
                (Some(ChangeKind::Modified), ChangeKind::Removed) => {
                    self.changes.insert(path, ChangeKind::Removed);
                }
                // Appeared and vanished inside one window.
                (Some(ChangeKind::Created), ChangeKind::Removed) => {
                    self.changes.remove(&path);
                }
                _ => continue,
            }
            self.last_event = Some(Instant::now());
        }
    }

    pub fn is_ready(&self) -> bool {
        self.last_event
            .is_some_and(|last| last.elapsed() >= self.debounce && !self.changes.is_empty())
    }

    pub fn take_if_ready(&mut self) -> Option<HashMap<PathBuf, ChangeKind>> {
        if !self.is_ready() {
            return None;
        }
        self.last_event = None;
        Some(std::mem::take(&mut self.changes))
    }

    pub fn sleep_duration(&self) -> Duration {
        match self.last_event {
            Some(last) => self.debounce.saturating_sub(last.elapsed()).max(Duration::from_millis(1)),
            None => Duration::from_secs(86400),
        }
    }
}

fn is_temp_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    matches!(ext, "swp" | "swo" | "tmp" | "bak") || name.ends_with('~')
}

/// What a batch of changes asks the router manager to do.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Plan {
    /// The set of routes or their configuration may have changed.
    pub rediscover: bool,
    /// Files whose enclosing routes must be rebuilt.
    pub sources: Vec<PathBuf>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        !self.rediscover && self.sources.is_empty()
    }
}

pub fn classify(changes: HashMap<PathBuf, ChangeKind>, tree: &ResolvedTree, override_file_name: &str) -> Plan {
    let mut plan = Plan::default();
    let mut sources = BTreeSet::new();

    for (path, kind) in changes {
        if tree.is_excluded(&path) {
            continue;
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name == override_file_name {
            plan.rediscover = true;
            continue;
        }
        let is_entry = name == tree.entry_file_name();
        match kind {
            ChangeKind::Created if is_entry || path.is_dir() => plan.rediscover = true,
            ChangeKind::Created => {
                sources.insert(path);
            }
            ChangeKind::Modified => {
                if is_entry {
                    plan.rediscover = true;
                }
                sources.insert(path);
            }
            // Might have been a whole route directory.
            ChangeKind::Removed => {
                plan.rediscover = true;
                sources.insert(path);
            }
        }
    }

    plan.sources = sources.into_iter().collect();
    plan
}

/// Rediscovers first, then rebuilds whatever rediscovery did not already rebuild.
pub async fn apply(manager: &Arc<RouterManager>, plan: Plan) {
    let rebuilt = if plan.rediscover {
        manager.rediscover().await
    } else {
        BTreeSet::new()
    };
    if !plan.sources.is_empty() {
        manager.rebuild_for_files(&plan.sources, &rebuilt).await;
    }
}

pub struct Watcher {
    notify_rx: std::sync::mpsc::Receiver<notify::Result<notify::Event>>,
    // Dropping it stops the subscription.
    _watcher: RecommendedWatcher,
    debouncer: Debouncer,
    manager: Arc<RouterManager>,
}

impl Watcher {
    /// Subscribes immediately; events buffer until [`Watcher::run`].
    pub fn new(manager: Arc<RouterManager>, debounce: Duration) -> notify::Result<Self> {
        let (notify_tx, notify_rx) = std::sync::mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = notify_tx.send(res);
        })?;

        let tree = manager.tree();
        let target = if tree.routes_root().is_dir() {
            tree.routes_root()
        } else {
            warn!(
                "routes directory {} does not exist, watching the project root",
                tree.routes_root().display()
            );
            tree.root()
        };
        watcher.watch(target, RecursiveMode::Recursive)?;
        debug!(path = %target.display(), "watching");

        Ok(Self {
            notify_rx,
            _watcher: watcher,
            debouncer: Debouncer::new(debounce),
            manager,
        })
    }

    pub async fn run(self) {
        let Self {
            notify_rx,
            _watcher,
            mut debouncer,
            manager,
        } = self;
        let (async_tx, mut async_rx) = tokio::sync::mpsc::channel::<notify::Event>(256);

        let bridge = std::thread::Builder::new().name("fs-watch".to_string()).spawn(move || {
            while let Ok(result) = notify_rx.recv() {
                match result {
                    Ok(event) => {
                        if async_tx.blocking_send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("watch error: {e}"),
                }
            }
        });
        if let Err(e) = bridge {
            warn!("failed to start the watch thread, hot reload disabled: {e}");
            return;
        }

        loop {
            tokio::select! {
                biased;
                event = async_rx.recv() => match event {
                    Some(event) => debouncer.add_event(&event),
                    None => break,
                },
                _ = tokio::time::sleep(debouncer.sleep_duration()) => {
                    let Some(changes) = debouncer.take_if_ready() else { continue };
                    let plan = classify(changes, manager.tree(), manager.override_file_name());
                    if plan.is_empty() {
                        continue;
                    }
                    info!(
                        rediscover = plan.rediscover,
                        files = plan.sources.len(),
                        "change detected"
                    );
                    apply(&manager, plan).await;
                }
            }
        }
        debug!("watcher stopped");
    }
}

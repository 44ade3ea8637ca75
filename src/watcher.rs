//! Watch mode
//!
//! Re-runs analysis and execution whenever a watched file changes. Before
//! every execution the watch set is recomputed: every transitively
//! referenced package manifest plus every declared `files` glob, grouped by
//! package directory (a glob list containing negations gets its own group so
//! the negations only filter their siblings). All watches are released and
//! re-established across re-analysis.

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::analyzer::{Analysis, Analyzer};
use crate::cache::{Cache, LocalCache};
use crate::config::{CacheMode, Options};
use crate::deferred::Deferred;
use crate::executor::Executor;
use crate::pool::WorkerPool;
use crate::reporter::Reporter;

/// One set of glob patterns scoped to a package directory.
#[derive(Debug, Clone)]
pub struct WatchGroup {
    pub package_dir: PathBuf,
    pub patterns: Vec<glob::Pattern>,
    pub excludes: Vec<glob::Pattern>,
}

impl WatchGroup {
    fn matches(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.package_dir) else {
            return false;
        };
        self.patterns.iter().any(|p| p.matches_path(relative))
            && !self.excludes.iter().any(|p| p.matches_path(relative))
    }
}

/// The complete watch set for one analysis.
#[derive(Debug, Clone, Default)]
pub struct WatchSet {
    pub groups: Vec<WatchGroup>,
    pub manifests: Vec<PathBuf>,
}

impl WatchSet {
    pub fn relevant(&self, path: &Path) -> bool {
        self.manifests.iter().any(|m| m == path) || self.groups.iter().any(|g| g.matches(path))
    }

    /// The directories notify should watch: each package directory
    /// recursively, plus each manifest's directory.
    fn roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self
            .groups
            .iter()
            .map(|g| g.package_dir.clone())
            .collect();
        for manifest in &self.manifests {
            if let Some(parent) = manifest.parent() {
                roots.push(parent.to_path_buf());
            }
        }
        roots.sort();
        roots.dedup();
        // Drop roots nested under another root; the recursive watch above
        // them already covers them.
        let mut top_level: Vec<PathBuf> = Vec::new();
        for root in roots {
            if !top_level.iter().any(|kept| root.starts_with(kept)) {
                top_level.push(root);
            }
        }
        top_level
    }
}

fn compile(pattern: &str) -> Option<glob::Pattern> {
    match glob::Pattern::new(pattern) {
        Ok(compiled) => Some(compiled),
        Err(err) => {
            warn!(pattern, "ignoring unwatchable glob: {err}");
            None
        }
    }
}

/// Compute the watch set for an analysis.
pub fn compute_watch_set(analysis: &Analysis) -> WatchSet {
    let mut set = WatchSet {
        groups: Vec::new(),
        manifests: analysis.manifests.iter().map(|m| m.path.clone()).collect(),
    };

    for (_, config) in analysis.graph.iter() {
        let Some(files) = config.files() else { continue };
        let package_dir = config.reference.package_dir.clone();

        let (negated, positive): (Vec<_>, Vec<_>) =
            files.iter().partition(|p| p.starts_with('!'));

        if negated.is_empty() {
            // Merge into the package's shared group.
            let patterns: Vec<_> = positive.iter().filter_map(|p| compile(p)).collect();
            if let Some(group) = set
                .groups
                .iter_mut()
                .find(|g| g.package_dir == package_dir && g.excludes.is_empty())
            {
                group.patterns.extend(patterns);
            } else {
                set.groups.push(WatchGroup {
                    package_dir,
                    patterns,
                    excludes: Vec::new(),
                });
            }
        } else {
            // Negations only apply to their own script's globs.
            set.groups.push(WatchGroup {
                package_dir,
                patterns: positive.iter().filter_map(|p| compile(p)).collect(),
                excludes: negated
                    .iter()
                    .filter_map(|p| compile(p.trim_start_matches('!')))
                    .collect(),
            });
        }
    }
    set
}

/// The watch loop: analyze and execute while stale, wait otherwise, abort on
/// signal. Returns the process exit code.
pub async fn watch(options: &Options, cwd: &Path, abort: Deferred<()>) -> i32 {
    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel::<notify::Event>(256);

    let mut stale = true;
    let mut watch_set = WatchSet::default();
    // Dropping the previous watcher releases its watches.
    let mut _active_watcher: Option<RecommendedWatcher> = None;

    loop {
        if abort.is_resolved() {
            return 1;
        }

        if !stale {
            tokio::select! {
                _ = abort.wait() => return 1,
                event = event_rx.recv() => {
                    if let Some(event) = event {
                        if is_relevant(&event, &watch_set) {
                            stale = true;
                        }
                    }
                }
            }
            continue;
        }

        // Debounce: let a burst of events land before re-analyzing.
        tokio::time::sleep(Duration::from_millis(100)).await;
        while event_rx.try_recv().is_ok() {}
        stale = false;

        let reporter = Reporter::new(&options.script.package_dir);
        reporter.watch_run_start();

        match Analyzer::new().analyze(&options.script) {
            Err((analyzer, diagnostics)) => {
                let printer = analyzer.printer(cwd);
                for diagnostic in &diagnostics {
                    printer.print(diagnostic);
                }
                // Watch the manifests we managed to read so a fix re-runs.
                watch_set = WatchSet {
                    groups: Vec::new(),
                    manifests: analyzer.loaded_manifests(),
                };
                _active_watcher = install(&watch_set, event_tx.clone());
            }
            Ok(analysis) => {
                let analysis = Arc::new(analysis);
                watch_set = compute_watch_set(&analysis);
                _active_watcher = install(&watch_set, event_tx.clone());

                let cache: Option<Arc<dyn Cache>> = match options.cache {
                    CacheMode::Local => Some(Arc::new(LocalCache::new())),
                    CacheMode::None => None,
                };
                let executor = Executor::new(
                    analysis,
                    WorkerPool::new(options.parallelism),
                    cache,
                    options.failure_mode,
                    Reporter::new(&options.script.package_dir),
                );

                let mut run = {
                    let executor = executor.clone();
                    tokio::spawn(async move { executor.execute_top_level().await })
                };

                loop {
                    tokio::select! {
                        result = &mut run => {
                            match result {
                                Ok(Ok(summary)) => reporter.summary(
                                    summary.ran, summary.fresh, summary.cached, 0),
                                Ok(Err(failures)) => reporter.summary(0, 0, 0, failures.len()),
                                Err(join_err) => warn!("execution task failed: {join_err}"),
                            }
                            break;
                        }
                        _ = abort.wait() => {
                            executor.abort();
                            let _ = (&mut run).await;
                            return 1;
                        }
                        event = event_rx.recv() => {
                            if let Some(event) = event {
                                if is_relevant(&event, &watch_set) {
                                    debug!("change during execution, scheduling re-run");
                                    stale = true;
                                    // Top-level services stop now so the next
                                    // iteration restarts them with new
                                    // fingerprints.
                                    executor.release_entrypoint_services();
                                }
                            }
                        }
                    }
                }
            }
        }

        if !stale {
            reporter.watch_idle();
        }
    }
}

fn is_relevant(event: &notify::Event, watch_set: &WatchSet) -> bool {
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return false;
    }
    event.paths.iter().any(|path| watch_set.relevant(path))
}

fn install(
    watch_set: &WatchSet,
    tx: tokio::sync::mpsc::Sender<notify::Event>,
) -> Option<RecommendedWatcher> {
    let mut watcher =
        match notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.blocking_send(event);
            }
        }) {
            Ok(watcher) => watcher,
            Err(err) => {
                warn!("failed to create file watcher: {err}");
                return None;
            }
        };

    for root in watch_set.roots() {
        if let Err(err) = watcher.watch(&root, RecursiveMode::Recursive) {
            warn!(root = %root.display(), "failed to watch: {err}");
        }
    }
    Some(watcher)
}

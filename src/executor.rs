//! Execution scheduling
//!
//! The per-invocation coordinator. Owns the worker-slot pool, the cache
//! handle, the failure-mode policy, the abort signal, and the per-script
//! execution memo: a given script reference resolves to exactly one execution
//! record per run, and every caller observes the same terminal result.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

use crate::analyzer::{Analysis, ConfigId, ScriptKind, ScriptReference};
use crate::cache::Cache;
use crate::deferred::Deferred;
use crate::execution::service::ServiceExecution;
use crate::execution::{no_command, one_shot};
use crate::fingerprint::Fingerprint;
use crate::pool::WorkerPool;
use crate::reporter::Reporter;

/// What to do with the rest of the graph when a script fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Independent subtrees keep running.
    Continue,
    /// Stop starting new scripts; in-flight ones finish.
    NoNew,
    /// Stop starting new scripts and kill in-flight ones.
    Kill,
}

/// Why a script failed. The `Display` renderings are the user-visible text.
#[derive(Debug, Clone, Error)]
pub enum FailureReason {
    #[error("Failed to start: {0}")]
    SpawnError(String),
    #[error("Exited with status code {0}")]
    ExitNonZero(i32),
    #[error("Killed by signal {0}")]
    Signal(i32),
    #[error("Terminated")]
    Terminated,
    #[error("Service exited unexpectedly")]
    ServiceExitedUnexpectedly,
    #[error("Service terminated unexpectedly")]
    ServiceTerminatedUnexpectedly,
    #[error("Cannot run because a dependency failed")]
    DependencyFailed,
    #[error("Not started because another script failed")]
    StartCancelled,
    #[error("Aborted")]
    Aborted,
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Clone)]
pub struct Failure {
    pub script: ScriptReference,
    pub reason: FailureReason,
}

/// The successful result of one script's execution: its fingerprint plus the
/// services that must remain available to downstream consumers.
#[derive(Clone)]
pub struct ExecutionSuccess {
    pub fingerprint: Fingerprint,
    pub services: Vec<Arc<ServiceExecution>>,
}

pub type ExecutionResult = Result<ExecutionSuccess, Failure>;

/// Outcome counts for the final summary line.
#[derive(Debug, Default, Clone, Copy)]
pub struct Summary {
    pub ran: usize,
    pub fresh: usize,
    pub cached: usize,
}

pub struct Executor {
    analysis: Arc<Analysis>,
    pool: WorkerPool,
    cache: Option<Arc<dyn Cache>>,
    failure_mode: FailureMode,
    reporter: Reporter,
    executions: Mutex<HashMap<usize, Deferred<ExecutionResult>>>,
    services: Mutex<HashMap<usize, Arc<ServiceExecution>>>,
    /// Services that stay alive until abort: reachable from the entry point
    /// through no-command scripts only.
    persistent_services: HashSet<usize>,
    failures: Mutex<Vec<Failure>>,
    first_failure: Deferred<()>,
    stop_starting: AtomicBool,
    killed: Deferred<()>,
    aborted: Deferred<()>,
    ran: AtomicUsize,
    fresh: AtomicUsize,
    cached: AtomicUsize,
}

impl Executor {
    pub fn new(
        analysis: Arc<Analysis>,
        pool: WorkerPool,
        cache: Option<Arc<dyn Cache>>,
        failure_mode: FailureMode,
        reporter: Reporter,
    ) -> Arc<Self> {
        let persistent_services = find_persistent_services(&analysis);
        Arc::new(Self {
            analysis,
            pool,
            cache,
            failure_mode,
            reporter,
            executions: Mutex::new(HashMap::new()),
            services: Mutex::new(HashMap::new()),
            persistent_services,
            failures: Mutex::new(Vec::new()),
            first_failure: Deferred::new(),
            stop_starting: AtomicBool::new(false),
            killed: Deferred::new(),
            aborted: Deferred::new(),
            ran: AtomicUsize::new(0),
            fresh: AtomicUsize::new(0),
            cached: AtomicUsize::new(0),
        })
    }

    pub fn analysis(&self) -> &Arc<Analysis> {
        &self.analysis
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn cache(&self) -> Option<&Arc<dyn Cache>> {
        self.cache.as_ref()
    }

    /// Fired when in-flight children should be terminated (failure-mode
    /// `kill` or abort).
    pub fn killed(&self) -> &Deferred<()> {
        &self.killed
    }

    /// Fired on external abort.
    pub fn aborted(&self) -> &Deferred<()> {
        &self.aborted
    }

    pub fn should_start_new(&self) -> bool {
        !self.stop_starting.load(Ordering::SeqCst)
    }

    pub fn count_ran(&self) {
        self.ran.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_fresh(&self) {
        self.fresh.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_cached(&self) {
        self.cached.fetch_add(1, Ordering::Relaxed);
    }

    /// Execute a script, memoized per reference: the first caller spawns the
    /// execution task, every caller shares the same completion holder.
    pub fn execute(self: &Arc<Self>, id: ConfigId) -> Deferred<ExecutionResult> {
        let mut executions = self.executions.lock().unwrap();
        if let Some(existing) = executions.get(&id.0) {
            return existing.clone();
        }
        let deferred: Deferred<ExecutionResult> = Deferred::new();
        executions.insert(id.0, deferred.clone());
        drop(executions);

        let executor = self.clone();
        let slot = deferred.clone();
        tokio::spawn(async move {
            let config = executor.analysis.config(id);
            debug!(script = %config.reference.name, "executing");
            let result = match &config.kind {
                ScriptKind::NoCommand => no_command::execute(&executor, id).await,
                ScriptKind::OneShot { .. } => one_shot::execute(&executor, id).await,
                ScriptKind::Service { .. } => {
                    let service = executor.service(id);
                    service.execute(&executor).await
                }
            };
            slot.resolve(result);
        });
        deferred
    }

    /// The service state machine for a script, created on first use.
    pub fn service(self: &Arc<Self>, id: ConfigId) -> Arc<ServiceExecution> {
        let mut services = self.services.lock().unwrap();
        services
            .entry(id.0)
            .or_insert_with(|| {
                ServiceExecution::new(
                    self,
                    id,
                    self.persistent_services.contains(&id.0),
                )
            })
            .clone()
    }

    /// Record a failure that originated at a script: render it, remember it,
    /// and apply the failure-mode policy exactly once.
    pub(crate) fn record_failure(&self, failure: Failure) {
        self.reporter.failure(&failure.script, &failure.reason);
        self.failures.lock().unwrap().push(failure);
        if self.first_failure.resolve(()) {
            match self.failure_mode {
                FailureMode::Continue => {}
                FailureMode::NoNew => {
                    self.stop_starting.store(true, Ordering::SeqCst);
                }
                FailureMode::Kill => {
                    self.stop_starting.store(true, Ordering::SeqCst);
                    self.killed.resolve(());
                }
            }
        }
    }

    /// External abort: stop new work, terminate in-flight children, and let
    /// go of the entry point's hold on top-level services.
    pub fn abort(&self) {
        if !self.aborted.resolve(()) {
            return;
        }
        self.stop_starting.store(true, Ordering::SeqCst);
        self.killed.resolve(());
        self.release_entrypoint_services();
    }

    /// Release the entry point's consumer handle on every persistent service
    /// so they wind down (used by abort and by the watcher between
    /// iterations).
    pub fn release_entrypoint_services(&self) {
        let services: Vec<_> = self.services.lock().unwrap().values().cloned().collect();
        for service in services {
            service.release_entrypoint();
        }
    }

    /// Execute the entry script, start any top-level services it surfaced,
    /// and keep them alive until the abort signal fires. Returns the summary
    /// on success or every recorded failure.
    pub async fn execute_top_level(self: &Arc<Self>) -> Result<Summary, Vec<Failure>> {
        let root_result = self.execute(self.analysis.root).wait().await;

        // Top-level services are started by the entry point itself: a
        // service the user asked for directly (or through no-command
        // forwarding) runs even though no one-shot consumes it.
        if let Ok(success) = &root_result {
            for service in &success.services {
                service.ensure_started(self).await.ok();
            }
        }

        // Wait for every service to fully settle, re-snapshotting in case
        // settling surfaced new ones.
        loop {
            let services: Vec<_> = self.services.lock().unwrap().values().cloned().collect();
            for service in &services {
                service.settle().await;
            }
            if self.services.lock().unwrap().len() == services.len() {
                break;
            }
        }

        let failures = self.failures.lock().unwrap().clone();
        if failures.is_empty() && root_result.is_ok() {
            Ok(Summary {
                ran: self.ran.load(Ordering::Relaxed),
                fresh: self.fresh.load(Ordering::Relaxed),
                cached: self.cached.load(Ordering::Relaxed),
            })
        } else if failures.is_empty() {
            // The root failed without an originating record (e.g. cancelled
            // before any script ran).
            Err(vec![root_result.err().expect("root failed")])
        } else {
            Err(failures)
        }
    }
}

/// Services reachable from the entry point through no-command scripts only.
/// These receive an entry-point consumer that is held until abort.
fn find_persistent_services(analysis: &Analysis) -> HashSet<usize> {
    let mut persistent = HashSet::new();
    let mut queue = vec![analysis.root];
    let mut visited = HashSet::new();
    while let Some(id) = queue.pop() {
        if !visited.insert(id.0) {
            continue;
        }
        let config = analysis.config(id);
        match config.kind {
            ScriptKind::Service { .. } => {
                persistent.insert(id.0);
            }
            ScriptKind::NoCommand => {
                queue.extend(config.dependencies.iter().map(|d| d.config));
            }
            ScriptKind::OneShot { .. } => {}
        }
    }
    persistent
}

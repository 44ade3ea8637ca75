//! Service execution state machine
//!
//! Services are never fingerprint-skipped or cache-restored. They start
//! lazily when the first consumer needs them and stop when the last consumer
//! is done. Every ingress (consumer demand, consumer completion, child exit,
//! upstream failure, abort) is a method whose body is one match over the
//! current state; an unexpected state is a programmer error, not a
//! recoverable condition.
//!
//! Consumer accounting: when the child reaches `started`, the service walks
//! its reverse-dependency graph through no-command nodes and counts every
//! command-bearing one-shot whose execution has not yet settled; each one
//! releases its count when its execution record resolves. Downstream
//! services hold an explicit [`UpstreamHold`] for as long as they run, and a
//! service reachable from the entry point through no-command nodes only
//! additionally carries an entry-point consumer that is released on abort.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::debug;

use super::{compute_fingerprint, resolve_dependencies};
use crate::analyzer::{ConfigId, ScriptKind, ScriptReference};
use crate::deferred::Deferred;
use crate::executor::{ExecutionResult, ExecutionSuccess, Executor, Failure, FailureReason};
use crate::process::{ExitResult, ScriptChildProcess};
use crate::state::ScriptStateDir;

enum ServiceState {
    Initial,
    Fingerprinting,
    AwaitingFirstConsumer {
        upstream: Vec<Arc<ServiceExecution>>,
    },
    Starting {
        /// Holds demanded before the child is up (downstream services
        /// starting in parallel). Seeded into the consumer count at the
        /// `started` transition so a hold can never lose the race against
        /// the zero-consumer check.
        pending_holds: usize,
    },
    Started {
        consumers: usize,
        entrypoint_held: bool,
        child: Arc<ScriptChildProcess>,
    },
    Stopping {
        child: Arc<ScriptChildProcess>,
    },
    /// The child is being torn down because an upstream service died; the
    /// exit observer completes the transition to `Failed`.
    Failing {
        failure: Failure,
    },
    Stopped,
    Failed(Failure),
}

/// State plus the entry-point release flag, under one lock so the flag and
/// the consumer count can never disagree.
struct Cell {
    state: ServiceState,
    entrypoint_released: bool,
}

pub struct ServiceExecution {
    id: ConfigId,
    reference: ScriptReference,
    /// Entry-point services keep an implicit consumer until abort.
    persistent: bool,
    cell: Mutex<Cell>,
    /// Resolves when the child is up (or the start failed).
    started: Deferred<Result<(), Failure>>,
    /// Resolves when the service has fully wound down.
    done: Deferred<Result<(), Failure>>,
}

/// A downstream service's hold on an upstream one; released on drop.
pub struct UpstreamHold {
    service: Arc<ServiceExecution>,
    released: AtomicBool,
}

impl UpstreamHold {
    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.service.release_consumer();
        }
    }
}

impl Drop for UpstreamHold {
    fn drop(&mut self) {
        self.release();
    }
}

impl ServiceExecution {
    pub fn new(executor: &Arc<Executor>, id: ConfigId, persistent: bool) -> Arc<Self> {
        let reference = executor.analysis().config(id).reference.clone();
        Arc::new(Self {
            id,
            reference,
            persistent,
            cell: Mutex::new(Cell {
                state: ServiceState::Initial,
                entrypoint_released: false,
            }),
            started: Deferred::new(),
            done: Deferred::new(),
        })
    }

    /// The execution-record entry point: resolve dependencies, compute the
    /// fingerprint, then park until the first consumer arrives. The record
    /// resolves immediately; the service itself is the forwarded handle.
    pub async fn execute(self: &Arc<Self>, executor: &Arc<Executor>) -> ExecutionResult {
        {
            let mut cell = self.cell.lock().unwrap();
            match cell.state {
                ServiceState::Initial => cell.state = ServiceState::Fingerprinting,
                _ => unreachable!("service executed twice"),
            }
        }

        let resolved = match resolve_dependencies(executor, self.id).await {
            Ok(resolved) => resolved,
            Err(failure) => return Err(self.fail_before_start(failure)),
        };
        let fingerprint = match compute_fingerprint(executor, self.id, &resolved).await {
            Ok(fingerprint) => fingerprint,
            Err(failure) => return Err(self.fail_before_start(failure)),
        };

        {
            let mut cell = self.cell.lock().unwrap();
            match cell.state {
                ServiceState::Fingerprinting => {
                    cell.state = ServiceState::AwaitingFirstConsumer {
                        upstream: resolved.services,
                    }
                }
                _ => unreachable!("service left fingerprinting early"),
            }
        }

        Ok(ExecutionSuccess {
            fingerprint,
            services: vec![self.clone()],
        })
    }

    fn fail_before_start(&self, failure: Failure) -> Failure {
        {
            let mut cell = self.cell.lock().unwrap();
            cell.state = ServiceState::Failed(failure.clone());
        }
        self.started.resolve(Err(failure.clone()));
        self.done.resolve(Err(failure.clone()));
        failure
    }

    /// Consumer demand: start the service if this is the first consumer,
    /// then wait until it is running. One-shot consumers are accounted by
    /// the reverse-dependency walk, so no handle is returned here.
    pub async fn ensure_started(
        self: &Arc<Self>,
        executor: &Arc<Executor>,
    ) -> Result<(), Failure> {
        enum Action {
            Kick(Vec<Arc<ServiceExecution>>),
            Wait,
            Done(Result<(), Failure>),
        }

        let action = {
            let mut cell = self.cell.lock().unwrap();
            match &mut cell.state {
                ServiceState::Initial | ServiceState::Fingerprinting => {
                    unreachable!("consumer acquired a service before its record resolved")
                }
                ServiceState::AwaitingFirstConsumer { upstream } => {
                    let upstream = std::mem::take(upstream);
                    cell.state = ServiceState::Starting { pending_holds: 0 };
                    Action::Kick(upstream)
                }
                ServiceState::Starting { .. } => Action::Wait,
                ServiceState::Started { .. } => Action::Done(Ok(())),
                ServiceState::Stopping { .. } | ServiceState::Stopped => {
                    Action::Done(Err(Failure {
                        script: self.reference.clone(),
                        reason: FailureReason::ServiceExitedUnexpectedly,
                    }))
                }
                ServiceState::Failing { failure } | ServiceState::Failed(failure) => {
                    Action::Done(Err(failure.clone()))
                }
            }
        };

        match action {
            Action::Kick(upstream) => {
                let service = self.clone();
                let executor = executor.clone();
                tokio::spawn(async move { service.start(executor, upstream).await });
                self.started.wait().await
            }
            Action::Wait => self.started.wait().await,
            Action::Done(result) => result,
        }
    }

    /// A downstream service's start: like [`ensure_started`], but the caller
    /// holds an explicit consumer handle until it stops.
    ///
    /// The consumer is registered under the same lock as the state it
    /// observes: a hold taken before the child is up is seeded into the
    /// `starting` state, so the zero-consumer check after `started` can
    /// never win a race against it.
    pub fn hold<'a>(
        self: &'a Arc<Self>,
        executor: &'a Arc<Executor>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<UpstreamHold, Failure>> + Send + 'a>>
    {
        Box::pin(async move {
        enum Action {
            Kick(Vec<Arc<ServiceExecution>>),
            Wait,
            Ready,
            Done(Failure),
        }

        let action = {
            let mut cell = self.cell.lock().unwrap();
            match &mut cell.state {
                ServiceState::Initial | ServiceState::Fingerprinting => {
                    unreachable!("consumer acquired a service before its record resolved")
                }
                ServiceState::AwaitingFirstConsumer { upstream } => {
                    let upstream = std::mem::take(upstream);
                    cell.state = ServiceState::Starting { pending_holds: 1 };
                    Action::Kick(upstream)
                }
                ServiceState::Starting { pending_holds } => {
                    *pending_holds += 1;
                    Action::Wait
                }
                ServiceState::Started { consumers, .. } => {
                    *consumers += 1;
                    Action::Ready
                }
                ServiceState::Stopping { .. } | ServiceState::Stopped => {
                    Action::Done(Failure {
                        script: self.reference.clone(),
                        reason: FailureReason::ServiceExitedUnexpectedly,
                    })
                }
                ServiceState::Failing { failure } | ServiceState::Failed(failure) => {
                    Action::Done(failure.clone())
                }
            }
        };

        match action {
            Action::Kick(upstream) => {
                let service = self.clone();
                let executor = executor.clone();
                tokio::spawn(async move { service.start(executor, upstream).await });
                self.started.wait().await?;
            }
            Action::Wait => self.started.wait().await?,
            Action::Ready => {}
            Action::Done(failure) => return Err(failure),
        }

        Ok(UpstreamHold {
            service: self.clone(),
            released: AtomicBool::new(false),
        })
        })
    }

    /// The `starting -> started` edge: acquire upstream services in
    /// parallel, spawn the child, then count consumers from the
    /// reverse-dependency walk.
    async fn start(
        self: Arc<Self>,
        executor: Arc<Executor>,
        upstream: Vec<Arc<ServiceExecution>>,
    ) {
        let mut holds = Vec::new();
        let mut join = JoinSet::new();
        for service in upstream {
            let executor = executor.clone();
            let fut: std::pin::Pin<Box<dyn std::future::Future<Output = _> + Send>> =
                Box::pin(async move { service.hold(&executor).await });
            join.spawn(fut);
        }
        while let Some(joined) = join.join_next().await {
            match joined.expect("upstream hold task panicked") {
                Ok(hold) => holds.push(hold),
                Err(_) => {
                    let failure = Failure {
                        script: self.reference.clone(),
                        reason: FailureReason::DependencyFailed,
                    };
                    self.fail_before_start(failure);
                    return;
                }
            }
        }

        if executor.killed().is_resolved() {
            self.fail_before_start(Failure {
                script: self.reference.clone(),
                reason: FailureReason::Aborted,
            });
            return;
        }

        let config = executor.analysis().config(self.id);
        let command = config.command().expect("service has a command");
        let state_dir = ScriptStateDir::new(&self.reference);
        state_dir.reset_streams().await.ok();

        let child = match ScriptChildProcess::spawn(
            command,
            &self.reference.package_dir,
            state_dir.stdout_path(),
            state_dir.stderr_path(),
        ) {
            Ok(child) => Arc::new(child),
            Err(err) => {
                let failure = Failure {
                    script: self.reference.clone(),
                    reason: FailureReason::SpawnError(format!("{err:#}")),
                };
                executor.record_failure(failure.clone());
                self.fail_before_start(failure);
                return;
            }
        };

        // Enumerate command-bearing consumers through no-command nodes and
        // watch their execution records; each resolution releases one
        // consumer.
        let consumer_records: Vec<_> = walk_consumers(&executor, self.id)
            .into_iter()
            .map(|consumer| executor.execute(consumer))
            .filter(|record| record.peek().is_none())
            .collect();

        {
            let mut cell = self.cell.lock().unwrap();
            let entrypoint_held = self.persistent && !cell.entrypoint_released;
            match cell.state {
                ServiceState::Starting { pending_holds } => {
                    cell.state = ServiceState::Started {
                        consumers: consumer_records.len()
                            + pending_holds
                            + usize::from(entrypoint_held),
                        entrypoint_held,
                        child: child.clone(),
                    };
                }
                _ => unreachable!("service left starting early"),
            }
        }
        executor.reporter().service_started(&self.reference);
        self.started.resolve(Ok(()));

        for record in consumer_records {
            let service = self.clone();
            tokio::spawn(async move {
                let _ = record.wait().await;
                service.release_consumer();
            });
        }

        // Propagate upstream failure: if a service we depend on dies while
        // we are running, we cannot keep running either.
        for hold in &holds {
            let service = self.clone();
            let upstream = hold.service.clone();
            tokio::spawn(async move {
                if upstream.done.wait().await.is_err() {
                    service.upstream_failed();
                }
            });
        }

        {
            let service = self.clone();
            let killed = executor.killed().clone();
            tokio::spawn(async move {
                killed.wait().await;
                service.terminate_for_abort();
            });
        }

        {
            let service = self.clone();
            let completed = child.completed().clone();
            tokio::spawn(async move {
                let exit = completed.wait().await;
                service.on_child_exit(exit, &executor, holds);
            });
        }

        // Everything the walk found may already have settled.
        self.stop_if_unconsumed();
    }

    /// Consumer released (walk record resolved, upstream hold dropped, or
    /// entry point let go). Stops the child when the count reaches zero.
    fn release_consumer(&self) {
        let terminate = {
            let mut cell = self.cell.lock().unwrap();
            match &mut cell.state {
                ServiceState::Started { consumers, child, .. } => {
                    *consumers = consumers.saturating_sub(1);
                    if *consumers == 0 {
                        let child = child.clone();
                        cell.state = ServiceState::Stopping {
                            child: child.clone(),
                        };
                        Some(child)
                    } else {
                        None
                    }
                }
                // Late releases after a stop or failure are fine.
                _ => None,
            }
        };
        if let Some(child) = terminate {
            debug!(script = %self.reference.name, "last consumer done, stopping service");
            child.terminate();
        }
    }

    fn stop_if_unconsumed(&self) {
        let terminate = {
            let mut cell = self.cell.lock().unwrap();
            match &mut cell.state {
                ServiceState::Started { consumers: 0, child, .. } => {
                    let child = child.clone();
                    cell.state = ServiceState::Stopping {
                        child: child.clone(),
                    };
                    Some(child)
                }
                _ => None,
            }
        };
        if let Some(child) = terminate {
            child.terminate();
        }
    }

    /// Entry-point release (abort, or the watcher winding services down
    /// between iterations).
    pub fn release_entrypoint(&self) {
        let release = {
            let mut cell = self.cell.lock().unwrap();
            if cell.entrypoint_released {
                false
            } else {
                cell.entrypoint_released = true;
                match &mut cell.state {
                    ServiceState::Started {
                        entrypoint_held, ..
                    } if *entrypoint_held => {
                        *entrypoint_held = false;
                        true
                    }
                    _ => false,
                }
            }
        };
        if release {
            self.release_consumer();
        }
    }

    /// An upstream service died while we were running: terminate the child
    /// and surface the propagated failure kind.
    fn upstream_failed(&self) {
        let terminate = {
            let mut cell = self.cell.lock().unwrap();
            match &cell.state {
                ServiceState::Started { child, .. } => {
                    let child = child.clone();
                    cell.state = ServiceState::Failing {
                        failure: Failure {
                            script: self.reference.clone(),
                            reason: FailureReason::ServiceTerminatedUnexpectedly,
                        },
                    };
                    Some(child)
                }
                _ => None,
            }
        };
        if let Some(child) = terminate {
            child.terminate();
        }
    }

    /// Abort: stop the child; an abort-driven stop is not a failure of the
    /// service itself.
    fn terminate_for_abort(&self) {
        let terminate = {
            let mut cell = self.cell.lock().unwrap();
            match &cell.state {
                ServiceState::Started { child, .. } => {
                    let child = child.clone();
                    cell.state = ServiceState::Stopping {
                        child: child.clone(),
                    };
                    Some(child)
                }
                _ => None,
            }
        };
        if let Some(child) = terminate {
            child.terminate();
        }
    }

    /// The child exited. Which edge this is depends on where we were:
    /// requested stop, spontaneous death, or teardown after an upstream
    /// failure.
    fn on_child_exit(&self, exit: ExitResult, executor: &Arc<Executor>, holds: Vec<UpstreamHold>) {
        enum Outcome {
            CleanStop,
            Died(Failure),
            Propagated(Failure),
        }

        let outcome = {
            let mut cell = self.cell.lock().unwrap();
            match &cell.state {
                ServiceState::Stopping { .. } => {
                    cell.state = ServiceState::Stopped;
                    Outcome::CleanStop
                }
                ServiceState::Started { .. } => {
                    let failure = Failure {
                        script: self.reference.clone(),
                        reason: match exit {
                            ExitResult::ExitNonZero(_)
                            | ExitResult::Signal(_)
                            | ExitResult::Ok => FailureReason::ServiceExitedUnexpectedly,
                            ExitResult::SpawnError(message) => {
                                FailureReason::SpawnError(message)
                            }
                            ExitResult::Terminated => FailureReason::Terminated,
                        },
                    };
                    cell.state = ServiceState::Failed(failure.clone());
                    Outcome::Died(failure)
                }
                ServiceState::Failing { failure } => {
                    let failure = failure.clone();
                    cell.state = ServiceState::Failed(failure.clone());
                    Outcome::Propagated(failure)
                }
                _ => unreachable!("service child exited from a non-running state"),
            }
        };

        for hold in &holds {
            hold.release();
        }

        match outcome {
            Outcome::CleanStop => {
                executor.reporter().service_stopped(&self.reference);
                self.done.resolve(Ok(()));
            }
            Outcome::Died(failure) | Outcome::Propagated(failure) => {
                executor.record_failure(failure.clone());
                self.done.resolve(Err(failure));
            }
        }
    }

    /// Wind-down for the executor's teardown: a service no consumer ever
    /// demanded just resolves; anything that started is awaited.
    pub async fn settle(&self) {
        let finish_now = {
            let mut cell = self.cell.lock().unwrap();
            if matches!(cell.state, ServiceState::AwaitingFirstConsumer { .. }) {
                cell.state = ServiceState::Stopped;
                true
            } else {
                false
            }
        };
        if finish_now {
            self.done.resolve(Ok(()));
            return;
        }
        let _ = self.done.wait().await;
    }
}

/// The command-bearing one-shot scripts that consume a service: walk the
/// reverse-dependency graph, passing through no-command nodes, stopping at
/// anything with a command. Downstream services are excluded; they account
/// for themselves with explicit holds.
fn walk_consumers(executor: &Arc<Executor>, id: ConfigId) -> Vec<ConfigId> {
    let analysis = executor.analysis();
    let mut consumers = Vec::new();
    let mut queue: Vec<ConfigId> = analysis.config(id).reverse_dependencies.clone();
    let mut visited = std::collections::HashSet::new();
    while let Some(current) = queue.pop() {
        if !visited.insert(current.0) {
            continue;
        }
        let config = analysis.config(current);
        match config.kind {
            ScriptKind::OneShot { .. } => consumers.push(current),
            ScriptKind::Service { .. } => {}
            ScriptKind::NoCommand => {
                queue.extend(config.reverse_dependencies.iter().copied());
            }
        }
    }
    consumers
}

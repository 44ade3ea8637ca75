//! One-shot execution
//!
//! The full incremental pipeline for a script expected to run to completion:
//! dependencies, upstream services, fingerprint, freshness check, cache
//! restore, output cleaning, worker slot, spawn, persist.

use std::sync::Arc;
use tracing::{debug, warn};

use super::{compute_fingerprint, resolve_dependencies};
use crate::analyzer::{relative_path, CleanPolicy, ConfigId, ScriptKind};
use crate::executor::{ExecutionResult, ExecutionSuccess, Executor, Failure, FailureReason};
use crate::fingerprint::{expand_globs, Fingerprint};
use crate::process::{ExitResult, ScriptChildProcess};
use crate::state::{PreviousState, ScriptStateDir};

pub(crate) async fn execute(executor: &Arc<Executor>, id: ConfigId) -> ExecutionResult {
    let analysis = executor.analysis().clone();
    let config = analysis.config(id);
    let reference = &config.reference;
    let fail = |reason: FailureReason| Failure {
        script: reference.clone(),
        reason,
    };

    let resolved = resolve_dependencies(executor, id).await?;

    // Require every upstream service before going further; a service that
    // cannot start means this script cannot run.
    for service in &resolved.services {
        if service.ensure_started(executor).await.is_err() {
            return Err(fail(FailureReason::DependencyFailed));
        }
    }

    let fingerprint = compute_fingerprint(executor, id, &resolved).await?;
    let state = ScriptStateDir::new(reference);
    let previous = state.read_previous().await;

    // Fresh? Only fully tracked scripts (cacheable fingerprints) can know
    // that nothing changed.
    if fingerprint.cacheable() {
        if let Some(previous) = &previous {
            if previous.fingerprint == fingerprint.as_str() && state.outputs_present(previous) {
                executor.count_fresh();
                executor.reporter().fresh(reference);
                state.replay_streams().await.ok();
                return Ok(ExecutionSuccess {
                    fingerprint,
                    services: Vec::new(),
                });
            }
        }
    }

    // Cache restore.
    if fingerprint.cacheable() {
        if let Some(cache) = executor.cache() {
            match cache.get(reference, &fingerprint) {
                Ok(Some(hit)) => match hit.apply(&reference.package_dir) {
                    Ok(restored) => {
                        if let Err(err) = state.write(&fingerprint, &restored).await {
                            warn!("Failed to persist state after cache restore: {err:#}");
                        }
                        executor.count_cached();
                        executor.reporter().cached(reference);
                        return Ok(ExecutionSuccess {
                            fingerprint,
                            services: Vec::new(),
                        });
                    }
                    Err(err) => warn!("Failed to restore from cache: {err:#}"),
                },
                Ok(None) => {}
                Err(err) => warn!("Cache lookup failed: {err:#}"),
            }
        }
    }

    // Clean declared outputs.
    if let ScriptKind::OneShot { clean, output, .. } = &config.kind {
        let should_clean = match clean {
            CleanPolicy::Always => true,
            CleanPolicy::Never => false,
            CleanPolicy::IfFileDeleted => input_file_deleted(previous.as_ref(), &fingerprint),
        };
        if should_clean {
            if let Some(output_globs) = output {
                if let Err(err) = delete_outputs(reference, output_globs) {
                    let failure = fail(FailureReason::Internal(format!("{err:#}")));
                    executor.record_failure(failure.clone());
                    return Err(failure);
                }
            }
        }
    }

    // Policy gate, once before queueing for a slot and once after, since the
    // queue wait can span another script's failure.
    if executor.aborted().is_resolved() {
        return Err(fail(FailureReason::Aborted));
    }
    if !executor.should_start_new() {
        return Err(fail(FailureReason::StartCancelled));
    }
    let slot = executor.pool().acquire().await;
    if executor.aborted().is_resolved() {
        return Err(fail(FailureReason::Aborted));
    }
    if !executor.should_start_new() {
        return Err(fail(FailureReason::StartCancelled));
    }

    // An interrupted run must not look fresh next time.
    if let Err(err) = state.invalidate().await {
        warn!("Failed to invalidate state: {err:#}");
    }
    state.reset_streams().await.ok();

    let command = config.command().expect("one-shot has a command");
    debug!(script = %reference.name, command, "spawning");
    let child = match ScriptChildProcess::spawn(
        command,
        &reference.package_dir,
        state.stdout_path(),
        state.stderr_path(),
    ) {
        Ok(child) => child,
        Err(err) => {
            let failure = fail(FailureReason::SpawnError(format!("{err:#}")));
            executor.record_failure(failure.clone());
            return Err(failure);
        }
    };

    let exit = tokio::select! {
        exit = child.completed().wait() => exit,
        _ = executor.killed().wait() => {
            child.terminate();
            child.completed().wait().await
        }
    };
    drop(slot);

    match exit {
        ExitResult::Ok => {
            let outputs = collect_outputs(reference, config.output())?;
            if fingerprint.cacheable() {
                if let Some(cache) = executor.cache() {
                    if let Err(err) = cache.put(reference, &fingerprint, &outputs) {
                        warn!("Failed to write cache entry: {err:#}");
                    }
                }
            }
            if let Err(err) = state.write(&fingerprint, &outputs).await {
                warn!("Failed to persist state: {err:#}");
            }
            executor.count_ran();
            executor.reporter().ran(reference);
            Ok(ExecutionSuccess {
                fingerprint,
                services: Vec::new(),
            })
        }
        ExitResult::ExitNonZero(code) => {
            let failure = fail(FailureReason::ExitNonZero(code));
            executor.record_failure(failure.clone());
            Err(failure)
        }
        ExitResult::Signal(signal) => {
            let failure = fail(FailureReason::Signal(signal));
            executor.record_failure(failure.clone());
            Err(failure)
        }
        ExitResult::Terminated => {
            let reason = if executor.aborted().is_resolved() {
                FailureReason::Aborted
            } else {
                FailureReason::Terminated
            };
            let failure = fail(reason);
            executor.record_failure(failure.clone());
            Err(failure)
        }
        ExitResult::SpawnError(message) => {
            let failure = fail(FailureReason::SpawnError(message));
            executor.record_failure(failure.clone());
            Err(failure)
        }
    }
}

/// Did an input file recorded by the previous run disappear?
fn input_file_deleted(previous: Option<&PreviousState>, current: &Fingerprint) -> bool {
    let Some(data) = previous.and_then(|p| p.data.as_ref()) else {
        return false;
    };
    data.files
        .keys()
        .any(|path| !current.data().files.contains_key(path))
}

/// Delete the files matched by the declared output globs.
fn delete_outputs(
    reference: &crate::analyzer::ScriptReference,
    output_globs: &[String],
) -> anyhow::Result<()> {
    for path in expand_globs(&reference.package_dir, output_globs)? {
        debug!(path = %path.display(), "cleaning output");
        std::fs::remove_file(&path)?;
    }
    Ok(())
}

/// Expand the output globs after a successful run into package-relative
/// paths for the state record and the cache.
fn collect_outputs(
    reference: &crate::analyzer::ScriptReference,
    output_globs: Option<&[String]>,
) -> Result<Vec<String>, Failure> {
    let Some(globs) = output_globs else {
        return Ok(Vec::new());
    };
    expand_globs(&reference.package_dir, globs)
        .map(|paths| {
            paths
                .iter()
                .map(|p| relative_path(&reference.package_dir, p))
                .collect()
        })
        .map_err(|err| Failure {
            script: reference.clone(),
            reason: FailureReason::Internal(format!("{err:#}")),
        })
}

//! Execution variants
//!
//! One module per script shape: no-command, one-shot, and service. The
//! helpers here are the steps they share: resolving dependency executions
//! (in randomized order) and assembling the fingerprint from their results.

pub mod no_command;
pub mod one_shot;
pub mod service;

use rand::seq::SliceRandom;
use std::sync::Arc;

use crate::analyzer::ConfigId;
use crate::executor::{Executor, Failure, FailureReason};
use crate::fingerprint::{self, Fingerprint};
use service::ServiceExecution;

/// The dependency results a script needs before doing anything else.
pub(crate) struct ResolvedDependencies {
    /// Dependency id plus its fingerprint, in completion order.
    pub fingerprints: Vec<(ConfigId, Fingerprint)>,
    /// Union of the services forwarded by the dependencies, deduplicated.
    pub services: Vec<Arc<ServiceExecution>>,
}

/// Trigger every dependency execution and wait for all of them.
///
/// The trigger order is shuffled on purpose: correct graphs declare their
/// ordering, and randomization surfaces graphs that accidentally rely on
/// declaration order. All records are awaited even after a failure so that
/// every script in the graph settles.
pub(crate) async fn resolve_dependencies(
    executor: &Arc<Executor>,
    id: ConfigId,
) -> Result<ResolvedDependencies, Failure> {
    let config = executor.analysis().config(id);
    let mut dep_ids: Vec<ConfigId> = config.dependencies.iter().map(|d| d.config).collect();
    dep_ids.shuffle(&mut rand::thread_rng());

    let records: Vec<_> = dep_ids
        .into_iter()
        .map(|dep| (dep, executor.execute(dep)))
        .collect();

    let mut fingerprints = Vec::new();
    let mut services: Vec<Arc<ServiceExecution>> = Vec::new();
    let mut any_failed = false;
    for (dep, record) in records {
        match record.wait().await {
            Ok(success) => {
                for service in success.services {
                    if !services.iter().any(|s| Arc::ptr_eq(s, &service)) {
                        services.push(service);
                    }
                }
                fingerprints.push((dep, success.fingerprint));
            }
            Err(_) => any_failed = true,
        }
    }

    if any_failed {
        return Err(Failure {
            script: config.reference.clone(),
            reason: FailureReason::DependencyFailed,
        });
    }
    Ok(ResolvedDependencies {
        fingerprints,
        services,
    })
}

/// Compute this script's fingerprint from its config and the dependency
/// fingerprints gathered by [`resolve_dependencies`].
pub(crate) async fn compute_fingerprint(
    executor: &Arc<Executor>,
    id: ConfigId,
    resolved: &ResolvedDependencies,
) -> Result<Fingerprint, Failure> {
    let analysis = executor.analysis();
    let config = analysis.config(id);
    let pairs: Vec<_> = resolved
        .fingerprints
        .iter()
        .map(|(dep, fingerprint)| (analysis.config(*dep), fingerprint.clone()))
        .collect();

    fingerprint::compute(config, &pairs).await.map_err(|err| {
        let failure = Failure {
            script: config.reference.clone(),
            reason: FailureReason::Internal(format!("{err:#}")),
        };
        executor.record_failure(failure.clone());
        failure
    })
}

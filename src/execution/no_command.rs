//! No-command execution
//!
//! A dependency aggregation node: waits for its dependencies, forwards the
//! union of their service handles to whoever depends on it, and contributes
//! a fingerprint of its own so downstream fingerprints see changes below it.

use std::sync::Arc;
use tracing::debug;

use super::{compute_fingerprint, resolve_dependencies};
use crate::analyzer::ConfigId;
use crate::executor::{ExecutionResult, ExecutionSuccess, Executor};

pub(crate) async fn execute(executor: &Arc<Executor>, id: ConfigId) -> ExecutionResult {
    let resolved = resolve_dependencies(executor, id).await?;
    let fingerprint = compute_fingerprint(executor, id, &resolved).await?;

    debug!(
        script = %executor.analysis().config(id).reference.name,
        "no command, dependencies resolved"
    );

    Ok(ExecutionSuccess {
        fingerprint,
        services: resolved.services,
    })
}

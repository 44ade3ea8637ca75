//! Launch-time configuration
//!
//! Wireit is not invoked directly: the package-manager runner (`npm run`)
//! sets environment variables naming the script and manifest, and Wireit
//! reconstructs its entry point from those. Tunables (parallelism, failure
//! mode, cache backend) come from `WIREIT_*` variables or flags.

use anyhow::{anyhow, Result};
use std::path::PathBuf;

use crate::analyzer::ScriptReference;
use crate::cli::Cli;
use crate::executor::FailureMode;

/// Environment variable set by npm to the name of the running script.
pub const LIFECYCLE_EVENT_VAR: &str = "npm_lifecycle_event";
/// Environment variable set by npm to the path of the invoking package.json.
pub const PACKAGE_JSON_VAR: &str = "npm_package_json";

/// Cache backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Local,
    None,
}

/// Fully resolved invocation options
#[derive(Debug, Clone)]
pub struct Options {
    /// The script named by the runner, in the invoking package.
    pub script: ScriptReference,
    pub watch: bool,
    /// Worker slots for one-shot executions.
    pub parallelism: usize,
    pub failure_mode: FailureMode,
    pub cache: CacheMode,
}

impl Options {
    /// Resolve options from the CLI surface plus the runner environment.
    ///
    /// Returns a "launched incorrectly" error when the npm environment
    /// variables are absent, since without them there is no script to run.
    pub fn from_env(cli: &Cli) -> Result<Self> {
        let script_name = std::env::var(LIFECYCLE_EVENT_VAR).map_err(|_| {
            anyhow!(
                "wireit launched incorrectly: the {} environment variable is not set. \
                 Launch wireit with \"npm run <script>\" or a compatible runner.",
                LIFECYCLE_EVENT_VAR
            )
        })?;

        let manifest_path = std::env::var(PACKAGE_JSON_VAR).map_err(|_| {
            anyhow!(
                "wireit launched incorrectly: the {} environment variable is not set. \
                 Launch wireit with \"npm run <script>\" or a compatible runner.",
                PACKAGE_JSON_VAR
            )
        })?;

        // npm may hand us a relative path; anchor it to the working
        // directory so state dirs and labels are stable.
        let manifest_path = match std::env::current_dir() {
            Ok(cwd) => cwd.join(manifest_path),
            Err(_) => PathBuf::from(manifest_path),
        };
        let package_dir = crate::analyzer::normalize_path(
            manifest_path
                .parent()
                .ok_or_else(|| anyhow!("{} has no parent directory", manifest_path.display()))?,
        );

        let parallelism = match cli.parallel.as_deref() {
            None => default_parallelism(),
            Some("infinity") => 0,
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| anyhow!("Expected WIREIT_PARALLEL to be a number, got {:?}", raw))?,
        };

        let failure_mode = match cli.failures.as_deref() {
            None | Some("continue") => FailureMode::Continue,
            Some("no-new") => FailureMode::NoNew,
            Some("kill") => FailureMode::Kill,
            Some(other) => {
                return Err(anyhow!(
                    "Expected WIREIT_FAILURES to be continue, no-new, or kill, got {:?}",
                    other
                ))
            }
        };

        let cache = match cli.cache.as_deref() {
            None | Some("local") => CacheMode::Local,
            Some("none") => CacheMode::None,
            Some(other) => {
                return Err(anyhow!(
                    "Expected WIREIT_CACHE to be local or none, got {:?}",
                    other
                ))
            }
        };

        Ok(Self {
            script: ScriptReference::new(package_dir, script_name),
            watch: cli.watch_mode(),
            parallelism,
            failure_mode,
            cache,
        })
    }
}

/// Platform heuristic: two one-shot scripts per available core.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_parallelism_is_positive() {
        assert!(default_parallelism() > 0);
    }
}

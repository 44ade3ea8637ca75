//! Persisted per-script state
//!
//! Each script owns a directory `<packageDir>/.wireit/<hex(name)>/` holding
//! the fingerprint of its last successful run (`state`), the relative paths
//! of the outputs that run produced (`outputs`), and the captured `stdout` /
//! `stderr` streams. The hex encoding keeps arbitrary script names (colons,
//! slashes, spaces) filesystem-safe.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::analyzer::ScriptReference;
use crate::fingerprint::{Fingerprint, FingerprintData};

/// State recorded by the previous successful run.
#[derive(Debug)]
pub struct PreviousState {
    /// The persisted canonical fingerprint string.
    pub fingerprint: String,
    /// Parsed form, when the string is still parseable (a corrupt or
    /// old-format file simply means "not fresh").
    pub data: Option<FingerprintData>,
    /// Output files (relative to the package) observed after that run.
    pub outputs: Vec<String>,
}

/// Handle to one script's state directory.
#[derive(Debug, Clone)]
pub struct ScriptStateDir {
    dir: PathBuf,
    package_dir: PathBuf,
}

impl ScriptStateDir {
    pub fn new(reference: &ScriptReference) -> Self {
        let dir = reference
            .package_dir
            .join(".wireit")
            .join(hex::encode(reference.name.as_bytes()));
        Self {
            dir,
            package_dir: reference.package_dir.clone(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.dir.join("stdout")
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.dir.join("stderr")
    }

    /// Load the previous run's state, if any.
    pub async fn read_previous(&self) -> Option<PreviousState> {
        let fingerprint = tokio::fs::read_to_string(self.dir.join("state")).await.ok()?;
        let outputs = match tokio::fs::read_to_string(self.dir.join("outputs")).await {
            Ok(listing) => listing.lines().map(str::to_string).collect(),
            Err(_) => Vec::new(),
        };
        let data = Fingerprint::parse(&fingerprint).ok();
        Some(PreviousState {
            fingerprint,
            data,
            outputs,
        })
    }

    /// Forget the persisted fingerprint. Called before spawning so an
    /// interrupted run can never be mistaken for fresh.
    pub async fn invalidate(&self) -> Result<()> {
        match tokio::fs::remove_file(self.dir.join("state")).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context("Failed to invalidate script state"),
        }
    }

    /// Record a successful run: the fingerprint plus the outputs it left
    /// behind.
    pub async fn write(&self, fingerprint: &Fingerprint, outputs: &[String]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        tokio::fs::write(self.dir.join("outputs"), outputs.join("\n"))
            .await
            .context("Failed to write outputs listing")?;
        tokio::fs::write(self.dir.join("state"), fingerprint.as_str())
            .await
            .context("Failed to write script state")?;
        Ok(())
    }

    /// Truncate the captured stream files at the start of a run; chunks are
    /// appended as the child produces them.
    pub async fn reset_streams(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        tokio::fs::write(self.stdout_path(), b"").await?;
        tokio::fs::write(self.stderr_path(), b"").await?;
        Ok(())
    }

    /// Re-emit the captured streams of the previous run, so a fresh or
    /// cache-restored script still shows its output.
    pub async fn replay_streams(&self) -> Result<()> {
        if let Ok(captured) = tokio::fs::read(self.stdout_path()).await {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&captured).await?;
            stdout.flush().await?;
        }
        if let Ok(captured) = tokio::fs::read(self.stderr_path()).await {
            let mut stderr = tokio::io::stderr();
            stderr.write_all(&captured).await?;
            stderr.flush().await?;
        }
        Ok(())
    }

    /// Whether every output recorded by the previous run still exists.
    pub fn outputs_present(&self, previous: &PreviousState) -> bool {
        previous
            .outputs
            .iter()
            .all(|relative| self.package_dir.join(relative).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{CleanPolicy, ScriptKind, ScriptConfig};
    use crate::diagnostic::Location;
    use std::fs;
    use tempfile::TempDir;

    async fn fingerprint_for(dir: &Path) -> Fingerprint {
        let config = ScriptConfig {
            reference: ScriptReference::new(dir, "build"),
            declaration: Location::new(dir.join("package.json"), 0, 0),
            kind: ScriptKind::OneShot {
                command: "true".to_string(),
                files: Some(vec![]),
                output: None,
                clean: CleanPolicy::Always,
            },
            dependencies: Vec::new(),
            reverse_dependencies: Vec::new(),
            package_locks: Vec::new(),
        };
        crate::fingerprint::compute(&config, &[]).await.unwrap()
    }

    #[tokio::test]
    async fn round_trips_state_and_outputs() {
        let temp = TempDir::new().unwrap();
        let reference = ScriptReference::new(temp.path(), "build");
        let state = ScriptStateDir::new(&reference);

        assert!(state.read_previous().await.is_none());

        let fingerprint = fingerprint_for(temp.path()).await;
        state
            .write(&fingerprint, &["dist/out.js".to_string()])
            .await
            .unwrap();

        let previous = state.read_previous().await.unwrap();
        assert_eq!(previous.fingerprint, fingerprint.as_str());
        assert!(previous.data.is_some());
        assert_eq!(previous.outputs, vec!["dist/out.js".to_string()]);

        // Output file does not exist yet.
        assert!(!state.outputs_present(&previous));
        fs::create_dir_all(temp.path().join("dist")).unwrap();
        fs::write(temp.path().join("dist/out.js"), "x").unwrap();
        assert!(state.outputs_present(&previous));
    }

    #[tokio::test]
    async fn invalidate_forgets_the_fingerprint() {
        let temp = TempDir::new().unwrap();
        let reference = ScriptReference::new(temp.path(), "build");
        let state = ScriptStateDir::new(&reference);

        let fingerprint = fingerprint_for(temp.path()).await;
        state.write(&fingerprint, &[]).await.unwrap();
        state.invalidate().await.unwrap();
        assert!(state.read_previous().await.is_none());

        // Invalidating twice is fine.
        state.invalidate().await.unwrap();
    }

    #[test]
    fn state_dir_is_hex_of_the_script_name() {
        let reference = ScriptReference::new("/repo", "build:js");
        let state = ScriptStateDir::new(&reference);
        assert!(state
            .dir()
            .ends_with(format!(".wireit/{}", hex::encode("build:js"))));
    }
}

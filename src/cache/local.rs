//! Local filesystem cache backend
//!
//! Entries live inside each script's state directory:
//! `<packageDir>/.wireit/<hex(name)>/cache/<fingerprint-sha256>/` containing
//! a `manifest` file (newline-separated relative paths) and a `files/` tree
//! mirroring the package-relative layout of the cached outputs.
//!
//! Per-fingerprint atomicity comes from staging each entry in a temp
//! directory and renaming it into place; a reader either finds the complete
//! renamed entry or nothing.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{Cache, CacheHit};
use crate::analyzer::ScriptReference;
use crate::fingerprint::Fingerprint;
use crate::state::ScriptStateDir;

#[derive(Debug, Default)]
pub struct LocalCache;

impl LocalCache {
    pub fn new() -> Self {
        Self
    }

    fn entry_dir(script: &ScriptReference, fingerprint: &Fingerprint) -> PathBuf {
        ScriptStateDir::new(script)
            .dir()
            .join("cache")
            .join(fingerprint.content_hash())
    }
}

impl Cache for LocalCache {
    fn get(
        &self,
        script: &ScriptReference,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Box<dyn CacheHit>>> {
        let entry_dir = Self::entry_dir(script, fingerprint);
        let manifest_path = entry_dir.join("manifest");

        let manifest = match fs::read_to_string(&manifest_path) {
            Ok(manifest) => manifest,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read {}", manifest_path.display()))
            }
        };

        let files = manifest
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        debug!(script = %script.name, "cache hit");
        Ok(Some(Box::new(LocalCacheHit { entry_dir, files })))
    }

    fn put(
        &self,
        script: &ScriptReference,
        fingerprint: &Fingerprint,
        files: &[String],
    ) -> Result<()> {
        let entry_dir = Self::entry_dir(script, fingerprint);
        if entry_dir.exists() {
            return Ok(());
        }

        // Stage the whole entry next to its final location, then rename.
        let staging = entry_dir.with_extension(format!("tmp.{}", std::process::id()));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(staging.join("files"))
            .with_context(|| format!("Failed to create {}", staging.display()))?;

        for relative in files {
            let source = script.package_dir.join(relative);
            let target = staging.join("files").join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&source, &target)
                .with_context(|| format!("Failed to cache {}", source.display()))?;
        }

        fs::write(staging.join("manifest"), files.join("\n"))
            .context("Failed to write cache manifest")?;

        match fs::rename(&staging, &entry_dir) {
            Ok(()) => Ok(()),
            Err(_) if entry_dir.exists() => {
                // A concurrent writer got there first; their entry is for the
                // same fingerprint, so keep it.
                fs::remove_dir_all(&staging).ok();
                Ok(())
            }
            Err(err) => {
                fs::remove_dir_all(&staging).ok();
                Err(err).context("Failed to commit cache entry")
            }
        }
    }
}

struct LocalCacheHit {
    entry_dir: PathBuf,
    files: Vec<String>,
}

impl CacheHit for LocalCacheHit {
    fn apply(&self, package_dir: &Path) -> Result<Vec<String>> {
        for relative in &self.files {
            let source = self.entry_dir.join("files").join(relative);
            let target = package_dir.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&source, &target)
                .with_context(|| format!("Failed to restore {}", target.display()))?;
        }
        Ok(self.files.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{CleanPolicy, ScriptConfig, ScriptKind};
    use crate::diagnostic::Location;
    use tempfile::TempDir;

    async fn fingerprint_for(dir: &Path) -> Fingerprint {
        let config = ScriptConfig {
            reference: ScriptReference::new(dir, "build"),
            declaration: Location::new(dir.join("package.json"), 0, 0),
            kind: ScriptKind::OneShot {
                command: "true".to_string(),
                files: Some(vec![]),
                output: Some(vec!["dist/**".to_string()]),
                clean: CleanPolicy::Always,
            },
            dependencies: Vec::new(),
            reverse_dependencies: Vec::new(),
            package_locks: Vec::new(),
        };
        crate::fingerprint::compute(&config, &[]).await.unwrap()
    }

    #[tokio::test]
    async fn stores_and_restores_outputs() {
        let temp = TempDir::new().unwrap();
        let script = ScriptReference::new(temp.path(), "build");
        let fingerprint = fingerprint_for(temp.path()).await;

        fs::create_dir_all(temp.path().join("dist")).unwrap();
        fs::write(temp.path().join("dist/out.js"), "bundled").unwrap();

        let cache = LocalCache::new();
        cache
            .put(&script, &fingerprint, &["dist/out.js".to_string()])
            .unwrap();

        // Simulate a clean: the output disappears.
        fs::remove_file(temp.path().join("dist/out.js")).unwrap();

        let hit = cache.get(&script, &fingerprint).unwrap().unwrap();
        let restored = hit.apply(temp.path()).unwrap();
        assert_eq!(restored, vec!["dist/out.js".to_string()]);
        assert_eq!(
            fs::read_to_string(temp.path().join("dist/out.js")).unwrap(),
            "bundled"
        );
    }

    #[tokio::test]
    async fn miss_returns_none_and_double_put_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let script = ScriptReference::new(temp.path(), "build");
        let fingerprint = fingerprint_for(temp.path()).await;

        let cache = LocalCache::new();
        assert!(cache.get(&script, &fingerprint).unwrap().is_none());

        cache.put(&script, &fingerprint, &[]).unwrap();
        cache.put(&script, &fingerprint, &[]).unwrap();
        assert!(cache.get(&script, &fingerprint).unwrap().is_some());
    }
}

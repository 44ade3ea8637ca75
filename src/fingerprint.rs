//! Fingerprint computation
//!
//! A fingerprint is the canonical JSON serialization of everything that can
//! affect a script's output: platform, architecture, runner version, the
//! command, the clean policy, a sorted map of hashed input files (declared
//! globs plus discovered package-lock files), the output globs, and the
//! fingerprints of every dependency. Two fingerprints are equal iff their
//! strings are equal; deserializing and re-serializing a fingerprint string
//! reproduces it byte for byte.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use crate::analyzer::{relative_path, CleanPolicy, ScriptConfig, ScriptKind};

/// The serialized shape of a fingerprint. Field order is load-bearing:
/// serde_json writes struct fields in declaration order, which is what makes
/// the serialization canonical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintData {
    pub platform: String,
    pub arch: String,
    /// Version token of the runner itself; a new wireit release invalidates
    /// prior fingerprints.
    pub runner: String,
    pub command: Option<String>,
    pub service: bool,
    pub clean: String,
    /// Relative path -> sha256 hex of every hashed input file.
    pub files: BTreeMap<String, String>,
    pub output: Vec<String>,
    /// Dependency label -> dependency fingerprint, sorted by label.
    pub dependencies: BTreeMap<String, FingerprintData>,
}

/// A computed fingerprint: the canonical string plus the derived
/// cacheability flag.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    string: Arc<str>,
    data: Arc<FingerprintData>,
    cacheable: bool,
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.string == other.string
    }
}

impl Eq for Fingerprint {}

impl Fingerprint {
    pub fn from_data(data: FingerprintData, cacheable: bool) -> Self {
        let string = serde_json::to_string(&data).expect("fingerprint serializes");
        Self {
            string: Arc::from(string),
            data: Arc::new(data),
            cacheable,
        }
    }

    /// Parse a persisted fingerprint string back into its data form.
    pub fn parse(string: &str) -> Result<FingerprintData> {
        serde_json::from_str(string).context("Failed to parse persisted fingerprint")
    }

    pub fn as_str(&self) -> &str {
        &self.string
    }

    pub fn data(&self) -> &FingerprintData {
        &self.data
    }

    /// Only cacheable fingerprints may be persisted or restored: the script
    /// either has no command, or declares its input files and has only
    /// cacheable dependencies.
    pub fn cacheable(&self) -> bool {
        self.cacheable
    }

    /// Hex sha256 of the canonical string, for keying cache entries.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.string.as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn clean_token(clean: CleanPolicy) -> String {
    match clean {
        CleanPolicy::Always => "true".to_string(),
        CleanPolicy::Never => "false".to_string(),
        CleanPolicy::IfFileDeleted => "if-file-deleted".to_string(),
    }
}

/// Compute the fingerprint of one script from its config and its
/// dependencies' fingerprints.
///
/// `dependencies` pairs each dependency config with its already-computed
/// fingerprint; keys in the serialized map are labels relative to this
/// script's package so fingerprints do not embed absolute paths.
pub async fn compute(
    config: &ScriptConfig,
    dependencies: &[(&ScriptConfig, Fingerprint)],
) -> Result<Fingerprint> {
    let package_dir = &config.reference.package_dir;

    let mut files = BTreeMap::new();
    if let Some(patterns) = config.files() {
        for path in expand_globs(package_dir, patterns)? {
            let relative = relative_path(package_dir, &path);
            let digest = hash_file(&path)
                .await
                .with_context(|| format!("Failed to hash {}", path.display()))?;
            files.insert(relative, digest);
        }
    }

    for lock_path in discover_package_locks(package_dir, &config.package_locks) {
        let relative = relative_path(package_dir, &lock_path);
        let digest = hash_file(&lock_path)
            .await
            .with_context(|| format!("Failed to hash {}", lock_path.display()))?;
        files.insert(relative, digest);
    }

    let mut dep_map = BTreeMap::new();
    let mut deps_cacheable = true;
    for (dep_config, dep_fingerprint) in dependencies {
        deps_cacheable &= dep_fingerprint.cacheable();
        let label = dep_config.reference.label(package_dir);
        dep_map.insert(label, dep_fingerprint.data().clone());
    }

    let (clean, output) = match &config.kind {
        ScriptKind::OneShot { clean, output, .. } => (
            clean_token(*clean),
            output.clone().unwrap_or_default(),
        ),
        _ => (clean_token(CleanPolicy::Always), Vec::new()),
    };

    let data = FingerprintData {
        platform: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        runner: env!("CARGO_PKG_VERSION").to_string(),
        command: config.command().map(str::to_string),
        service: config.is_service(),
        clean,
        files,
        output,
        dependencies: dep_map,
    };

    let cacheable =
        config.command().is_none() || (config.files().is_some() && deps_cacheable);

    Ok(Fingerprint::from_data(data, cacheable))
}

/// Expand glob patterns against a base directory into a sorted list of files.
///
/// Patterns prefixed with `!` are exclusions applied to the matches of the
/// other patterns in the same list.
pub fn expand_globs(base_dir: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut includes = Vec::new();
    let mut excludes = Vec::new();
    for pattern in patterns {
        if let Some(negated) = pattern.strip_prefix('!') {
            let full = base_dir.join(negated);
            excludes.push(
                glob::Pattern::new(&full.to_string_lossy())
                    .with_context(|| format!("Invalid glob pattern: {pattern}"))?,
            );
        } else {
            includes.push(pattern);
        }
    }

    let mut paths = Vec::new();
    for pattern in includes {
        let full_pattern = base_dir.join(pattern).to_string_lossy().to_string();
        for entry in glob::glob(&full_pattern)
            .with_context(|| format!("Invalid glob pattern: {pattern}"))?
        {
            let path = entry.with_context(|| format!("Failed to read glob entry: {pattern}"))?;
            if !path.is_file() {
                continue;
            }
            if excludes.iter().any(|p| p.matches_path(&path)) {
                continue;
            }
            paths.push(path);
        }
    }

    // Sort and dedupe for deterministic ordering regardless of declaration
    // order or overlapping patterns.
    paths.sort();
    paths.dedup();
    Ok(paths)
}

/// Walk from the package directory to the filesystem root, collecting every
/// lock file that exists.
fn discover_package_locks(package_dir: &Path, lock_names: &[String]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut dir = Some(package_dir);
    while let Some(current) = dir {
        for name in lock_names {
            let candidate = current.join(name);
            if candidate.is_file() {
                found.push(candidate);
            }
        }
        dir = current.parent();
    }
    found
}

/// Streaming SHA-256 of one file, hex encoded.
pub async fn hash_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub mod local;

pub use local::LocalCache;

use anyhow::Result;
use std::path::Path;

use crate::analyzer::ScriptReference;
use crate::fingerprint::Fingerprint;

/// Cache backend surface.
///
/// Only cacheable fingerprints reach these methods. Implementations must be
/// atomic per fingerprint: a concurrent reader either sees a complete entry
/// or no entry, never a partial one. Remote object-store backends would
/// implement this same trait; the engine does not care where entries live.
pub trait Cache: Send + Sync {
    /// Look up the outputs stored for a script at a fingerprint.
    fn get(
        &self,
        script: &ScriptReference,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Box<dyn CacheHit>>>;

    /// Store the given output files (paths relative to the package
    /// directory) for a script at a fingerprint.
    fn put(
        &self,
        script: &ScriptReference,
        fingerprint: &Fingerprint,
        files: &[String],
    ) -> Result<()>;
}

/// A matched cache entry, ready to be written back into the package.
pub trait CacheHit: Send {
    /// Restore the entry's files into the package directory, returning the
    /// relative paths that were written.
    fn apply(&self, package_dir: &Path) -> Result<Vec<String>>;
}

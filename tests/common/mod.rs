// Common test utilities shared across acceptance tests
#![allow(dead_code)] // each acceptance binary uses a subset of these helpers
//
// Each test gets a completely isolated workspace in a temp directory. The
// wireit binary is launched the way the npm runner would launch it: with
// npm_lifecycle_event naming the script and npm_package_json pointing at the
// invoking manifest. No global state is touched; dropping the workspace
// deletes everything, including the per-script .wireit state dirs.

use assert_cmd::Command;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Write a package.json at `rel_package` ("" for the workspace root).
    pub fn write_manifest(&self, rel_package: &str, json: &str) {
        let dir = self.package_dir(rel_package);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("package.json"), json).unwrap();
    }

    pub fn package_dir(&self, rel_package: &str) -> PathBuf {
        if rel_package.is_empty() {
            self.path().to_path_buf()
        } else {
            self.path().join(rel_package)
        }
    }

    pub fn write_file(&self, rel: &str, content: &str) {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    pub fn read_file(&self, rel: &str) -> String {
        fs::read_to_string(self.path().join(rel)).unwrap()
    }

    pub fn file_exists(&self, rel: &str) -> bool {
        self.path().join(rel).exists()
    }

    /// A wireit invocation as the npm runner would perform it, for a script
    /// in the root package.
    pub fn wireit(&self, script: &str) -> Command {
        self.wireit_in("", script)
    }

    /// Same, for a script in a nested package.
    pub fn wireit_in(&self, rel_package: &str, script: &str) -> Command {
        let package_dir = self.package_dir(rel_package);
        let mut cmd = Command::cargo_bin("wireit").unwrap();
        cmd.current_dir(&package_dir)
            .env("npm_lifecycle_event", script)
            .env("npm_package_json", package_dir.join("package.json"))
            .env_remove("WIREIT_PARALLEL")
            .env_remove("WIREIT_FAILURES")
            .env_remove("WIREIT_CACHE")
            .env_remove("RUST_LOG");
        cmd
    }
}

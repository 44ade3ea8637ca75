//! User-facing outcome lines
//!
//! The narrow surface the log-formatting collaborator sits behind: one method
//! per observable event, each rendering a single stderr line with the script
//! label and a leading glyph. Internal engine logs use `tracing` instead.

use std::path::PathBuf;

use crate::analyzer::ScriptReference;
use crate::executor::FailureReason;

const CHECK: &str = "\u{2705}";
const CROSS: &str = "\u{274c}";

#[derive(Debug, Clone)]
pub struct Reporter {
    root_package: PathBuf,
}

impl Reporter {
    pub fn new(root_package: impl Into<PathBuf>) -> Self {
        Self {
            root_package: root_package.into(),
        }
    }

    fn label(&self, script: &ScriptReference) -> String {
        script.label(&self.root_package)
    }

    pub fn ran(&self, script: &ScriptReference) {
        eprintln!("{CHECK} [{}] Executed successfully", self.label(script));
    }

    pub fn fresh(&self, script: &ScriptReference) {
        eprintln!("{CHECK} [{}] Already fresh", self.label(script));
    }

    pub fn cached(&self, script: &ScriptReference) {
        eprintln!("{CHECK} [{}] Restored from cache", self.label(script));
    }

    pub fn service_started(&self, script: &ScriptReference) {
        eprintln!("{CHECK} [{}] Service started", self.label(script));
    }

    pub fn service_stopped(&self, script: &ScriptReference) {
        eprintln!("{CHECK} [{}] Service stopped", self.label(script));
    }

    pub fn failure(&self, script: &ScriptReference, reason: &FailureReason) {
        eprintln!("{CROSS} [{}] {}", self.label(script), reason);
    }

    pub fn watch_run_start(&self) {
        eprintln!("{CHECK} Running...");
    }

    pub fn watch_idle(&self) {
        eprintln!("{CHECK} Watching for file changes");
    }

    pub fn summary(&self, ran: usize, fresh: usize, cached: usize, failed: usize) {
        if failed > 0 {
            eprintln!("{CROSS} {failed} script(s) failed");
        } else if ran == 0 && cached == 0 {
            eprintln!("{CHECK} Already fresh ({fresh} script(s) skipped)");
        } else {
            eprintln!(
                "{CHECK} Ran {ran} script(s), skipped {}",
                fresh + cached
            );
        }
    }
}

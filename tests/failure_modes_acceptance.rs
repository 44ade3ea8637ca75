/// Acceptance tests for the WIREIT_FAILURES policy: continue, no-new, kill.
mod common;

use common::TestWorkspace;
use std::time::Duration;

#[test]
fn continue_mode_lets_independent_subtrees_finish() {
    let workspace = TestWorkspace::new();
    workspace.write_manifest(
        "",
        r#"{
  "scripts": {"main": "wireit", "bad": "wireit", "good": "wireit"},
  "wireit": {
    "main": {"dependencies": ["bad", "good"]},
    "bad": {"command": "exit 1"},
    "good": {"command": "sleep 0.2; echo ok > good.txt"}
  }
}"#,
    );

    workspace
        .wireit("main")
        .env("WIREIT_FAILURES", "continue")
        .assert()
        .failure()
        .code(1);
    assert!(
        workspace.file_exists("good.txt"),
        "independent script must finish in continue mode"
    );
}

#[test]
fn no_new_mode_finishes_in_flight_but_starts_nothing_else() {
    let workspace = TestWorkspace::new();
    workspace.write_manifest(
        "",
        r#"{
  "scripts": {"main": "wireit", "bad": "wireit", "slow": "wireit", "after": "wireit"},
  "wireit": {
    "main": {"dependencies": ["bad", "after"]},
    "bad": {"command": "sleep 0.3; exit 1"},
    "slow": {"command": "sleep 0.6; echo slow > slow.txt"},
    "after": {"command": "echo after > after.txt", "dependencies": ["slow"]}
  }
}"#,
    );

    workspace
        .wireit("main")
        .env("WIREIT_FAILURES", "no-new")
        .assert()
        .failure()
        .code(1);

    // `slow` was already running when `bad` failed and completed; `after`
    // had not started yet and must stay unstarted.
    assert!(workspace.file_exists("slow.txt"));
    assert!(!workspace.file_exists("after.txt"));
}

#[test]
fn kill_mode_terminates_in_flight_scripts() {
    let workspace = TestWorkspace::new();
    workspace.write_manifest(
        "",
        r#"{
  "scripts": {"main": "wireit", "bad": "wireit", "slow": "wireit"},
  "wireit": {
    "main": {"dependencies": ["bad", "slow"]},
    "bad": {"command": "sleep 0.2; exit 1"},
    "slow": {"command": "sleep 60; echo done > slow.txt"}
  }
}"#,
    );

    // Without the kill the sleep would hold the run for a minute; the
    // timeout proves the subtree was torn down.
    workspace
        .wireit("main")
        .env("WIREIT_FAILURES", "kill")
        .timeout(Duration::from_secs(20))
        .assert()
        .failure()
        .code(1);
    assert!(!workspace.file_exists("slow.txt"));
}

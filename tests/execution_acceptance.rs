/// Acceptance tests for one-shot execution: incremental skipping, cache
/// restoration, dependency ordering, cleaning, and failure propagation.
mod common;

use common::TestWorkspace;
use predicates::prelude::*;

#[test]
fn second_run_with_no_changes_is_fresh_and_does_not_spawn() {
    let workspace = TestWorkspace::new();
    workspace.write_file("in.txt", "x");
    workspace.write_manifest(
        "",
        r#"{
  "scripts": {"a": "wireit"},
  "wireit": {"a": {"command": "echo run >> count.txt", "files": ["in.txt"], "output": []}}
}"#,
    );

    workspace.wireit("a").assert().success();
    assert_eq!(workspace.read_file("count.txt").lines().count(), 1);

    workspace
        .wireit("a")
        .assert()
        .success()
        .code(0)
        .stderr(predicate::str::contains("Already fresh"));
    assert_eq!(
        workspace.read_file("count.txt").lines().count(),
        1,
        "a fresh script must not spawn"
    );
}

#[test]
fn changed_input_reruns_the_script() {
    let workspace = TestWorkspace::new();
    workspace.write_file("in.txt", "x");
    workspace.write_manifest(
        "",
        r#"{
  "scripts": {"a": "wireit"},
  "wireit": {"a": {"command": "echo run >> count.txt", "files": ["in.txt"]}}
}"#,
    );

    workspace.wireit("a").assert().success();
    workspace.write_file("in.txt", "y");
    workspace.wireit("a").assert().success();
    assert_eq!(workspace.read_file("count.txt").lines().count(), 2);
}

#[test]
fn reverting_an_input_restores_outputs_from_cache() {
    let workspace = TestWorkspace::new();
    workspace.write_file("in.txt", "one");
    workspace.write_manifest(
        "",
        r#"{
  "scripts": {"build": "wireit"},
  "wireit": {"build": {
    "command": "cp in.txt dist/out.txt && echo built >> count.txt",
    "files": ["in.txt"],
    "output": ["dist/**"]
  }}
}"#,
    );
    std::fs::create_dir_all(workspace.path().join("dist")).unwrap();

    workspace.wireit("build").assert().success();
    workspace.write_file("in.txt", "two");
    workspace.wireit("build").assert().success();
    assert_eq!(workspace.read_file("count.txt").lines().count(), 2);

    // Reverting the input brings back the first fingerprint: the outputs
    // come from the cache without spawning.
    workspace.write_file("in.txt", "one");
    workspace
        .wireit("build")
        .assert()
        .success()
        .stderr(predicate::str::contains("Restored from cache"));
    assert_eq!(workspace.read_file("count.txt").lines().count(), 2);
    assert_eq!(workspace.read_file("dist/out.txt"), "one");
}

#[test]
fn dependencies_run_before_dependents() {
    let workspace = TestWorkspace::new();
    workspace.write_manifest(
        "",
        r#"{
  "scripts": {"a": "wireit", "b": "wireit"},
  "wireit": {
    "a": {"command": "echo a >> order.txt"},
    "b": {"command": "echo b >> order.txt", "dependencies": ["a"]}
  }
}"#,
    );

    workspace.wireit("b").assert().success();
    assert_eq!(workspace.read_file("order.txt"), "a\nb\n");
}

#[test]
fn cross_package_dependency_executes_in_its_own_package() {
    let workspace = TestWorkspace::new();
    workspace.write_manifest(
        "app",
        r#"{
  "scripts": {"build": "wireit"},
  "wireit": {"build": {"command": "echo app > here.txt", "dependencies": ["../lib:build"]}}
}"#,
    );
    workspace.write_manifest(
        "lib",
        r#"{
  "scripts": {"build": "wireit"},
  "wireit": {"build": {"command": "echo lib > here.txt"}}
}"#,
    );

    workspace.wireit_in("app", "build").assert().success();
    assert_eq!(workspace.read_file("app/here.txt").trim(), "app");
    assert_eq!(workspace.read_file("lib/here.txt").trim(), "lib");
}

#[test]
fn no_command_script_aggregates_its_dependencies() {
    let workspace = TestWorkspace::new();
    workspace.write_manifest(
        "",
        r#"{
  "scripts": {"all": "wireit", "x": "wireit", "y": "wireit"},
  "wireit": {
    "all": {"dependencies": ["x", "y"]},
    "x": {"command": "echo x > x.txt"},
    "y": {"command": "echo y > y.txt"}
  }
}"#,
    );

    workspace.wireit("all").assert().success().code(0);
    assert!(workspace.file_exists("x.txt"));
    assert!(workspace.file_exists("y.txt"));
}

#[test]
fn failing_script_reports_the_exit_code() {
    let workspace = TestWorkspace::new();
    workspace.write_manifest(
        "",
        r#"{
  "scripts": {"a": "wireit"},
  "wireit": {"a": {"command": "exit 7"}}
}"#,
    );

    workspace
        .wireit("a")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("status code 7"));
}

#[test]
fn dependency_failure_prevents_the_dependent_from_running() {
    let workspace = TestWorkspace::new();
    workspace.write_manifest(
        "",
        r#"{
  "scripts": {"a": "wireit", "b": "wireit"},
  "wireit": {
    "a": {"command": "exit 1"},
    "b": {"command": "echo ran > b.txt", "dependencies": ["a"]}
  }
}"#,
    );

    workspace.wireit("b").assert().failure().code(1);
    assert!(!workspace.file_exists("b.txt"));
}

#[test]
fn clean_deletes_stale_outputs_before_running() {
    let workspace = TestWorkspace::new();
    workspace.write_file("in.txt", "x");
    workspace.write_file("dist/stale.txt", "stale");
    workspace.write_manifest(
        "",
        r#"{
  "scripts": {"build": "wireit"},
  "wireit": {"build": {
    "command": "cp in.txt dist/fresh.txt",
    "files": ["in.txt"],
    "output": ["dist/**"]
  }}
}"#,
    );

    workspace.wireit("build").assert().success();
    assert!(!workspace.file_exists("dist/stale.txt"));
    assert!(workspace.file_exists("dist/fresh.txt"));
}

#[test]
fn plain_scripts_without_wireit_config_still_run_as_dependencies() {
    let workspace = TestWorkspace::new();
    workspace.write_manifest(
        "",
        r#"{
  "scripts": {"a": "wireit", "plain": "echo plain > plain.txt"},
  "wireit": {"a": {"command": "echo a > a.txt", "dependencies": ["plain"]}}
}"#,
    );

    workspace.wireit("a").assert().success();
    assert!(workspace.file_exists("plain.txt"));
    assert!(workspace.file_exists("a.txt"));
}

#[test]
fn package_lock_changes_invalidate_freshness() {
    let workspace = TestWorkspace::new();
    workspace.write_file("in.txt", "x");
    workspace.write_file("package-lock.json", r#"{"v": 1}"#);
    workspace.write_manifest(
        "",
        r#"{
  "scripts": {"a": "wireit"},
  "wireit": {"a": {"command": "echo run >> count.txt", "files": ["in.txt"]}}
}"#,
    );

    workspace.wireit("a").assert().success();
    workspace.write_file("package-lock.json", r#"{"v": 2}"#);
    workspace.wireit("a").assert().success();
    assert_eq!(workspace.read_file("count.txt").lines().count(), 2);
}

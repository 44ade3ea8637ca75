/// Acceptance tests for analysis failures: launch checks, graph validation,
/// cycle reporting, and the caret-style diagnostics they render.
mod common;

use common::TestWorkspace;
use predicates::prelude::*;

#[test]
fn launched_outside_the_runner_reports_it() {
    let workspace = TestWorkspace::new();
    workspace.write_manifest("", r#"{"scripts": {"a": "echo hi"}}"#);

    let mut cmd = workspace.wireit("a");
    cmd.env_remove("npm_lifecycle_event");
    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("launched incorrectly"));
}

#[test]
fn missing_script_is_a_single_diagnostic() {
    let workspace = TestWorkspace::new();
    workspace.write_manifest("", r#"{"scripts": {"a": "echo hi"}}"#);

    workspace
        .wireit("nope")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("\"nope\" not found"));
}

#[test]
fn missing_dependency_points_at_the_specifier() {
    let workspace = TestWorkspace::new();
    workspace.write_manifest(
        "",
        r#"{
  "scripts": {"a": "wireit"},
  "wireit": {"a": {"command": "true", "dependencies": ["ghost"]}}
}"#,
    );

    workspace
        .wireit("a")
        .assert()
        .failure()
        .stderr(predicate::str::contains("\"ghost\" not found"))
        .stderr(predicate::str::contains("~")); // caret underline rendered
}

#[test]
fn self_cycle_prints_a_two_line_trail() {
    let workspace = TestWorkspace::new();
    workspace.write_manifest(
        "",
        r#"{
  "scripts": {"a": "wireit"},
  "wireit": {"a": {"command": "true", "dependencies": ["a"]}}
}"#,
    );

    workspace
        .wireit("a")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Cycle detected"))
        .stderr(predicate::str::contains(".-> a\n`-- a"));
}

#[test]
fn cycle_of_three_prints_the_full_trail() {
    let workspace = TestWorkspace::new();
    workspace.write_manifest(
        "",
        r#"{
  "scripts": {"a": "wireit", "b": "wireit", "c": "wireit"},
  "wireit": {
    "a": {"command": "true", "dependencies": ["b"]},
    "b": {"command": "true", "dependencies": ["c"]},
    "c": {"command": "true", "dependencies": ["a"]}
  }
}"#,
    );

    workspace
        .wireit("a")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Cycle detected"))
        .stderr(predicate::str::contains(".-> a\n|   b\n|   c\n`-- a"));
}

#[test]
fn cross_package_cycle_labels_the_foreign_edge() {
    let workspace = TestWorkspace::new();
    workspace.write_manifest(
        "foo",
        r#"{
  "scripts": {"a": "wireit"},
  "wireit": {"a": {"command": "true", "dependencies": ["../bar:b"]}}
}"#,
    );
    workspace.write_manifest(
        "bar",
        r#"{
  "scripts": {"b": "wireit"},
  "wireit": {"b": {"command": "true", "dependencies": ["../foo:a"]}}
}"#,
    );

    workspace
        .wireit_in("foo", "a")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Cycle detected"))
        .stderr(predicate::str::contains("../bar:b"));
}

#[test]
fn script_not_wireit_shows_both_locations() {
    let workspace = TestWorkspace::new();
    workspace.write_manifest(
        "",
        r#"{
  "scripts": {"b": "not-wireit"},
  "wireit": {"b": {"command": "true"}}
}"#,
    );

    let output = workspace.wireit("b").assert().failure().code(1);
    let stderr = String::from_utf8_lossy(&output.get_output().stderr).to_string();

    // One caret excerpt at scripts.b, one at wireit.b.
    assert_eq!(
        stderr.matches("package.json:").count(),
        2,
        "expected two location excerpts, got:\n{stderr}"
    );
    assert!(stderr.contains("not-wireit"));
    assert!(stderr.matches('~').count() >= 2);
}

#[test]
fn invalid_field_shapes_report_field_and_index() {
    let workspace = TestWorkspace::new();
    workspace.write_manifest(
        "",
        r#"{
  "scripts": {"a": "wireit"},
  "wireit": {"a": {
    "command": "true",
    "files": [""],
    "packageLocks": ["nested/lock.json"]
  }}
}"#,
    );

    workspace
        .wireit("a")
        .assert()
        .failure()
        .stderr(predicate::str::contains("files[0] must not be empty"))
        .stderr(predicate::str::contains(
            "packageLocks[0] must be a filename, not a path",
        ));
}

#[test]
fn invalid_json_reports_the_file() {
    let workspace = TestWorkspace::new();
    workspace.write_manifest("", "{ this is not json");

    workspace
        .wireit("a")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Invalid JSON"));
}

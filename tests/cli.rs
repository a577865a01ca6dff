//! Binary-level tests: drive the `fqd` executable against a temporary
//! workspace, the way the Makefile sequences it in production.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn fqd_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("fqd");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    // Three messages across two months; ids overlap nothing.
    let export = serde_json::json!([
        {
            "id": 1,
            "timestamp": "2023-01-05T10:00:00Z",
            "author": "alice",
            "body": "How do I renew my visa?"
        },
        {
            "id": 2,
            "timestamp": "2023-01-06T11:30:00Z",
            "author": "bob",
            "body": "At the consulate, takes two weeks.",
            "reply_to": 1
        },
        {
            "id": 3,
            "timestamp": "2023-02-02T09:00:00Z",
            "author": "carol",
            "body": "how do i renew my visa"
        }
    ]);
    fs::write(
        root.join("data").join("export.json"),
        serde_json::to_string_pretty(&export).unwrap(),
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/digest.sqlite"

[channel]
slug = "greece"
title = "Greece chat"
url = "https://t.me/c/1234567/1"

[source]
export_path = "{root}/data/export.json"
page_size = 2

[collaborator]
provider = "disabled"

[normalize]
max_categories = 8

[render]
output_dir = "{root}/docs"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("fqd.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_fqd(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = fqd_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run fqd binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_fqd(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_fqd(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_fqd(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_fetch_appends_and_partitions() {
    let (_tmp, config_path) = setup_test_env();

    run_fqd(&config_path, &["init"]);
    let (stdout, stderr, success) = run_fqd(&config_path, &["fetch"]);
    assert!(success, "fetch failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("fetched: 3 messages"));
    assert!(stdout.contains("appended: 3"));
    assert!(stdout.contains("2023-01"));
    assert!(stdout.contains("2023-02"));
    assert!(stdout.contains("ok"));
}

#[test]
fn test_fetch_skips_duplicates_on_rerun() {
    let (_tmp, config_path) = setup_test_env();

    run_fqd(&config_path, &["init"]);
    run_fqd(&config_path, &["fetch"]);
    let (stdout, _, success) = run_fqd(&config_path, &["fetch"]);
    assert!(success);
    // Cursor resumes past everything already stored.
    assert!(stdout.contains("fetched: 0 messages"));
    assert!(stdout.contains("appended: 0"));
}

#[test]
fn test_extract_fails_nonzero_with_disabled_collaborator() {
    let (_tmp, config_path) = setup_test_env();

    run_fqd(&config_path, &["init"]);
    run_fqd(&config_path, &["fetch"]);

    let (stdout, stderr, success) = run_fqd(
        &config_path,
        &["extract-questions", "--max-months", "2"],
    );
    assert!(
        !success,
        "extraction must fail without a collaborator: stdout={}",
        stdout
    );
    assert!(stdout.contains("failed: 2"), "stdout={}", stdout);
    // The failure is isolated and reported, not a crash.
    assert!(stderr.contains("collaborator") || stdout.contains("failed"));
}

#[test]
fn test_extract_window_bounds_partitions() {
    let (_tmp, config_path) = setup_test_env();

    run_fqd(&config_path, &["init"]);
    run_fqd(&config_path, &["fetch"]);

    let (stdout, _, success) = run_fqd(
        &config_path,
        &["extract-questions", "--max-months", "1"],
    );
    assert!(!success);
    // Only the most recent month is considered.
    assert!(stdout.contains("partitions considered: 1"), "stdout={}", stdout);
}

#[test]
fn test_aggregate_on_empty_store_succeeds() {
    let (_tmp, config_path) = setup_test_env();

    run_fqd(&config_path, &["init"]);
    let (stdout, stderr, success) = run_fqd(&config_path, &["aggregate-questions"]);
    assert!(success, "stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("aggregated questions: 0"));

    // Second run is an idempotent skip.
    let (stdout, _, success) = run_fqd(&config_path, &["aggregate-questions"]);
    assert!(success);
    assert!(stdout.contains("skipped (fresh)"));
}

#[test]
fn test_status_reports_partitions() {
    let (_tmp, config_path) = setup_test_env();

    run_fqd(&config_path, &["init"]);
    run_fqd(&config_path, &["fetch"]);

    let (stdout, stderr, success) = run_fqd(&config_path, &["status"]);
    assert!(success, "status failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Messages:"));
    assert!(stdout.contains("Partitions:"));
    assert!(stdout.contains("2023-01"));
    assert!(stdout.contains("missing"), "no extraction ran yet");
}

#[test]
fn test_render_empty_store_writes_index() {
    let (tmp, config_path) = setup_test_env();

    run_fqd(&config_path, &["init"]);
    let (stdout, stderr, success) = run_fqd(&config_path, &["render"]);
    assert!(success, "render failed: stdout={}, stderr={}", stdout, stderr);

    let index = tmp
        .path()
        .join("docs")
        .join("greece")
        .join("faq")
        .join("_index.md");
    let content = fs::read_to_string(&index).unwrap();
    assert!(content.contains("# Greece chat — FAQ"));

    // Byte-identical on re-render.
    let before = fs::read(&index).unwrap();
    run_fqd(&config_path, &["render"]);
    assert_eq!(fs::read(&index).unwrap(), before);
}

#[test]
fn test_missing_config_fails_cleanly() {
    let tmp = TempDir::new().unwrap();
    let bogus = tmp.path().join("nope.toml");
    let (_, stderr, success) = run_fqd(&bogus, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

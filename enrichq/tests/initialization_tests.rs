//! Binary-level tests: configuration bootstrap, subcommands and one full run
//! against a mock lookup service.

mod common;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use wiremock::MockServer;

use common::wiremock_helpers::{lookup_template, mount_empty_lookups, mount_probe, mount_profile, probe_url};
use enrichq::handoff::read_handoff;

fn enrichq() -> assert_cmd::Command {
    cargo_bin_cmd!("enrichq")
}

/// Config whose every path lives under `dir`
fn write_config(dir: &Path, lookup_url: &str, probe_url: &str) -> std::path::PathBuf {
    let config = format!(
        r#"
[paths]
database = "{dir}/queue.db"
credential_cache = "{dir}/tokens.txt"
accounts = "{dir}/accounts.txt"
result_sink = "{dir}/results.txt"
handoff = "{dir}/pending.txt"
summary = "{dir}/summary.json"

[http]
user_agent = "enrichq-test"
request_timeout_secs = 5
lookup_url = "{lookup_url}"
probe_url = "{probe_url}"

[decoder]
name = "/name"
url = "/url"
location = "/location"
extra = ""

[dispatch]
workers = 2
max_attempts = 2
attempt_delay_min_ms = 0
attempt_delay_max_ms = 0
channel_capacity = 8
status_interval_secs = 1
requests_per_second = 0

[credentials]
min_valid = 1
wave_multiplier = 3
wave_pause_secs = 0
probe_concurrency = 4
provision_concurrency = 2

[provisioner]
command = ""
args = []
timeout_secs = 10

[retry]
max_rounds = 2
round_delay_secs = 0
min_credentials = 1
"#,
        dir = dir.display(),
        lookup_url = lookup_url,
        probe_url = probe_url,
    );
    let path = dir.join("enrichq.toml");
    fs::write(&path, config).unwrap();
    path
}

#[test]
fn test_help_describes_tool() {
    enrichq()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Resumable batch enrichment"))
        .stdout(predicate::str::contains("stats"))
        .stdout(predicate::str::contains("export"));
}

#[test]
fn test_init_writes_default_config_once() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("config").join("enrichq.toml");

    enrichq()
        .args(["init", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Created default configuration"));
    let written = fs::read_to_string(&config).unwrap();
    assert!(written.contains("[dispatch]"));
    assert!(written.contains("{identifier}"));

    enrichq()
        .args(["init", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    enrichq()
        .args(["init", "--force", "--config"])
        .arg(&config)
        .assert()
        .success();
}

#[test]
fn test_missing_config_fails_without_prompting() {
    let tmp = TempDir::new().unwrap();

    enrichq()
        .current_dir(tmp.path())
        .args(["--config", "nowhere.toml", "stats"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration file not found"));
}

#[test]
fn test_invalid_config_is_reported() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(tmp.path(), "https://api.example.com/v1/lookup", "https://api.example.com/v1/me");

    enrichq()
        .arg("--config")
        .arg(&config)
        .arg("stats")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_fresh_without_input_rejected() {
    enrichq()
        .arg("--fresh")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--fresh requires --input"));
}

#[test]
fn test_stats_on_empty_queue() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(
        tmp.path(),
        "https://api.example.com/v1/lookup?email={identifier}",
        "https://api.example.com/v1/me",
    );

    enrichq()
        .arg("--config")
        .arg(&config)
        .args(["stats", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"total\": 0"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_against_mock_service() {
    let server = MockServer::start().await;
    mount_probe(&server, "tok-good").await;
    mount_profile(
        &server,
        "ada@example.com",
        serde_json::json!({"name": "Ada Lovelace", "url": "https://people.example/ada", "location": "London"}),
    )
    .await;
    mount_empty_lookups(&server).await;

    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().to_path_buf();
    let config = write_config(&dir, &lookup_template(&server), &probe_url(&server));
    fs::write(dir.join("tokens.txt"), "tok-good\ntok-revoked\n").unwrap();
    fs::write(
        dir.join("ids.txt"),
        "ada@example.com\nAda@Example.com\ngrace@example.com\nnot an address\nlinus@example.com\n",
    )
    .unwrap();

    let run_dir = dir.clone();
    let run_config = config.clone();
    tokio::task::spawn_blocking(move || {
        enrichq()
            .arg("--config")
            .arg(&run_config)
            .arg("--input")
            .arg(run_dir.join("ids.txt"))
            .arg("run")
            .assert()
            .success();
    })
    .await
    .unwrap();

    let results = fs::read_to_string(dir.join("results.txt")).unwrap();
    assert_eq!(results.lines().count(), 1);
    assert!(results.starts_with("ada@example.com|Ada Lovelace|https://people.example/ada|London"));
    assert!(read_handoff(&dir.join("pending.txt")).unwrap().is_empty());

    let summary: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.join("summary.json")).unwrap()).unwrap();
    assert_eq!(summary["outcome"], "completed");
    assert_eq!(summary["stats"]["success"], 3);
    assert_eq!(summary["stats"]["has_result"], 1);

    let stats_config = config.clone();
    tokio::task::spawn_blocking(move || {
        enrichq()
            .arg("--config")
            .arg(&stats_config)
            .args(["stats", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"success\": 3"))
            .stdout(predicate::str::contains("\"no_result\": 2"));
    })
    .await
    .unwrap();
}

#[test]
fn test_export_writes_pending_identifiers() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(
        tmp.path(),
        "https://api.example.com/v1/lookup?email={identifier}",
        "https://api.example.com/v1/me",
    );
    let queue = enrichq::store::WorkQueue::new(tmp.path().join("queue.db"));
    queue
        .load(&["a@example.com".to_string(), "b@example.com".to_string()])
        .unwrap();
    queue.close().unwrap();

    let output = tmp.path().join("out").join("pending.txt");
    enrichq()
        .arg("--config")
        .arg(&config)
        .arg("export")
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("Exported 2 pending identifiers"));

    let mut exported = read_handoff(&output).unwrap();
    exported.sort();
    assert_eq!(exported, vec!["a@example.com", "b@example.com"]);
}

#[test]
fn test_unreadable_input_keeps_previous_queue() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(
        tmp.path(),
        "https://api.example.com/v1/lookup?email={identifier}",
        "https://api.example.com/v1/me",
    );
    let queue = enrichq::store::WorkQueue::new(tmp.path().join("queue.db"));
    queue
        .load(&["a@example.com".to_string(), "b@example.com".to_string()])
        .unwrap();
    queue
        .update_status("a@example.com", enrichq::store::IdentifierStatus::Success, true, false)
        .unwrap();
    queue.close().unwrap();

    enrichq()
        .arg("--config")
        .arg(&config)
        .arg("--input")
        .arg(tmp.path().join("typo.txt"))
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read identifier file"));

    let stats = enrichq::store::WorkQueue::new(tmp.path().join("queue.db")).stats().unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.success, 1);
    assert_eq!(stats.pending, 1);
}

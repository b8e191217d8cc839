//! Binary-level tests for the `routeguard` command

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

fn routeguard() -> Command {
    let mut cmd = Command::cargo_bin("routeguard").unwrap();
    cmd.env_remove("ROUTEGUARD_CONFIG").env("NO_COLOR", "1");
    cmd
}

fn write_config(dir: &Path, extra: &str) -> std::path::PathBuf {
    let rules = dir.join("rules");
    std::fs::create_dir_all(&rules).unwrap();
    std::fs::write(
        rules.join("10-routes.toml"),
        r#"
[[rules]]
id = "streaming"
kind = "domain"
patterns = ["netflix.com"]
action = "vpn"
priority = 10

[[rules]]
id = "lan"
kind = "cidr"
patterns = ["192.168.0.0/16"]
action = "direct"
"#,
    )
    .unwrap();

    let path = dir.join("routeguard.toml");
    std::fs::write(
        &path,
        format!("[routing]\nrulesets_dir = {:?}\n{extra}", rules.display().to_string()),
    )
    .unwrap();
    path
}

#[test]
fn test_version() {
    routeguard()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("routeguard"));
}

#[test]
fn test_rules_test_matches_domain() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "");

    routeguard()
        .args(["rules", "test", "www.netflix.com", "--json", "-c"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"rule_id\": \"streaming\""))
        .stdout(predicate::str::contains("\"action\": \"vpn\""));
}

#[test]
fn test_rules_list_in_file_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "");

    routeguard()
        .args(["rules", "list", "-c"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::is_match("(?s)streaming.*lan").unwrap())
        .stdout(predicate::str::contains("2 rule(s)"));
}

#[test]
fn test_config_validate_rejects_bad_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "default_route = \"block\"\n");

    routeguard()
        .args(["config", "validate"])
        .arg(&config)
        .assert()
        .failure();
}

#[test]
fn test_bypass_json_with_hex() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        "\n[dpi]\nmode = \"manual\"\nbypass_domains = [\"blocked.test\"]\n",
    );

    routeguard()
        .args(["bypass", "cdn.blocked.test", "--json", "--hex", "-c"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"state\": \"bypass_applied\""))
        .stdout(predicate::str::contains("segments_hex"));
}

#[test]
fn test_completions_without_shell_or_env_fails() {
    routeguard()
        .env_remove("SHELL")
        .arg("completions")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Cannot detect the shell"));
}

#[test]
fn test_completions_written_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("routeguard.bash");
    routeguard()
        .args(["completions", "bash", "--output"])
        .arg(&out)
        .assert()
        .success();
    let script = std::fs::read_to_string(&out).unwrap();
    assert!(script.contains("routeguard"));
}

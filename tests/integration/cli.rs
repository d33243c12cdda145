#[path = "common/mod.rs"]
mod common;

use std::{fs, path::Path};

use assert_cmd::Command;
use common::{
    kill_marked, read_lines, serve_health, snapshot, spawn_marked, unique_marker,
    unreachable_url, write_build, write_live_build,
};
use predicates::prelude::*;
use redeploy::{
    artifact::list_backups,
    lock::DeployLock,
    notify::{DeploymentEvent, EventStatus},
};
use tempfile::tempdir;

fn write_config(path: &Path, root: &Path, health_url: &str, pattern: &str) {
    fs::write(
        path,
        format!(
            r#"app_name: web
app_version: v2
source_dir: "{root}/build"
deploy_dir: "{root}/srv/web"
backup_dir: "{root}/backups"
health_check_url: "{health_url}"
process_pattern: "{pattern}"
notify:
  event_file: "{root}/event.json"
timings:
  grace_period: 500ms
  force_delay: 200ms
  settle_delay: 0s
  probe_interval: 50ms
  probe_attempts: 2
  probe_timeout: 1s
"#,
            root = root.display(),
        ),
    )
    .expect("failed to write config");
}

fn read_event(path: &Path) -> DeploymentEvent {
    let raw = fs::read_to_string(path).expect("event file written");
    serde_json::from_str(&raw).expect("event file is JSON")
}

fn redeploy() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("redeploy"))
}

#[test]
fn healthy_deploy_exits_zero_and_writes_success_event() {
    let temp = tempdir().expect("failed to create tempdir");
    let root = temp.path();
    let start_log = root.join("started.log");
    write_build(&root.join("build"), "v2", &start_log);
    let config = root.join("redeploy.yaml");
    write_config(
        &config,
        root,
        &serve_health("200 OK"),
        &unique_marker("cli-healthy"),
    );

    redeploy()
        .arg("deploy")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Status: SUCCESS"));

    assert_eq!(read_lines(&start_log), ["started v2"]);
    let event = read_event(&root.join("event.json"));
    assert_eq!(event.status, EventStatus::Success);
    assert_eq!(event.app_name, "web");
    assert_eq!(event.version, "v2");
    assert!(!event.rolled_back);
}

#[test]
fn unhealthy_deploy_rolls_back_and_exits_one() {
    let temp = tempdir().expect("failed to create tempdir");
    let root = temp.path();
    let start_log = root.join("started.log");
    let deploy_dir = root.join("srv/web");
    write_live_build(&deploy_dir, "v1", &start_log);
    write_build(&root.join("build"), "v2", &start_log);
    let before = snapshot(&deploy_dir);

    let marker = unique_marker("cli-rollback");
    spawn_marked(&marker);
    let config = root.join("redeploy.yaml");
    write_config(&config, root, &unreachable_url(), &marker);

    redeploy()
        .arg("deploy")
        .arg("-c")
        .arg(&config)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Status: FAILURE"));

    assert_eq!(snapshot(&deploy_dir), before);
    assert_eq!(read_lines(&start_log), ["started v2", "started v1"]);
    assert_eq!(list_backups(&root.join("backups"), "web").expect("list backups").len(), 1);

    let event = read_event(&root.join("event.json"));
    assert_eq!(event.status, EventStatus::Failure);
    assert!(event.rolled_back);
    kill_marked(&marker);
}

#[test]
fn locked_deploy_dir_fails_without_touching_anything() {
    let temp = tempdir().expect("failed to create tempdir");
    let root = temp.path();
    let start_log = root.join("started.log");
    write_build(&root.join("build"), "v2", &start_log);
    let config = root.join("redeploy.yaml");
    write_config(
        &config,
        root,
        &serve_health("200 OK"),
        &unique_marker("cli-locked"),
    );

    let _held = DeployLock::acquire(&root.join("srv/web")).expect("take lock");

    redeploy()
        .arg("deploy")
        .arg("--config")
        .arg(&config)
        .assert()
        .code(1);

    assert!(!root.join("srv/web").exists());
    assert!(read_lines(&start_log).is_empty());
    let event = read_event(&root.join("event.json"));
    assert_eq!(event.status, EventStatus::Failure);
    assert!(event.message.contains("locked"));
}

#[test]
fn environment_overrides_config_file() {
    let temp = tempdir().expect("failed to create tempdir");
    let root = temp.path();
    let start_log = root.join("started.log");
    write_build(&root.join("build"), "v2", &start_log);
    let config = root.join("redeploy.yaml");
    write_config(
        &config,
        root,
        &serve_health("200 OK"),
        &unique_marker("cli-env"),
    );

    redeploy()
        .arg("deploy")
        .arg("--config")
        .arg(&config)
        .env("REDEPLOY_APP_VERSION", "v2.5.0")
        .assert()
        .success();

    assert_eq!(read_event(&root.join("event.json")).version, "v2.5.0");
}

#[test]
fn missing_required_setting_is_reported() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = temp.path().join("redeploy.yaml");
    fs::write(&config, "app_name: web\n").expect("failed to write config");

    redeploy()
        .arg("deploy")
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("source_dir"));
}

#[test]
fn backups_lists_newest_first() {
    let temp = tempdir().expect("failed to create tempdir");
    let root = temp.path();
    for name in ["web_20240101_120000", "web_20240301_080000", "other_20240401_000000"] {
        fs::create_dir_all(root.join("backups").join(name)).expect("create backup");
    }
    let config = root.join("redeploy.yaml");
    write_config(&config, root, &unreachable_url(), "web");

    let output = redeploy()
        .arg("backups")
        .arg("--config")
        .arg(&config)
        .output()
        .expect("failed to run backups");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<_> = stdout.lines().collect();
    assert_eq!(lines.len(), 2, "{stdout}");
    assert!(lines[0].ends_with("web_20240301_080000"));
    assert!(lines[1].ends_with("web_20240101_120000"));
}

#[test]
fn status_reports_health() {
    let temp = tempdir().expect("failed to create tempdir");
    let root = temp.path();
    let marker = unique_marker("cli-status");
    let config = root.join("redeploy.yaml");

    write_config(&config, root, &serve_health("200 OK"), &marker);
    redeploy()
        .arg("status")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Stopped"))
        .stdout(predicate::str::contains("Healthy"));

    write_config(&config, root, &unreachable_url(), &marker);
    redeploy()
        .arg("status")
        .arg("--config")
        .arg(&config)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Unhealthy"));
}

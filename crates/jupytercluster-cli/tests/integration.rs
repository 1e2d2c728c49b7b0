#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn jc(dir: &TempDir, actor: &str) -> Command {
    let mut cmd = Command::cargo_bin("jupytercluster").unwrap();
    cmd.current_dir(dir.path())
        .env("JUPYTERCLUSTER_CONFIG", dir.path().join("jupytercluster.yaml"))
        .env("JUPYTERCLUSTER_ACTOR", actor)
        .env_remove("JUPYTERCLUSTER_ALLOW_NAMESPACE_CREATION");
    cmd
}

fn init_offline(dir: &TempDir) {
    jc(dir, "admin")
        .args(["config", "init", "--offline", "--admin", "admin"])
        .assert()
        .success();
}

fn create(dir: &TempDir, actor: &str, name: &str) {
    jc(dir, actor)
        .args(["hub", "create", name])
        .assert()
        .success();
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

#[test]
fn config_init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    jc(&dir, "admin")
        .args(["config", "init", "--offline"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote"));
    jc(&dir, "admin")
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("already exists"));

    let content = std::fs::read_to_string(dir.path().join("jupytercluster.yaml")).unwrap();
    assert!(content.contains("dry_run"), "{content}");
}

#[test]
fn config_validate_clean_offline_config() {
    let dir = TempDir::new().unwrap();
    init_offline(&dir);
    jc(&dir, "admin")
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid"));
}

#[test]
fn config_validate_rejects_zero_timeout() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("jupytercluster.yaml"),
        "admin_users: [admin]\ntimeouts:\n  start_secs: 0\nbackend:\n  driver: dry_run\n  cluster: in_memory\n",
    )
    .unwrap();
    jc(&dir, "admin")
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error] timeouts.start_secs"));
}

#[test]
fn missing_config_points_at_init() {
    let dir = TempDir::new().unwrap();
    jc(&dir, "admin")
        .args(["hub", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("config init"));
}

// ---------------------------------------------------------------------------
// hub lifecycle
// ---------------------------------------------------------------------------

#[test]
fn create_then_list() {
    let dir = TempDir::new().unwrap();
    init_offline(&dir);
    create(&dir, "alice", "team-a");

    jc(&dir, "alice")
        .args(["hub", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("team-a"))
        .stdout(predicate::str::contains("created"))
        .stdout(predicate::str::contains("jupyterhub-team-a"));
}

#[test]
fn start_stop_delete_round_trip() {
    let dir = TempDir::new().unwrap();
    init_offline(&dir);
    create(&dir, "alice", "demo");

    jc(&dir, "alice")
        .args(["hub", "start", "demo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("running"))
        .stdout(predicate::str::contains(
            "http://proxy-public.jupyterhub-demo.svc.cluster.local",
        ));

    jc(&dir, "alice")
        .args(["hub", "stop", "demo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stopped"));

    jc(&dir, "alice")
        .args(["hub", "delete", "demo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted hub 'demo'"));

    jc(&dir, "alice")
        .args(["hub", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No hubs."));
}

#[test]
fn operations_history_as_json() {
    let dir = TempDir::new().unwrap();
    init_offline(&dir);
    create(&dir, "alice", "hist");
    jc(&dir, "alice")
        .args(["hub", "start", "hist"])
        .assert()
        .success();

    let output = jc(&dir, "alice")
        .args(["--json", "hub", "operations", "hist"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let ops: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let ops = ops.as_array().unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0]["kind"], "install");
    assert_eq!(ops[0]["status"]["type"], "succeeded");
}

#[test]
fn get_as_json_reports_state() {
    let dir = TempDir::new().unwrap();
    init_offline(&dir);
    create(&dir, "alice", "shown");

    let output = jc(&dir, "alice")
        .args(["-j", "hub", "get", "shown"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let hub: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(hub["name"], "shown");
    assert_eq!(hub["owner"], "alice");
    assert_eq!(hub["state"], "created");
    assert_eq!(hub["namespace"], "jupyterhub-shown");
}

// ---------------------------------------------------------------------------
// validation and access
// ---------------------------------------------------------------------------

#[test]
fn create_strips_forbidden_overrides() {
    let dir = TempDir::new().unwrap();
    init_offline(&dir);
    std::fs::write(
        dir.path().join("values.yaml"),
        "namespace: kube-system\nsingleuser:\n  image:\n    name: jupyter/base\n",
    )
    .unwrap();

    jc(&dir, "alice")
        .args(["hub", "create", "safe", "--values", "values.yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stripped namespace"));

    let output = jc(&dir, "alice")
        .args(["--json", "hub", "get", "safe"])
        .output()
        .unwrap();
    let hub: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(hub["values"].get("namespace").is_none());
    assert_eq!(hub["values"]["singleuser"]["image"]["name"], "jupyter/base");
}

#[test]
fn create_reads_values_from_stdin() {
    let dir = TempDir::new().unwrap();
    init_offline(&dir);
    jc(&dir, "alice")
        .args(["hub", "create", "piped", "--values", "-"])
        .write_stdin("{\"hub\": {\"config\": {}}}")
        .assert()
        .success();
}

#[test]
fn invalid_name_is_rejected() {
    let dir = TempDir::new().unwrap();
    init_offline(&dir);
    jc(&dir, "alice")
        .args(["hub", "create", "Bad_Name"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid hub name"));
}

#[test]
fn duplicate_name_conflicts() {
    let dir = TempDir::new().unwrap();
    init_offline(&dir);
    create(&dir, "alice", "twice");
    jc(&dir, "bob")
        .args(["hub", "create", "twice"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn other_users_cannot_touch_a_hub() {
    let dir = TempDir::new().unwrap();
    init_offline(&dir);
    create(&dir, "alice", "private");

    jc(&dir, "bob")
        .args(["hub", "get", "private"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("forbidden"));
    jc(&dir, "bob")
        .args(["hub", "start", "private"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("forbidden"));
    jc(&dir, "bob")
        .args(["hub", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No hubs."));

    jc(&dir, "admin")
        .args(["hub", "get", "private"])
        .assert()
        .success()
        .stdout(predicate::str::contains("alice"));
}

#[test]
fn stopping_a_created_hub_conflicts() {
    let dir = TempDir::new().unwrap();
    init_offline(&dir);
    create(&dir, "alice", "idle");
    jc(&dir, "alice")
        .args(["hub", "stop", "idle"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("conflict"));
}

#[test]
fn unknown_hub_is_not_found() {
    let dir = TempDir::new().unwrap();
    init_offline(&dir);
    jc(&dir, "alice")
        .args(["hub", "get", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("hub 'ghost' not found"));
}

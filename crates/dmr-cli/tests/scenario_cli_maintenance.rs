use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

fn db_uri(dir: &tempfile::TempDir, name: &str) -> String {
    format!("sqlite3://na:na@{}/{name}", dir.path().display())
}

fn base_cmd(uri: &str) -> Command {
    let mut cmd = Command::cargo_bin("dmr").unwrap();
    cmd.args(["--ignore-environment", "--core-settings", "{}", "--database-uri", uri, "--database-info-queue"]);
    cmd
}

#[test]
fn schema_verify_creates_schema_on_a_fresh_database() {
    let dir = tempfile::tempdir().unwrap();
    let uri = db_uri(&dir, "verify.db");
    let mut cmd = base_cmd(&uri);
    cmd.args(["schema", "verify"]);
    cmd.assert().success().stdout(predicate::str::contains("schema_ok=true"));
}

#[test]
fn schema_recreate_without_yes_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let uri = db_uri(&dir, "recreate.db");
    let mut cmd = base_cmd(&uri);
    cmd.args(["schema", "recreate"]);
    cmd.assert().failure().stderr(predicate::str::contains("--yes"));
}

#[test]
fn schema_recreate_with_yes_succeeds_on_an_empty_mart() {
    let dir = tempfile::tempdir().unwrap();
    let uri = db_uri(&dir, "recreate-yes.db");
    let mut cmd = base_cmd(&uri);
    cmd.args(["schema", "recreate", "--yes"]);
    cmd.assert().success().stdout(predicate::str::contains("schema_recreated=true"));
}

#[test]
fn locks_reap_reports_zero_on_a_fresh_database() {
    let dir = tempfile::tempdir().unwrap();
    let uri = db_uri(&dir, "locks.db");
    let mut cmd = base_cmd(&uri);
    cmd.args(["locks", "reap", "--lease-seconds", "60"]);
    cmd.assert().success().stdout(predicate::str::contains("locks_reaped=0"));
}

#[test]
fn stats_reports_an_empty_mart_and_queue() {
    let dir = tempfile::tempdir().unwrap();
    let uri = db_uri(&dir, "stats.db");
    let mut cmd = base_cmd(&uri);
    cmd.args(["schema", "verify"]);
    cmd.assert().success();

    let mut stats_cmd = base_cmd(&uri);
    stats_cmd.arg("stats");
    stats_cmd
        .assert()
        .success()
        .stdout(predicate::str::contains("entities=0"))
        .stdout(predicate::str::contains("queue.ready=0"));
}

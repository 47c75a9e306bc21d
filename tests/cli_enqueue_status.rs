use std::fs;

use predicates::prelude::*;

fn write_workspace(temp: &tempfile::TempDir) -> anyhow::Result<(String, String)> {
    let data_dir = temp.path().join("data");
    let config_path = temp.path().join("config.yaml");
    fs::write(
        &config_path,
        format!("data_dir: {}\n", data_dir.display()),
    )?;

    let request_path = temp.path().join("request.yaml");
    fs::write(
        &request_path,
        "book_id: book-cli\n\
title: Zoo Day\n\
structure:\n\
  - kind: cover_front\n\
  - kind: illustration\n\
    repeats: 2\n\
    scene_summary: Jack at the gate\n\
context:\n\
  CHARACTER_NAME: Jack\n\
  THEME: a day at the zoo\n\
reference_image_url: https://example.com/jack.png\n\
narrative: single_theme\n\
idempotency_key: book-cli:1\n",
    )?;

    Ok((
        config_path.to_string_lossy().to_string(),
        request_path.to_string_lossy().to_string(),
    ))
}

#[test]
fn enqueue_then_status_reports_a_queued_book() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let (config_path, request_path) = write_workspace(&temp)?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("fableforge");
    cmd.args(["enqueue", "--request", &request_path, "--config", &config_path])
        .assert()
        .success()
        .stdout(predicate::str::contains("book_id: book-cli"))
        .stdout(predicate::str::contains("task_id: "));

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("fableforge");
    cmd.args(["status", "--book-id", "book-cli", "--config", &config_path])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"queued\""))
        .stdout(predicate::str::contains("Zoo Day"));

    // Same idempotency key again: rejected before a second task is created.
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("fableforge");
    cmd.args(["enqueue", "--request", &request_path, "--config", &config_path])
        .assert()
        .failure()
        .stderr(predicate::str::contains("duplicate enqueue"));

    Ok(())
}

#[test]
fn invalid_request_is_rejected_at_enqueue() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let (config_path, request_path) = write_workspace(&temp)?;
    let raw = fs::read_to_string(&request_path)?;
    fs::write(
        &request_path,
        raw.replace("https://example.com/jack.png", "\"\""),
    )?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("fableforge");
    cmd.args(["enqueue", "--request", &request_path, "--config", &config_path])
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing character reference image"));

    Ok(())
}

#[test]
fn status_for_unknown_book_fails() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let (config_path, _request_path) = write_workspace(&temp)?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("fableforge");
    cmd.args(["status", "--book-id", "nope", "--config", &config_path])
        .assert()
        .failure()
        .stderr(predicate::str::contains("book not found"));

    Ok(())
}

#[test]
fn rust_log_debug_emits_debug_line_to_stderr() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let (config_path, request_path) = write_workspace(&temp)?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("fableforge");
    cmd.env("RUST_LOG", "debug")
        .args(["enqueue", "--request", &request_path, "--config", &config_path])
        .assert()
        .success()
        .stderr(predicate::str::contains("parsed cli"));

    Ok(())
}

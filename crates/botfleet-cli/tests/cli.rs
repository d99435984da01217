use assert_cmd::Command;
use predicates::str::{contains, starts_with};
use tempfile::TempDir;

fn botfleet(dir: &TempDir) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("botfleet"));
    cmd.env("BOTFLEET_DIR", dir.path());
    cmd
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("botfleet"));
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(contains("BotFleet"));
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("botfleet"));
    cmd.arg("--version").assert().success();
}

#[test]
fn test_cli_completions() {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("botfleet"));
    cmd.args(["completions", "bash"])
        .assert()
        .success()
        .stdout(starts_with("_botfleet"));
}

#[test]
fn test_bot_lifecycle_offline() {
    let dir = TempDir::new().unwrap();

    botfleet(&dir)
        .args([
            "bot",
            "add",
            "support-bot",
            "--token",
            "123456:AAE-test-credential",
            "--skip-verify",
        ])
        .assert()
        .success()
        .stdout(contains("Bot registered: support-bot"))
        .stdout(contains("Webhook path:"));

    botfleet(&dir)
        .args(["bot", "list"])
        .assert()
        .success()
        .stdout(contains("support-bot"))
        .stdout(contains("disabled"));

    botfleet(&dir)
        .args(["bot", "start", "support-bot"])
        .assert()
        .success()
        .stdout(contains("Polling started for support-bot"));

    botfleet(&dir)
        .args(["bot", "list", "--format", "json"])
        .assert()
        .success()
        .stdout(contains("\"mode\": \"polling\""));

    botfleet(&dir)
        .args(["bot", "stop", "support-bot"])
        .assert()
        .success()
        .stdout(contains("Delivery stopped for support-bot"));

    botfleet(&dir)
        .args(["bot", "remove", "support-bot"])
        .assert()
        .success()
        .stdout(contains("Bot removed: support-bot"));

    botfleet(&dir)
        .args(["bot", "list"])
        .assert()
        .success()
        .stdout(contains("No bots registered."));
}

#[test]
fn test_bot_add_rejects_duplicate_id() {
    let dir = TempDir::new().unwrap();

    botfleet(&dir)
        .args([
            "bot",
            "add",
            "support-bot",
            "--token",
            "123456:AAE-test-credential",
            "--skip-verify",
        ])
        .assert()
        .success();

    botfleet(&dir)
        .args([
            "bot",
            "add",
            "support-bot",
            "--token",
            "456:BBF-other-credential",
            "--skip-verify",
        ])
        .assert()
        .failure()
        .stderr(contains("already exists"));
}

#[test]
fn test_bot_add_rejects_invalid_id() {
    let dir = TempDir::new().unwrap();

    botfleet(&dir)
        .args([
            "bot",
            "add",
            "bad id!",
            "--token",
            "123456:AAE-test-credential",
            "--skip-verify",
        ])
        .assert()
        .failure()
        .stderr(contains("invalid bot id"));
}

#[test]
fn test_webhook_enable_requires_public_base_url() {
    let dir = TempDir::new().unwrap();

    botfleet(&dir)
        .args([
            "bot",
            "add",
            "support-bot",
            "--token",
            "123456:AAE-test-credential",
            "--skip-verify",
        ])
        .assert()
        .success();

    botfleet(&dir)
        .args(["webhook", "enable", "support-bot"])
        .assert()
        .failure()
        .stderr(contains("public_base_url"));
}

#[test]
fn test_webhook_disable_without_webhook_is_noop() {
    let dir = TempDir::new().unwrap();

    botfleet(&dir)
        .args([
            "bot",
            "add",
            "support-bot",
            "--token",
            "123456:AAE-test-credential",
            "--skip-verify",
        ])
        .assert()
        .success();

    botfleet(&dir)
        .args(["webhook", "disable", "support-bot"])
        .assert()
        .success()
        .stdout(contains("No webhook to disable"));
}

#[test]
fn test_health_empty_fleet() {
    let dir = TempDir::new().unwrap();

    botfleet(&dir)
        .args(["health"])
        .assert()
        .success()
        .stdout(contains("No bots registered."));
}

#[test]
fn test_health_reports_bot_without_snapshot() {
    let dir = TempDir::new().unwrap();

    botfleet(&dir)
        .args([
            "bot",
            "add",
            "support-bot",
            "--token",
            "123456:AAE-test-credential",
            "--skip-verify",
        ])
        .assert()
        .success();

    botfleet(&dir)
        .args(["health"])
        .assert()
        .success()
        .stdout(contains("support-bot"))
        .stdout(contains("no snapshot yet"));

    botfleet(&dir)
        .args(["health", "support-bot"])
        .assert()
        .success()
        .stdout(contains("No health snapshot recorded yet."));
}

#[test]
fn test_unknown_bot_is_an_error() {
    let dir = TempDir::new().unwrap();

    botfleet(&dir)
        .args(["health", "ghost-bot"])
        .assert()
        .failure()
        .stderr(contains("unknown bot"));
}

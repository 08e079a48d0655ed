use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const ENV_OVERRIDES: &[&str] = &[
    "AZURE_TENANT_ID",
    "AZURE_CLIENT_ID",
    "AZURE_CLIENT_SECRET",
    "AZURE_SUBSCRIPTION_ID",
    "AZURE_CLI_MCP_BINARY",
    "COMMAND_TIMEOUT",
    "AUTH_TIMEOUT",
    "LOG_LEVEL",
    "LOG_FILE",
    "RUST_LOG",
];

/// Command with a private config file and no inherited overrides
fn cli(dir: &TempDir, config: &str) -> Command {
    let path = dir.path().join("config.toml");
    fs::write(&path, config).unwrap();

    let mut cmd = Command::cargo_bin("azure-cli-mcp").unwrap();
    for key in ENV_OVERRIDES {
        cmd.env_remove(key);
    }
    cmd.arg("--config").arg(path);
    cmd
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("azure-cli-mcp").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("azure-cli-mcp 0.1.0"));
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("azure-cli-mcp").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("MCP server exposing the Azure CLI"));
}

#[test]
fn test_cli_exec_missing_command() {
    let dir = TempDir::new().unwrap();
    cli(&dir, "")
        .arg("exec")
        .assert()
        .failure()
        .stderr(predicate::str::contains("required arguments were not provided"));
}

#[test]
fn test_check_config_hides_secret() {
    let dir = TempDir::new().unwrap();
    cli(&dir, "")
        .env("AZURE_TENANT_ID", "tenant")
        .env("AZURE_CLIENT_ID", "app")
        .env("AZURE_CLIENT_SECRET", "very-secret-value")
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("client_id = \"app\""))
        .stdout(predicate::str::contains("***"))
        .stdout(predicate::str::contains("very-secret-value").not());
}

#[test]
fn test_invalid_config_fails() {
    let dir = TempDir::new().unwrap();
    cli(&dir, "[execution]\ncommand_timeout_secs = 0\n")
        .arg("check-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load configuration"));
}

#[test]
fn test_exec_rejects_injection() {
    let dir = TempDir::new().unwrap();
    cli(&dir, "")
        .args(["exec", "group", "list;", "rm", "-rf", "/"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("validation_error"));
}

#[cfg(unix)]
#[test]
fn test_exec_runs_unauthenticated_command() {
    let dir = TempDir::new().unwrap();
    let config = r#"
[cli]
binary = "echo"

[policy]
unauthenticated_commands = ["hello"]
"#;
    cli(&dir, config)
        .args(["exec", "hello", "world"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"success\""))
        .stdout(predicate::str::contains("hello world"));
}

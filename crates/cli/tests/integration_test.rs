use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn vmstress() -> Command {
    Command::cargo_bin("vmstress").unwrap()
}

fn write_config(dir: &TempDir) {
    let config = r#"[run]
duration_secs = 1
poll_interval_secs = 1
seed = 7

[[credentials]]
name = "alice"
key = "secret"
tenant = "project-a"
"#;
    fs::write(dir.path().join(".vmstress.toml"), config).unwrap();
}

#[test]
fn test_full_integration() {
    let temp_dir = TempDir::new().unwrap();
    write_config(&temp_dir);

    // ========================================================================
    // Help & Version
    // ========================================================================
    println!("Testing help...");
    vmstress()
        .current_dir(temp_dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("randomized lifecycle stress driver"));

    vmstress()
        .current_dir(temp_dir.path())
        .arg("--version")
        .assert()
        .success();

    // ========================================================================
    // Run against the simulation
    // ========================================================================
    // Exit 0 an der Deadline: die Simulation bleibt protokollkonform.
    println!("Testing run --simulate...");
    vmstress()
        .current_dir(temp_dir.path())
        .args(["run", "--simulate"])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success();

    // ========================================================================
    // Refusal without a compute client
    // ========================================================================
    println!("Testing run without --simulate...");
    vmstress()
        .current_dir(temp_dir.path())
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no compute client configured"));

    // ========================================================================
    // Wipe
    // ========================================================================
    // Die Simulation startet leer, der Sweep meldet 0 Löschungen.
    println!("Testing wipe --simulate...");
    vmstress()
        .current_dir(temp_dir.path())
        .args(["wipe", "--simulate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("alice: deleted 0 server(s)"));
}

#[test]
fn test_missing_config_fails() {
    let temp_dir = TempDir::new().unwrap();

    vmstress()
        .current_dir(temp_dir.path())
        .args(["run", "--simulate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn test_explicit_config_path() {
    let temp_dir = TempDir::new().unwrap();
    write_config(&temp_dir);
    let config_path = temp_dir.path().join(".vmstress.toml");

    // --config erlaubt den Lauf außerhalb des Config-Verzeichnisses.
    vmstress()
        .args([
            "run",
            "--simulate",
            "--duration",
            "1",
            "--config",
            config_path.to_str().unwrap(),
        ])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success();
}

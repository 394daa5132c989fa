use assert_cmd::Command;
use predicates::str::contains;

#[test]
fn help_lists_subcommands() {
    Command::cargo_bin("plugtimer").unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("serve"))
        .stdout(contains("devices"));
}

#[test]
fn devices_without_account_fails_cleanly() {
    let dir = std::env::temp_dir().join(format!("plugtimer-smoke-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let cfg = dir.join("config.toml");
    std::fs::write(&cfg, "log_level = \"warn\"\n").unwrap();

    Command::cargo_bin("plugtimer").unwrap()
        .env_remove("PLUGTIMER_EMAIL")
        .env_remove("PLUGTIMER_PASSWORD")
        .env_remove("MEROSS_EMAIL")
        .env_remove("MEROSS_PASSWORD")
        .args(["--config", cfg.to_str().unwrap(), "devices"])
        .assert()
        .failure()
        .stderr(contains("PLUGTIMER_EMAIL"));

    let _ = std::fs::remove_dir_all(dir);
}

// Command-line behaviour with keys and passwords piped on stdin

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// A temp dir with a cheap key derivation config and an initialized store.
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[kdf]\nmemory_kib = 1024\niterations = 1\nparallelism = 1\n",
        )
        .unwrap();
        let ws = Self { dir };
        ws.cmd().arg("init").assert().success();
        ws
    }

    fn store(&self) -> PathBuf {
        self.dir.path().join("keychain.json")
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn cmd(&self) -> Command {
        self.cmd_for(&self.store())
    }

    fn cmd_for(&self, store: &Path) -> Command {
        let mut cmd = Command::cargo_bin("keychain").unwrap();
        cmd.env_remove("KEYCHAIN_STORE")
            .env_remove("KEYCHAIN_CONFIG")
            .env_remove("RUST_LOG")
            .env("NO_COLOR", "1")
            .arg("--config")
            .arg(self.dir.path().join("config.toml"))
            .arg("--store")
            .arg(store);
        cmd
    }

    fn add_chain(&self, name: &str, key: &str) {
        self.cmd()
            .args(["chain", "new", name])
            .write_stdin(format!("{key}\n"))
            .assert()
            .success();
    }

    fn add_link(&self, chain: &str, name: &str, key: &str, password: &str) {
        self.cmd()
            .args(["link", "add", chain, name])
            .write_stdin(format!("{key}\n{password}\n"))
            .assert()
            .success();
    }
}

#[test]
fn test_help() {
    Command::cargo_bin("keychain")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("chain"))
        .stdout(predicate::str::contains("sync"));
}

#[test]
fn test_init_refuses_to_overwrite() {
    let ws = Workspace::new();
    assert!(ws.store().exists());

    ws.cmd()
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    ws.cmd().args(["init", "--force"]).assert().success();
}

#[test]
fn test_chain_and_link_lifecycle() {
    let ws = Workspace::new();
    ws.add_chain("Work", "work-key");
    ws.add_link("Work", "Email", "work-key", "hunter2");

    ws.cmd()
        .args(["link", "show", "Work", "Email"])
        .write_stdin("work-key\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("hunter2"));

    ws.cmd()
        .args(["chain", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Work (1 links)"));

    ws.cmd()
        .args(["link", "list", "Work"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Email"));

    ws.cmd()
        .args(["link", "edit", "Work", "Email", "--name", "Mail", "--password"])
        .write_stdin("work-key\nnew-secret\n")
        .assert()
        .success();

    ws.cmd()
        .args(["-o", "json", "link", "show", "Work", "Mail"])
        .write_stdin("work-key\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"password\": \"new-secret\""));

    ws.cmd()
        .args(["link", "remove", "Work", "Mail"])
        .assert()
        .success();

    ws.cmd()
        .args(["link", "show", "Work", "Mail"])
        .write_stdin("work-key\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_wrong_key_is_rejected() {
    let ws = Workspace::new();
    ws.add_chain("Work", "work-key");

    ws.cmd()
        .args(["link", "add", "Work", "Email"])
        .write_stdin("wrong\nhunter2\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid key"));
}

#[test]
fn test_rekey_then_old_key_fails() {
    let ws = Workspace::new();
    ws.add_chain("Work", "old");
    ws.add_link("Work", "Email", "old", "hunter2");

    ws.cmd()
        .args(["chain", "rekey", "Work"])
        .write_stdin("old\nnew\n")
        .assert()
        .success();

    ws.cmd()
        .args(["link", "show", "Work", "Email"])
        .write_stdin("old\n")
        .assert()
        .failure();

    ws.cmd()
        .args(["link", "show", "Work", "Email"])
        .write_stdin("new\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("hunter2"));
}

#[test]
fn test_chain_remove_requires_confirmation() {
    let ws = Workspace::new();
    ws.add_chain("Old", "key");

    // Without a terminal the confirmation falls back to "no"
    ws.cmd()
        .args(["chain", "remove", "Old"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cancelled"));

    ws.cmd()
        .args(["chain", "remove", "Old", "--yes"])
        .assert()
        .success();

    ws.cmd()
        .args(["chain", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("(no chains)"));
}

#[test]
fn test_search() {
    let ws = Workspace::new();
    ws.add_chain("Work", "key");
    ws.add_link("Work", "GitHub", "key", "a");
    ws.add_link("Work", "Gitlab", "key", "b");
    ws.add_link("Work", "Bank", "key", "c");

    ws.cmd()
        .args(["search", "git"])
        .assert()
        .success()
        .stdout(predicate::str::contains("GitHub"))
        .stdout(predicate::str::contains("Gitlab"))
        .stdout(predicate::str::contains("Bank").not());

    ws.cmd()
        .args(["search", "git", "--case-sensitive"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No matches"));
}

#[test]
fn test_export_import_between_stores() {
    let ws = Workspace::new();
    ws.add_chain("Work", "key");
    ws.add_link("Work", "Email", "key", "hunter2");

    let export = ws.path("work.csv");
    ws.cmd()
        .arg("export")
        .arg(&export)
        .arg("--plain")
        .write_stdin("key\n")
        .assert()
        .success()
        .stderr(predicate::str::contains("plain text"));
    assert!(std::fs::read_to_string(&export).unwrap().contains("hunter2"));

    let other_store = ws.path("other.json");
    let other = |args: &[&str]| {
        let mut cmd = ws.cmd_for(&other_store);
        cmd.args(args);
        cmd
    };
    other(&["init"]).assert().success();
    other(&["-o", "json", "import"])
        .arg(&export)
        .write_stdin("fresh\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"links_created\": 1"));

    other(&["link", "show", "Work", "Email"])
        .write_stdin("fresh\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("hunter2"));
}

#[test]
fn test_missing_store() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("keychain")
        .unwrap()
        .env_remove("KEYCHAIN_CONFIG")
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .arg("--store")
        .arg(dir.path().join("absent.json"))
        .args(["chain", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
    xdg_cache: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");
        let xdg_cache = base.join("xdg-cache");

        for dir in [&home, &xdg_data, &xdg_config, &xdg_state, &xdg_cache] {
            fs::create_dir_all(dir).expect("failed to create test directory");
        }

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
            xdg_cache,
        }
    }

    fn db_path(&self, project_id: &str) -> PathBuf {
        self.xdg_data.join("keen").join(format!("{project_id}.db"))
    }

    fn write_config(&self, contents: &str) {
        let dir = self.xdg_config.join("keen");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(dir.join("config.toml"), contents).expect("failed to write config");
    }

    fn write_legacy_event(&self, project_id: &str, collection: &str, name: &str, body: &str) {
        let dir = self
            .xdg_cache
            .join("keen")
            .join(project_id)
            .join(collection);
        fs::create_dir_all(&dir).expect("failed to create legacy dir");
        fs::write(dir.join(name), body).expect("failed to write legacy event");
    }
}

fn run_keen(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("keen"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env("XDG_CACHE_HOME", &env.xdg_cache)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute keen: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    assert!(
        output.status.success(),
        "keen {:?} failed with status {:?}\nstdout:\n{}\nstderr:\n{}",
        args,
        output.status.code(),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn run_ok(env: &CliTestEnv, args: &[&str]) -> String {
    let output = run_keen(env, args);
    assert_success(args, &output);
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn status_on_fresh_project() {
    let env = CliTestEnv::new();

    let stdout = run_ok(&env, &["--project", "demo", "status"]);
    assert!(stdout.contains("Project:        demo"), "{stdout}");
    assert!(stdout.contains("Queued events:  0"), "{stdout}");
    assert!(stdout.contains("no (missing write key)"), "{stdout}");
    assert!(env.db_path("demo").exists());
}

#[test]
fn add_then_clear() {
    let env = CliTestEnv::new();

    let stdout = run_ok(
        &env,
        &["--project", "demo", "add", "purchases", r#"{"item": "widget"}"#],
    );
    assert!(stdout.contains("Queued event"), "{stdout}");
    run_ok(
        &env,
        &[
            "--project",
            "demo",
            "add",
            "purchases",
            "{}",
            "--timestamp",
            "2024-01-01T00:00:00Z",
        ],
    );

    let stdout = run_ok(&env, &["--project", "demo", "status"]);
    assert!(stdout.contains("Queued events:  2"), "{stdout}");

    let stdout = run_ok(&env, &["--project", "demo", "clear"]);
    assert!(stdout.contains("Deleted 2 event(s)"), "{stdout}");

    let stdout = run_ok(&env, &["--project", "demo", "status"]);
    assert!(stdout.contains("Queued events:  0"), "{stdout}");
}

#[test]
fn invalid_events_are_rejected() {
    let env = CliTestEnv::new();

    let args = ["--project", "demo", "add", "$purchases", "{}"];
    let output = run_keen(&env, &args);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("validation error"));

    let args = ["--project", "demo", "add", "purchases", "[1, 2]"];
    let output = run_keen(&env, &args);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("must be a JSON object"));

    let stdout = run_ok(&env, &["--project", "demo", "status"]);
    assert!(stdout.contains("Queued events:  0"), "{stdout}");
}

#[test]
fn missing_project_fails() {
    let env = CliTestEnv::new();

    let output = run_keen(&env, &["status"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("project.project_id is required"));
}

#[test]
fn config_file_supplies_project() {
    let env = CliTestEnv::new();
    env.write_config(
        r#"
[project]
project_id = "from-config"
write_key = "wk"

[storage]
max_events_per_collection = 2
events_to_forget = 1
"#,
    );

    for n in 0..3 {
        run_ok(&env, &["add", "clicks", &format!(r#"{{"n": {n}}}"#)]);
    }

    let stdout = run_ok(&env, &["status"]);
    assert!(stdout.contains("Project:        from-config"), "{stdout}");
    assert!(stdout.contains("Upload ready:   yes"), "{stdout}");
    assert!(stdout.contains("Queued events:  2"), "{stdout}");
}

#[test]
fn upload_with_empty_queue_is_a_no_op() {
    let env = CliTestEnv::new();

    let stdout = run_ok(
        &env,
        &["--project", "demo", "--write-key", "wk", "upload"],
    );
    assert!(stdout.contains("No events to upload"), "{stdout}");
}

#[test]
fn legacy_store_is_imported_on_open() {
    let env = CliTestEnv::new();
    env.write_legacy_event("demo", "clicks", "0001", r#"{"n": 1}"#);
    env.write_legacy_event("demo", "clicks", "0002", r#"{"n": 2}"#);

    let stdout = run_ok(&env, &["--project", "demo", "status"]);
    assert!(stdout.contains("Queued events:  2"), "{stdout}");
    assert!(stdout.contains("Legacy import:  done"), "{stdout}");
    assert!(!env.xdg_cache.join("keen").join("demo").exists());

    // The import is one-time, even when old files show up again
    env.write_legacy_event("demo", "clicks", "0003", r#"{"n": 3}"#);
    let stdout = run_ok(&env, &["--project", "demo", "import-legacy"]);
    assert!(stdout.contains("Legacy store already imported"), "{stdout}");
    let stdout = run_ok(&env, &["--project", "demo", "status"]);
    assert!(stdout.contains("Queued events:  2"), "{stdout}");
}

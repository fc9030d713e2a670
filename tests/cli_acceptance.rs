/// Acceptance tests for the geoflow command line
///
/// Operators are plain shell commands (`cat`, `echo`) declared in a
/// per-test configuration, so no climate tooling is needed.
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const SCALED: &str = "scale(ds(variable='tas',period='1980'),factor=3)";

/// Helper to get the geoflow binary path with unique cache dir
fn geoflow_with_cache(cache_dir: &Path) -> Command {
    let mut cmd = Command::new(std::env!("CARGO_BIN_EXE_geoflow"));
    cmd.env("GEOFLOW_CACHE_DIR", cache_dir);
    cmd.env("GEOFLOW_LOG_FORMAT", "compact");
    cmd
}

/// Helper to set up a test workspace
struct TestWorkspace {
    temp_dir: TempDir,
    cache_dir: TempDir,
    config_path: PathBuf,
}

impl TestWorkspace {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();

        let data_dir = temp_dir.path().join("data");
        fs::create_dir_all(&data_dir).unwrap();
        fs::write(data_dir.join("tas_1980-1989.nc"), "tas data\n").unwrap();
        fs::write(data_dir.join("tas_1990-1999.nc"), "later tas data\n").unwrap();

        let config_path = temp_dir.path().join("geoflow.toml");
        fs::write(
            &config_path,
            format!(
                r#"
[cache]
stamping = "disabled"
concat_command = "cat ${{ins}} > ${{out}}"

[[operators]]
name = "select"
command = "cat ${{ins}} > ${{out}}"
timewise = true

[[operators]]
name = "scale"
command = "cat ${{in}} > ${{out}}; echo ${{factor}} >> ${{out}}"
timewise = true

[[operators]]
name = "broken"
command = "echo failing >&2; exit 3; touch ${{out}}"

[[datasets]]
pattern = "{}/${{variable}}_*.nc"

[macros]
tripled = "scale(ARG,factor=3)"
"#,
                data_dir.display()
            ),
        )
        .unwrap();

        Self {
            temp_dir,
            cache_dir,
            config_path,
        }
    }

    fn geoflow(&self) -> Command {
        let mut cmd = geoflow_with_cache(self.cache_dir.path());
        cmd.arg("--config").arg(&self.config_path);
        cmd.current_dir(self.temp_dir.path());
        cmd
    }

    fn eval(&self, expression: &str) -> String {
        let output = self
            .geoflow()
            .args(["eval", expression])
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "eval failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8(output.stdout).unwrap().trim().to_string()
    }
}

#[test]
fn test_crs_is_canonical() {
    let workspace = TestWorkspace::new();

    workspace
        .geoflow()
        .args(["crs", "scale( ds(variable='tas', model='X', period='1980') , factor=3 )"])
        .assert()
        .success()
        .stdout("scale(ds(model='X',variable='tas',period='1980'),factor=3)\n");
}

#[test]
fn test_crs_expands_macros_and_hashes() {
    let workspace = TestWorkspace::new();

    workspace
        .geoflow()
        .args(["crs", "--hash", "tripled(ds(variable='tas',period='1980'))"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with(format!("{}\n", SCALED)))
        .stdout(predicate::str::is_match("\n[0-9a-f]{56}\n$").unwrap());
}

#[test]
fn test_period_commands() {
    let workspace = TestWorkspace::new();

    workspace
        .geoflow()
        .args(["period", "parse", "1980-1985"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Period: 1980-1985"))
        .stdout(predicate::str::contains("First: 1980-01-01"));

    workspace
        .geoflow()
        .args(["period", "parse", "fx"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Fixed (time-independent)"));

    workspace
        .geoflow()
        .args(["period", "merge", "1983", "1980", "1981"])
        .assert()
        .success()
        .stdout("1980-1981\n1983\n");

    workspace
        .geoflow()
        .args(["period", "parse", "1985-1980"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid period"));
}

#[test]
fn test_eval_computes_then_reuses() {
    let workspace = TestWorkspace::new();

    let first = workspace.eval(SCALED);
    let path = PathBuf::from(&first);
    let root = fs::canonicalize(workspace.cache_dir.path()).unwrap();
    assert!(path.starts_with(&root), "{} not below {}", first, root.display());
    assert_eq!(fs::read_to_string(&path).unwrap(), "tas data\n3\n");

    let second = workspace.eval(SCALED);
    assert_eq!(first, second);

    workspace
        .geoflow()
        .args(["cache", "count"])
        .assert()
        .success()
        .stdout("2\n");
}

#[test]
fn test_eval_json_output() {
    let workspace = TestWorkspace::new();

    let output = workspace
        .geoflow()
        .args(["eval", "--json", SCALED])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["crs"], SCALED);
    assert!(json["result"].as_str().unwrap().ends_with(".nc"));
}

#[test]
fn test_eval_errors() {
    let workspace = TestWorkspace::new();

    workspace
        .geoflow()
        .args(["eval", "nope(ds(variable='tas',period='1980'))"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown operator 'nope'"));

    workspace
        .geoflow()
        .args(["eval", "scale(ds(variable='zg',period='1980'),factor=3)"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No data found"));

    workspace
        .geoflow()
        .args(["eval", "broken()"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("exit code 3"))
        .stderr(predicate::str::contains("failing"));
}

#[test]
fn test_cache_list_drop_and_protect() {
    let workspace = TestWorkspace::new();
    workspace.eval(SCALED);

    workspace
        .geoflow()
        .args(["cache", "list", "--pattern", "scale("])
        .assert()
        .success()
        .stdout(predicate::str::contains(SCALED));

    workspace
        .geoflow()
        .args(["cache", "protect", SCALED])
        .assert()
        .success()
        .stdout(predicate::str::contains("Protected:"));

    workspace
        .geoflow()
        .args(["cache", "list", "--pattern", "scale("])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("P "));

    workspace
        .geoflow()
        .args(["cache", "drop", SCALED])
        .assert()
        .failure()
        .stderr(predicate::str::contains("write-protected"));

    workspace
        .geoflow()
        .args(["cache", "drop", "--force", SCALED])
        .assert()
        .success()
        .stdout(predicate::str::contains("Dropped:"));

    workspace
        .geoflow()
        .args(["cache", "drop", SCALED])
        .assert()
        .success()
        .stdout(predicate::str::contains("Not cached:"));

    workspace
        .geoflow()
        .args(["cache", "count"])
        .assert()
        .success()
        .stdout("1\n");
}

#[test]
fn test_cache_clean_needs_filter_or_all() {
    let workspace = TestWorkspace::new();
    workspace.eval(SCALED);

    workspace
        .geoflow()
        .args(["cache", "clean"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--all"));

    workspace
        .geoflow()
        .args(["cache", "clean", "--pattern", "select("])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 entries removed."));

    workspace
        .geoflow()
        .args(["cache", "clean", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 entries removed."));
}

#[test]
fn test_cache_sync_and_rebuild_report_counts() {
    let workspace = TestWorkspace::new();
    workspace.eval(SCALED);

    workspace
        .geoflow()
        .args(["cache", "sync"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Index saved (2 entries)."));

    workspace
        .geoflow()
        .args(["cache", "du"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Entries: 2"))
        .stdout(predicate::str::contains("Total size:"));

    // "tas data\n3\n"
    workspace
        .geoflow()
        .args(["cache", "du", "--pattern", "scale("])
        .assert()
        .success()
        .stdout(predicate::str::contains("Entries: 1"))
        .stdout(predicate::str::contains("(11 bytes)"));
}

#[test]
fn test_config_validate() {
    let workspace = TestWorkspace::new();

    workspace
        .geoflow()
        .args(["config", "validate"])
        .arg(&workspace.config_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration file is valid"))
        .stdout(predicate::str::contains("Stamping: disabled"));

    let invalid = workspace.temp_dir.path().join("invalid.toml");
    fs::write(&invalid, "[cache]\nhash_length = 0\n").unwrap();
    workspace
        .geoflow()
        .args(["config", "validate"])
        .arg(&invalid)
        .assert()
        .failure();
}

#[test]
fn test_config_is_discovered_from_working_directory() {
    let workspace = TestWorkspace::new();
    let nested = workspace.temp_dir.path().join("analysis/notebooks");
    fs::create_dir_all(&nested).unwrap();

    geoflow_with_cache(workspace.cache_dir.path())
        .current_dir(&nested)
        .env("HOME", workspace.temp_dir.path())
        .env_remove("GEOFLOW_CONFIG")
        .args(["crs", "tripled(ds(variable='tas',period='1980'))"])
        .assert()
        .success()
        .stdout(format!("{}\n", SCALED));
}

use assert_cmd::Command;
use predicates::prelude::*;

fn write_config(dir: &std::path::Path, step_duration_s: f64) -> std::path::PathBuf {
    let path = dir.join("rheo_config.toml");
    std::fs::write(
        &path,
        format!(
            r#"
[session]
targets = [3.0]
start_gap_mm = 10.0
sample_volume_ml = 0.5
sample_id = "cli-test"
step_duration_s = {step_duration_s}

[motion]
approach_velocity_mms = -2.0

[safety]
min_position_mm = 0.2
"#
        ),
    )
    .expect("write config");
    path
}

#[test]
fn help_names_the_instrument() {
    Command::cargo_bin("rheo_cli")
        .expect("binary")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Squeeze-flow rheometer"));
}

#[test]
fn self_check_passes() {
    Command::cargo_bin("rheo_cli")
        .expect("binary")
        .arg("self-check")
        .assert()
        .success()
        .stdout(predicate::str::contains("self-check passed"));
}

#[test]
fn self_check_json_output() {
    let out = Command::cargo_bin("rheo_cli")
        .expect("binary")
        .args(["--json", "self-check"])
        .assert()
        .success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");
    let v: serde_json::Value = serde_json::from_str(stdout.trim()).expect("json line");
    assert_eq!(v["self_check"], "ok");
}

#[test]
fn run_rejects_non_monotonic_targets() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = write_config(dir.path(), 0.3);
    Command::cargo_bin("rheo_cli")
        .expect("binary")
        .args(["--config", cfg.to_str().expect("path")])
        .args(["run", "--simulate", "--targets", "5,3"])
        .current_dir(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("strictly increasing"));
}

#[test]
fn run_without_hardware_requires_simulate_flag() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = write_config(dir.path(), 0.3);
    Command::cargo_bin("rheo_cli")
        .expect("binary")
        .args(["--config", cfg.to_str().expect("path")])
        .args(["run"])
        .current_dir(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("--simulate"));
}

#[test]
fn simulated_run_writes_a_record_stream() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = write_config(dir.path(), 0.3);
    Command::cargo_bin("rheo_cli")
        .expect("binary")
        .args(["--config", cfg.to_str().expect("path")])
        .args(["run", "--simulate"])
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Test complete"));

    let data_dir = dir.path().join("data");
    let entries: Vec<_> = std::fs::read_dir(&data_dir)
        .expect("data dir")
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(entries.len(), 1);
    let name = entries[0].file_name().into_string().expect("name");
    assert!(name.contains("squeeze_flow_cli-test_1mL_3g"), "{name}");
    let text = std::fs::read_to_string(entries[0].path()).expect("csv");
    assert!(text.starts_with("Current Time,"));
    assert!(text.lines().count() > 5);
}

#[test]
fn calibrate_fits_csv_into_cell_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cell = dir.path().join("cell.json");
    let csv = dir.path().join("cal.csv");
    std::fs::write(&csv, "raw,force\n500000,0.0\n600000,100.0\n").expect("write csv");

    Command::cargo_bin("rheo_cli")
        .expect("binary")
        .args(["--cell", cell.to_str().expect("path")])
        .args(["calibrate", "--csv", csv.to_str().expect("path")])
        .assert()
        .success()
        .stdout(predicate::str::contains("Calibration saved"));

    let text = std::fs::read_to_string(&cell).expect("record written");
    let v: serde_json::Value = serde_json::from_str(&text).expect("json");
    let slope = v["calibration"].as_f64().expect("slope");
    assert!((slope - 1000.0).abs() < 1e-6, "slope {slope}");
}

#[test]
fn tare_persists_a_cell_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cell = dir.path().join("cell.json");
    Command::cargo_bin("rheo_cli")
        .expect("binary")
        .args(["--cell", cell.to_str().expect("path")])
        .args(["tare", "--simulate", "--samples", "10"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Tare value"));
    let text = std::fs::read_to_string(&cell).expect("record written");
    let v: serde_json::Value = serde_json::from_str(&text).expect("json");
    assert!(v["tare"].is_number());
    assert_eq!(v["units"], "g");
}

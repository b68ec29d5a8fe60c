use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn courtvault(home: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("courtvault");
    cmd.current_dir(home)
        .env("COURTVAULT_HOME", home)
        .env("COURTVAULT_CONFIG_PATH", home.join("absent.toml"))
        .env("COURTVAULT_LOG", "warn");
    cmd
}

fn seed_archive(home: &Path) {
    let dir = home.join("staging/1999-09-09/english");
    fs::create_dir_all(&dir).expect("mkdir staging");
    fs::write(dir.join("x.pdf"), "judgment x").expect("write staged");
    courtvault(home)
        .args(["backfill", "--start", "1999-01-01", "--end", "2000-01-01"])
        .assert()
        .success();
}

#[test]
fn verify_passes_then_flags_a_damaged_container() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path();
    seed_archive(home);

    courtvault(home)
        .args(["verify", "--strict"])
        .assert()
        .success()
        .stdout(predicate::str::contains("verify=ok"));

    fs::write(
        home.join("remote/data/tar/year=1999/english/english.tar"),
        "truncated",
    )
    .expect("damage container");

    courtvault(home)
        .args(["verify", "--year", "1999"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("size mismatch"));

    courtvault(home)
        .args(["verify", "--year", "1850"])
        .assert()
        .success()
        .stdout(predicate::str::contains("indexes=0"));
}

#[test]
fn migrate_index_upgrades_flat_indexes() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path();
    let dir = home.join("remote/data/tar/year=1980/english");
    fs::create_dir_all(&dir).expect("mkdir remote");
    fs::write(dir.join("english.tar"), vec![0u8; 2048]).expect("write container");
    fs::write(
        dir.join("english.index.json"),
        r#"{"year": 1980, "archive_type": "english", "file_count": 2, "files": ["a.pdf", "b.pdf"]}"#,
    )
    .expect("write legacy index");

    courtvault(home)
        .args(["migrate-index", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("would upgrade (2 files, 2048 bytes)"));
    let untouched = fs::read_to_string(dir.join("english.index.json")).expect("read index");
    assert!(!untouched.contains("parts"));

    courtvault(home).arg("migrate-index").assert().success();
    let raw = fs::read_to_string(dir.join("english.index.json")).expect("read index");
    let index: serde_json::Value = serde_json::from_str(&raw).expect("parse index");
    assert_eq!(index["category"], "english");
    assert_eq!(index["parts"][0]["name"], "english");
    assert_eq!(index["parts"][0]["size_bytes"], 2048);
    assert_eq!(index["files"][1], "b.pdf");

    courtvault(home)
        .args(["verify"])
        .assert()
        .success();
}

#[test]
fn export_rebuilds_metadata_jsonl_for_requested_years() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path();
    let dir = home.join("staging/2003-04-05/metadata");
    fs::create_dir_all(&dir).expect("mkdir staging");
    fs::write(dir.join("r1.json"), r#"{"path": "2003/r1.pdf", "bench": "2"}"#).expect("write");

    courtvault(home)
        .env("COURTVAULT_EXPORT_ENABLED", "false")
        .args(["backfill", "--start", "2003-01-01", "--end", "2004-01-01"])
        .assert()
        .success();
    let output = home.join("remote/metadata/jsonl/year=2003/metadata.jsonl");
    assert!(!output.exists());

    courtvault(home)
        .args(["export", "--year", "2003"])
        .assert()
        .success()
        .stdout(predicate::str::contains("records_exported=1"));
    let jsonl = fs::read_to_string(&output).expect("read export");
    assert_eq!(jsonl.lines().count(), 1);
    assert!(jsonl.contains("2003/r1.pdf"));

    courtvault(home).arg("export").assert().failure();
}

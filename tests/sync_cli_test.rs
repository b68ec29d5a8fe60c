use chrono::{Days, NaiveDate, Utc};
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn courtvault(home: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("courtvault");
    cmd.current_dir(home)
        .env("COURTVAULT_HOME", home)
        .env("COURTVAULT_CONFIG_PATH", home.join("absent.toml"))
        .env("COURTVAULT_TIMEZONE", "UTC")
        .env("COURTVAULT_WORKERS", "2")
        .env("COURTVAULT_LOG", "warn");
    cmd
}

fn stage(home: &Path, day: NaiveDate, category: &str, name: &str, body: &str) {
    let dir = home.join("staging").join(day.to_string()).join(category);
    fs::create_dir_all(&dir).expect("mkdir staging");
    fs::write(dir.join(name), body).expect("write staged file");
}

fn read_json(path: &Path) -> serde_json::Value {
    let raw = fs::read_to_string(path).expect("read json");
    serde_json::from_str(&raw).expect("parse json")
}

/// A metadata index that was last published on `day`.
fn publish_metadata_index(home: &Path, day: NaiveDate) {
    let year = day.format("%Y").to_string();
    let dir = home.join(format!("remote/metadata/tar/year={year}"));
    fs::create_dir_all(&dir).expect("mkdir remote");
    let index = serde_json::json!({
        "year": year.parse::<i32>().expect("year"),
        "category": "metadata",
        "file_count": 0,
        "created_at": format!("{day}T06:00:00+00:00"),
        "updated_at": format!("{day}T06:00:00+00:00"),
        "parts": [],
    });
    fs::write(
        dir.join("metadata.index.json"),
        serde_json::to_vec_pretty(&index).expect("encode index"),
    )
    .expect("write index");
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

#[test]
fn sync_on_an_empty_archive_asks_for_a_backfill() {
    let tmp = tempdir().expect("tempdir");
    courtvault(tmp.path())
        .arg("sync")
        .assert()
        .failure()
        .stderr(predicate::str::contains("run backfill first"));
}

#[test]
fn sync_fetches_days_after_the_latest_published_one() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path();
    let today = today();
    let published = today.checked_sub_days(Days::new(3)).expect("date");
    publish_metadata_index(home, published);

    // Already archived; a sync must not look at it again.
    stage(home, published, "english", "old.pdf", "judgment old");
    stage(home, today, "english", "new.pdf", "judgment new");
    stage(home, today, "metadata", "new.json", r#"{"title": "New v. State"}"#);

    courtvault(home)
        .arg("sync")
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("latest_archived={published}")))
        .stdout(predicate::str::contains("state=completed"))
        .stdout(predicate::str::contains("files_added=2"));

    let year = today.format("%Y");
    let english = read_json(&home.join(format!("remote/data/tar/year={year}/english/english.index.json")));
    assert_eq!(english["file_count"], 1);
    assert_eq!(english["parts"][0]["files"][0], "new.pdf");

    assert!(!home.join("work/sync_checkpoint.json").exists());
    let history = read_json(&home.join("work/all_sync_changes.json"));
    assert_eq!(history.as_array().map(Vec::len), Some(1));
    assert!(!home.join("work/all_fill_changes.json").exists());
}

#[test]
fn sync_right_after_a_backfill_is_up_to_date() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path();
    let today = today();
    stage(home, today, "metadata", "a.json", r#"{"title": "A v. State"}"#);

    courtvault(home)
        .args([
            "backfill",
            "--start",
            &today.to_string(),
            "--end",
            &today.checked_add_days(Days::new(1)).expect("date").to_string(),
        ])
        .assert()
        .success();

    courtvault(home)
        .arg("sync")
        .assert()
        .success()
        .stdout(predicate::str::contains("sync=up-to-date"))
        .stdout(predicate::str::contains("files_added").not());
}

#[test]
fn status_shows_an_interrupted_sync() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path();
    fs::create_dir_all(home.join("work")).expect("mkdir work");
    let checkpoint = serde_json::json!({
        "overall_start": "2024-03-01",
        "overall_end": "2024-03-10",
        "completed_chunks": [],
        "current_chunk": ["2024-03-01", "2024-03-10"],
        "completed_years_in_current_chunk": [],
        "failed_days": ["2024-03-04"],
        "last_updated": "2024-03-05T00:00:00+00:00",
    });
    fs::write(
        home.join("work/sync_checkpoint.json"),
        serde_json::to_vec_pretty(&checkpoint).expect("encode checkpoint"),
    )
    .expect("write checkpoint");

    courtvault(home)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("campaign.state=not_started"))
        .stdout(predicate::str::contains("sync_checkpoint.failed_days=1"))
        .stdout(predicate::str::contains("rerun sync to resume"));
}

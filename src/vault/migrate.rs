//! Upgrade of flat, pre-partitioning indexes to the parts layout.
//!
//! Only the index is rewritten. The legacy container already sits at the
//! canonical part name, so it becomes part one as-is.

use anyhow::{Context, Result};
use log::{info, warn};
use serde::Serialize;
use serde_json::Value;

use crate::vault::key::{ArchiveKey, Category, year_from_remote_key};
use crate::vault::manifest::{ArchiveManifest, is_legacy_format};
use crate::vault::object_store::ObjectStore;

const INDEX_SUFFIX: &str = ".index.json";
const INDEX_ROOTS: [&str; 2] = ["metadata/", "data/"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MigrationOutcome {
    Current,
    /// Legacy layout but nothing listed; left alone.
    Empty,
    Upgraded { files: usize, size_bytes: u64 },
    WouldUpgrade { files: usize, size_bytes: u64 },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationEntry {
    pub index_key: String,
    #[serde(flatten)]
    pub outcome: MigrationOutcome,
}

/// Every `*.index.json` under the metadata and document trees, sorted.
pub fn find_indexes(store: &dyn ObjectStore) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for root in INDEX_ROOTS {
        let keys = store
            .list_with_prefix(root)
            .with_context(|| format!("failed to list {root}"))?;
        out.extend(keys.into_iter().filter(|k| k.ends_with(INDEX_SUFFIX)));
    }
    out.sort();
    out.dedup();
    Ok(out)
}

/// Recover the archive key an index belongs to from its remote path.
pub fn key_for_index(index_key: &str) -> Option<ArchiveKey> {
    let year = year_from_remote_key(index_key)?;
    let file = index_key.rsplit('/').next()?;
    let category: Category = file.strip_suffix(INDEX_SUFFIX)?.parse().ok()?;
    let key = ArchiveKey::new(year, category);
    (key.index_key() == index_key).then_some(key)
}

fn migrate_one(store: &dyn ObjectStore, index_key: &str, dry_run: bool, now: &str) -> Result<MigrationOutcome> {
    let Some(raw) = store
        .get(index_key)
        .with_context(|| format!("failed to fetch {index_key}"))?
    else {
        return Ok(MigrationOutcome::Skipped {
            reason: "index vanished".into(),
        });
    };
    let doc: Value = match serde_json::from_slice(&raw) {
        Ok(doc) => doc,
        Err(err) => {
            return Ok(MigrationOutcome::Skipped {
                reason: format!("unparsable: {err}"),
            });
        }
    };
    if !is_legacy_format(&doc) {
        return Ok(MigrationOutcome::Current);
    }
    let Some(key) = key_for_index(index_key) else {
        return Ok(MigrationOutcome::Skipped {
            reason: "path does not name a known key".into(),
        });
    };

    let mut manifest = ArchiveManifest::from_slice(&raw).with_context(|| format!("failed to parse {index_key}"))?;
    let canonical = key.canonical_part_name();
    let container = key.container_key(&canonical);
    let Some(size) = store
        .head(&container)
        .with_context(|| format!("failed to stat {container}"))?
    else {
        return Ok(MigrationOutcome::Skipped {
            reason: format!("legacy container {container} missing"),
        });
    };
    if !manifest.upgrade_legacy(&canonical, Some(size), now) {
        return Ok(MigrationOutcome::Empty);
    }

    let files = manifest.file_count;
    if dry_run {
        return Ok(MigrationOutcome::WouldUpgrade { files, size_bytes: size });
    }
    manifest.save(store, &key)?;
    info!("upgraded {index_key}: {files} files in part {canonical}");
    Ok(MigrationOutcome::Upgraded { files, size_bytes: size })
}

/// Upgrade every legacy index in the store. One bad index does not stop the
/// rest; it is reported as skipped.
pub fn migrate_indexes(store: &dyn ObjectStore, dry_run: bool, now: &str) -> Result<Vec<MigrationEntry>> {
    let mut entries = Vec::new();
    for index_key in find_indexes(store)? {
        let outcome = match migrate_one(store, &index_key, dry_run, now) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("migration of {index_key} failed: {err:#}");
                MigrationOutcome::Skipped {
                    reason: format!("{err:#}"),
                }
            }
        };
        entries.push(MigrationEntry { index_key, outcome });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::object_store::LocalObjectStore;
    use serde_json::json;
    use tempfile::tempdir;

    const NOW: &str = "2025-02-01T10:00:00+05:30";

    fn seed_legacy(store: &LocalObjectStore, key: &ArchiveKey, files: &[&str]) {
        let doc = json!({
            "year": key.year,
            "archive_type": key.category.as_str(),
            "file_count": files.len(),
            "zip_size": 4096,
            "created_at": "2023-05-01T00:00:00",
            "files": files,
        });
        store
            .put(&key.index_key(), &serde_json::to_vec(&doc).unwrap())
            .unwrap();
    }

    #[test]
    fn index_path_maps_back_to_key() {
        let key = ArchiveKey::new(1987, Category::Regional);
        assert_eq!(key_for_index(&key.index_key()), Some(key));
        assert_eq!(key_for_index("data/tar/year=1987/english/notes.index.json"), None);
        assert_eq!(key_for_index("data/tar/english.index.json"), None);
    }

    #[test]
    fn legacy_index_becomes_single_part() {
        let tmp = tempdir().unwrap();
        let store = LocalObjectStore::new(tmp.path());
        let key = ArchiveKey::new(1990, Category::English);
        seed_legacy(&store, &key, &["a.pdf", "b.pdf"]);
        store.put(&key.container_key("english"), &[0u8; 3072]).unwrap();

        let dry = migrate_indexes(&store, true, NOW).unwrap();
        assert_eq!(
            dry[0].outcome,
            MigrationOutcome::WouldUpgrade { files: 2, size_bytes: 3072 }
        );
        let untouched: Value = serde_json::from_slice(&store.get(&key.index_key()).unwrap().unwrap()).unwrap();
        assert!(is_legacy_format(&untouched));

        let done = migrate_indexes(&store, false, NOW).unwrap();
        assert_eq!(done[0].outcome, MigrationOutcome::Upgraded { files: 2, size_bytes: 3072 });
        let manifest = ArchiveManifest::load(&store, &key, NOW).unwrap();
        assert_eq!(manifest.parts.len(), 1);
        assert_eq!(manifest.parts[0].name, "english");
        assert_eq!(manifest.parts[0].size_bytes, 3072);
        assert_eq!(manifest.files, vec!["a.pdf", "b.pdf"]);

        let again = migrate_indexes(&store, false, NOW).unwrap();
        assert_eq!(again[0].outcome, MigrationOutcome::Current);
    }

    #[test]
    fn missing_container_is_skipped_not_invented() {
        let tmp = tempdir().unwrap();
        let store = LocalObjectStore::new(tmp.path());
        let key = ArchiveKey::new(1991, Category::Metadata);
        seed_legacy(&store, &key, &["x.json"]);

        let entries = migrate_indexes(&store, false, NOW).unwrap();
        assert!(matches!(entries[0].outcome, MigrationOutcome::Skipped { .. }));
        let raw: Value = serde_json::from_slice(&store.get(&key.index_key()).unwrap().unwrap()).unwrap();
        assert!(is_legacy_format(&raw));
    }
}

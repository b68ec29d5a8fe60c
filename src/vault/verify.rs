//! Cross-checks indexes against the containers actually in the store.

use anyhow::{Context, Result};
use serde::Serialize;

use crate::vault::manifest::ArchiveManifest;
use crate::vault::migrate::{find_indexes, key_for_index};
use crate::vault::object_store::ObjectStore;
use crate::vault::util::sha256_file;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum PartProblem {
    Missing,
    SizeMismatch { recorded: u64, actual: u64 },
    DigestMismatch { recorded: String, actual: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PartFinding {
    pub index_key: String,
    pub part: String,
    #[serde(flatten)]
    pub problem: PartProblem,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub indexes: usize,
    pub parts_checked: usize,
    pub legacy_indexes: Vec<String>,
    pub unreadable: Vec<String>,
    pub findings: Vec<PartFinding>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty() && self.unreadable.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    pub years: Vec<i32>,
    /// Download each part and compare its sha256 when one is recorded.
    pub strict: bool,
}

pub fn verify_store(store: &dyn ObjectStore, opts: &VerifyOptions) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    let scratch = if opts.strict {
        Some(tempfile::tempdir().context("failed to create verify scratch dir")?)
    } else {
        None
    };

    for index_key in find_indexes(store)? {
        let Some(key) = key_for_index(&index_key) else {
            continue;
        };
        if !opts.years.is_empty() && !opts.years.contains(&key.year) {
            continue;
        }
        report.indexes += 1;

        let manifest = match ArchiveManifest::load(store, &key, "") {
            Ok(m) => m,
            Err(err) => {
                report.unreadable.push(format!("{index_key}: {err:#}"));
                continue;
            }
        };
        if manifest.parts.is_empty() && !manifest.files.is_empty() {
            report.legacy_indexes.push(index_key.clone());
        }

        for part in &manifest.parts {
            report.parts_checked += 1;
            let container = key.container_key(&part.name);
            let finding = |problem| PartFinding {
                index_key: index_key.clone(),
                part: part.name.clone(),
                problem,
            };
            let Some(actual) = store
                .head(&container)
                .with_context(|| format!("failed to stat {container}"))?
            else {
                report.findings.push(finding(PartProblem::Missing));
                continue;
            };
            if actual != part.size_bytes {
                report.findings.push(finding(PartProblem::SizeMismatch {
                    recorded: part.size_bytes,
                    actual,
                }));
                continue;
            }
            if let (Some(dir), Some(recorded)) = (&scratch, &part.sha256) {
                let local = dir.path().join("part.tar");
                if !store
                    .get_to_file(&container, &local)
                    .with_context(|| format!("failed to download {container}"))?
                {
                    report.findings.push(finding(PartProblem::Missing));
                    continue;
                }
                let digest = sha256_file(&local)?;
                if &digest != recorded {
                    report.findings.push(finding(PartProblem::DigestMismatch {
                        recorded: recorded.clone(),
                        actual: digest,
                    }));
                }
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::config::UploadMode;
    use crate::vault::key::{ArchiveKey, Category};
    use crate::vault::object_store::LocalObjectStore;
    use crate::vault::store::{PartitionedArchiveStore, StoreSettings};
    use crate::vault::util::parse_timezone;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn seeded() -> (tempfile::TempDir, Arc<dyn ObjectStore>) {
        let tmp = tempdir().unwrap();
        let remote: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(tmp.path().join("remote")));
        let store = PartitionedArchiveStore::new(
            remote.clone(),
            tmp.path().join("work"),
            StoreSettings {
                max_part_size_bytes: 1 << 20,
                upload_mode: UploadMode::Immediate,
                timezone: parse_timezone("UTC").unwrap(),
            },
        );
        for year in [2001, 2002] {
            let key = ArchiveKey::new(year, Category::English);
            store.add_file(&key, "a.pdf", b"first").unwrap();
            store.upload_key(&key).unwrap();
        }
        store.close_session().unwrap();
        (tmp, remote)
    }

    #[test]
    fn clean_store_verifies() {
        let (_tmp, remote) = seeded();
        let report = verify_store(
            remote.as_ref(),
            &VerifyOptions {
                years: Vec::new(),
                strict: true,
            },
        )
        .unwrap();
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.indexes, 2);
        assert_eq!(report.parts_checked, 2);
    }

    #[test]
    fn truncated_and_missing_parts_are_reported() {
        let (_tmp, remote) = seeded();
        let k1 = ArchiveKey::new(2001, Category::English);
        let k2 = ArchiveKey::new(2002, Category::English);
        remote.put(&k1.container_key("english"), b"short").unwrap();

        let only_2001 = verify_store(
            remote.as_ref(),
            &VerifyOptions {
                years: vec![2001],
                strict: false,
            },
        )
        .unwrap();
        assert_eq!(only_2001.indexes, 1);
        assert!(matches!(
            only_2001.findings[0].problem,
            PartProblem::SizeMismatch { actual: 5, .. }
        ));

        let dir = remote.as_ref();
        let raw = dir.get(&k2.index_key()).unwrap().unwrap();
        let mut manifest = ArchiveManifest::from_slice(&raw).unwrap();
        manifest.parts[0].name = "part-20990101T000000".into();
        manifest.save(dir, &k2).unwrap();

        let all = verify_store(dir, &VerifyOptions::default()).unwrap();
        assert_eq!(all.findings.len(), 2);
        assert_eq!(all.findings[1].problem, PartProblem::Missing);
    }
}

//! Where the archive currently ends, for incremental syncs.
//!
//! The newest year's metadata index is authoritative: its `updated_at` is the
//! last day a sync or backfill published. Without one, the newest year's
//! other indexes are used. A backfill of old years writes today's timestamp
//! into them, so the date never runs past the end of the index's year.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use chrono_tz::Tz;
use log::{debug, warn};

use crate::vault::key::{ArchiveKey, Category};
use crate::vault::manifest::ArchiveManifest;
use crate::vault::migrate::{find_indexes, key_for_index};
use crate::vault::object_store::ObjectStore;

#[derive(Debug, Clone, PartialEq)]
pub struct LatestArchive {
    /// Index the date was read from.
    pub key: ArchiveKey,
    pub date: NaiveDate,
}

/// Calendar day of an index timestamp in `tz`. Offset-less timestamps are
/// taken as already local.
pub fn timestamp_day(raw: &str, tz: Tz) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&tz).date_naive());
    }
    if let Ok(at) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(at.date());
    }
    raw.get(..10)
        .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok())
}

/// The most recent day the remote archive was published for, or `None` for
/// an empty archive.
pub fn latest_archived_date(store: &dyn ObjectStore, tz: Tz) -> Result<Option<LatestArchive>> {
    let keys: Vec<ArchiveKey> = find_indexes(store)?
        .iter()
        .filter_map(|index| key_for_index(index))
        .collect();
    let Some(newest_year) = keys.iter().map(|k| k.year).max() else {
        return Ok(None);
    };
    let year_end = NaiveDate::from_ymd_opt(newest_year, 12, 31);

    let (metadata, others): (Vec<ArchiveKey>, Vec<ArchiveKey>) = keys
        .into_iter()
        .filter(|k| k.year == newest_year)
        .partition(|k| k.category == Category::Metadata);

    for candidates in [metadata, others] {
        let mut best: Option<LatestArchive> = None;
        for key in candidates {
            let manifest = ArchiveManifest::load(store, &key, "")?;
            let Some(date) = timestamp_day(&manifest.updated_at, tz) else {
                warn!("index {} has no usable updated_at ({:?})", key.index_key(), manifest.updated_at);
                continue;
            };
            let date = year_end.map_or(date, |end| date.min(end));
            debug!("{} covers up to {date}", key.index_key());
            if best.as_ref().is_none_or(|b| date > b.date) {
                best = Some(LatestArchive { key, date });
            }
        }
        if best.is_some() {
            return Ok(best);
        }
    }
    Ok(None)
}

use chrono::Datelike;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::FetchError;
use crate::vault::chunks::DayTask;
use crate::vault::key::Category;

/// One file produced by a fetch, ready to be archived under
/// `(year, category)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedItem {
    pub category: Category,
    pub year: i32,
    pub filename: String,
    pub content: Vec<u8>,
    /// False when the fetcher served the bytes from an earlier download.
    pub content_is_new: bool,
}

/// Produces the files for one day. Implementations do their own retrying;
/// an `Err` means the day is given up for this run.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, task: &DayTask) -> Result<Vec<FetchedItem>, FetchError>;
}

/// Imports files that were downloaded ahead of time into
/// `<root>/<YYYY-MM-DD>/<category>/<filename>`. A missing day directory
/// simply yields nothing.
pub struct StagingFetcher {
    root: PathBuf,
    categories: Vec<Category>,
}

impl StagingFetcher {
    pub fn new(root: impl Into<PathBuf>, categories: Vec<Category>) -> Self {
        Self {
            root: root.into(),
            categories,
        }
    }

    fn read_category(
        &self,
        task: &DayTask,
        dir: &Path,
        category: &Category,
        out: &mut Vec<FetchedItem>,
    ) -> Result<(), FetchError> {
        let io_err = |path: &Path, source: io::Error| FetchError::Io {
            date: task.date.to_string(),
            path: path.display().to_string(),
            source,
        };
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(io_err(dir, err)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| io_err(dir, e))?.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            files.push((name.to_string(), path.clone()));
        }
        files.sort();

        for (filename, path) in files {
            let content = fs::read(&path).map_err(|e| io_err(&path, e))?;
            out.push(FetchedItem {
                category: category.clone(),
                year: task.date.year(),
                filename,
                content,
                content_is_new: false,
            });
        }
        Ok(())
    }
}

impl Fetcher for StagingFetcher {
    fn fetch(&self, task: &DayTask) -> Result<Vec<FetchedItem>, FetchError> {
        let day_dir = self.root.join(task.date.format("%Y-%m-%d").to_string());
        let mut out = Vec::new();
        for category in &self.categories {
            let dir = day_dir.join(category.as_str());
            self.read_category(task, &dir, category, &mut out)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    #[test]
    fn reads_staged_files_per_category() {
        let tmp = tempdir().unwrap();
        let day = tmp.path().join("2001-03-04");
        fs::create_dir_all(day.join("english")).unwrap();
        fs::create_dir_all(day.join("metadata")).unwrap();
        fs::write(day.join("english/b.pdf"), b"B").unwrap();
        fs::write(day.join("english/a.pdf"), b"A").unwrap();
        fs::write(day.join("english/.partial"), b"").unwrap();
        fs::write(day.join("metadata/a.json"), b"{}").unwrap();

        let fetcher = StagingFetcher::new(tmp.path(), Category::defaults());
        let task = DayTask {
            date: NaiveDate::from_ymd_opt(2001, 3, 4).unwrap(),
        };
        let items = fetcher.fetch(&task).unwrap();
        let names: Vec<_> = items
            .iter()
            .map(|i| format!("{}/{}", i.category, i.filename))
            .collect();
        assert_eq!(names, vec!["metadata/a.json", "english/a.pdf", "english/b.pdf"]);
        assert!(items.iter().all(|i| i.year == 2001));
    }

    #[test]
    fn missing_day_yields_nothing() {
        let tmp = tempdir().unwrap();
        let fetcher = StagingFetcher::new(tmp.path(), Category::defaults());
        let task = DayTask {
            date: NaiveDate::from_ymd_opt(1950, 1, 1).unwrap(),
        };
        assert!(fetcher.fetch(&task).unwrap().is_empty());
    }
}

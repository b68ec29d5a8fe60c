//! Tar containers that can be reopened for append.
//!
//! A tar archive ends with two zero blocks. Resuming a part means finding the
//! end of the last real entry, truncating the trailer and continuing to write
//! entries from there; `finish` writes a fresh trailer.
//!
//! Sizes are always container bytes on disk, framing included, so the
//! rotation check and the size recorded in the index agree.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

const BLOCK: u64 = 512;
/// Two zero blocks close every archive.
pub const TRAILER: u64 = 2 * BLOCK;
/// Longest name that fits a plain ustar/GNU header.
const NAME_FIELD: usize = 100;

/// Bytes appending `len` bytes as `name` adds to a container.
pub fn entry_footprint(name: &str, len: u64) -> u64 {
    let mut bytes = BLOCK + len.div_ceil(BLOCK) * BLOCK;
    if name.len() > NAME_FIELD {
        // GNU long-name record: header plus the NUL-terminated name
        bytes += BLOCK + (name.len() as u64 + 1).div_ceil(BLOCK) * BLOCK;
    }
    bytes
}

pub struct PartWriter {
    path: PathBuf,
    builder: tar::Builder<File>,
    /// Entry bytes on disk, trailer excluded.
    written: u64,
}

/// A container reopened for append along with what it already holds.
pub struct ResumedPart {
    pub writer: PartWriter,
    pub files: Vec<String>,
}

struct Scan {
    files: Vec<String>,
    end_offset: u64,
}

fn scan(path: &Path) -> Result<Scan> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive = tar::Archive::new(file);
    let mut out = Scan {
        files: Vec::new(),
        end_offset: 0,
    };
    let entries = archive
        .entries()
        .with_context(|| format!("failed to read {}", path.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("corrupt entry in {}", path.display()))?;
        let size = entry.header().entry_size()?;
        let padded = size.div_ceil(BLOCK) * BLOCK;
        out.end_offset = entry.raw_file_position() + padded;
        if entry.header().entry_type().is_file() {
            out.files.push(entry.path()?.to_string_lossy().into_owned());
        }
    }
    Ok(out)
}

impl PartWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            builder: tar::Builder::new(file),
            written: 0,
        })
    }

    /// Reopen an existing container, positioned to append after its last entry.
    pub fn resume(path: &Path) -> Result<ResumedPart> {
        let scanned = scan(path)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.set_len(scanned.end_offset)
            .with_context(|| format!("failed to truncate {}", path.display()))?;
        file.seek(SeekFrom::Start(scanned.end_offset))?;
        Ok(ResumedPart {
            writer: Self {
                path: path.to_path_buf(),
                builder: tar::Builder::new(file),
                written: scanned.end_offset,
            },
            files: scanned.files,
        })
    }

    /// What `finish` would leave on disk right now.
    pub fn container_size(&self) -> u64 {
        self.written + TRAILER
    }

    pub fn append(&mut self, name: &str, content: &[u8]) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
        header.set_entry_type(tar::EntryType::Regular);
        self.builder
            .append_data(&mut header, name, content)
            .with_context(|| format!("failed to append {name} to {}", self.path.display()))?;
        self.written = self
            .builder
            .get_mut()
            .stream_position()
            .with_context(|| format!("failed to locate end of {}", self.path.display()))?;
        Ok(())
    }

    /// Write the trailer and return the container's size on disk.
    pub fn finish(self) -> Result<u64> {
        let path = self.path;
        let file = self
            .builder
            .into_inner()
            .with_context(|| format!("failed to finish {}", path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", path.display()))?;
        drop(file);
        Ok(fs::metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len())
    }
}

/// Names of the regular files in a container, in write order.
pub fn list_entries(path: &Path) -> Result<Vec<String>> {
    Ok(scan(path)?.files)
}

/// Every regular file in a container with its content.
pub fn read_entries(path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive = tar::Archive::new(file);
    let mut out = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry.with_context(|| format!("corrupt entry in {}", path.display()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        out.push((name, data));
    }
    Ok(out)
}

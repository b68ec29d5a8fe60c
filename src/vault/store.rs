//! Size-bounded, append-growing archive containers per (year, category),
//! mirrored to a remote object store.
//!
//! All state sits behind one coarse lock. Public methods take it once; the
//! `*_locked` helpers assume it is held and never lock again.

use anyhow::{Context, Result, anyhow};
use chrono_tz::Tz;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::vault::config::{UploadMode, VaultStoreConfig};
use crate::vault::container::{PartWriter, entry_footprint};
use crate::vault::key::ArchiveKey;
use crate::vault::manifest::{ArchiveManifest, ArchivePart};
use crate::vault::object_store::ObjectStore;
use crate::vault::util::{now_in, now_iso, parse_timezone, part_name_at, sha256_file};

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub max_part_size_bytes: u64,
    pub upload_mode: UploadMode,
    pub timezone: Tz,
}

impl StoreSettings {
    pub fn from_config(cfg: &VaultStoreConfig) -> Result<Self> {
        Ok(Self {
            max_part_size_bytes: cfg.max_part_size_bytes,
            upload_mode: cfg.upload_mode,
            timezone: parse_timezone(&cfg.timezone)?,
        })
    }
}

struct OpenPart {
    name: String,
    local_path: PathBuf,
    writer: PartWriter,
    /// Everything in the container, including entries from a resumed upload.
    files: Vec<String>,
    new_files: usize,
    created_at: String,
}

/// A finalized part whose container has not reached the remote yet.
struct PendingPart {
    part: ArchivePart,
    local_path: PathBuf,
}

struct KeyState {
    manifest: ArchiveManifest,
    known_files: HashSet<String>,
    open: Option<OpenPart>,
    pending: Vec<PendingPart>,
    /// Local manifest differs from the remote one.
    manifest_dirty: bool,
    /// Written to since the last `upload_key`.
    dirty: bool,
    uploaded: bool,
    added_this_session: Vec<String>,
    uploaded_parts: Vec<UploadedPart>,
}

impl KeyState {
    fn new(manifest: ArchiveManifest) -> Self {
        Self {
            known_files: manifest.all_files(),
            manifest,
            open: None,
            pending: Vec::new(),
            manifest_dirty: false,
            dirty: false,
            uploaded: false,
            added_this_session: Vec::new(),
            uploaded_parts: Vec::new(),
        }
    }
}

#[derive(Default)]
struct StoreState {
    keys: HashMap<ArchiveKey, KeyState>,
    /// Local containers already mirrored remotely; removed on `close_session`.
    uploaded_locals: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadedPart {
    pub name: String,
    pub file_count: usize,
    pub size_bytes: u64,
}

/// What happened to one key since the last drain.
#[derive(Debug, Clone, Serialize)]
pub struct KeyChanges {
    pub year: i32,
    pub category: String,
    pub new_files: Vec<String>,
    pub uploaded_parts: Vec<UploadedPart>,
}

pub struct PartitionedArchiveStore {
    remote: Arc<dyn ObjectStore>,
    local_root: PathBuf,
    settings: StoreSettings,
    state: Mutex<StoreState>,
}

fn missing_key(key: &ArchiveKey) -> anyhow::Error {
    anyhow!("archive key {key} used before its manifest was loaded")
}

impl PartitionedArchiveStore {
    pub fn new(remote: Arc<dyn ObjectStore>, local_root: PathBuf, settings: StoreSettings) -> Self {
        Self {
            remote,
            local_root,
            settings,
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    fn now(&self) -> String {
        now_iso(self.settings.timezone)
    }

    fn local_path(&self, key: &ArchiveKey, part_name: &str) -> PathBuf {
        self.local_root.join(key.container_key(part_name))
    }

    /// Load and cache the manifest for `key`. The fetch happens without the
    /// lock; a racing loader's copy is discarded.
    fn ensure_loaded(&self, key: &ArchiveKey) -> Result<()> {
        if self.state.lock().keys.contains_key(key) {
            return Ok(());
        }
        let manifest = ArchiveManifest::load(self.remote.as_ref(), key, &self.now())?;
        debug!(
            "loaded manifest for {key}: {} parts, {} files",
            manifest.parts.len(),
            manifest.file_count
        );
        self.state
            .lock()
            .keys
            .entry(key.clone())
            .or_insert_with(|| KeyState::new(manifest));
        Ok(())
    }

    pub fn file_exists(&self, key: &ArchiveKey, filename: &str) -> Result<bool> {
        self.ensure_loaded(key)?;
        let state = self.state.lock();
        let ks = state.keys.get(key).ok_or_else(|| missing_key(key))?;
        Ok(ks.known_files.contains(filename))
    }

    /// Append `content` as `filename` unless the key already holds that
    /// filename. Returns whether anything was written.
    pub fn add_file(&self, key: &ArchiveKey, filename: &str, content: &[u8]) -> Result<bool> {
        self.ensure_loaded(key)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        {
            let ks = state.keys.get(key).ok_or_else(|| missing_key(key))?;
            if ks.known_files.contains(filename) {
                return Ok(false);
            }
        }

        let incoming = entry_footprint(filename, content.len() as u64);
        self.ensure_open_part_locked(state, key, incoming)?;

        let ks = state.keys.get_mut(key).ok_or_else(|| missing_key(key))?;
        let open = ks
            .open
            .as_mut()
            .ok_or_else(|| anyhow!("no open part for {key}"))?;
        open.writer.append(filename, content)?;
        open.files.push(filename.to_string());
        open.new_files += 1;
        ks.known_files.insert(filename.to_string());
        ks.added_this_session.push(filename.to_string());
        ks.dirty = true;
        ks.uploaded = false;
        Ok(true)
    }

    /// Make sure `key` has an open part that can take an entry of `incoming`
    /// container bytes, rotating when the finished part would pass the limit.
    /// An empty part takes any entry, so a single oversized file still lands.
    fn ensure_open_part_locked(
        &self,
        state: &mut StoreState,
        key: &ArchiveKey,
        incoming: u64,
    ) -> Result<()> {
        let max = self.settings.max_part_size_bytes;
        let open_size = state
            .keys
            .get(key)
            .ok_or_else(|| missing_key(key))?
            .open
            .as_ref()
            .map(|open| (open.writer.container_size(), open.files.is_empty()));
        let Some((size, empty)) = open_size else {
            return self.open_part_locked(state, key, false);
        };
        if !empty && size + incoming > max {
            info!("rotating {key}: open part reached {max} bytes");
            self.finalize_part_locked(state, key)?;
            self.open_part_locked(state, key, true)?;
        }
        Ok(())
    }

    /// Open a part for `key`. Outside rotation, the newest known part is
    /// resumed when it still has room and its container exists remotely. The
    /// first part of a key always takes the canonical name.
    fn open_part_locked(&self, state: &mut StoreState, key: &ArchiveKey, rotate: bool) -> Result<()> {
        let max = self.settings.max_part_size_bytes;
        let ks = state.keys.get_mut(key).ok_or_else(|| missing_key(key))?;

        if !rotate && ks.pending.is_empty() {
            let candidate = match ks.manifest.last_part() {
                Some(last) if last.size_bytes < max => {
                    Some((last.name.clone(), Some(last.created_at.clone())))
                }
                Some(_) => None,
                None => Some((key.canonical_part_name(), None)),
            };
            if let Some((name, created_at)) = candidate {
                if let Some(open) = self.try_resume(key, &name, created_at)? {
                    ks.known_files.extend(open.files.iter().cloned());
                    ks.open = Some(open);
                    return Ok(());
                }
                if ks.manifest.parts.is_empty() {
                    ks.open = Some(self.create_part(key, &name)?);
                    return Ok(());
                }
                warn!("container for {key} part {name} missing remotely; starting a new part");
            }
        }

        let name = self.next_part_name(ks);
        ks.open = Some(self.create_part(key, &name)?);
        Ok(())
    }

    fn create_part(&self, key: &ArchiveKey, name: &str) -> Result<OpenPart> {
        let local_path = self.local_path(key, name);
        debug!("creating part {name} for {key} at {}", local_path.display());
        Ok(OpenPart {
            name: name.to_string(),
            writer: PartWriter::create(&local_path)?,
            local_path,
            files: Vec::new(),
            new_files: 0,
            created_at: self.now(),
        })
    }

    /// Reopen a remote container for append, reusing the local working copy
    /// when its size matches the remote one.
    fn try_resume(
        &self,
        key: &ArchiveKey,
        name: &str,
        created_at: Option<String>,
    ) -> Result<Option<OpenPart>> {
        let remote_key = key.container_key(name);
        let Some(remote_size) = self
            .remote
            .head(&remote_key)
            .with_context(|| format!("failed to stat {remote_key}"))?
        else {
            return Ok(None);
        };
        let local_path = self.local_path(key, name);
        let cached = fs::metadata(&local_path).is_ok_and(|m| m.len() == remote_size);
        if !cached {
            let found = self
                .remote
                .get_to_file(&remote_key, &local_path)
                .with_context(|| format!("failed to download {remote_key}"))?;
            if !found {
                return Ok(None);
            }
        }
        let resumed = PartWriter::resume(&local_path)?;
        info!(
            "resuming {key} part {name}: {} files, {} bytes",
            resumed.files.len(),
            resumed.writer.container_size()
        );
        Ok(Some(OpenPart {
            name: name.to_string(),
            local_path,
            writer: resumed.writer,
            files: resumed.files,
            new_files: 0,
            created_at: created_at.unwrap_or_else(|| self.now()),
        }))
    }

    /// Timestamp name for a rotated part, suffixed when another part of the
    /// key already took the same second.
    fn next_part_name(&self, ks: &KeyState) -> String {
        let base = part_name_at(&now_in(self.settings.timezone));
        let taken = |name: &str| {
            ks.manifest.parts.iter().any(|p| p.name == name)
                || ks.pending.iter().any(|p| p.part.name == name)
                || ks.open.as_ref().is_some_and(|o| o.name == name)
        };
        if !taken(&base) {
            return base;
        }
        let mut n = 1u32;
        loop {
            let candidate = format!("{base}-{n}");
            if !taken(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Public entry point for closing the active part of `key`.
    pub fn finalize_part(&self, key: &ArchiveKey) -> Result<Option<ArchivePart>> {
        let mut guard = self.state.lock();
        if !guard.keys.contains_key(key) {
            return Ok(None);
        }
        self.finalize_part_locked(&mut guard, key)
    }

    /// Close the open part of `key`. Immediate mode pushes the container and
    /// manifest before returning; batch mode only queues the part.
    fn finalize_part_locked(
        &self,
        state: &mut StoreState,
        key: &ArchiveKey,
    ) -> Result<Option<ArchivePart>> {
        let ks = state.keys.get_mut(key).ok_or_else(|| missing_key(key))?;
        let Some(open) = ks.open.take() else {
            return Ok(None);
        };

        let local_path = open.local_path;
        let had_content = !open.files.is_empty();
        let size_bytes = open.writer.finish()?;
        if open.new_files == 0 {
            if !had_content {
                let _ = fs::remove_file(&local_path);
            }
            return Ok(None);
        }

        let mut part = ArchivePart::new(&open.name, open.files, size_bytes, &open.created_at);
        part.sha256 = Some(sha256_file(&local_path)?);
        info!(
            "finalized {key} part {}: {} files, {} bytes",
            part.name, part.file_count, part.size_bytes
        );
        ks.pending.push(PendingPart {
            part: part.clone(),
            local_path,
        });

        if self.settings.upload_mode == UploadMode::Immediate {
            self.flush_pending_locked(state, key)?;
        }
        Ok(Some(part))
    }

    /// Upload queued containers in order, merge them into the manifest and
    /// push the manifest once. Parts that fail stay queued.
    fn flush_pending_locked(&self, state: &mut StoreState, key: &ArchiveKey) -> Result<usize> {
        let now = self.now();
        let ks = state.keys.get_mut(key).ok_or_else(|| missing_key(key))?;
        let mut merged = 0usize;
        let mut failure = None;
        while let Some(next) = ks.pending.first() {
            let remote_key = key.container_key(&next.part.name);
            if let Err(err) = self.remote.put_file(&remote_key, &next.local_path) {
                failure = Some(anyhow::Error::new(err).context(format!("failed to upload {remote_key}")));
                break;
            }
            let done = ks.pending.remove(0);
            ks.uploaded_parts.push(UploadedPart {
                name: done.part.name.clone(),
                file_count: done.part.file_count,
                size_bytes: done.part.size_bytes,
            });
            ks.manifest.add_part(done.part, &now);
            ks.manifest_dirty = true;
            state.uploaded_locals.push(done.local_path);
            merged += 1;
        }

        if ks.manifest_dirty {
            ks.manifest.save(self.remote.as_ref(), key)?;
            ks.manifest_dirty = false;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(merged),
        }
    }

    /// Finalize and publish everything written to `key`. Repeated calls with
    /// no writes in between do nothing and return 0.
    pub fn upload_key(&self, key: &ArchiveKey) -> Result<usize> {
        let mut guard = self.state.lock();
        self.upload_key_locked(&mut guard, key)
    }

    fn upload_key_locked(&self, state: &mut StoreState, key: &ArchiveKey) -> Result<usize> {
        let Some(ks) = state.keys.get(key) else {
            return Ok(0);
        };
        if !ks.dirty && ks.open.is_none() && ks.pending.is_empty() && !ks.manifest_dirty {
            return Ok(0);
        }

        let before = ks.uploaded_parts.len();
        self.finalize_part_locked(state, key)?;
        self.flush_pending_locked(state, key)?;

        let ks = state.keys.get_mut(key).ok_or_else(|| missing_key(key))?;
        ks.dirty = false;
        ks.uploaded = true;
        let count = ks.uploaded_parts.len() - before;
        if count > 0 {
            info!(
                "uploaded {count} part(s) for {key}; index now {} files in {} parts",
                ks.manifest.file_count,
                ks.manifest.parts.len()
            );
        }
        Ok(count)
    }

    /// End of session: finalize open parts, publish batch-mode work, then drop
    /// uploaded local containers and the directories they leave empty.
    pub fn close_session(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut keys: Vec<ArchiveKey> = state.keys.keys().cloned().collect();
        keys.sort();

        let mut first_err = None;
        for key in &keys {
            let result = self.finalize_part_locked(state, key).and_then(|_| {
                let needs_upload = state.keys.get(key).is_some_and(|ks| {
                    !ks.pending.is_empty()
                        || ks.manifest_dirty
                        || (ks.dirty && self.settings.upload_mode == UploadMode::Batch)
                });
                if needs_upload {
                    self.upload_key_locked(state, key)?;
                }
                Ok(())
            });
            if let Err(err) = result {
                warn!("failed to close {key}: {err:#}");
                first_err.get_or_insert(err);
            }
        }

        for path in std::mem::take(&mut state.uploaded_locals) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!("failed to remove {}: {err}", path.display()),
            }
            if let Some(parent) = path.parent() {
                self.prune_empty_dirs(parent);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn prune_empty_dirs(&self, start: &Path) {
        let mut dir = start.to_path_buf();
        while dir.starts_with(&self.local_root) && dir != self.local_root {
            if fs::remove_dir(&dir).is_err() {
                break;
            }
            if !dir.pop() {
                break;
            }
        }
    }

    pub fn is_uploaded(&self, key: &ArchiveKey) -> bool {
        self.state.lock().keys.get(key).is_some_and(|ks| ks.uploaded)
    }

    pub fn manifest(&self, key: &ArchiveKey) -> Option<ArchiveManifest> {
        self.state.lock().keys.get(key).map(|ks| ks.manifest.clone())
    }

    /// Take and reset per-key change records accumulated since the last call.
    pub fn drain_session_changes(&self) -> Vec<KeyChanges> {
        let mut state = self.state.lock();
        let mut out: BTreeMap<ArchiveKey, KeyChanges> = BTreeMap::new();
        for (key, ks) in state.keys.iter_mut() {
            if ks.added_this_session.is_empty() && ks.uploaded_parts.is_empty() {
                continue;
            }
            out.insert(
                key.clone(),
                KeyChanges {
                    year: key.year,
                    category: key.category.to_string(),
                    new_files: std::mem::take(&mut ks.added_this_session),
                    uploaded_parts: std::mem::take(&mut ks.uploaded_parts),
                },
            );
        }
        out.into_values().collect()
    }
}

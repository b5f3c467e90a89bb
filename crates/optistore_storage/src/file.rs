//! Sharded local-file map entity store.
//!
//! Layout under the storage directory:
//!
//! ```text
//! <directory>/
//! ├─ LOCK              # Advisory lock, single process per directory
//! ├─ slices            # Fixed shard count, written at first init
//! ├─ scratch/          # Staging area for prepared writes
//! ├─ 0/                # Shard directories, one per slice
//! │   └─ <escaped-reference>.json
//! └─ ...
//! ```
//!
//! A write stages its payload as a scratch file first and renames it
//! over the destination at commit, so a crash mid-write leaves either
//! the old payload intact or the new one fully written, never a
//! partial file. The shard count is fixed at first initialization and
//! persisted in `slices`; changing it afterwards would orphan existing
//! entities, so reopening ignores a differing configured value.

use crate::envelope;
use crate::error::{StorageError, StorageResult};
use crate::reference::EntityReference;
use crate::store::{
    BackupRestore, MapChange, MapChanger, MapEntityStore, StateCommitter, StateIter, StateSink,
};
use fs2::FileExt;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

const SLICES_FILE: &str = "slices";
const LOCK_FILE: &str = "LOCK";
const SCRATCH_DIR: &str = "scratch";
const STATE_EXT: &str = "json";

/// Maximum accepted shard fan-out.
pub(crate) const MAX_SLICES: u32 = 10_000;

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

/// A sharded local-file map entity store.
///
/// Entities are distributed across shard subdirectories by a stable
/// hash of the reference, bounding per-directory file counts. The
/// store holds an advisory lock on its directory for its lifetime;
/// only one instance can exist per directory at a time.
#[derive(Debug)]
pub struct FileMapStore {
    layout: Layout,
    _lock: File,
}

/// Resolved directory layout, shared with changers and sinks.
#[derive(Debug, Clone)]
struct Layout {
    directory: PathBuf,
    scratch: PathBuf,
    slices: u32,
}

impl Layout {
    fn shard_of(&self, reference: &EntityReference) -> u32 {
        let digest = Sha256::digest(reference.as_str().as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % u64::from(self.slices)) as u32
    }

    fn shard_dir(&self, shard: u32) -> PathBuf {
        self.directory.join(shard.to_string())
    }

    fn data_file(&self, reference: &EntityReference) -> PathBuf {
        let name = format!("{}.{STATE_EXT}", escape_reference(reference.as_str()));
        self.shard_dir(self.shard_of(reference)).join(name)
    }

    fn scratch_file(&self) -> PathBuf {
        let seq = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
        self.scratch.join(format!("stage-{seq}.tmp"))
    }
}

/// Replaces all characters some filesystem can't handle.
///
/// Characters outside `[A-Za-z0-9_.-]` become `%XX` escapes of their
/// UTF-8 bytes, so the resulting names are portable across
/// filesystems. `%` itself is escaped, which keeps the mapping
/// injective.
fn escape_reference(identity: &str) -> String {
    let mut escaped = String::with_capacity(identity.len() + 16);
    for byte in identity.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'.' | b'-' => {
                escaped.push(byte as char);
            }
            _ => {
                escaped.push('%');
                escaped.push_str(&format!("{byte:02X}"));
            }
        }
    }
    escaped
}

impl FileMapStore {
    /// Opens or initializes a store in the given directory.
    ///
    /// The first initialization persists `slices`; later opens read
    /// the persisted value and ignore the configured one. Leftover
    /// scratch files from a crashed process are removed.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::Locked`] if another process holds
    /// the directory, or [`StorageError::InvalidConfiguration`] if
    /// the slice count is outside `[1, 10000]`.
    pub fn open(directory: &Path, slices: u32) -> StorageResult<Self> {
        if slices == 0 || slices > MAX_SLICES {
            return Err(StorageError::invalid_configuration(format!(
                "slice count {slices} outside [1, {MAX_SLICES}]"
            )));
        }

        fs::create_dir_all(directory)?;
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(directory.join(LOCK_FILE))?;
        lock.try_lock_exclusive()
            .map_err(|_| StorageError::Locked)?;

        let slices_path = directory.join(SLICES_FILE);
        let slices = if slices_path.exists() {
            read_slices(&slices_path)?
        } else {
            fs::write(&slices_path, slices.to_string())?;
            slices
        };

        let scratch = directory.join(SCRATCH_DIR);
        fs::create_dir_all(&scratch)?;
        clear_scratch(&scratch)?;

        info!(
            "opened file store at {:?} with {} slices",
            directory, slices
        );

        Ok(Self {
            layout: Layout {
                directory: directory.to_path_buf(),
                scratch,
                slices,
            },
            _lock: lock,
        })
    }

    /// Returns the storage directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.layout.directory
    }

    /// Returns the persisted shard count.
    #[must_use]
    pub fn slices(&self) -> u32 {
        self.layout.slices
    }
}

fn read_slices(path: &Path) -> StorageResult<u32> {
    let text = fs::read_to_string(path)?;
    let slices: u32 = text
        .trim()
        .parse()
        .map_err(|_| StorageError::corrupted(format!("unreadable slice count {text:?}")))?;
    if slices == 0 || slices > MAX_SLICES {
        return Err(StorageError::corrupted(format!(
            "persisted slice count {slices} outside [1, {MAX_SLICES}]"
        )));
    }
    Ok(slices)
}

fn clear_scratch(scratch: &Path) -> StorageResult<()> {
    let mut removed = 0;
    for entry in fs::read_dir(scratch)? {
        let path = entry?.path();
        if path.is_file() {
            fs::remove_file(path)?;
            removed += 1;
        }
    }
    if removed > 0 {
        debug!("removed {} stale scratch files", removed);
    }
    Ok(())
}

/// Stages `payload` and atomically replaces `dest` with it.
fn store_payload(layout: &Layout, dest: &Path, payload: &str) -> StorageResult<()> {
    let temp = layout.scratch_file();
    fs::write(&temp, payload)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(temp, dest)?;
    Ok(())
}

impl MapEntityStore for FileMapStore {
    fn fetch(&self, reference: &EntityReference) -> StorageResult<String> {
        match fs::read_to_string(self.layout.data_file(reference)) {
            Ok(payload) => Ok(payload),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::not_found(reference)),
            Err(e) => Err(e.into()),
        }
    }

    fn apply_changes(
        &self,
        visit: &mut dyn FnMut(&mut dyn MapChanger) -> StorageResult<()>,
    ) -> StorageResult<Box<dyn StateCommitter>> {
        let staged = Arc::new(Mutex::new(Vec::new()));
        let mut changer = FileChanger {
            layout: self.layout.clone(),
            staged: Arc::clone(&staged),
        };
        match visit(&mut changer) {
            Ok(()) => Ok(Box::new(FileCommitter { staged })),
            Err(e) => {
                // Failed batches must not leave scratch files behind.
                Box::new(FileCommitter { staged }).cancel();
                Err(e)
            }
        }
    }

    fn all_states(&self) -> StorageResult<StateIter> {
        let mut shard_dirs: Vec<PathBuf> = (0..self.layout.slices)
            .map(|shard| self.layout.shard_dir(shard))
            .filter(|dir| dir.is_dir())
            .collect();
        shard_dirs.reverse();
        Ok(Box::new(FileStateIter {
            pending: shard_dirs,
            current: None,
        }))
    }
}

impl BackupRestore for FileMapStore {
    fn backup(&self) -> StorageResult<StateIter> {
        self.all_states()
    }

    fn restore(&self, states: &mut dyn Iterator<Item = String>) -> StorageResult<usize> {
        let mut restored = 0;
        for payload in states {
            let reference = envelope::envelope_reference(&payload)?;
            store_payload(&self.layout, &self.layout.data_file(&reference), &payload)?;
            restored += 1;
        }
        info!("restored {} entities into {:?}", restored, self.layout.directory);
        Ok(restored)
    }
}

enum StagedFileOp {
    Put { temp: PathBuf, dest: PathBuf },
    Remove { dest: PathBuf },
}

struct FileChanger {
    layout: Layout,
    staged: Arc<Mutex<Vec<StagedFileOp>>>,
}

impl MapChanger for FileChanger {
    fn create(&mut self, reference: &EntityReference) -> StorageResult<Box<dyn StateSink>> {
        FileSink::open(&self.layout, reference, false, Arc::clone(&self.staged))
    }

    fn update(&mut self, change: &MapChange) -> StorageResult<Box<dyn StateSink>> {
        FileSink::open(
            &self.layout,
            &change.reference,
            true,
            Arc::clone(&self.staged),
        )
    }

    fn remove(&mut self, reference: &EntityReference) -> StorageResult<()> {
        let dest = self.layout.data_file(reference);
        if !dest.exists() {
            return Err(StorageError::not_found(reference));
        }
        self.staged.lock().push(StagedFileOp::Remove { dest });
        Ok(())
    }
}

struct FileSink {
    reference: EntityReference,
    temp: PathBuf,
    dest: PathBuf,
    writer: Option<BufWriter<File>>,
    must_exist: bool,
    staged: Arc<Mutex<Vec<StagedFileOp>>>,
}

impl FileSink {
    fn open(
        layout: &Layout,
        reference: &EntityReference,
        must_exist: bool,
        staged: Arc<Mutex<Vec<StagedFileOp>>>,
    ) -> StorageResult<Box<dyn StateSink>> {
        let temp = layout.scratch_file();
        let file = File::create(&temp)?;
        Ok(Box::new(Self {
            reference: reference.clone(),
            temp,
            dest: layout.data_file(reference),
            writer: Some(BufWriter::new(file)),
            must_exist,
            staged,
        }))
    }

    fn discard_temp(&self) {
        let _ = fs::remove_file(&self.temp);
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        // A sink dropped without finish() or abort() releases its
        // scratch file; a finished sink's file belongs to the batch.
        if self.writer.take().is_some() {
            self.discard_temp();
        }
    }
}

impl StateSink for FileSink {
    fn write(&mut self, chunk: &str) -> StorageResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| StorageError::corrupted("write after finish"))?;
        writer.write_all(chunk.as_bytes())?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> StorageResult<()> {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush().and_then(|()| writer.get_ref().sync_all()) {
                drop(writer);
                self.discard_temp();
                return Err(e.into());
            }
        }

        let exists = self.dest.exists();
        if self.must_exist && !exists {
            self.discard_temp();
            return Err(StorageError::not_found(&self.reference));
        }
        if !self.must_exist && exists {
            self.discard_temp();
            return Err(StorageError::already_exists(&self.reference));
        }

        self.staged.lock().push(StagedFileOp::Put {
            temp: self.temp.clone(),
            dest: self.dest.clone(),
        });
        Ok(())
    }

    fn abort(mut self: Box<Self>) {
        self.writer.take();
        self.discard_temp();
    }
}

struct FileCommitter {
    staged: Arc<Mutex<Vec<StagedFileOp>>>,
}

impl StateCommitter for FileCommitter {
    fn commit(self: Box<Self>) -> StorageResult<()> {
        let staged: Vec<StagedFileOp> = self.staged.lock().drain(..).collect();
        for op in staged {
            match op {
                StagedFileOp::Put { temp, dest } => {
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::rename(&temp, &dest)?;
                }
                StagedFileOp::Remove { dest } => {
                    fs::remove_file(&dest)?;
                }
            }
        }
        Ok(())
    }

    fn cancel(self: Box<Self>) {
        let staged: Vec<StagedFileOp> = self.staged.lock().drain(..).collect();
        for op in staged {
            if let StagedFileOp::Put { temp, .. } = op {
                let _ = fs::remove_file(temp);
            }
        }
    }
}

struct FileStateIter {
    pending: Vec<PathBuf>,
    current: Option<fs::ReadDir>,
}

impl Iterator for FileStateIter {
    type Item = StorageResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entries) = self.current.as_mut() {
                for entry in entries {
                    let path = match entry {
                        Ok(entry) => entry.path(),
                        Err(e) => return Some(Err(e.into())),
                    };
                    if path.is_file() && path.extension().is_some_and(|ext| ext == STATE_EXT) {
                        return Some(fs::read_to_string(&path).map_err(Into::into));
                    }
                }
                self.current = None;
            }
            let dir = self.pending.pop()?;
            match fs::read_dir(&dir) {
                Ok(entries) => self.current = Some(entries),
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

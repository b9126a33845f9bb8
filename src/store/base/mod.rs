// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! State-partitioned file store.
//!
//! A [`FileStore`] manages a pool of named files, each in exactly one
//! *state* (a directory) at a time. Operations are built through
//! [`FileStore::in_states`]: the resulting [`FileOp`] only sees files in its
//! accepted states and reports a typed [`Error::WrongFileState`] when the
//! target is elsewhere, so callers can distinguish "uploading" from
//! "cached" without string matching.
//!
//! A per-entry lock serializes state transitions for a name; reads take a
//! shared lease. Metadata records live in sidecar files next to the blob
//! and move (or not) with it according to their kind.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};

mod metadata;

pub use metadata::{
    decode_last_access, decode_persist, encode_last_access, encode_persist, MetadataKind,
};

use super::Error;

/// How names map onto paths inside a state directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// `<dir>/<name>`
    Flat,
    /// `<dir>/<name[0..2]>/<name[2..4]>/<name>`, for content-addressed
    /// names.
    Sharded,
}

struct StateInner {
    label: String,
    directory: PathBuf,
    layout: Layout,
}

/// A named state backed by a directory.
#[derive(Clone)]
pub struct FileState(Arc<StateInner>);

impl FileState {
    pub fn new(label: impl Into<String>, directory: impl Into<PathBuf>, layout: Layout) -> Self {
        Self(Arc::new(StateInner {
            label: label.into(),
            directory: directory.into(),
            layout,
        }))
    }

    pub fn label(&self) -> &str {
        &self.0.label
    }

    pub fn directory(&self) -> &Path {
        &self.0.directory
    }

    pub(crate) fn path_for(&self, name: &str) -> Result<PathBuf, Error> {
        if name.is_empty() || name.contains(['/', '.']) {
            return Err(Error::InvalidName(name.to_string()));
        }
        match self.0.layout {
            Layout::Flat => Ok(self.0.directory.join(name)),
            Layout::Sharded => {
                if name.len() < 4 || !name.is_ascii() {
                    return Err(Error::InvalidName(name.to_string()));
                }
                Ok(self
                    .0
                    .directory
                    .join(&name[..2])
                    .join(&name[2..4])
                    .join(name))
            }
        }
    }
}

impl PartialEq for FileState {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.directory == other.0.directory
    }
}

impl Eq for FileState {}

impl std::fmt::Debug for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FileState({})", self.0.label)
    }
}

struct Capacity {
    state: FileState,
    max: NonZeroUsize,
    // Unbounded on purpose: eviction must surface the victims so their
    // files can be deleted, and a bounded `LruCache` drops them silently.
    lru: Mutex<LruCache<String, ()>>,
}

/// Pool of state-partitioned files with per-entry locking and an optional
/// LRU count cap over one designated state.
pub struct FileStore {
    states: Vec<FileState>,
    entries: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    capacity: Option<Capacity>,
}

impl FileStore {
    /// Creates the store and its state directories.
    pub fn new(states: Vec<FileState>) -> Result<Self, Error> {
        Self::build(states, None)
    }

    /// Like [`FileStore::new`], with an LRU cap of `capacity` entries over
    /// `capped_state`. Insertions beyond the cap synchronously evict the
    /// least-recently-used non-persisted entries.
    pub fn with_capacity(
        states: Vec<FileState>,
        capped_state: FileState,
        capacity: NonZeroUsize,
    ) -> Result<Self, Error> {
        Self::build(
            states,
            Some(Capacity {
                state: capped_state,
                max: capacity,
                lru: Mutex::new(LruCache::unbounded()),
            }),
        )
    }

    fn build(states: Vec<FileState>, capacity: Option<Capacity>) -> Result<Self, Error> {
        for state in &states {
            fs::create_dir_all(state.directory())?;
        }
        Ok(Self {
            states,
            entries: Mutex::new(HashMap::new()),
            capacity,
        })
    }

    /// Builds an operation scoped to `states`.
    pub fn in_states(&self, states: &[FileState]) -> FileOp<'_> {
        FileOp {
            store: self,
            accepted: states.to_vec(),
        }
    }

    fn entry_lock(&self, name: &str) -> Arc<RwLock<()>> {
        let mut entries = self.entries.lock();
        Arc::clone(
            entries
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(()))),
        )
    }

    fn drop_entry(&self, name: &str) {
        self.entries.lock().remove(name);
    }

    /// Registers `name` as most-recently-used in the capped state and evicts
    /// past-capacity entries. Persisted victims are retained.
    fn touch_capped(&self, state: &FileState, name: &str) {
        let Some(capacity) = &self.capacity else {
            return;
        };
        if capacity.state != *state {
            return;
        }

        let victims: Vec<String> = {
            let mut lru = capacity.lru.lock();
            lru.put(name.to_string(), ());
            let mut victims = Vec::new();
            while lru.len() > capacity.max.get() {
                match lru.pop_lru() {
                    Some((victim, ())) => victims.push(victim),
                    None => break,
                }
            }
            victims
        };

        for victim in victims {
            match self.in_states(std::slice::from_ref(state)).delete_file(&victim) {
                Ok(()) => debug!("evicted {victim} from {}", state.label()),
                Err(err) if err.is_persisted() => {
                    // Pinned entries stay but keep occupying a slot.
                    capacity.lru.lock().put(victim, ());
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => warn!("failed to evict {victim}: {err}"),
            }
        }
    }

    fn promote_capped(&self, state: &FileState, name: &str) {
        if let Some(capacity) = &self.capacity {
            if capacity.state == *state {
                capacity.lru.lock().get(name);
            }
        }
    }

    fn forget_capped(&self, state: &FileState, name: &str) {
        if let Some(capacity) = &self.capacity {
            if capacity.state == *state {
                capacity.lru.lock().pop(name);
            }
        }
    }
}

/// A store operation scoped to a set of accepted states.
pub struct FileOp<'a> {
    store: &'a FileStore,
    accepted: Vec<FileState>,
}

impl<'a> FileOp<'a> {
    /// Locates `name` among the accepted states. A hit in a registered but
    /// non-accepted state is a [`Error::WrongFileState`] carrying that
    /// state's label.
    fn find(&self, name: &str) -> Result<(FileState, PathBuf), Error> {
        for state in &self.accepted {
            let path = state.path_for(name)?;
            if path.is_file() {
                return Ok((state.clone(), path));
            }
        }
        for state in &self.store.states {
            if self.accepted.contains(state) {
                continue;
            }
            if state.path_for(name)?.is_file() {
                return Err(Error::WrongFileState {
                    name: name.to_string(),
                    observed: state.label().to_string(),
                });
            }
        }
        Err(Error::FileNotFound {
            name: name.to_string(),
        })
    }

    fn accepted_state(&self, state: &FileState, name: &str) -> Result<(), Error> {
        if self.accepted.contains(state) {
            Ok(())
        } else {
            Err(Error::WrongFileState {
                name: name.to_string(),
                observed: state.label().to_string(),
            })
        }
    }

    /// Creates `name` in `state` with `len` zero bytes preallocated.
    pub fn create_file(&self, name: &str, state: &FileState, len: u64) -> Result<(), Error> {
        self.accepted_state(state, name)?;
        let lock = self.store.entry_lock(name);
        let _guard = lock.write();

        match self.find(name) {
            Ok(_) => {
                return Err(Error::FileExists {
                    name: name.to_string(),
                })
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let path = state.path_for(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(len)?;
        drop(_guard);

        self.store.touch_capped(state, name);
        Ok(())
    }

    /// Opens `name` for reading.
    pub fn get_file_reader(&self, name: &str) -> Result<fs::File, Error> {
        let lock = self.store.entry_lock(name);
        let _guard = lock.read();
        let (state, path) = self.find(name)?;
        let file = fs::File::open(path)?;
        drop(_guard);
        self.store.promote_capped(&state, name);
        Ok(file)
    }

    /// Opens `name` for reading and writing.
    pub fn get_file_read_writer(&self, name: &str) -> Result<fs::File, Error> {
        let lock = self.store.entry_lock(name);
        let _guard = lock.read();
        let (_, path) = self.find(name)?;
        Ok(fs::OpenOptions::new().read(true).write(true).open(path)?)
    }

    pub fn get_file_stat(&self, name: &str) -> Result<fs::Metadata, Error> {
        let lock = self.store.entry_lock(name);
        let _guard = lock.read();
        let (_, path) = self.find(name)?;
        Ok(fs::metadata(path)?)
    }

    /// Moves `name` to `to`. Movable metadata records follow; non-movable
    /// ones are dropped. Moving a file onto itself is a no-op.
    pub fn move_file(&self, name: &str, to: &FileState) -> Result<(), Error> {
        self.accepted_state(to, name)?;
        let lock = self.store.entry_lock(name);
        let guard = lock.write();

        let (from_state, from_path) = self.find(name)?;
        if from_state == *to {
            return Ok(());
        }

        let to_path = to.path_for(name)?;
        if to_path.is_file() {
            return Err(Error::FileExists {
                name: name.to_string(),
            });
        }

        let mut carried = Vec::new();
        for kind in MetadataKind::ALL {
            let sidecar = sidecar_path(&from_path, kind);
            if kind.movable() {
                match fs::read(&sidecar) {
                    Ok(raw) => carried.push((kind, raw)),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&from_path, &to_path)?;
        for (kind, raw) in carried {
            fs::write(sidecar_path(&to_path, kind), raw)?;
        }
        for kind in MetadataKind::ALL {
            remove_ignoring_missing(&sidecar_path(&from_path, kind))?;
        }
        drop(guard);

        self.store.forget_capped(&from_state, name);
        self.store.touch_capped(to, name);
        Ok(())
    }

    /// Imports the file at `source` as `name` in state `to`. `source` must
    /// live on the same filesystem; the import is an atomic rename.
    pub fn move_file_from(&self, name: &str, to: &FileState, source: &Path) -> Result<(), Error> {
        self.accepted_state(to, name)?;
        let lock = self.store.entry_lock(name);
        let guard = lock.write();

        for state in &self.store.states {
            if state.path_for(name)?.is_file() {
                return Err(Error::FileExists {
                    name: name.to_string(),
                });
            }
        }

        let to_path = to.path_for(name)?;
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(source, &to_path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                Error::FileNotFound {
                    name: source.display().to_string(),
                }
            } else {
                Error::Io(err)
            }
        })?;
        drop(guard);

        self.store.touch_capped(to, name);
        Ok(())
    }

    /// Deletes `name` and all its metadata. Blocked by a persist pin.
    pub fn delete_file(&self, name: &str) -> Result<(), Error> {
        let lock = self.store.entry_lock(name);
        let guard = lock.write();

        let (state, path) = self.find(name)?;
        match fs::read(sidecar_path(&path, MetadataKind::Persist)) {
            Ok(raw) if decode_persist(&raw) => {
                return Err(Error::FilePersisted {
                    name: name.to_string(),
                })
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        fs::remove_file(&path)?;
        for kind in MetadataKind::ALL {
            remove_ignoring_missing(&sidecar_path(&path, kind))?;
        }
        drop(guard);

        self.store.forget_capped(&state, name);
        self.store.drop_entry(name);
        Ok(())
    }

    /// All file names present in the accepted states. Metadata sidecars are
    /// not listed.
    pub fn list_names(&self) -> Result<Vec<String>, Error> {
        let mut names = Vec::new();
        for state in &self.accepted {
            let mut stack = vec![state.directory().to_path_buf()];
            while let Some(dir) = stack.pop() {
                let entries = match fs::read_dir(&dir) {
                    Ok(entries) => entries,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                    Err(err) => return Err(err.into()),
                };
                for entry in entries {
                    let entry = entry?;
                    let file_type = fs::metadata(entry.path())?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if file_type.is_dir() {
                        stack.push(entry.path());
                    } else if !name.contains('.') {
                        names.push(name);
                    }
                }
            }
        }
        Ok(names)
    }

    /// Reads a metadata record. A missing record is `None`; a missing blob
    /// is an error.
    pub fn get_file_metadata(
        &self,
        name: &str,
        kind: MetadataKind,
    ) -> Result<Option<Vec<u8>>, Error> {
        let lock = self.store.entry_lock(name);
        let _guard = lock.read();
        let (_, path) = self.find(name)?;
        match fs::read(sidecar_path(&path, kind)) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes a metadata record. Returns whether the stored bytes changed.
    pub fn set_file_metadata(
        &self,
        name: &str,
        kind: MetadataKind,
        data: &[u8],
    ) -> Result<bool, Error> {
        let lock = self.store.entry_lock(name);
        let _guard = lock.write();
        let (_, path) = self.find(name)?;
        let sidecar = sidecar_path(&path, kind);
        match fs::read(&sidecar) {
            Ok(existing) if existing == data => return Ok(false),
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::write(&sidecar, data)?;
        Ok(true)
    }

    /// Writes `data` into the record at `offset`, extending it if needed.
    pub fn set_file_metadata_at(
        &self,
        name: &str,
        kind: MetadataKind,
        data: &[u8],
        offset: u64,
    ) -> Result<usize, Error> {
        use std::io::{Seek, SeekFrom, Write};

        let lock = self.store.entry_lock(name);
        let _guard = lock.write();
        let (_, path) = self.find(name)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(sidecar_path(&path, kind))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(data.len())
    }

    /// Returns the existing record, or stores `data` and returns it.
    pub fn get_or_set_file_metadata(
        &self,
        name: &str,
        kind: MetadataKind,
        data: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let lock = self.store.entry_lock(name);
        let _guard = lock.write();
        let (_, path) = self.find(name)?;
        let sidecar = sidecar_path(&path, kind);
        match fs::read(&sidecar) {
            Ok(existing) => Ok(existing),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                fs::write(&sidecar, data)?;
                Ok(data.to_vec())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes a metadata record. Deleting a missing record, or a record of
    /// a missing blob, succeeds.
    pub fn delete_file_metadata(&self, name: &str, kind: MetadataKind) -> Result<(), Error> {
        let lock = self.store.entry_lock(name);
        let _guard = lock.write();
        let (_, path) = match self.find(name) {
            Ok(found) => found,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        remove_ignoring_missing(&sidecar_path(&path, kind))
    }

    /// Calls `f` with every metadata record present for `name`.
    pub fn range_file_metadata(
        &self,
        name: &str,
        mut f: impl FnMut(MetadataKind, Vec<u8>) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let lock = self.store.entry_lock(name);
        let _guard = lock.read();
        let (_, path) = self.find(name)?;
        for kind in MetadataKind::ALL {
            match fs::read(sidecar_path(&path, kind)) {
                Ok(raw) => f(kind, raw)?,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

fn sidecar_path(path: &Path, kind: MetadataKind) -> PathBuf {
    let mut file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    file_name.push_str(kind.suffix());
    path.with_file_name(file_name)
}

fn remove_ignoring_missing(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

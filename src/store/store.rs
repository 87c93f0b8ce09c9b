use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::{AtomicBool, Ordering};

use rocksdb::{Direction, IteratorMode, Options, DB};
use thiserror::Error;

use crate::store::cursor::Cursor;

const MAX_OPEN_FILES: i32 = 1000;
const KEEP_LOG_FILES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Open,
    Get,
    Put,
    Remove,
    Iterate,
    Sync,
    Compact,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreOp::Open => "open",
            StoreOp::Get => "get",
            StoreOp::Put => "put",
            StoreOp::Remove => "remove",
            StoreOp::Iterate => "iterate",
            StoreOp::Sync => "sync",
            StoreOp::Compact => "compact",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage engine error during {op} (key: {key:?}): {source}")]
    Engine {
        op: StoreOp,
        key: Option<String>,
        #[source]
        source: rocksdb::Error,
    },
    #[error("IO error during {op} (key: {key:?}): {source}")]
    Io {
        op: StoreOp,
        key: Option<String>,
        #[source]
        source: io::Error,
    },
    #[error("Stored key is not valid UTF-8: {0:?}")]
    InvalidKey(Vec<u8>),
    #[error("A traversal over {0} is already in progress")]
    TraversalInProgress(PathBuf),
}

impl StoreError {
    pub(crate) fn engine(op: StoreOp, key: Option<&str>, source: rocksdb::Error) -> Self {
        StoreError::Engine {
            op,
            key: key.map(str::to_string),
            source,
        }
    }

    pub(crate) fn io(op: StoreOp, key: Option<&str>, source: io::Error) -> Self {
        StoreError::Io {
            op,
            key: key.map(str::to_string),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub live_entries: usize,
    /// Size of the engine's table files on disk.
    pub disk_bytes: u64,
}

fn db_options() -> Options {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.set_max_open_files(MAX_OPEN_FILES);
    opts.set_keep_log_file_num(KEEP_LOG_FILES);
    opts
}

/// A durable, string-keyed store of opaque byte values backed by RocksDB.
///
/// Single traversal at a time; see [`ObjectStore::cursor`].
pub struct ObjectStore {
    root: PathBuf,
    db: DB,
    pub(crate) traversing: AtomicBool,
    #[cfg(test)]
    writes_before_failure: AtomicUsize,
}

impl fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl ObjectStore {
    /// Opens the store rooted at `root`.
    ///
    /// With `fresh` any existing data at `root` is discarded first; otherwise
    /// the existing database is opened (and created if absent).
    pub fn open(root: impl AsRef<Path>, fresh: bool) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        let io_err = |source: io::Error| StoreError::io(StoreOp::Open, None, source);

        if fresh && root.exists() {
            fs::remove_dir_all(&root).map_err(io_err)?;
        }
        fs::create_dir_all(&root).map_err(io_err)?;

        let db = DB::open(&db_options(), &root).map_err(|source| {
            tracing::error!(path = %root.display(), error = %source, "failed to open object store");
            StoreError::engine(StoreOp::Open, None, source)
        })?;

        tracing::debug!(path = %root.display(), fresh, "opened object store");

        Ok(ObjectStore {
            root,
            db,
            traversing: AtomicBool::new(false),
            #[cfg(test)]
            writes_before_failure: AtomicUsize::new(usize::MAX),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.db
            .get(key.as_bytes())
            .map_err(|source| StoreError::engine(StoreOp::Get, Some(key), source))
    }

    pub fn contains_key(&self, key: &str) -> Result<bool, StoreError> {
        let value = self
            .db
            .get_pinned(key.as_bytes())
            .map_err(|source| StoreError::engine(StoreOp::Get, Some(key), source))?;
        Ok(value.is_some())
    }

    /// Inserts or replaces the value for `key`.
    ///
    /// The write goes through the engine's write-ahead log, so it survives a
    /// process crash once this returns; [`sync`](Self::sync) makes it survive
    /// a machine crash.
    pub fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        #[cfg(test)]
        self.injected_failure(StoreOp::Put, key)?;

        self.db
            .put(key.as_bytes(), value)
            .map_err(|source| StoreError::engine(StoreOp::Put, Some(key), source))
    }

    /// Deletes `key`. Returns whether it was present.
    ///
    /// The presence check and the delete are separate engine calls, so the
    /// answer is exact only while writers of the same key are serialized.
    pub fn remove(&self, key: &str) -> Result<bool, StoreError> {
        #[cfg(test)]
        self.injected_failure(StoreOp::Remove, key)?;

        if !self.contains_key(key)? {
            return Ok(false);
        }
        self.db
            .delete(key.as_bytes())
            .map_err(|source| StoreError::engine(StoreOp::Remove, Some(key), source))?;
        Ok(true)
    }

    fn entries_with_prefix<'s>(
        &'s self,
        prefix: &'s str,
    ) -> impl Iterator<Item = Result<(String, Box<[u8]>), StoreError>> + 's {
        self.db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward))
            .map(|item| {
                let (key, value) =
                    item.map_err(|source| StoreError::engine(StoreOp::Iterate, None, source))?;
                let key = String::from_utf8(key.into_vec())
                    .map_err(|e| StoreError::InvalidKey(e.into_bytes()))?;
                Ok((key, value))
            })
            .take_while(move |item| match item {
                Ok((key, _)) => key.starts_with(prefix),
                Err(_) => true,
            })
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        self.entries_with_prefix("")
            .try_fold(0, |n, item| item.map(|_| n + 1))
    }

    /// Engine estimate of the number of live keys, without a scan.
    pub fn estimated_len(&self) -> Result<u64, StoreError> {
        let estimate = self
            .db
            .property_int_value("rocksdb.estimate-num-keys")
            .map_err(|source| StoreError::engine(StoreOp::Get, None, source))?;
        Ok(estimate.unwrap_or(0))
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.entries_with_prefix("").next().transpose()?.is_none())
    }

    /// Keys starting with `prefix`, in key order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.entries_with_prefix(prefix)
            .map(|item| item.map(|(key, _)| key))
            .collect()
    }

    /// Entries whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.entries_with_prefix(prefix)
            .map(|item| item.map(|(key, value)| (key, value.into_vec())))
            .collect()
    }

    /// Starts a traversal over every entry live right now.
    ///
    /// The cursor owns a snapshot of the keys, so [`Cursor::remove_current`]
    /// and `put` on any key are safe mid-traversal. Only one cursor may be
    /// alive per store.
    pub fn cursor(&self) -> Result<Cursor<'_>, StoreError> {
        if self
            .traversing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StoreError::TraversalInProgress(self.root.clone()));
        }

        match self.keys_with_prefix("") {
            Ok(keys) => Ok(Cursor::new(self, keys)),
            Err(e) => {
                self.traversing.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Forces the write-ahead log and memtables to stable storage.
    pub fn sync(&self) -> Result<(), StoreError> {
        let engine_err = |source: rocksdb::Error| StoreError::engine(StoreOp::Sync, None, source);
        self.db.flush_wal(true).map_err(engine_err)?;
        self.db.flush().map_err(engine_err)
    }

    /// Flushes and compacts the whole key range, purging removed entries.
    pub fn compact(&self) -> Result<StoreStats, StoreError> {
        self.db
            .flush()
            .map_err(|source| StoreError::engine(StoreOp::Compact, None, source))?;
        self.db.compact_range(None::<&[u8]>, None::<&[u8]>);

        let stats = self.stats()?;
        tracing::debug!(
            path = %self.root.display(),
            live_entries = stats.live_entries,
            disk_bytes = stats.disk_bytes,
            "compacted object store"
        );
        Ok(stats)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let disk_bytes = self
            .db
            .property_int_value("rocksdb.total-sst-files-size")
            .map_err(|source| StoreError::engine(StoreOp::Get, None, source))?
            .unwrap_or(0);
        Ok(StoreStats {
            live_entries: self.len()?,
            disk_bytes,
        })
    }

    /// Lets the next `allowed` writes through, then refuses every write.
    #[cfg(test)]
    pub(crate) fn fail_writes_after(&self, allowed: usize) {
        self.writes_before_failure.store(allowed, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn stop_failing_writes(&self) {
        self.writes_before_failure.store(usize::MAX, Ordering::Release);
    }

    #[cfg(test)]
    fn injected_failure(&self, op: StoreOp, key: &str) -> Result<(), StoreError> {
        match self.writes_before_failure.load(Ordering::Acquire) {
            usize::MAX => Ok(()),
            0 => Err(StoreError::io(
                op,
                Some(key),
                io::Error::new(io::ErrorKind::Other, "write refused"),
            )),
            left => {
                self.writes_before_failure.store(left - 1, Ordering::Release);
                Ok(())
            }
        }
    }
}

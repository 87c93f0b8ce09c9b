use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::index::manifest::{
    FinalizeRecord, FinalizeStats, IndexConfig, IndexManifest, PruneConfig, PruneStats,
    FORMAT_VERSION,
};
use crate::record::{
    AssociationRecord, DescriptionRecord, InnerKey, PrunedCounts, RecordError, ResolutionRecord,
};
use crate::store::{ObjectStore, StoreError};
use crate::types::identifiers::{
    Language, LanguageError, NormalizedPhrase, PageId, PhraseNormalizer, KEY_SEPARATOR,
};
use crate::types::observation::{LoadStats, Observation};

pub const DESCRIBE_DIR: &str = "describe";
pub const RESOLVE_DIR: &str = "resolve";

const PROGRESS_INTERVAL: u64 = 1_000_000;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Count must be positive, got {0}")]
    NonPositiveCount(u64),
    #[error("Significance threshold must be within [0, 1], got {0}")]
    InvalidSignificance(f64),
    #[error("Lock shard count must be positive")]
    NoLockShards,
    #[error("Phrase {0:?} is empty after normalization")]
    BlankPhrase(String),
    #[error(transparent)]
    Language(#[from] LanguageError),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("Record error: {0}")]
    Record(#[from] RecordError),
    #[error("Index is not finalized yet; call freeze_and_prune first")]
    NotFinalized,
    #[error("Index is finalized and closed for writes")]
    Finalized,
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Stored record {key:?} could not be decoded: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Index at {path} was built with a different phrase normalizer: {stored:?}")]
    NormalizerMismatch {
        path: PathBuf,
        stored: PhraseNormalizer,
    },
    #[error("Unsupported index format version: {0}")]
    UnsupportedFormat(String),
    #[error("Write of {key:?} failed ({write_error}); its rollback failed: {rollback_error}")]
    RollbackFailed {
        key: String,
        write_error: StoreError,
        rollback_error: StoreError,
    },
    #[error("Index lock poisoned")]
    Poisoned,
    #[error("Finalize worker panicked")]
    WorkerPanicked,
}

/// Mutexes serializing the read-modify-write of records that hash to the same shard.
struct ShardLocks {
    shards: Vec<Mutex<()>>,
}

impl ShardLocks {
    fn new(count: usize) -> Self {
        Self {
            shards: (0..count).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock(&self, key: &str) -> Result<MutexGuard<'_, ()>, IndexError> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let shard = (hasher.finish() % self.shards.len() as u64) as usize;
        self.shards[shard].lock().map_err(|_| IndexError::Poisoned)
    }
}

fn store_key<K: InnerKey>(lang: &Language, key: &K) -> String {
    format!("{}{}{}", lang, KEY_SEPARATOR, key.key_fragment())
}

fn lang_prefix(lang: &Language) -> String {
    format!("{}{}", lang, KEY_SEPARATOR)
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, IndexError> {
    serde_json::from_slice(bytes).map_err(|source| IndexError::Decode {
        key: key.to_string(),
        source,
    })
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, IndexError> {
    Ok(serde_json::to_vec(value)?)
}

fn ranked<K: Ord + Clone>(counts: &PrunedCounts<K>, max: usize) -> Vec<(K, f64)> {
    let total = counts.total();
    counts
        .iter()
        .take(max)
        .map(|(key, count)| {
            let share = if total == 0 { 0.0 } else { count as f64 / total as f64 };
            (key.clone(), share)
        })
        .collect()
}

/// Freezes, filters and prunes every record in `store`; records left empty are removed.
fn freeze_store<K: InnerKey>(
    store: &ObjectStore,
    max_size: usize,
    prune: &PruneConfig,
) -> Result<PruneStats, IndexError> {
    let mut stats = PruneStats::default();
    let mut cursor = store.cursor()?;

    while let Some(item) = cursor.next() {
        let (key, bytes) = item?;
        let mut record: AssociationRecord<K> = decode(&key, &bytes)?;

        let before = record.freeze().len();
        // Significance is judged against the full record, before size pruning.
        let keep = record
            .significant_len(prune.min_count, prune.min_significance)?
            .min(max_size);
        record.prune(keep)?;

        stats.entries_kept += keep as u64;
        stats.entries_dropped += (before - keep) as u64;

        if record.is_empty() {
            cursor.remove_current()?;
            stats.records_removed += 1;
        } else {
            store.put(&key, encode(&record)?)?;
            stats.records_kept += 1;
        }
    }

    Ok(stats)
}

/// Persistent phrase–page association index.
///
/// Two stores back it: `describe/` maps `<lang>:<page>` to the phrases
/// pointing at that page, `resolve/` maps `<lang>:<phrase>` to the pages a
/// phrase points at. Observations accumulate through [`add`](Self::add)
/// until [`freeze_and_prune`](Self::freeze_and_prune), after which the index
/// is read-only.
pub struct PhraseIndex {
    root: PathBuf,
    config: IndexConfig,
    // Shared by adders and readers; taken exclusively by freeze_and_prune.
    phase: RwLock<IndexManifest>,
    describe: ObjectStore,
    resolve: ObjectStore,
    describe_locks: ShardLocks,
    resolve_locks: ShardLocks,
}

impl PhraseIndex {
    /// Opens the index at `root`.
    ///
    /// `fresh` discards anything already there. Otherwise an existing index
    /// is reopened (it must have been built with `config.normalizer`) or a
    /// new one is created.
    pub fn open(
        root: impl AsRef<Path>,
        config: IndexConfig,
        fresh: bool,
    ) -> Result<Self, IndexError> {
        if config.lock_shards == 0 {
            return Err(ValidationError::NoLockShards.into());
        }
        let root = root.as_ref().to_path_buf();

        if fresh && root.exists() {
            fs::remove_dir_all(&root)?;
        }
        fs::create_dir_all(&root)?;

        let manifest = match IndexManifest::read(&root)? {
            Some(manifest) => {
                if manifest.format_version != FORMAT_VERSION {
                    return Err(IndexError::UnsupportedFormat(manifest.format_version));
                }
                if manifest.normalizer != config.normalizer {
                    return Err(IndexError::NormalizerMismatch {
                        path: root,
                        stored: manifest.normalizer,
                    });
                }
                manifest
            }
            None => {
                let manifest = IndexManifest::new(config.normalizer);
                manifest.write(&root)?;
                manifest
            }
        };

        let describe = ObjectStore::open(root.join(DESCRIBE_DIR), fresh)?;
        let resolve = ObjectStore::open(root.join(RESOLVE_DIR), fresh)?;

        tracing::info!(
            path = %root.display(),
            fresh,
            finalized = manifest.finalized.is_some(),
            pages = describe.estimated_len()?,
            phrases = resolve.estimated_len()?,
            "opened phrase index"
        );

        Ok(PhraseIndex {
            describe_locks: ShardLocks::new(config.lock_shards),
            resolve_locks: ShardLocks::new(config.lock_shards),
            root,
            config,
            phase: RwLock::new(manifest),
            describe,
            resolve,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn normalize(&self, phrase: &str) -> NormalizedPhrase {
        self.config.normalizer.normalize(phrase)
    }

    fn read_phase(&self) -> Result<RwLockReadGuard<'_, IndexManifest>, IndexError> {
        self.phase.read().map_err(|_| IndexError::Poisoned)
    }

    fn write_phase(&self) -> Result<RwLockWriteGuard<'_, IndexManifest>, IndexError> {
        self.phase.write().map_err(|_| IndexError::Poisoned)
    }

    pub fn is_finalized(&self) -> Result<bool, IndexError> {
        Ok(self.read_phase()?.finalized.is_some())
    }

    /// Config and statistics of the finalize pass, if it ran.
    pub fn finalize_record(&self) -> Result<Option<FinalizeRecord>, IndexError> {
        Ok(self.read_phase()?.finalized.clone())
    }

    /// Records that `phrase` pointed at `page` `count` times.
    ///
    /// Merges into the description record of `(lang, page)` and the
    /// resolution record of `(lang, normalize(phrase))`. If the second write
    /// fails the first is rolled back. Not idempotent: retrying a call that
    /// succeeded counts it twice. Phrases that normalize to nothing are
    /// rejected.
    pub fn add(
        &self,
        lang: &Language,
        page: PageId,
        phrase: &str,
        count: u64,
    ) -> Result<(), IndexError> {
        let normalized = self.normalize(phrase);
        if normalized.is_empty() {
            return Err(ValidationError::BlankPhrase(phrase.to_string()).into());
        }
        self.add_normalized(lang, page, normalized, count)
    }

    fn add_normalized(
        &self,
        lang: &Language,
        page: PageId,
        phrase: NormalizedPhrase,
        count: u64,
    ) -> Result<(), IndexError> {
        if count == 0 {
            return Err(ValidationError::NonPositiveCount(count).into());
        }
        let phase = self.read_phase()?;
        if phase.finalized.is_some() {
            return Err(IndexError::Finalized);
        }

        let describe_key = store_key(lang, &page);
        let resolve_key = store_key(lang, &phrase);

        // Always describe before resolve, so two adders cannot deadlock.
        let _describe_guard = self.describe_locks.lock(&describe_key)?;
        let _resolve_guard = self.resolve_locks.lock(&resolve_key)?;

        let previous = self.describe.get(&describe_key)?;
        let mut description: DescriptionRecord = match &previous {
            Some(bytes) => decode(&describe_key, bytes)?,
            None => DescriptionRecord::new(),
        };
        description.add(phrase, count)?;

        let mut resolution: ResolutionRecord = match self.resolve.get(&resolve_key)? {
            Some(bytes) => decode(&resolve_key, &bytes)?,
            None => ResolutionRecord::new(),
        };
        resolution.add(page, count)?;

        let description_bytes = encode(&description)?;
        let resolution_bytes = encode(&resolution)?;

        self.describe.put(&describe_key, description_bytes)?;
        if let Err(write_error) = self.resolve.put(&resolve_key, resolution_bytes) {
            let rollback = match previous {
                Some(bytes) => self.describe.put(&describe_key, bytes),
                None => self.describe.remove(&describe_key).map(|_| ()),
            };
            return Err(match rollback {
                Ok(()) => write_error.into(),
                Err(rollback_error) => IndexError::RollbackFailed {
                    key: describe_key,
                    write_error,
                    rollback_error,
                },
            });
        }

        drop(phase);
        Ok(())
    }

    /// Adds every observation, skipping phrases that normalize to nothing.
    pub fn load<I>(&self, observations: I) -> Result<LoadStats, IndexError>
    where
        I: IntoIterator<Item = Observation>,
    {
        let mut stats = LoadStats::default();

        for observation in observations {
            stats.observations += 1;
            if stats.observations % PROGRESS_INTERVAL == 0 {
                tracing::info!(
                    observations = stats.observations,
                    retained = stats.retained,
                    percent = stats.retained_percent(),
                    "loading observations"
                );
            }

            let phrase = self.normalize(&observation.phrase);
            if phrase.is_empty() {
                stats.skipped_blank += 1;
                continue;
            }
            self.add_normalized(
                &observation.language,
                observation.page,
                phrase,
                observation.count,
            )?;
            stats.retained += 1;
        }

        tracing::info!(
            observations = stats.observations,
            retained = stats.retained,
            skipped_blank = stats.skipped_blank,
            "finished loading observations"
        );
        Ok(stats)
    }

    /// Freezes every record, drops insignificant entries, then prunes to size.
    ///
    /// Runs exclusively of `add`. The two stores are processed in parallel.
    /// Afterwards the stores are compacted and the index is read-only.
    pub fn freeze_and_prune(&self, prune: PruneConfig) -> Result<FinalizeStats, IndexError> {
        let significance = prune.min_significance;
        if !significance.is_finite() || !(0.0..=1.0).contains(&significance) {
            return Err(ValidationError::InvalidSignificance(significance).into());
        }

        let mut manifest = self.write_phase()?;
        if manifest.finalized.is_some() {
            return Err(IndexError::Finalized);
        }

        tracing::info!(
            path = %self.root.display(),
            max_resolution_size = prune.max_resolution_size,
            max_description_size = prune.max_description_size,
            min_significance = prune.min_significance,
            min_count = prune.min_count,
            "freezing and pruning phrase index"
        );

        let (resolution, description) = std::thread::scope(|scope| {
            let resolution = scope.spawn(|| {
                freeze_store::<PageId>(&self.resolve, prune.max_resolution_size, &prune)
            });
            let description = freeze_store::<NormalizedPhrase>(
                &self.describe,
                prune.max_description_size,
                &prune,
            );
            let resolution = resolution.join().map_err(|_| IndexError::WorkerPanicked);
            (resolution, description)
        });
        let stats = FinalizeStats {
            resolution: resolution??,
            description: description?,
        };

        let resolve_stats = self.resolve.compact()?;
        let describe_stats = self.describe.compact()?;
        self.sync()?;

        let mut updated = manifest.clone();
        updated.finalized = Some(FinalizeRecord {
            prune,
            finalized_at: Utc::now(),
            stats,
        });
        updated.write(&self.root)?;
        *manifest = updated;

        tracing::info!(
            phrases_kept = stats.resolution.records_kept,
            phrases_removed = stats.resolution.records_removed,
            pages_kept = stats.description.records_kept,
            pages_removed = stats.description.records_removed,
            resolve_disk_bytes = resolve_stats.disk_bytes,
            describe_disk_bytes = describe_stats.disk_bytes,
            "phrase index finalized"
        );
        Ok(stats)
    }

    fn ensure_finalized(&self) -> Result<(), IndexError> {
        if self.read_phase()?.finalized.is_none() {
            return Err(IndexError::NotFinalized);
        }
        Ok(())
    }

    fn read_counts<K: InnerKey>(
        &self,
        store: &ObjectStore,
        key: &str,
    ) -> Result<Option<PrunedCounts<K>>, IndexError> {
        match store.get(key)? {
            Some(bytes) => {
                let record: AssociationRecord<K> = decode(key, &bytes)?;
                Ok(Some(record.into_pruned_counts(self.config.normalizer)?))
            }
            None => Ok(None),
        }
    }

    /// Phrases describing `page`, most frequent first.
    pub fn get_page_counts(
        &self,
        lang: &Language,
        page: PageId,
    ) -> Result<Option<PrunedCounts<NormalizedPhrase>>, IndexError> {
        self.ensure_finalized()?;
        self.read_counts(&self.describe, &store_key(lang, &page))
    }

    /// Pages `phrase` resolves to, most frequent first.
    pub fn get_phrase_counts(
        &self,
        lang: &Language,
        phrase: &str,
    ) -> Result<Option<PrunedCounts<PageId>>, IndexError> {
        self.ensure_finalized()?;
        let phrase = self.normalize(phrase);
        self.read_counts(&self.resolve, &store_key(lang, &phrase))
    }

    /// Up to `max` phrases for `page` with their share of the page's total.
    pub fn describe(
        &self,
        lang: &Language,
        page: PageId,
        max: usize,
    ) -> Result<Option<Vec<(NormalizedPhrase, f64)>>, IndexError> {
        Ok(self
            .get_page_counts(lang, page)?
            .map(|counts| ranked(&counts, max)))
    }

    /// Up to `max` pages for `phrase` with their share of the phrase's total.
    pub fn resolve(
        &self,
        lang: &Language,
        phrase: &str,
        max: usize,
    ) -> Result<Option<Vec<(PageId, f64)>>, IndexError> {
        Ok(self
            .get_phrase_counts(lang, phrase)?
            .map(|counts| ranked(&counts, max)))
    }

    /// Every phrase indexed for `lang`, in lexical order.
    pub fn all_phrases(&self, lang: &Language) -> Result<Vec<NormalizedPhrase>, IndexError> {
        self.ensure_finalized()?;
        let prefix = lang_prefix(lang);
        Ok(self
            .resolve
            .keys_with_prefix(&prefix)?
            .iter()
            .map(|key| NormalizedPhrase::from_stored(&key[prefix.len()..]))
            .collect())
    }

    /// Every phrase indexed for `lang` with its page counts, in lexical order.
    pub fn all_phrase_counts(
        &self,
        lang: &Language,
    ) -> Result<Vec<(NormalizedPhrase, PrunedCounts<PageId>)>, IndexError> {
        self.ensure_finalized()?;
        let prefix = lang_prefix(lang);
        self.resolve
            .scan_prefix(&prefix)?
            .into_iter()
            .map(|(key, bytes)| -> Result<_, IndexError> {
                let record: ResolutionRecord = decode(&key, &bytes)?;
                let phrase = NormalizedPhrase::from_stored(&key[prefix.len()..]);
                Ok((phrase, record.into_pruned_counts(self.config.normalizer)?))
            })
            .collect()
    }

    /// Forces both stores to stable storage.
    pub fn sync(&self) -> Result<(), IndexError> {
        self.describe.sync()?;
        self.resolve.sync()?;
        Ok(())
    }
}

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::identifiers::PhraseNormalizer;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const FORMAT_VERSION: &str = "1";

/// Settings an index is opened with.
///
/// Only the normalizer is persisted: it decides which phrases share a key, so
/// an index reopens only under the rule it was built with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub normalizer: PhraseNormalizer,
    /// Lock shards per store used to serialize same-key merges.
    pub lock_shards: usize,
}

impl IndexConfig {
    pub fn v0() -> Self {
        Self {
            normalizer: PhraseNormalizer::default(),
            lock_shards: 64,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self::v0()
    }
}

/// Limits applied by `freeze_and_prune`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PruneConfig {
    /// Pages kept per phrase.
    pub max_resolution_size: usize,
    /// Phrases kept per page.
    pub max_description_size: usize,
    /// Entries below this fraction of their record's total are dropped. `0.0` disables.
    pub min_significance: f64,
    /// Entries below this absolute count are dropped. `0` disables.
    pub min_count: u64,
}

impl PruneConfig {
    pub fn new(
        max_resolution_size: usize,
        max_description_size: usize,
        min_significance: f64,
    ) -> Self {
        Self {
            max_resolution_size,
            max_description_size,
            min_significance,
            min_count: 0,
        }
    }

    pub fn with_min_count(mut self, min_count: u64) -> Self {
        self.min_count = min_count;
        self
    }
}

/// Outcome of one store's freeze pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneStats {
    pub records_kept: u64,
    pub records_removed: u64,
    pub entries_kept: u64,
    pub entries_dropped: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeStats {
    pub resolution: PruneStats,
    pub description: PruneStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeRecord {
    pub prune: PruneConfig,
    pub finalized_at: DateTime<Utc>, // informational only
    pub stats: FinalizeStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub format_version: String,
    pub normalizer: PhraseNormalizer,
    pub created_at: DateTime<Utc>, // informational only
    pub finalized: Option<FinalizeRecord>,
}

impl IndexManifest {
    pub fn new(normalizer: PhraseNormalizer) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            normalizer,
            created_at: Utc::now(),
            finalized: None,
        }
    }

    pub fn read(root: &Path) -> Result<Option<Self>, std::io::Error> {
        let path = root.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let f = fs::File::open(&path)?;
        let manifest = serde_json::from_reader(f)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Some(manifest))
    }

    /// Writes the manifest next to a temp copy and renames it into place.
    pub fn write(&self, root: &Path) -> Result<(), std::io::Error> {
        let path = root.join(MANIFEST_FILE);
        let temp_path = path.with_extension("json.tmp");

        let f = fs::File::create(&temp_path)?;
        serde_json::to_writer_pretty(&f, self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        f.sync_all()?;

        fs::rename(&temp_path, &path)
    }
}

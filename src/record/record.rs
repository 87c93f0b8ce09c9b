use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::pruned::PrunedCounts;
use crate::types::identifiers::{NormalizedPhrase, PageId, PhraseNormalizer};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("Count must be positive, got {0}")]
    NonPositiveCount(u64),
    #[error("Record is frozen and no longer accepts additions")]
    AlreadyFrozen,
    #[error("Record must be frozen before {0}")]
    NotFrozen(&'static str),
    #[error("Count overflow while merging")]
    CountOverflow,
    #[error("Invalid significance threshold: {0}")]
    InvalidSignificance(f64),
}

/// Inner key of an association record.
pub trait InnerKey: Ord + Clone + Debug + Serialize + DeserializeOwned {
    /// Borrowed form callers look entries up with.
    type Query: ?Sized + Ord + ToOwned;

    /// Text used for this key inside a composite store key.
    fn key_fragment(&self) -> String;

    /// Maps a lookup argument onto the form keys are stored in.
    fn canonical<'q>(query: &'q Self::Query, normalizer: &PhraseNormalizer)
        -> Cow<'q, Self::Query>;
}

impl InnerKey for PageId {
    type Query = u32;

    fn key_fragment(&self) -> String {
        self.to_string()
    }

    fn canonical<'q>(query: &'q u32, _normalizer: &PhraseNormalizer) -> Cow<'q, u32> {
        Cow::Borrowed(query)
    }
}

impl InnerKey for NormalizedPhrase {
    type Query = str;

    fn key_fragment(&self) -> String {
        self.as_str().to_string()
    }

    fn canonical<'q>(query: &'q str, normalizer: &PhraseNormalizer) -> Cow<'q, str> {
        Cow::Owned(normalizer.normalize(query).into_string())
    }
}

/// Phrase → pages, keyed by page.
pub type ResolutionRecord = AssociationRecord<PageId>;
/// Page → phrases, keyed by normalized phrase.
pub type DescriptionRecord = AssociationRecord<NormalizedPhrase>;

#[derive(Debug, Clone, PartialEq)]
enum RecordState<K> {
    Unfrozen { counts: BTreeMap<K, u64>, total: u64 },
    Frozen { entries: Vec<(K, u64)>, total: u64 },
}

/// A multiset of `(key, count)` pairs.
///
/// Accumulates by summation until [`freeze`](Self::freeze), after which it
/// is an ordered sequence (count descending, key ascending on ties) that can
/// only shrink through pruning. `total` is fixed at freeze time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    into = "StoredRecord<K>",
    try_from = "StoredRecord<K>",
    bound(serialize = "K: InnerKey", deserialize = "K: InnerKey")
)]
pub struct AssociationRecord<K: InnerKey> {
    state: RecordState<K>,
}

/// On-disk shape of a record. Entries are in frozen order once frozen.
#[derive(Serialize, Deserialize)]
struct StoredRecord<K> {
    frozen: bool,
    total: u64,
    entries: Vec<(K, u64)>,
}

impl<K: InnerKey> From<AssociationRecord<K>> for StoredRecord<K> {
    fn from(record: AssociationRecord<K>) -> Self {
        match record.state {
            RecordState::Unfrozen { counts, total } => StoredRecord {
                frozen: false,
                total,
                entries: counts.into_iter().collect(),
            },
            RecordState::Frozen { entries, total } => StoredRecord {
                frozen: true,
                total,
                entries,
            },
        }
    }
}

impl<K: InnerKey> TryFrom<StoredRecord<K>> for AssociationRecord<K> {
    type Error = RecordError;

    fn try_from(stored: StoredRecord<K>) -> Result<Self, RecordError> {
        if stored.frozen {
            return Ok(AssociationRecord {
                state: RecordState::Frozen {
                    entries: stored.entries,
                    total: stored.total,
                },
            });
        }
        let mut record = AssociationRecord::new();
        for (key, count) in stored.entries {
            record.add(key, count)?;
        }
        Ok(record)
    }
}

impl<K: InnerKey> Default for AssociationRecord<K> {
    fn default() -> Self {
        Self::new()
    }
}

fn frozen_order<K: Ord>(a: &(K, u64), b: &(K, u64)) -> Ordering {
    b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0))
}

impl<K: InnerKey> AssociationRecord<K> {
    pub fn new() -> Self {
        Self {
            state: RecordState::Unfrozen {
                counts: BTreeMap::new(),
                total: 0,
            },
        }
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self.state, RecordState::Frozen { .. })
    }

    /// Adds `count` observations of `key`, summing into any existing entry.
    pub fn add(&mut self, key: K, count: u64) -> Result<(), RecordError> {
        if count == 0 {
            return Err(RecordError::NonPositiveCount(count));
        }
        match &mut self.state {
            RecordState::Unfrozen { counts, total } => {
                // Entry counts never exceed the total, so a checked total covers both.
                *total = total.checked_add(count).ok_or(RecordError::CountOverflow)?;
                *counts.entry(key).or_insert(0) += count;
                Ok(())
            }
            RecordState::Frozen { .. } => Err(RecordError::AlreadyFrozen),
        }
    }

    /// Folds every entry of `other` into this record.
    pub fn merge(&mut self, other: AssociationRecord<K>) -> Result<(), RecordError> {
        if self.is_frozen() {
            return Err(RecordError::AlreadyFrozen);
        }
        let entries: Vec<(K, u64)> = match other.state {
            RecordState::Unfrozen { counts, .. } => counts.into_iter().collect(),
            RecordState::Frozen { entries, .. } => entries,
        };
        for (key, count) in entries {
            self.add(key, count)?;
        }
        Ok(())
    }

    /// Sorts the entries and fixes the total. Calling it again is a no-op.
    pub fn freeze(&mut self) -> &[(K, u64)] {
        if let RecordState::Unfrozen { counts, total } = &mut self.state {
            let total = *total;
            let mut entries: Vec<(K, u64)> = std::mem::take(counts).into_iter().collect();
            entries.sort_by(frozen_order);
            self.state = RecordState::Frozen { entries, total };
        }
        match &self.state {
            RecordState::Frozen { entries, .. } => entries,
            RecordState::Unfrozen { .. } => &[],
        }
    }

    /// Keeps the first `max_size` entries. The total is unchanged.
    pub fn prune(&mut self, max_size: usize) -> Result<(), RecordError> {
        match &mut self.state {
            RecordState::Frozen { entries, .. } => {
                entries.truncate(max_size);
                Ok(())
            }
            RecordState::Unfrozen { .. } => Err(RecordError::NotFrozen("prune")),
        }
    }

    /// Length of the leading run of entries with `count >= min_count` and
    /// `count >= min_significance * total`.
    pub fn significant_len(
        &self,
        min_count: u64,
        min_significance: f64,
    ) -> Result<usize, RecordError> {
        if !min_significance.is_finite() || !(0.0..=1.0).contains(&min_significance) {
            return Err(RecordError::InvalidSignificance(min_significance));
        }
        match &self.state {
            RecordState::Frozen { entries, total } => {
                let threshold = min_significance * *total as f64;
                Ok(entries
                    .iter()
                    .take_while(|(_, c)| *c >= min_count && *c as f64 >= threshold)
                    .count())
            }
            RecordState::Unfrozen { .. } => Err(RecordError::NotFrozen("significance filtering")),
        }
    }

    /// Drops every entry below the significance thresholds.
    pub fn retain_significant(
        &mut self,
        min_count: u64,
        min_significance: f64,
    ) -> Result<(), RecordError> {
        let keep = self.significant_len(min_count, min_significance)?;
        self.prune(keep)
    }

    pub fn size(&self) -> usize {
        match &self.state {
            RecordState::Unfrozen { counts, .. } => counts.len(),
            RecordState::Frozen { entries, .. } => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Sum of counts. Once frozen, includes entries pruned away since.
    pub fn total(&self) -> u64 {
        match &self.state {
            RecordState::Unfrozen { total, .. } | RecordState::Frozen { total, .. } => *total,
        }
    }

    /// Count held by `key`. Description keys are only obtainable from a
    /// normalizer, so a lookup always goes through the normalization rule.
    pub fn get(&self, key: &K) -> Option<u64> {
        match &self.state {
            RecordState::Unfrozen { counts, .. } => counts.get(key).copied(),
            RecordState::Frozen { entries, .. } => {
                entries.iter().find(|(k, _)| k == key).map(|(_, c)| *c)
            }
        }
    }

    /// Entry at 0-based `rank` in frozen order.
    pub fn entry_at(&self, rank: usize) -> Result<Option<(&K, u64)>, RecordError> {
        match &self.state {
            RecordState::Frozen { entries, .. } => Ok(entries.get(rank).map(|(k, c)| (k, *c))),
            RecordState::Unfrozen { .. } => Err(RecordError::NotFrozen("rank lookup")),
        }
    }

    /// Frozen entries in order.
    pub fn entries(&self) -> Result<&[(K, u64)], RecordError> {
        match &self.state {
            RecordState::Frozen { entries, .. } => Ok(entries),
            RecordState::Unfrozen { .. } => Err(RecordError::NotFrozen("reading entries")),
        }
    }

    /// Immutable read view of a frozen record. `normalizer` is applied to
    /// phrase arguments of the view's lookups.
    pub fn into_pruned_counts(
        self,
        normalizer: PhraseNormalizer,
    ) -> Result<PrunedCounts<K>, RecordError> {
        match self.state {
            RecordState::Frozen { entries, total } => {
                Ok(PrunedCounts::new(entries, total, normalizer))
            }
            RecordState::Unfrozen { .. } => Err(RecordError::NotFrozen("reading counts")),
        }
    }
}

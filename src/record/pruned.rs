use std::borrow::Borrow;
use std::collections::BTreeMap;

use serde::Serialize;

use crate::record::record::InnerKey;
use crate::types::identifiers::PhraseNormalizer;

/// Read-only view of a frozen, pruned association record.
///
/// Entries iterate count-descending. `total` is the mass of the record
/// before pruning, so fractions stay comparable across pruning settings.
/// Phrase lookups are normalized with the rule the index was built with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrunedCounts<K: Ord> {
    total: u64,
    entries: Vec<(K, u64)>,
    #[serde(skip)]
    positions: BTreeMap<K, usize>,
    #[serde(skip)]
    normalizer: PhraseNormalizer,
}

impl<K: Ord + Clone> PrunedCounts<K> {
    pub(crate) fn new(entries: Vec<(K, u64)>, total: u64, normalizer: PhraseNormalizer) -> Self {
        let positions = entries
            .iter()
            .enumerate()
            .map(|(rank, (key, _))| (key.clone(), rank))
            .collect();
        Self {
            total,
            entries,
            positions,
            normalizer,
        }
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn entry_at(&self, rank: usize) -> Option<(&K, u64)> {
        self.entries.get(rank).map(|(k, c)| (k, *c))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, u64)> + '_ {
        self.entries.iter().map(|(k, c)| (k, *c))
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.entries.iter().map(|(k, _)| k)
    }

    /// The first `max` entries; the total is kept.
    pub fn truncated(&self, max: usize) -> Self {
        let entries = self.entries.iter().take(max).cloned().collect();
        Self::new(entries, self.total, self.normalizer)
    }

    pub fn into_entries(self) -> Vec<(K, u64)> {
        self.entries
    }
}

impl<K> PrunedCounts<K>
where
    K: InnerKey + Borrow<K::Query>,
{
    /// 0-based rank of `key` in count-descending order.
    pub fn rank_of(&self, key: &K::Query) -> Option<usize> {
        let key = K::canonical(key, &self.normalizer);
        self.positions.get(&*key).copied()
    }

    pub fn get(&self, key: &K::Query) -> Option<u64> {
        self.rank_of(key).map(|rank| self.entries[rank].1)
    }

    /// Share of the pre-prune total held by `key`.
    pub fn fraction(&self, key: &K::Query) -> Option<f64> {
        let count = self.get(key)?;
        Some(if self.total == 0 {
            0.0
        } else {
            count as f64 / self.total as f64
        })
    }
}

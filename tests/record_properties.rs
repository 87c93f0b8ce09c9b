use std::collections::BTreeMap;

use phrase_index::record::{DescriptionRecord, ResolutionRecord};
use phrase_index::store::ObjectStore;
use phrase_index::types::{PageId, PhraseNormalizer, StripMode};
use proptest::prelude::*;
use tempfile::tempdir;

fn adds() -> impl Strategy<Value = Vec<(u32, u64)>> {
    prop::collection::vec((0u32..20, 1u64..1_000), 0..60)
}

fn normalizers() -> impl Strategy<Value = PhraseNormalizer> {
    (
        any::<bool>(),
        any::<bool>(),
        prop_oneof![
            Just(StripMode::None),
            Just(StripMode::Trailing),
            Just(StripMode::Leading),
            Just(StripMode::Both),
        ],
    )
        .prop_map(|(lowercase, collapse_whitespace, strip)| PhraseNormalizer {
            lowercase,
            collapse_whitespace,
            strip,
        })
}

fn build(adds: &[(u32, u64)]) -> ResolutionRecord {
    let mut record = ResolutionRecord::new();
    for &(page, count) in adds {
        record.add(PageId::new(page), count).unwrap();
    }
    record
}

proptest! {
    #[test]
    fn frozen_counts_are_sums(adds in adds()) {
        let mut expected: BTreeMap<u32, u64> = BTreeMap::new();
        for &(page, count) in &adds {
            *expected.entry(page).or_insert(0) += count;
        }

        let mut record = build(&adds);
        record.freeze();

        prop_assert_eq!(record.size(), expected.len());
        prop_assert_eq!(record.total(), expected.values().sum::<u64>());
        for (page, count) in &expected {
            prop_assert_eq!(record.get(&PageId::new(*page)), Some(*count));
        }
    }

    #[test]
    fn frozen_order_is_count_descending(adds in adds()) {
        let mut record = build(&adds);
        let entries = record.freeze().to_vec();
        for pair in entries.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            prop_assert!(a.1 > b.1 || (a.1 == b.1 && a.0 < b.0));
        }
    }

    #[test]
    fn pruning_is_monotone(adds in adds(), n in 0usize..30) {
        let mut record = build(&adds);
        record.freeze();
        let size_before = record.size();
        let total_before = record.total();
        let prefix = record.entries().unwrap()[..n.min(size_before)].to_vec();

        record.prune(n).unwrap();

        prop_assert_eq!(record.size(), n.min(size_before));
        prop_assert_eq!(record.total(), total_before);
        prop_assert_eq!(record.entries().unwrap(), &prefix[..]);
    }

    #[test]
    fn normalization_is_idempotent(
        normalizer in normalizers(),
        s in "[a-zA-Z0-9 .,!?'\"()\t\n_-]{0,32}|[À-ÿ\\PC]{0,12}",
    ) {
        let once = normalizer.normalize(&s);
        let twice = normalizer.normalize(once.as_str());
        prop_assert_eq!(once, twice);
    }
}

proptest! {
    // Each case opens a database twice.
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn store_round_trip_preserves_frozen_record(adds in adds(), n in 0usize..10) {
        let dir = tempdir().unwrap();
        let mut record = build(&adds);
        record.freeze();
        record.prune(n).unwrap();

        {
            let store = ObjectStore::open(dir.path(), true).unwrap();
            store.put("en:phrase", serde_json::to_vec(&record).unwrap()).unwrap();
            store.sync().unwrap();
        }

        let store = ObjectStore::open(dir.path(), false).unwrap();
        let bytes = store.get("en:phrase").unwrap().unwrap();
        let back: ResolutionRecord = serde_json::from_slice(&bytes).unwrap();
        prop_assert_eq!(back.entries().unwrap(), record.entries().unwrap());
        prop_assert_eq!(back.total(), record.total());
    }
}

#[test]
fn description_record_merges_case_and_punctuation_variants() {
    let n = PhraseNormalizer::default();
    let mut record = DescriptionRecord::new();
    for (phrase, count) in [("foo", 93), ("foO", 5), ("baz", 1), ("bar", 12), ("FOO!!", 2)] {
        record.add(n.normalize(phrase), count).unwrap();
    }
    record.freeze();
    record.prune(2).unwrap();

    assert_eq!(record.total(), 113);
    assert_eq!(record.size(), 2);
    assert_eq!(record.get(&n.normalize("foo")), Some(100));
    assert_eq!(record.get(&n.normalize("Bar.")), Some(12));
    assert_eq!(record.get(&n.normalize("baz")), None);
}

use std::sync::Arc;
use std::thread;

use phrase_index::index::{IndexConfig, IndexError, PhraseIndex, PruneConfig, ValidationError};
use phrase_index::types::{Language, Observation, PageId, StripMode};
use tempfile::tempdir;

fn en() -> Language {
    Language::new("en").unwrap()
}

fn open_fresh(path: &std::path::Path) -> PhraseIndex {
    PhraseIndex::open(path, IndexConfig::v0(), true).unwrap()
}

fn add_all(index: &PhraseIndex, rows: &[(&str, u32, &str, u64)]) {
    for &(lang, page, phrase, count) in rows {
        index
            .add(&Language::new(lang).unwrap(), PageId::new(page), phrase, count)
            .unwrap();
    }
}

#[test]
fn page_counts_merge_normalized_phrases() {
    let dir = tempdir().unwrap();
    let index = open_fresh(dir.path());
    add_all(
        &index,
        &[
            ("en", 319, "foo", 93),
            ("en", 319, "foO", 5),
            ("en", 319, "baz", 1),
            ("en", 319, "bar", 12),
        ],
    );
    index.freeze_and_prune(PruneConfig::new(2, 2, 0.0)).unwrap();

    let counts = index.get_page_counts(&en(), PageId::new(319)).unwrap().unwrap();
    assert_eq!(counts.total(), 111);
    assert_eq!(counts.size(), 2);
    assert_eq!(counts.get("foo"), Some(98));
    assert_eq!(counts.get("bar"), Some(12));
    assert_eq!(counts.get("baz"), None);

    // Phrase lookups on the view go through the same normalization.
    assert_eq!(counts.get("foO"), Some(98));
    assert_eq!(counts.get("FOO."), Some(98));
    assert_eq!(counts.rank_of("Bar!"), Some(1));
    assert!((counts.fraction("BAR").unwrap() - 12.0 / 111.0).abs() < 1e-12);
}

#[test]
fn phrase_counts_resolve_to_top_pages() {
    let dir = tempdir().unwrap();
    let index = open_fresh(dir.path());
    add_all(
        &index,
        &[
            ("en", 319, "foo", 93),
            ("en", 319, "foO", 5),
            ("en", 132, "fOo", 19),
            ("en", 36, "fOo", 8),
        ],
    );
    index.freeze_and_prune(PruneConfig::new(2, 2, 0.0)).unwrap();

    let counts = index.get_phrase_counts(&en(), "foo").unwrap().unwrap();
    assert_eq!(counts.total(), 125);
    assert_eq!(counts.size(), 2);
    assert_eq!(counts.get(&319), Some(98));
    assert_eq!(counts.get(&132), Some(19));
    assert_eq!(counts.get(&36), None);

    let order: Vec<u32> = counts.keys().map(|p| p.get()).collect();
    assert_eq!(order, vec![319, 132]);

    // Lookups normalize the query too.
    let same = index.get_phrase_counts(&en(), "FOO.").unwrap().unwrap();
    assert_eq!(same, counts);
}

#[test]
fn unknown_keys_are_absent() {
    let dir = tempdir().unwrap();
    let index = open_fresh(dir.path());
    add_all(&index, &[("en", 1, "foo", 1)]);
    index.freeze_and_prune(PruneConfig::new(10, 10, 0.0)).unwrap();

    assert!(index.get_page_counts(&en(), PageId::new(34321)).unwrap().is_none());
    assert!(index.get_phrase_counts(&en(), "sadfas").unwrap().is_none());
    let de = Language::new("de").unwrap();
    assert!(index.get_phrase_counts(&de, "foo").unwrap().is_none());
}

#[test]
fn reads_before_finalize_are_rejected() {
    let dir = tempdir().unwrap();
    let index = open_fresh(dir.path());
    add_all(&index, &[("en", 1, "foo", 1)]);

    assert!(matches!(
        index.get_page_counts(&en(), PageId::new(1)),
        Err(IndexError::NotFinalized)
    ));
    assert!(matches!(
        index.get_phrase_counts(&en(), "foo"),
        Err(IndexError::NotFinalized)
    ));
    assert!(matches!(index.all_phrases(&en()), Err(IndexError::NotFinalized)));
}

#[test]
fn writes_after_finalize_are_rejected() {
    let dir = tempdir().unwrap();
    let index = open_fresh(dir.path());
    add_all(&index, &[("en", 1, "foo", 1)]);
    index.freeze_and_prune(PruneConfig::new(10, 10, 0.0)).unwrap();

    assert!(matches!(
        index.add(&en(), PageId::new(1), "foo", 1),
        Err(IndexError::Finalized)
    ));
    assert!(matches!(
        index.freeze_and_prune(PruneConfig::new(10, 10, 0.0)),
        Err(IndexError::Finalized)
    ));
}

#[test]
fn invalid_input_is_a_validation_error() {
    let dir = tempdir().unwrap();
    let index = open_fresh(dir.path());

    assert!(matches!(
        index.add(&en(), PageId::new(1), "foo", 0),
        Err(IndexError::Validation(ValidationError::NonPositiveCount(0)))
    ));
    assert!(matches!(
        index.add(&en(), PageId::new(1), " ?! ", 1),
        Err(IndexError::Validation(ValidationError::BlankPhrase(_)))
    ));
    assert!(matches!(
        index.freeze_and_prune(PruneConfig::new(1, 1, 1.5)),
        Err(IndexError::Validation(ValidationError::InvalidSignificance(_)))
    ));
    assert!(matches!(
        index.freeze_and_prune(PruneConfig::new(1, 1, f64::NAN)),
        Err(IndexError::Validation(ValidationError::InvalidSignificance(_)))
    ));
    assert!(!index.is_finalized().unwrap());

    index.freeze_and_prune(PruneConfig::new(1, 1, 0.0)).unwrap();
    assert!(index.all_phrases(&en()).unwrap().is_empty());
}

#[test]
fn significance_filter_runs_before_size_pruning() {
    let dir = tempdir().unwrap();
    let index = open_fresh(dir.path());
    add_all(
        &index,
        &[("en", 999, "x", 10), ("en", 31, "x", 4), ("en", 3424, "x", 1)],
    );
    let stats = index.freeze_and_prune(PruneConfig::new(10, 10, 0.25)).unwrap();

    let counts = index.get_phrase_counts(&en(), "x").unwrap().unwrap();
    assert_eq!(counts.size(), 2);
    assert_eq!(counts.total(), 15);
    assert_eq!(counts.get(&3424), None);
    assert_eq!(stats.resolution.entries_dropped, 1);

    // Page 3424's only phrase is 1/1 of its total, so its description survives.
    let page = index.get_page_counts(&en(), PageId::new(3424)).unwrap().unwrap();
    assert_eq!(page.get("x"), Some(1));
}

#[test]
fn records_pruned_to_nothing_are_removed() {
    let dir = tempdir().unwrap();
    let index = open_fresh(dir.path());
    add_all(&index, &[("en", 1, "rare", 1), ("en", 2, "common", 5)]);
    let stats = index
        .freeze_and_prune(PruneConfig::new(10, 10, 0.0).with_min_count(2))
        .unwrap();

    assert!(index.get_phrase_counts(&en(), "rare").unwrap().is_none());
    assert!(index.get_page_counts(&en(), PageId::new(1)).unwrap().is_none());
    assert!(index.get_phrase_counts(&en(), "common").unwrap().is_some());
    assert_eq!(stats.resolution.records_removed, 1);
    assert_eq!(stats.description.records_removed, 1);
    assert_eq!(index.all_phrases(&en()).unwrap().len(), 1);
}

#[test]
fn finalized_index_reopens_read_only() {
    let dir = tempdir().unwrap();
    {
        let index = open_fresh(dir.path());
        add_all(
            &index,
            &[("en", 349, "FOo!", 7), ("en", 3121, "foo", 3), ("en", 3214, "Bar", 9)],
        );
        index.freeze_and_prune(PruneConfig::new(5, 5, 0.0)).unwrap();
    }

    let index = PhraseIndex::open(dir.path(), IndexConfig::v0(), false).unwrap();
    assert!(index.is_finalized().unwrap());
    let record = index.finalize_record().unwrap().unwrap();
    assert_eq!(record.prune, PruneConfig::new(5, 5, 0.0));

    let phrases: Vec<String> = index
        .all_phrases(&en())
        .unwrap()
        .iter()
        .map(|p| p.as_str().to_string())
        .collect();
    assert_eq!(phrases, vec!["bar", "foo"]);

    let all = index.all_phrase_counts(&en()).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[1].0.as_str(), "foo");
    assert_eq!(all[1].1.get(&349), Some(7));
    assert_eq!(all[1].1.total(), 10);

    assert!(matches!(
        index.add(&en(), PageId::new(1), "x", 1),
        Err(IndexError::Finalized)
    ));
}

#[test]
fn unfinalized_index_keeps_accumulating_after_reopen() {
    let dir = tempdir().unwrap();
    {
        let index = open_fresh(dir.path());
        add_all(&index, &[("en", 1, "foo", 2)]);
        index.sync().unwrap();
    }

    let index = PhraseIndex::open(dir.path(), IndexConfig::v0(), false).unwrap();
    add_all(&index, &[("en", 1, "Foo", 3)]);
    index.freeze_and_prune(PruneConfig::new(5, 5, 0.0)).unwrap();
    let counts = index.get_page_counts(&en(), PageId::new(1)).unwrap().unwrap();
    assert_eq!(counts.get("foo"), Some(5));
}

#[test]
fn reopening_with_a_different_normalizer_fails() {
    let dir = tempdir().unwrap();
    drop(open_fresh(dir.path()));

    let mut config = IndexConfig::v0();
    config.normalizer.strip = StripMode::Both;
    assert!(matches!(
        PhraseIndex::open(dir.path(), config.clone(), false),
        Err(IndexError::NormalizerMismatch { .. })
    ));
    assert!(PhraseIndex::open(dir.path(), config, true).is_ok());
}

#[test]
fn lock_shard_count_may_change_between_opens() {
    let dir = tempdir().unwrap();
    {
        let index = open_fresh(dir.path());
        add_all(&index, &[("en", 1, "foo", 2)]);
    }

    let mut config = IndexConfig::v0();
    config.lock_shards = 128;
    let index = PhraseIndex::open(dir.path(), config, false).unwrap();
    assert_eq!(index.config().lock_shards, 128);
    add_all(&index, &[("en", 1, "foo", 1)]);
    index.freeze_and_prune(PruneConfig::new(5, 5, 0.0)).unwrap();
    let counts = index.get_phrase_counts(&en(), "foo").unwrap().unwrap();
    assert_eq!(counts.get(&1), Some(3));
}

#[test]
fn describe_and_resolve_report_shares_of_total() {
    let dir = tempdir().unwrap();
    let index = open_fresh(dir.path());
    add_all(
        &index,
        &[("en", 3214, "Bar", 9), ("en", 3214, "baz", 3), ("en", 3214, "boof", 1)],
    );
    index.freeze_and_prune(PruneConfig::new(5, 5, 0.0)).unwrap();

    let described = index.describe(&en(), PageId::new(3214), 2).unwrap().unwrap();
    assert_eq!(described.len(), 2);
    assert_eq!(described[0].0.as_str(), "bar");
    assert!((described[0].1 - 9.0 / 13.0).abs() < 1e-12);
    assert_eq!(described[1].0.as_str(), "baz");

    let resolved = index.resolve(&en(), "BAR", 5).unwrap().unwrap();
    assert_eq!(resolved, vec![(PageId::new(3214), 1.0)]);
    assert!(index.resolve(&en(), "nothing", 5).unwrap().is_none());
}

#[test]
fn languages_are_separate_namespaces() {
    let dir = tempdir().unwrap();
    let index = open_fresh(dir.path());
    add_all(&index, &[("en", 1, "paris", 4), ("fr", 1, "paris", 6)]);
    index.freeze_and_prune(PruneConfig::new(5, 5, 0.0)).unwrap();

    let fr = Language::new("fr").unwrap();
    assert_eq!(index.get_phrase_counts(&en(), "paris").unwrap().unwrap().total(), 4);
    assert_eq!(index.get_phrase_counts(&fr, "paris").unwrap().unwrap().total(), 6);
    assert_eq!(index.all_phrases(&fr).unwrap().len(), 1);
}

#[test]
fn load_skips_blank_phrases_and_reports_stats() {
    let dir = tempdir().unwrap();
    let index = open_fresh(dir.path());
    let observations = vec![
        Observation::new(en(), 1u32, "Foo", 2),
        Observation::new(en(), 1u32, "  ...  ", 5),
        Observation::new(en(), 2u32, "foo\tbar", 1),
    ];
    let stats = index.load(observations).unwrap();
    assert_eq!(stats.observations, 3);
    assert_eq!(stats.retained, 2);
    assert_eq!(stats.skipped_blank, 1);

    index.freeze_and_prune(PruneConfig::new(5, 5, 0.0)).unwrap();
    assert!(index.get_phrase_counts(&en(), "foo bar").unwrap().is_some());
}

#[test]
fn concurrent_adds_lose_no_updates() {
    let dir = tempdir().unwrap();
    let index = Arc::new(open_fresh(dir.path()));

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                for i in 0..50u32 {
                    // Every worker hits the same hot phrase and page.
                    index.add(&en(), PageId::new(7), "hot", 1).unwrap();
                    index.add(&en(), PageId::new(100 + i), &format!("w{worker}"), 2).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    index.freeze_and_prune(PruneConfig::new(1_000, 1_000, 0.0)).unwrap();

    let hot = index.get_phrase_counts(&en(), "hot").unwrap().unwrap();
    assert_eq!(hot.get(&7), Some(200));
    for worker in 0..4 {
        let counts = index.get_phrase_counts(&en(), &format!("w{worker}")).unwrap().unwrap();
        assert_eq!(counts.total(), 100);
        assert_eq!(counts.size(), 50);
    }
    let page = index.get_page_counts(&en(), PageId::new(120)).unwrap().unwrap();
    assert_eq!(page.total(), 8);
}

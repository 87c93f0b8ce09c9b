//! Persistent phrase–page association index.
//!
//! `phrase-index` aggregates raw `(language, page, phrase, count)` observations
//! (typically anchor texts pointing at encyclopedia pages) into two pruned
//! views: *resolution* (phrase → pages) and *description* (page → phrases).
//! Observations accumulate in durable RocksDB-backed stores, are frozen and
//! pruned once, and are read back as immutable [`record::PrunedCounts`].

pub mod index;
pub mod record;
pub mod store;
pub mod types;

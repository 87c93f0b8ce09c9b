pub mod dao;
pub mod manifest;

pub use dao::{IndexError, PhraseIndex, ValidationError, DESCRIBE_DIR, RESOLVE_DIR};
pub use manifest::{
    FinalizeRecord, FinalizeStats, IndexConfig, IndexManifest, PruneConfig, PruneStats,
    MANIFEST_FILE,
};

pub mod identifiers;
pub mod observation;

pub use identifiers::{
    Language, LanguageError, NormalizedPhrase, PageId, PhraseNormalizer, StripMode, KEY_SEPARATOR,
};
pub use observation::{LoadStats, Observation};

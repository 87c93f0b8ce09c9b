use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separator between the language code and the inner identity in store keys.
pub const KEY_SEPARATOR: char = ':';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LanguageError {
    #[error("Language code must not be empty")]
    Empty,
    #[error("Invalid language code: {0:?}")]
    InvalidCode(String),
}

/// A language tag such as `en` or `simple`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Language(String);

impl Language {
    /// Lower-cases the code and rejects anything that could not appear in a store key prefix.
    pub fn new(code: impl AsRef<str>) -> Result<Self, LanguageError> {
        let code = code.as_ref().trim().to_ascii_lowercase();
        if code.is_empty() {
            return Err(LanguageError::Empty);
        }
        let valid = code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(LanguageError::InvalidCode(code));
        }
        Ok(Language(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Local page identifier within one language edition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(u32);

impl PageId {
    pub const fn new(id: u32) -> Self {
        PageId(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for PageId {
    fn from(id: u32) -> Self {
        PageId(id)
    }
}

impl Borrow<u32> for PageId {
    fn borrow(&self) -> &u32 {
        &self.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A phrase after normalization.
///
/// Only a [`PhraseNormalizer`] hands these out, so two phrases that normalize
/// to the same text are the same key everywhere.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedPhrase(String);

impl NormalizedPhrase {
    /// Rebuilds a phrase read back from a store key, which was normalized when written.
    pub(crate) fn from_stored(text: &str) -> Self {
        NormalizedPhrase(text.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Borrow<str> for NormalizedPhrase {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NormalizedPhrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which end(s) of a phrase lose their non-alphanumeric characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StripMode {
    None,
    #[default]
    Trailing,
    Leading,
    Both,
}

/// Normalization rules:
/// - Lowercase
/// - Collapse whitespace runs into a single space
/// - Strip non-alphanumeric characters from the configured end(s)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhraseNormalizer {
    pub lowercase: bool,
    pub collapse_whitespace: bool,
    pub strip: StripMode,
}

impl Default for PhraseNormalizer {
    fn default() -> Self {
        Self {
            lowercase: true,
            collapse_whitespace: true,
            strip: StripMode::Trailing,
        }
    }
}

impl PhraseNormalizer {
    pub fn normalize(&self, phrase: &str) -> NormalizedPhrase {
        let mut text = if self.lowercase {
            phrase.to_lowercase()
        } else {
            phrase.to_string()
        };

        if self.collapse_whitespace {
            text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        }

        // Stripping only ever removes characters from the ends, so it cannot
        // create new whitespace runs or new upper-case letters.
        let stripped = match self.strip {
            StripMode::None => text.as_str(),
            StripMode::Trailing => text.trim_end_matches(|c: char| !c.is_alphanumeric()),
            StripMode::Leading => text.trim_start_matches(|c: char| !c.is_alphanumeric()),
            StripMode::Both => text.trim_matches(|c: char| !c.is_alphanumeric()),
        };

        NormalizedPhrase(stripped.to_string())
    }
}

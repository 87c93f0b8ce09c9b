use serde::{Deserialize, Serialize};

use crate::types::identifiers::{Language, PageId};

/// One raw data point: `phrase` pointed at `page` `count` times.
///
/// Observations are never stored; they are folded into association records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub language: Language,
    pub page: PageId,
    pub phrase: String,
    pub count: u64,
}

impl Observation {
    pub fn new(
        language: Language,
        page: impl Into<PageId>,
        phrase: impl Into<String>,
        count: u64,
    ) -> Self {
        Self {
            language,
            page: page.into(),
            phrase: phrase.into(),
            count,
        }
    }
}

/// Tally of a bulk load, returned to the caller instead of kept in globals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadStats {
    pub observations: u64,
    pub retained: u64,
    pub skipped_blank: u64,
}

impl LoadStats {
    /// Share of observations that made it into the index, in percent.
    pub fn retained_percent(&self) -> f64 {
        if self.observations == 0 {
            0.0
        } else {
            100.0 * self.retained as f64 / self.observations as f64
        }
    }
}

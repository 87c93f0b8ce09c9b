pub mod pruned;
pub mod record;

pub use pruned::PrunedCounts;
pub use record::{AssociationRecord, DescriptionRecord, InnerKey, RecordError, ResolutionRecord};

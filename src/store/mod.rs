pub mod cursor;
pub mod store;

pub use cursor::Cursor;
pub use store::{ObjectStore, StoreError, StoreOp, StoreStats};

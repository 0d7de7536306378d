pub mod shard;
pub mod store;

pub use shard::{IndexEntry, Shard, SortKey};
pub use store::{IndexStore, PutReport, SourceSummary, StoreLimits, StorePage, StoreQuery};

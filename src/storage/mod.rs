pub mod checkpoint;

pub use checkpoint::OffsetCheckpoint;

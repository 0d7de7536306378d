#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod app;
pub mod config;
pub mod core;
pub mod error;
pub mod event;
pub mod index;
pub mod ingest;
pub mod parser;
pub mod query;
pub mod stats;
pub mod storage;
pub mod tracker;

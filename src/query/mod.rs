pub mod engine;
pub mod server;
pub mod time;
pub mod views;

pub use engine::{Analytics, LogQuery, Pagination, QueryEngine, QueryLimits, SearchResponse};
pub use server::{AppState, LimitsUpdate, QueryServer};
pub use time::{TimeResolver, TimeWindow};
pub use views::{
    ComponentStats, ComponentsReport, DailySummary, ErrorCategory, ErrorPattern, TroubleshootQuery,
    TroubleshootReport,
};

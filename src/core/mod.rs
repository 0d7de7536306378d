pub mod clock;
pub mod file_state;
pub mod record;

pub use clock::{Clock, ManualClock, SystemClock};
pub use file_state::{FileIdentity, FileState, ResetReason, HEAD_FINGERPRINT_LEN};
pub use record::{
    normalize_refresh_id, CompositeKey, Level, LogRecord, MetaValue, Metadata, RecordKey,
};

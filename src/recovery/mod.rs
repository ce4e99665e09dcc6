pub mod checkpoint;
pub mod log_manager;
pub mod log_record;
pub mod recovery;
pub mod time_travel;

pub use checkpoint::{CheckpointManager, MasterRecord};
pub use log_manager::LogManager;
pub use log_record::{ActiveTxnEntry, DirtyPageEntry, LogRecord, LogRecordKind};
pub use recovery::RecoveryManager;
pub use time_travel::{Strategy, TimeTravelEngine, TimeTravelResult};

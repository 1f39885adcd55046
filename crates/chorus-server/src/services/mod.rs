pub mod session_records;

pub use session_records::{
    MemorySessionRecords, PgSessionRecords, SessionRecordNotifier, SessionRecords,
};

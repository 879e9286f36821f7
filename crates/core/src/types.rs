/// Server identifiers are the integer ids of the registered database servers.
pub type ServerId = i64;

/// Job identifiers are the integer ids of scheduler jobs.
pub type JobId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

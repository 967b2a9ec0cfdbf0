mod batch;
mod failure;
mod record;

pub use batch::{BatchId, BatchStatus, TerminalStatus};
pub use failure::{ErrorKind, FailureLogEntry};
pub use record::{Book, RecordKey, RecordKeyError};

use folio_domain::{BatchId, ErrorKind, RecordKey};
use tracing::warn;

use crate::COMPONENT;

// RECORD CONTEXT
// ================================================================================================

/// Snapshot of one record's outcome, handed to the observer after ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordContext {
    pub record_key: RecordKey,
    pub batch_id: BatchId,
    /// `None` for a successful record.
    pub error_kind: Option<ErrorKind>,
    pub attempt_number: u32,
}

// RECORD OBSERVER
// ================================================================================================

/// Optional per-record observability sink.
///
/// An unreachable sink must never affect orchestration: the caller downgrades any error to a
/// warning and carries on.
pub trait RecordObserver: Send + Sync + 'static {
    fn emit(&self, context: &RecordContext) -> Result<(), Box<dyn std::error::Error>>;
}

/// The default sink: discard everything.
pub struct NoopObserver;

impl RecordObserver for NoopObserver {
    fn emit(&self, _context: &RecordContext) -> Result<(), Box<dyn std::error::Error>> {
        Ok(())
    }
}

/// Emits to the sink, downgrading failures to a warning.
pub(crate) fn emit_degrading(observer: &dyn RecordObserver, context: &RecordContext) {
    if let Err(err) = observer.emit(context) {
        warn!(
            target: COMPONENT,
            record_key = %context.record_key,
            %err,
            "Observability sink rejected record context; continuing"
        );
    }
}

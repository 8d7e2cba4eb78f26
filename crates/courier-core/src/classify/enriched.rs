use std::error::Error as StdError;

use thiserror::Error;

use crate::domain::ErrorRecord;

/// A failure wrapped together with its ErrorRecord.
///
/// `Display` renders the record; `source()` is the original failure, which is
/// never dropped.
#[derive(Debug, Error)]
#[error("{record}")]
pub struct EnrichedError {
    record: Box<ErrorRecord>,
    #[source]
    source: Box<dyn StdError + Send + Sync + 'static>,
}

impl EnrichedError {
    pub(crate) fn new(record: ErrorRecord, source: Box<dyn StdError + Send + Sync + 'static>) -> Self {
        Self {
            record: Box::new(record),
            source,
        }
    }

    pub fn record(&self) -> &ErrorRecord {
        &self.record
    }

    pub fn downcast_original<E: StdError + 'static>(&self) -> Option<&E> {
        self.source.downcast_ref::<E>()
    }
}

//! Classification rules.
//!
//! Every error in the `source()` chain is inspected; the strongest signal
//! wins according to `priority`. A chain with no recognizable signal is
//! `Unexpected`.

use std::error::Error as StdError;
use std::io;

use crate::domain::ErrorKind;
use crate::error::CourierError;
use crate::ports::RemoteError;

use super::EnrichedError;

/// What one error in the chain says about the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Signal {
    pub kind: ErrorKind,
    pub remote_status: Option<u16>,
}

impl Signal {
    fn of(kind: ErrorKind) -> Self {
        Self {
            kind,
            remote_status: None,
        }
    }
}

/// Lower is stronger.
pub(crate) fn priority(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::Canceled => 0,
        ErrorKind::Unavailable => 1,
        ErrorKind::Timeout => 2,
        ErrorKind::InvalidRequest => 3,
        ErrorKind::RemoteServerError => 4,
        ErrorKind::RemoteClientError => 5,
        ErrorKind::Unexpected => 6,
    }
}

/// Strongest signal found anywhere in the chain.
pub(crate) fn detect(failure: &(dyn StdError + 'static)) -> Option<Signal> {
    chain(failure)
        .filter_map(signal_of)
        .min_by_key(|signal| priority(signal.kind))
}

pub(crate) fn chain<'a>(
    failure: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(failure), |&e| e.source())
}

fn signal_of(error: &(dyn StdError + 'static)) -> Option<Signal> {
    if let Some(remote) = error.downcast_ref::<RemoteError>() {
        return remote_signal(remote);
    }
    if let Some(enriched) = error.downcast_ref::<EnrichedError>() {
        return Some(recorded_signal(enriched));
    }
    if let Some(courier) = error.downcast_ref::<CourierError>() {
        return courier_signal(courier);
    }
    if error.is::<tokio::time::error::Elapsed>() {
        return Some(Signal::of(ErrorKind::Timeout));
    }
    if let Some(io) = error.downcast_ref::<io::Error>() {
        return io_signal(io);
    }
    if error.is::<serde_json::Error>() {
        return Some(Signal::of(ErrorKind::InvalidRequest));
    }
    None
}

fn remote_signal(error: &RemoteError) -> Option<Signal> {
    match error {
        RemoteError::Canceled => Some(Signal::of(ErrorKind::Canceled)),
        RemoteError::Connect(_) => Some(Signal::of(ErrorKind::Unavailable)),
        RemoteError::Timeout(_) => Some(Signal::of(ErrorKind::Timeout)),
        RemoteError::InvalidRequest(_) => Some(Signal::of(ErrorKind::InvalidRequest)),
        RemoteError::Status { code, .. } => status_signal(*code),
        // the boxed source is visited as the next link of the chain
        RemoteError::Other(_) => None,
    }
}

fn status_signal(code: u16) -> Option<Signal> {
    let kind = match code {
        500..=599 => ErrorKind::RemoteServerError,
        400..=499 => ErrorKind::RemoteClientError,
        _ => return None,
    };
    Some(Signal {
        kind,
        remote_status: Some(code),
    })
}

fn recorded_signal(enriched: &EnrichedError) -> Signal {
    let record = enriched.record();
    Signal {
        kind: record.kind,
        remote_status: record
            .attributes
            .get("remote_status")
            .and_then(|s| s.parse().ok()),
    }
}

fn courier_signal(error: &CourierError) -> Option<Signal> {
    match error {
        CourierError::InvalidKey(_) | CourierError::InvalidArgument(_) | CourierError::Config(_) => {
            Some(Signal::of(ErrorKind::InvalidRequest))
        }
        CourierError::Operation(enriched) => Some(recorded_signal(enriched)),
        CourierError::Join(_) | CourierError::Other(_) => None,
    }
}

fn io_signal(error: &io::Error) -> Option<Signal> {
    use io::ErrorKind as Io;
    let kind = match error.kind() {
        Io::ConnectionRefused
        | Io::ConnectionReset
        | Io::ConnectionAborted
        | Io::NotConnected
        | Io::AddrNotAvailable
        | Io::BrokenPipe => ErrorKind::Unavailable,
        Io::TimedOut => ErrorKind::Timeout,
        Io::InvalidInput | Io::InvalidData => ErrorKind::InvalidRequest,
        _ => return None,
    };
    Some(Signal::of(kind))
}

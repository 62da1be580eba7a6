//! Error taxonomy shared by the store, reflector and informer.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Network or API failure during list/watch; recovered by relisting.
    #[error("transport: {0}")]
    Transport(String),
    /// A single payload could not be decoded; the event is discarded.
    #[error("decode: {0}")]
    Decode(String),
    /// Watch history was pruned past the cursor; requires an unversioned relist.
    #[error("resource version expired: {0}")]
    Expired(String),
    #[error("watch status {code}: {message}")]
    WatchStatus { code: u16, message: String },
    #[error("handler queue overflow: {handler} exceeded capacity {capacity}")]
    QueueOverflow { handler: String, capacity: usize },
    #[error("informer already started")]
    AlreadyStarted,
    #[error("informer stopped")]
    Stopped,
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("indexer conflict: {0}")]
    IndexerConflict(String),
    #[error("index does not exist: {0}")]
    IndexNotFound(String),
    #[error("cannot add indexers to a populated store")]
    IndexersAfterStart,
}

impl Error {
    /// HTTP 410 Gone is how API servers report a pruned watch cursor.
    pub const GONE: u16 = 410;

    pub fn is_expired(&self) -> bool {
        match self {
            Error::Expired(_) => true,
            Error::WatchStatus { code, .. } => *code == Self::GONE,
            _ => false,
        }
    }

    /// Errors the reflector must not retry past.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::QueueOverflow { .. } | Error::Stopped)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

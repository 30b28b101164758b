//! Error taxonomy shared by every coordination component.
//!
//! Lost races (a CAS mismatch, a lock that is already held, an item taken by
//! another node) are not errors.  They are reported through return values.

use fred::error::{Error as FredError, ErrorKind};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The backing store could not be reached or did not answer in time.
    #[error("store connection error: {0}")]
    Connection(String),

    /// A stored value does not have the shape this node expects.  This
    /// points to corruption or a cross-version mismatch and is never masked.
    #[error("contract violation: {0}")]
    Contract(String),

    /// A component could not finish its startup handshake.
    #[error("startup failed: {0}")]
    Startup(String),

    /// Any other error reported by the store.
    #[error("store error: {0}")]
    Backend(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl Error {
    /// `true` for errors that come from store reachability rather than
    /// from the data or the request itself.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    pub(crate) fn contract(detail: impl Into<String>) -> Self {
        Self::Contract(detail.into())
    }
}

impl From<FredError> for Error {
    fn from(e: FredError) -> Self {
        match e.kind() {
            ErrorKind::IO | ErrorKind::Timeout | ErrorKind::Canceled => {
                Self::Connection(e.to_string())
            }
            _ if e.details().contains("not an integer") => Self::Contract(e.details().to_string()),
            _ => Self::Backend(e.to_string()),
        }
    }
}

use thiserror::Error;

use crate::zip::ZipError;

/// Failures surfaced by the archive client and the query layer.
///
/// Per-chain archive errors are logged and swallowed by the ingest driver;
/// everything that reaches a caller goes through this enum.
#[derive(Debug, Error)]
pub enum Error {
    /// The upstream list/HEAD/range request failed at the network layer or
    /// returned a non-success status.
    #[error("upstream unavailable: {0}")]
    Upstream(String),

    #[error(transparent)]
    Archive(#[from] ZipError),

    #[error("catalog: {0}")]
    Catalog(#[from] rusqlite::Error),

    /// No upstream archive and no catalog record for the requested date.
    #[error("no data for date {0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(&'static str),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Upstream(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

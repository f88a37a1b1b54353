use std::time::Duration;

use thiserror::Error;

/// Coarse classification used by the retry policy and the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    NotFound,
    Stale,
    Intercepted,
    NotInteractable,
    Navigation,
    Driver,
    Fatal,
    Storage,
}

impl ErrorKind {
    /// Interaction failures that usually clear up on their own.
    pub const TRANSIENT: &'static [ErrorKind] = &[
        ErrorKind::Timeout,
        ErrorKind::NotFound,
        ErrorKind::Stale,
        ErrorKind::Intercepted,
        ErrorKind::NotInteractable,
    ];
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("timed out after {:.1}s waiting for {what}", .after.as_secs_f64())]
    Timeout { what: String, after: Duration },

    #[error("element not found: {0}")]
    NotFound(String),

    #[error("stale element reference: {0}")]
    Stale(String),

    #[error("click intercepted by overlay: {0}")]
    Intercepted(String),

    #[error("element not interactable: {0}")]
    NotInteractable(String),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("webdriver: {0}")]
    Driver(String),

    #[error("browser session lost: {0}")]
    SessionLost(String),

    #[error("ledger: {0}")]
    Ledger(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl HarvestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarvestError::Timeout { .. } => ErrorKind::Timeout,
            HarvestError::NotFound(_) => ErrorKind::NotFound,
            HarvestError::Stale(_) => ErrorKind::Stale,
            HarvestError::Intercepted(_) => ErrorKind::Intercepted,
            HarvestError::NotInteractable(_) => ErrorKind::NotInteractable,
            HarvestError::Navigation { .. } => ErrorKind::Navigation,
            HarvestError::Driver(_) => ErrorKind::Driver,
            HarvestError::SessionLost(_) => ErrorKind::Fatal,
            HarvestError::Ledger(_) | HarvestError::Io(_) | HarvestError::Csv(_) => {
                ErrorKind::Storage
            }
        }
    }

    /// Fatal errors abort the whole run. Storage failures count too: a run that
    /// cannot checkpoint must not keep harvesting.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal | ErrorKind::Storage)
    }

    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        HarvestError::Timeout {
            what: what.into(),
            after,
        }
    }
}

pub type Result<T, E = HarvestError> = std::result::Result<T, E>;

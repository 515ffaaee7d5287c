use thiserror::Error;

use crate::store::StoreError;

/// Error outputs from a provisioning run.
///
/// Each variant corresponds to one user-facing failure category, so a caller
/// can tell "bad local data" apart from "server rejected us" without seeing
/// protocol internals. The reason strings are diagnostic detail for logs.
#[derive(Debug, Error)]
pub enum AnisetteError {
    /// The run was cancelled: upstream work already failed before this
    /// component started, or the user declined the legacy-server warning.
    #[error("cancelled")]
    Cancelled,
    /// A legacy (V1) server returned a malformed or incomplete response.
    #[error("invalid_anisette: {0}")]
    InvalidAnisette(String),
    /// A V3 server returned a malformed response, the header fetch failed,
    /// or the server reported a `GetHeadersError`.
    #[error("anisette_error: {0}")]
    Anisette(String),
    /// The provisioning handshake failed terminally: an error/invalid/timeout
    /// result, an unmodeled message, or an unexpected disconnect.
    #[error("provisioning_error: {0}")]
    Provisioning(String),
    /// The secure identity store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AnisetteError {
    pub(crate) fn invalid_anisette(reason: impl Into<String>) -> Self {
        Self::InvalidAnisette(reason.into())
    }

    pub(crate) fn anisette(reason: impl Into<String>) -> Self {
        Self::Anisette(reason.into())
    }

    pub(crate) fn provisioning(reason: impl Into<String>) -> Self {
        Self::Provisioning(reason.into())
    }
}

use thiserror::Error;

/// Failure kinds surfaced by the grade computation core.
///
/// A cohort that resolves to no classroom is not an error; callers get an
/// empty cohort and a warning instead.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("export failed: {0}")]
    Export(#[from] csv::Error),
}

impl CoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Stable wire code for the IPC error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidInput(_) => "bad_params",
            Self::Persistence(_) => "db_query_failed",
            Self::Export(_) => "export_failed",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

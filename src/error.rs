use std::time::Duration;

use thiserror::Error;

/// Errors raised at the external catalog boundary.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited by catalog API (retry-after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Invalid external ID format: {0:?}")]
    InvalidIdFormat(String),

    #[error("Not found in catalog: {0}")]
    NotFound(String),

    #[error("Malformed payload from {context}: {reason}")]
    MalformedPayload { context: String, reason: String },

    #[error("HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0} request timed out after {1:?}")]
    Timeout(&'static str, Duration),
}

impl CatalogError {
    pub fn malformed(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            context: context.into(),
            reason: reason.into(),
        }
    }

    /// Transient failures worth another attempt under the retry policy.
    /// Rate limiting has its own retry-once rule and is not included here.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status >= 500,
            Self::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Self::Timeout(..) => true,
            _ => false,
        }
    }

    /// Errors that make the remainder of the run pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Errors raised by the relational store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Database {0} timed out after {1:?}")]
    Timeout(&'static str, Duration),

    #[error("{entity} {id} does not exist")]
    MissingParent { entity: &'static str, id: String },

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("{0}")]
    Injected(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            Self::Timeout(..) => true,
            _ => false,
        }
    }
}

/// Errors raised while mapping catalog records to internal entities.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Invalid external ID {id:?} on {entity}")]
    InvalidExternalId { entity: &'static str, id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("{0} not set")]
    MissingEnv(&'static str),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Errors that end a whole sync or reconcile run.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient_client_errors_are_not() {
        let busy = CatalogError::Status {
            status: 503,
            url: "x".into(),
        };
        let bad = CatalogError::Status {
            status: 400,
            url: "x".into(),
        };
        assert!(busy.is_transient());
        assert!(!bad.is_transient());
        assert!(!CatalogError::RateLimited { retry_after: None }.is_transient());
        assert!(!CatalogError::NotFound("a".into()).is_transient());
    }

    #[test]
    fn only_auth_is_fatal() {
        assert!(CatalogError::Auth("bad creds".into()).is_fatal());
        assert!(!CatalogError::InvalidIdFormat("x".into()).is_fatal());
    }

    #[test]
    fn pool_timeouts_are_transient() {
        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_transient());
        assert!(!StoreError::Injected("boom".into()).is_transient());
    }
}

use anyhow::anyhow;
use serde_json::Value;

pub type Result<T> = std::result::Result<T, LibError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Conflict,
    Database,
    Internal,
    InvalidInput,
    NotFound,
}

impl ErrorKind {
    /// HTTP-equivalent status class for the envelope.
    pub const fn status_code(self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::InvalidInput => 422,
            ErrorKind::Database | ErrorKind::Internal => 500,
        }
    }

    pub const fn is_internal(self) -> bool {
        matches!(self, ErrorKind::Database | ErrorKind::Internal)
    }
}

pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
pub const NOT_FOUND: &str = "NOT_FOUND";
pub const CONFLICT: &str = "CONFLICT";
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

#[derive(Debug)]
pub struct LibError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub public: &'static str,
    pub details: Option<Value>,
    pub source: anyhow::Error,
}

impl LibError {
    pub fn database(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Database,
            code: INTERNAL_ERROR,
            public,
            details: None,
            source,
        }
    }

    pub fn invalid(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code: VALIDATION_ERROR,
            public,
            details: None,
            source,
        }
    }

    /// Request could not be decoded into the input contract at all.
    pub fn bad_request(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::BadRequest,
            code: VALIDATION_ERROR,
            public,
            details: None,
            source,
        }
    }

    pub fn not_found(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            code: NOT_FOUND,
            public,
            details: None,
            source,
        }
    }

    pub fn conflict(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Conflict,
            code: CONFLICT,
            public,
            details: None,
            source,
        }
    }

    pub fn internal(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Internal,
            code: INTERNAL_ERROR,
            public,
            details: None,
            source,
        }
    }

    pub fn corrupt_record(source: anyhow::Error) -> Self {
        Self::internal("Corrupt person record", source)
    }

    pub fn message(public: &'static str) -> Self {
        Self::internal(public, anyhow!(public))
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for LibError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.public)
    }
}

impl std::error::Error for LibError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source)
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for LibError {
    fn from(value: sqlx::Error) -> Self {
        Self::database("Database request failed", anyhow!(value))
    }
}

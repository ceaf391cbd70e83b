//! Error types shared by the resolver, the TAP client, the executor and the writers

use thiserror::Error;

/// Probe error types
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Invalid coordinate input: {0}")]
    InvalidCoordinateInput(String),

    #[error("Unresolvable name: {0}")]
    UnresolvableName(String),

    #[error("Service {0} must have an access_url")]
    MissingAccessUrl(String),

    #[error("TAP service {0} has no ADQL template")]
    MissingAdqlTemplate(String),

    #[error("Invalid plug-in specification: \"{0}\"")]
    InvalidPluginSpec(String),

    #[error("No plugin found for spec: {0}")]
    UnknownPlugin(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("HTTP status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("UWS protocol error: {0}")]
    Protocol(String),

    #[error("Async TAP job {url} timed out, exceeding {timeout_secs}s")]
    AsyncTimeout { url: String, timeout_secs: f64 },

    #[error("Cannot wait for job completion. Job {url} is not active (phase {phase})")]
    JobNotActive { url: String, phase: String },

    #[error("Query error: job {url} finished in phase {phase}")]
    QueryExecution { phase: String, url: String },

    #[error("Error reading result table: {0}")]
    ResultParse(String),

    #[error("Too many durations added (limit {0})")]
    TooManyDurations(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias using ProbeError
pub type Result<T> = std::result::Result<T, ProbeError>;

impl ProbeError {
    /// Errors that must stop the whole batch instead of being folded into a
    /// record's `errmsg`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProbeError::TooManyDurations(_))
    }

    /// Errors that belong to setup: they are reported before any query runs.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ProbeError::MissingAccessUrl(_)
                | ProbeError::MissingAdqlTemplate(_)
                | ProbeError::InvalidPluginSpec(_)
                | ProbeError::UnknownPlugin(_)
                | ProbeError::Config(_)
        )
    }
}

impl From<reqwest::Error> for ProbeError {
    fn from(err: reqwest::Error) -> Self {
        match (err.status(), err.url()) {
            (Some(status), Some(url)) => ProbeError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            },
            _ => ProbeError::Http(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ProbeError {
    fn from(err: serde_json::Error) -> Self {
        ProbeError::Serialization(err.to_string())
    }
}

impl From<csv::Error> for ProbeError {
    fn from(err: csv::Error) -> Self {
        ProbeError::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for ProbeError {
    fn from(err: sqlx::Error) -> Self {
        ProbeError::DatabaseError(err.to_string())
    }
}

impl From<quick_xml::Error> for ProbeError {
    fn from(err: quick_xml::Error) -> Self {
        ProbeError::ResultParse(err.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for ProbeError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        ProbeError::ResultParse(err.to_string())
    }
}

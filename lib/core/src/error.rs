use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Feature matrix not built: {metric}@{language}")]
    NotBuilt { metric: String, language: String },

    #[error("Normalizer not fitted: {0}")]
    NotFitted(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Normalization error: {0}")]
    Normalization(String),

    #[error("Capacity exceeded: requested {requested}, limit {limit}")]
    CapacityExceeded { requested: usize, limit: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Build cancelled: {0}")]
    Cancelled(String),

    #[error("Corrupt artifact: {0}")]
    Corrupt(String),
}

impl Error {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Stale cursor: {0}")]
    StaleCursor(String),

    #[error("Extension timeout: {0}")]
    ExtensionTimeout(String),

    #[error("Extension error: {0}")]
    Extension(String),

    #[error("Invalid parameter '{param}': {message}")]
    InvalidParam { param: String, message: String },

    #[error("Missing parameter: {0}")]
    MissingParam(String),

    #[error("Unknown mode: {0}")]
    UnknownMode(String),

    #[error("No data: {0}")]
    NoData(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn invalid_param(param: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidParam {
            param: param.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("CDP error: {0}")]
    Cdp(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Navigation timeout: {0}")]
    NavigationTimeout(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Preload cache full: {0} entries")]
    ResourceExhausted(usize),

    #[error("Invalid duration string: {0:?}")]
    InvalidDuration(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

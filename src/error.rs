use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("service error: {0}")]
    Service(String),
}

pub type Result<T> = std::result::Result<T, SchedError>;

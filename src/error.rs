//! Error types for the stream multiplexer.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("dial failed: {0}")]
    Dial(String),

    #[error("no book for asset {0}")]
    BookNotFound(String),

    #[error("book for asset {0} is missing a side")]
    IncompleteBook(String),

    #[error("unknown event type: {0}")]
    UnknownEventKind(String),

    #[error("no group with id {0}")]
    GroupNotFound(u64),

    #[error("{0}")]
    Generic(String),
}

pub type Result<T> = std::result::Result<T, Error>;

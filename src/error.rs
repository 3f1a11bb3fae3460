use std::time::Duration;

use thiserror::Error;

pub use anyhow::Context;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
    #[error("API key rejected by quote provider")]
    Auth,
    #[error("rate limit exhausted, next token in {0:?}")]
    RateLimited(Duration),
    #[error("fetch failed for {symbol}: {reason}")]
    Fetch { symbol: String, reason: String },
    #[error("wallpaper publish failed: {0}")]
    Publish(String),
    #[error("job cancelled")]
    Cancelled,
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn message<T: Into<String>>(msg: T) -> Self {
        AppError::Message(msg.into())
    }

    pub fn fetch(symbol: &str, reason: impl Into<String>) -> Self {
        AppError::Fetch {
            symbol: symbol.to_string(),
            reason: reason.into(),
        }
    }
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("archive responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("archive reported error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

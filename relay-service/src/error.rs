use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::providers::ProviderError;
use crate::storage::SpoolError;

/// Everything that can end an upload request early
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("No file uploaded")]
    NoFiles,

    #[error("Invalid multipart form: {0}")]
    Multipart(String),

    #[error("Too many files, at most {limit} allowed per upload")]
    TooManyFiles { limit: usize },

    #[error("File '{name}' is too large, the limit is {limit} bytes")]
    FileTooLarge { name: String, limit: u64 },

    #[error("Upload exceeds the request size limit")]
    RequestTooLarge,

    #[error("Upload failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Convert a multipart framing or body read failure. A body cut off by
    /// the request size limit stays a 413.
    pub fn from_multipart(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            RelayError::RequestTooLarge
        } else {
            RelayError::Multipart(err.body_text())
        }
    }

    /// Convert a spooling failure for the part named `name`
    pub fn from_spool(name: &str, err: SpoolError) -> Self {
        match err {
            SpoolError::TooLarge { limit } => RelayError::FileTooLarge {
                name: name.to_string(),
                limit,
            },
            SpoolError::BodyTooLarge => RelayError::RequestTooLarge,
            SpoolError::Stream(message) => RelayError::Multipart(message),
            SpoolError::Io(e) => RelayError::Io(e),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::NoFiles => StatusCode::BAD_REQUEST,
            RelayError::Multipart(_) => StatusCode::BAD_REQUEST,
            RelayError::TooManyFiles { .. } => StatusCode::BAD_REQUEST,
            RelayError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            RelayError::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            RelayError::Provider(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (self.status_code(), format!("❌ {}", self)).into_response()
    }
}

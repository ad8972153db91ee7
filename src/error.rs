//! 对外的错误分类，以及到 HTTP 状态码的映射

use rocket::http::Status;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use rocket::Request;
use thiserror::Error;
use tracing::error;

use crate::types::ErrorResponse;

/// Message shown to clients for internal failures; the detail stays in the logs.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error while generating a response";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Model not loaded. Please try again later.")]
    ServiceUnavailable,

    #[error("{0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    pub fn status(&self) -> Status {
        match self {
            ChatError::ServiceUnavailable => Status::ServiceUnavailable,
            ChatError::InvalidInput(_) => Status::BadRequest,
            ChatError::Internal(_) => Status::InternalServerError,
        }
    }

    /// Text that is safe to hand back to the client.
    pub fn public_message(&self) -> String {
        match self {
            ChatError::Internal(_) => INTERNAL_ERROR_MESSAGE.to_string(),
            other => other.to_string(),
        }
    }
}

impl<'r> Responder<'r, 'static> for ChatError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        if let ChatError::Internal(detail) = &self {
            error!(uri = %req.uri(), "chat request failed: {detail}");
        }
        let body = ErrorResponse {
            detail: self.public_message(),
        };
        (self.status(), Json(body)).respond_to(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_error_category() {
        assert_eq!(ChatError::ServiceUnavailable.status(), Status::ServiceUnavailable);
        assert_eq!(ChatError::InvalidInput("x".into()).status(), Status::BadRequest);
        assert_eq!(ChatError::Internal("x".into()).status(), Status::InternalServerError);
    }

    #[test]
    fn internal_detail_is_not_public() {
        let err = ChatError::Internal("tensor shape mismatch".into());
        assert_eq!(err.public_message(), INTERNAL_ERROR_MESSAGE);
        assert!(err.to_string().contains("tensor shape mismatch"));
    }
}

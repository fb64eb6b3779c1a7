use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyClosed,
    ConnectTimeout,
    ConnectFailed,
    AuthFailed,
    RemoteClosed,
    ExecTimeout,
    PtyUnavailable,
    SpawnFailed,
    IoError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error_code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Message plus details, the form shown to users in transcripts and toasts.
    pub fn describe(&self) -> String {
        match &self.details {
            Some(details) if !details.is_empty() => format!("{}: {}", self.message, details),
            _ => self.message.clone(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_code, self.message)
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{0}")]
    Api(ApiError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl From<ApiError> for BridgeError {
    fn from(value: ApiError) -> Self {
        Self::Api(value)
    }
}

impl BridgeError {
    /// Flattens any variant into the wire-level error shape.
    pub fn into_api(self) -> ApiError {
        match self {
            BridgeError::Api(err) => err,
            BridgeError::Io(err) => ApiError::new(ErrorCode::IoError, err.to_string()),
            BridgeError::Json(err) => ApiError::new(ErrorCode::InvalidArgument, err.to_string()),
            BridgeError::Regex(err) => ApiError::new(ErrorCode::InvalidArgument, err.to_string()),
        }
    }
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyClosed => "ALREADY_CLOSED",
            ErrorCode::ConnectTimeout => "CONNECT_TIMEOUT",
            ErrorCode::ConnectFailed => "CONNECT_FAILED",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::RemoteClosed => "REMOTE_CLOSED",
            ErrorCode::ExecTimeout => "EXEC_TIMEOUT",
            ErrorCode::PtyUnavailable => "PTY_UNAVAILABLE",
            ErrorCode::SpawnFailed => "SPAWN_FAILED",
            ErrorCode::IoError => "IO_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_serializes_screaming_snake_case() {
        let value = serde_json::to_value(ErrorCode::PtyUnavailable).expect("serialize");
        assert_eq!(value, serde_json::json!("PTY_UNAVAILABLE"));
        assert_eq!(ErrorCode::PtyUnavailable.to_string(), "PTY_UNAVAILABLE");
    }

    #[test]
    fn describe_appends_details() {
        let err = ApiError::new(ErrorCode::ConnectFailed, "Telnet connect failed")
            .with_details("Connection refused");
        assert_eq!(err.describe(), "Telnet connect failed: Connection refused");
        let bare = ApiError::new(ErrorCode::NotFound, "Session not found");
        assert_eq!(bare.describe(), "Session not found");
    }

    #[test]
    fn into_api_keeps_codes_for_every_variant() {
        let api: BridgeError = ApiError::new(ErrorCode::AuthFailed, "denied").into();
        assert_eq!(api.into_api().error_code, ErrorCode::AuthFailed);

        let io: BridgeError = std::io::Error::other("broken pipe").into();
        let io = io.into_api();
        assert_eq!(io.error_code, ErrorCode::IoError);
        assert!(io.message.contains("broken pipe"));

        let json: BridgeError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(json.into_api().error_code, ErrorCode::InvalidArgument);

        let regex: BridgeError = regex::Regex::new("[").unwrap_err().into();
        assert_eq!(regex.into_api().error_code, ErrorCode::InvalidArgument);
    }
}

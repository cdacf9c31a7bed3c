//! WOPI 错误类型与响应编码：结果到状态码与协议头的确定性映射。

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::io::ErrorKind;
use tracing::{debug, warn};

use crate::config::{HEADER_HANDLER_DIAG, HEADER_LOCK, HEADER_LOCK_FAILURE_REASON};
use crate::lease::LockMismatch;
use crate::storage::StorageError;

#[derive(Debug)]
pub enum WopiError {
    BadRequest(String),
    InvalidToken,
    NotFound(String),
    LockMismatch(LockMismatch),
    Unsupported(&'static str),
    ProofKeyInvalid,
    Internal(String),
}

impl IntoResponse for WopiError {
    fn into_response(self) -> Response {
        match self {
            WopiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            WopiError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid Token").into_response(),
            WopiError::NotFound(reason) => {
                debug!(reason = %reason, "file unknown or access denied");
                (StatusCode::NOT_FOUND, "File Unknown/User Unauthorized").into_response()
            }
            WopiError::LockMismatch(mismatch) => {
                let mut headers = HeaderMap::new();
                let current = mismatch.current.as_deref().unwrap_or_default();
                insert_header(&mut headers, HEADER_LOCK, current);
                if mismatch.current.is_none()
                    && let Some(reason) = mismatch.reason.as_deref().filter(|r| !r.is_empty())
                {
                    insert_header(&mut headers, HEADER_LOCK_FAILURE_REASON, reason);
                }
                (
                    StatusCode::CONFLICT,
                    headers,
                    "Lock mismatch/Locked by another interface",
                )
                    .into_response()
            }
            WopiError::Unsupported(operation) => {
                (StatusCode::NOT_IMPLEMENTED, format!("Unsupported: {operation}"))
                    .into_response()
            }
            WopiError::ProofKeyInvalid => {
                let mut headers = HeaderMap::new();
                insert_header(
                    &mut headers,
                    HEADER_HANDLER_DIAG,
                    "Proof Key Validation failure!",
                );
                (StatusCode::INTERNAL_SERVER_ERROR, headers, "Server Error").into_response()
            }
            WopiError::Internal(msg) => {
                warn!(error = %msg, "wopi request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Server Error").into_response()
            }
        }
    }
}

/// 写入协议头；值不是合法头部字符时跳过并记录。
pub fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(name), value);
        }
        Err(_) => warn!(header = name, "header value is not representable"),
    }
}

impl From<LockMismatch> for WopiError {
    fn from(mismatch: LockMismatch) -> Self {
        WopiError::LockMismatch(mismatch)
    }
}

impl From<StorageError> for WopiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => WopiError::NotFound("invalid path".into()),
            StorageError::NotFound => WopiError::NotFound("not a file".into()),
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                    WopiError::NotFound(err.to_string())
                }
                _ => WopiError::Internal(err.to_string()),
            },
        }
    }
}

//! rackrpc Response Types

use serde::{Deserialize, Serialize};
use super::{RemoteError, RequestId};

/// Command result (JSON value, normally an object).
pub type RpcResult = serde_json::Value;

/// A response to a [`Request`](super::Request), matched to it by `id`.
///
/// Exactly one of `result` and `error` is present.
///
/// # Example
///
/// ```
/// use rackrpc_common::protocol::{RemoteError, Response};
/// use serde_json::json;
///
/// let ok = Response::success(7, json!({"ident": "region1"}));
/// assert!(ok.is_success());
///
/// let failed = Response::error(7, RemoteError::unhandled_command("PowerOn"));
/// assert!(!failed.is_success());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    /// Request identifier this response corresponds to
    pub id: RequestId,
    /// Result value (present on success)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RpcResult>,
    /// Structured error (present on failure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl Response {
    pub fn success(id: RequestId, result: RpcResult) -> Self {
        Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: RequestId, error: RemoteError) -> Self {
        Response {
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Converts the response into the caller-facing result.
    ///
    /// A success response without a result is treated as an empty object,
    /// since commands such as `StartTLS` answer with nothing.
    pub fn into_result(self) -> super::Result<RpcResult> {
        match self.error {
            Some(error) => Err(error.into()),
            None => Ok(self.result.unwrap_or_else(|| serde_json::json!({}))),
        }
    }
}

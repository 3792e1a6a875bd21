pub mod commands;
pub mod error;
pub mod requests;
pub mod responses;

#[cfg(test)]
mod tests;

pub use error::{RemoteError, Result, RpcError};
pub use requests::{Args, CommandName, Request, RequestId};
pub use responses::{Response, RpcResult};

use serde::{Deserialize, Serialize};

/// One message on the wire.
///
/// The link is symmetric, so either side may send either variant at any time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Request(Request),
    Response(Response),
}

impl From<Request> for Frame {
    fn from(request: Request) -> Self {
        Frame::Request(request)
    }
}

impl From<Response> for Frame {
    fn from(response: Response) -> Self {
        Frame::Response(response)
    }
}

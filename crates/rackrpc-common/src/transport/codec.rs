use crate::protocol::error::Result;
use crate::protocol::Frame;

/// JSON codec for protocol frames.
///
/// # Example
///
/// ```
/// use rackrpc_common::transport::JsonCodec;
/// use rackrpc_common::protocol::{Frame, Request};
/// use serde_json::json;
///
/// let frame = Frame::from(Request::new("Identify", json!({})));
/// let encoded = JsonCodec::encode(&frame).unwrap();
/// let decoded = JsonCodec::decode(&encoded).unwrap();
/// assert_eq!(frame, decoded);
/// ```
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode(frame: &Frame) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(frame)?)
    }

    pub fn decode(data: &[u8]) -> Result<Frame> {
        Ok(serde_json::from_slice(data)?)
    }
}

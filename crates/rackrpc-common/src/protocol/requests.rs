use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

pub type RequestId = u64;
pub type CommandName = String;

/// Named arguments of a command.
pub type Args = serde_json::Map<String, serde_json::Value>;

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub command: CommandName,
    #[serde(default)]
    pub args: Args,
}

impl Request {
    /// Creates a request with a fresh id.
    ///
    /// `args` is expected to be a JSON object; anything else is sent as an
    /// empty argument map.
    pub fn new(command: impl Into<String>, args: serde_json::Value) -> Self {
        let args = match args {
            serde_json::Value::Object(map) => map,
            _ => Args::new(),
        };
        Request {
            id: generate_request_id(),
            command: command.into(),
            args,
        }
    }
}

fn generate_request_id() -> RequestId {
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let counter = REQUEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst);

    // upper 32 bits from the clock, lower 32 bits from the counter
    (timestamp & 0xFFFFFFFF00000000) | (counter & 0xFFFFFFFF)
}

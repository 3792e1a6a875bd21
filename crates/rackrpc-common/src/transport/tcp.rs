use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::error::{Result, RpcError};
use crate::protocol::{Frame, Request, Response};
use crate::transport::codec::JsonCodec;

/// Default timeout for establishing a TCP connection (5 seconds)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frame body size (100 MB)
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Async TCP transport for rackrpc.
///
/// Dials peers and moves length-prefixed frames over any async stream, so the
/// same code serves the plain TCP phase and the TLS phase of a connection.
///
/// # Wire Protocol
///
/// ```text
/// [4-byte length] [JSON data]
/// ```
///
/// # Example
///
/// ```no_run
/// use rackrpc_common::transport::TcpTransport;
/// use rackrpc_common::protocol::Request;
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = TcpTransport::new();
/// let mut stream = transport.connect("127.0.0.1", 5250).await?;
///
/// let request = Request::new("Identify", json!({}));
/// let response = TcpTransport::send_request(&mut stream, &request).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Connects to `host:port`.
    ///
    /// The host may resolve to several socket addresses; each is tried in
    /// turn until one accepts. The whole attempt is bounded by the connect
    /// timeout.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        tokio::time::timeout(self.connect_timeout, Self::connect_any(host, port))
            .await
            .map_err(|_| RpcError::Timeout(self.connect_timeout.as_millis() as u64))?
    }

    async fn connect_any(host: &str, port: u16) -> Result<TcpStream> {
        let socket_addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| RpcError::Connection(format!("Invalid address '{}:{}': {}", host, port, e)))?;

        let mut last_err = None;
        for socket_addr in socket_addrs {
            match TcpStream::connect(socket_addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => {
                    last_err = Some(e);
                }
            }
        }

        Err(RpcError::Connection(format!(
            "Failed to connect to {}:{}: {}",
            host,
            port,
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "no addresses resolved".to_string())
        )))
    }

    /// Sends a request and waits for its response.
    ///
    /// Only valid while nothing else is reading the stream (the handshake
    /// phase); any frame that is not the matching response is a protocol
    /// violation.
    pub async fn send_request<S>(stream: &mut S, request: &Request) -> Result<Response>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        Self::send_frame(stream, &Frame::Request(request.clone())).await?;

        match Self::receive_frame(stream).await? {
            Frame::Response(response) if response.id == request.id => Ok(response),
            Frame::Response(response) => Err(RpcError::ProtocolViolation(format!(
                "response id {} does not match request id {}",
                response.id, request.id
            ))),
            Frame::Request(other) => Err(RpcError::ProtocolViolation(format!(
                "unexpected {} request while waiting for {}",
                other.command, request.command
            ))),
        }
    }

    pub async fn send_frame<W>(stream: &mut W, frame: &Frame) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = JsonCodec::encode(frame)?;
        Self::send_message(stream, &encoded).await
    }

    pub async fn receive_frame<R>(stream: &mut R) -> Result<Frame>
    where
        R: AsyncRead + Unpin,
    {
        let data = Self::receive_message(stream).await?;
        JsonCodec::decode(&data)
    }

    /// Sends a message with length prefix.
    ///
    /// Wire format: `[4-byte length as u32 big-endian] + [data]`
    pub async fn send_message<W>(stream: &mut W, data: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(RpcError::ProtocolViolation(format!(
                "Message too large: {} bytes (max {} bytes)",
                data.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        let len = data.len() as u32;

        stream
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| Self::map_io_error(e, "writing length prefix"))?;
        stream
            .write_all(data)
            .await
            .map_err(|e| Self::map_io_error(e, "writing data"))?;
        stream
            .flush()
            .await
            .map_err(|e| Self::map_io_error(e, "flushing stream"))?;

        Ok(())
    }

    /// Receives a message with length prefix.
    ///
    /// A clean end-of-stream yields [`RpcError::ConnectionClosed`].
    pub async fn receive_message<R>(stream: &mut R) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| Self::map_io_error(e, "reading length prefix"))?;

        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_MESSAGE_SIZE {
            return Err(RpcError::ProtocolViolation(format!(
                "Message too large: {} bytes (max {} bytes)",
                len, MAX_MESSAGE_SIZE
            )));
        }

        let mut buf = vec![0u8; len];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| Self::map_io_error(e, "reading data"))?;

        Ok(buf)
    }

    /// Map IO errors to appropriate RpcError variants
    fn map_io_error(err: std::io::Error, context: &str) -> RpcError {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => RpcError::ConnectionClosed,
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected => {
                RpcError::Connection(format!("{}: Connection lost", context))
            }
            _ => RpcError::Io(err),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

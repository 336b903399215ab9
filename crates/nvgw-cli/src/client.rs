//! Synchronous gateway client.
//!
//! One connection per invocation: connect, send a framed request, read
//! the framed response, close. Framing matches the daemon: 4-byte
//! big-endian length, one tag byte, prost body.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use nvgw_daemon::protocol::messages::MessageType;
use nvgw_daemon::protocol::MAX_FRAME_SIZE;
use prost::Message;

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Client errors, mapped onto the CLI exit codes.
#[derive(Debug)]
pub enum ClientError {
    /// The gateway could not be reached (exit code 3).
    Connection(String),
    /// The gateway answered with a non-zero status (exit code 2).
    Server {
        /// Canonical status code.
        status: u32,
        /// Error message from the gateway.
        message: String,
    },
    /// The response could not be decoded (exit code 2).
    Protocol(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(message) => write!(f, "connection failed: {message}"),
            Self::Server { status, message } => {
                write!(f, "gateway error (status {status}): {message}")
            }
            Self::Protocol(message) => write!(f, "protocol error: {message}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl ClientError {
    /// CLI exit code for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Connection(_) => 3,
            Self::Server { .. } | Self::Protocol(_) => 2,
        }
    }
}

/// Gateway admin client.
pub struct GatewayClient {
    address: String,
    timeout: Duration,
}

impl GatewayClient {
    /// Client for `host:port`.
    #[must_use]
    pub fn new(address: String) -> Self {
        Self {
            address,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sends one request and decodes the typed response.
    ///
    /// # Errors
    ///
    /// `Connection` when the gateway is unreachable, `Protocol` on a
    /// malformed response.
    pub fn call<Req, Resp>(&self, tag: MessageType, request: &Req) -> Result<Resp, ClientError>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let mut stream = TcpStream::connect(&self.address)
            .map_err(|e| ClientError::Connection(format!("{}: {e}", self.address)))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .and_then(|()| stream.set_write_timeout(Some(self.timeout)))
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        let mut payload = Vec::with_capacity(1 + request.encoded_len());
        payload.push(tag as u8);
        request
            .encode(&mut payload)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        #[allow(clippy::cast_possible_truncation)]
        let length = (payload.len() as u32).to_be_bytes();
        stream
            .write_all(&length)
            .and_then(|()| stream.write_all(&payload))
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        let mut header = [0u8; 4];
        stream
            .read_exact(&mut header)
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        let length = u32::from_be_bytes(header) as usize;
        if length == 0 || length > MAX_FRAME_SIZE {
            return Err(ClientError::Protocol(format!("bad frame length {length}")));
        }
        let mut frame = vec![0u8; length];
        stream
            .read_exact(&mut frame)
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        if frame[0] != tag as u8 {
            return Err(ClientError::Protocol(format!(
                "response tag {} does not match request tag {}",
                frame[0], tag as u8
            )));
        }
        Resp::decode(&frame[1..]).map_err(|e| ClientError::Protocol(e.to_string()))
    }
}

/// Turns a `{status, error_message}` pair into a client result.
///
/// # Errors
///
/// `Server` for any non-zero status.
pub fn check_status(status: u32, error_message: &str) -> Result<(), ClientError> {
    if status == 0 {
        Ok(())
    } else {
        Err(ClientError::Server {
            status,
            message: error_message.to_string(),
        })
    }
}

//! Out-of-band swap of [`ConnectionParameters`] over TCP.
//!
//! Each side sends one JSON object terminated by `\n`. The responder reads first and the
//! initiator writes first, so the two never wait on each other.

use std::{io, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, info};

use crate::queue_pair::ConnectionParameters;

/// Failures of the control channel
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Socket I/O failed
    #[error("control channel {context} failed: {source}")]
    Io {
        /// What was being done
        context: &'static str,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// The local parameters could not be serialized
    #[error("failed to encode connection parameters: {0}")]
    Encode(#[source] serde_json::Error),
    /// The peer sent something that is not a parameter record
    #[error("malformed connection parameters from peer: {0}")]
    Decode(#[source] serde_json::Error),
    /// The peer hung up before a full line arrived
    #[error("peer closed the control channel before sending its parameters")]
    Closed,
}

/// Shorthand to wrap an I/O error with what was being done
fn io_err(context: &'static str) -> impl FnOnce(io::Error) -> ExchangeError {
    move |source| ExchangeError::Io { context, source }
}

/// Which side of the exchange this process plays
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Listen on `bind` and serve the first connection
    Responder {
        /// Listen address
        bind: SocketAddr,
    },
    /// Connect to `addr`, retrying while the responder is not listening yet
    Initiator {
        /// `host:port` of the responder
        addr: String,
        /// Extra connection attempts after the first
        retries: u32,
        /// Pause between attempts
        retry_delay: Duration,
    },
}

/// Serialize `params` as one JSON line
#[inline]
pub fn encode_line(params: &ConnectionParameters) -> Result<Vec<u8>, ExchangeError> {
    let mut line = serde_json::to_vec(params).map_err(ExchangeError::Encode)?;
    line.push(b'\n');
    Ok(line)
}

/// Parse one JSON line, with or without its newline
#[inline]
pub fn decode_line(line: &str) -> Result<ConnectionParameters, ExchangeError> {
    serde_json::from_str(line.trim_end()).map_err(ExchangeError::Decode)
}

/// Read one full line, `Closed` if the stream ends first
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, ExchangeError> {
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .await
        .map_err(io_err("read"))?;
    if read == 0 || !line.ends_with('\n') {
        return Err(ExchangeError::Closed);
    }
    Ok(line)
}

/// Write `local` as one line and flush
async fn write_params<W: AsyncWrite + Unpin>(
    writer: &mut W,
    local: &ConnectionParameters,
) -> Result<(), ExchangeError> {
    let line = encode_line(local)?;
    writer.write_all(&line).await.map_err(io_err("write"))?;
    writer.flush().await.map_err(io_err("flush"))
}

/// Responder half over an established stream: read, reply, then parse
#[inline]
pub async fn respond<S>(
    stream: S,
    local: &ConnectionParameters,
) -> Result<ConnectionParameters, ExchangeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    let line = read_line(&mut stream).await?;
    write_params(stream.get_mut(), local).await?;
    decode_line(&line)
}

/// Initiator half over an established stream: write, then read the reply
#[inline]
pub async fn initiate<S>(
    stream: S,
    local: &ConnectionParameters,
) -> Result<ConnectionParameters, ExchangeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    write_params(stream.get_mut(), local).await?;
    let line = read_line(&mut stream).await?;
    decode_line(&line)
}

/// A request/response swap of connection parameters with exactly one peer
#[async_trait]
pub trait ControlChannel {
    /// Hand over `local`, get the peer's parameters back
    async fn exchange(
        &mut self,
        local: &ConnectionParameters,
    ) -> Result<ConnectionParameters, ExchangeError>;
}

/// [`ControlChannel`] over a single TCP connection
#[derive(Debug, Clone)]
pub struct TcpControlChannel {
    /// Which side we are
    role: Role,
}

impl TcpControlChannel {
    /// A channel playing `role`
    #[inline]
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

/// Connect, retrying `retries` more times with `delay` in between
async fn connect_with_retry(
    addr: &str,
    retries: u32,
    delay: Duration,
) -> Result<TcpStream, ExchangeError> {
    let mut attempt = 0_u32;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) if attempt < retries => {
                attempt = attempt.saturating_add(1);
                debug!("connect to {} failed ({}), attempt {}", addr, err, attempt);
                tokio::time::sleep(delay).await;
            }
            Err(source) => {
                return Err(ExchangeError::Io {
                    context: "connect",
                    source,
                })
            }
        }
    }
}

#[async_trait]
impl ControlChannel for TcpControlChannel {
    async fn exchange(
        &mut self,
        local: &ConnectionParameters,
    ) -> Result<ConnectionParameters, ExchangeError> {
        let remote = match self.role {
            Role::Responder { bind } => {
                let listener = TcpListener::bind(bind).await.map_err(io_err("bind"))?;
                info!("waiting for the peer on {}", bind);
                let (stream, peer) = listener.accept().await.map_err(io_err("accept"))?;
                debug!("control connection from {}", peer);
                respond(stream, local).await?
            }
            Role::Initiator {
                ref addr,
                retries,
                retry_delay,
            } => {
                let stream = connect_with_retry(addr, retries, retry_delay).await?;
                debug!("control connection to {}", addr);
                initiate(stream, local).await?
            }
        };
        info!(
            "remote qp {} lid {} gid {}",
            remote.qp_num(),
            remote.lid(),
            remote.gid()
        );
        Ok(remote)
    }
}

/// Run one TCP exchange to completion on a private current-thread runtime
#[inline]
pub fn exchange(
    local: &ConnectionParameters,
    role: Role,
) -> Result<ConnectionParameters, ExchangeError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(io_err("runtime start"))?;
    runtime.block_on(TcpControlChannel::new(role).exchange(local))
}

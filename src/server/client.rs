//! Log Client
//!
//! Dials a log service over TCP (optionally TLS) and issues produce /
//! consume calls. Also provides the peer connector the replicator uses to
//! open record streams.

use super::protocol::{read_frame, write_frame, ErrorCode, FrameError, Request, Response};
use crate::commitlog::{Record, Watermark};
use crate::replicator::PeerConnector;
use crate::tls::PeerTlsConfig;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Stream of records pushed by a remote log service.
pub type RecordStream = BoxStream<'static, Result<Record, ClientError>>;

/// Byte stream a client talks over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Client-side errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tls handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("offset out of range: {0}")]
    OffsetOutOfRange(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("server error ({code:?}): {message}")]
    Server { code: ErrorCode, message: String },
    #[error("connection closed by server")]
    Disconnected,
    #[error("unexpected response from server")]
    UnexpectedResponse,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl ClientError {
    fn from_response(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::OffsetOutOfRange => ClientError::OffsetOutOfRange(message),
            ErrorCode::PermissionDenied => ClientError::PermissionDenied(message),
            code => ClientError::Server { code, message },
        }
    }
}

/// Connection to one log service.
pub struct LogClient {
    addr: String,
    stream: Box<dyn AsyncStream>,
}

impl LogClient {
    /// Dial `addr`, wrapping the connection in TLS when `tls` is given.
    pub async fn connect(addr: &str, tls: Option<&PeerTlsConfig>) -> Result<Self, ClientError> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        let _ = tcp.set_nodelay(true);

        let stream: Box<dyn AsyncStream> = match tls {
            Some(tls) => {
                let tls_stream = tls
                    .connector()
                    .connect(tls.server_name(), tcp)
                    .await
                    .map_err(|source| ClientError::Handshake {
                        addr: addr.to_string(),
                        source,
                    })?;
                Box::new(tls_stream)
            }
            None => Box::new(tcp),
        };

        Ok(Self {
            addr: addr.to_string(),
            stream,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Append a value and return its offset.
    pub async fn produce(&mut self, value: impl Into<Vec<u8>>) -> Result<u64, ClientError> {
        match self.call(&Request::Produce { value: value.into() }).await? {
            Response::Produced { offset } => Ok(offset),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Read the record at `offset`.
    pub async fn consume(&mut self, offset: u64) -> Result<Record, ClientError> {
        match self.call(&Request::Consume { offset }).await? {
            Response::Record(record) => Ok(record),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Turn this connection into a stream of records starting at `offset`.
    ///
    /// The stream ends after the first error or when the server closes the
    /// connection. Dropping it closes the connection.
    pub async fn consume_stream(
        self,
        offset: u64,
        origin: Option<String>,
    ) -> Result<RecordStream, ClientError> {
        self.resume_stream(offset, origin, None).await
    }

    /// Like [`LogClient::consume_stream`], with `offset` taken from the log
    /// instance `log_instance`. If the server now runs a different instance
    /// the stream starts from its first record.
    pub async fn resume_stream(
        mut self,
        offset: u64,
        origin: Option<String>,
        log_instance: Option<String>,
    ) -> Result<RecordStream, ClientError> {
        let request = Request::ConsumeStream {
            offset,
            origin,
            log_instance,
        };
        write_frame(&mut self.stream, &request).await?;

        let records = stream::unfold(Some(self.stream), |state| async move {
            let mut conn = state?;
            match read_frame::<_, Response>(&mut conn).await {
                Ok(Some(Response::Record(record))) => Some((Ok(record), Some(conn))),
                Ok(Some(Response::Error { code, message })) => {
                    Some((Err(ClientError::from_response(code, message)), None))
                }
                Ok(Some(_)) => Some((Err(ClientError::UnexpectedResponse), None)),
                Ok(None) => None,
                Err(e) => Some((Err(e.into()), None)),
            }
        });

        Ok(records.boxed())
    }

    async fn call(&mut self, request: &Request) -> Result<Response, ClientError> {
        write_frame(&mut self.stream, request).await?;
        match read_frame::<_, Response>(&mut self.stream).await? {
            Some(Response::Error { code, message }) => Err(ClientError::from_response(code, message)),
            Some(response) => Ok(response),
            None => Err(ClientError::Disconnected),
        }
    }
}

/// Dials peers over TCP, with TLS when configured.
#[derive(Debug, Clone, Default)]
pub struct TcpPeerConnector {
    tls: Option<PeerTlsConfig>,
}

impl TcpPeerConnector {
    pub fn new(tls: Option<PeerTlsConfig>) -> Self {
        Self { tls }
    }
}

#[async_trait]
impl PeerConnector for TcpPeerConnector {
    async fn stream_records(
        &self,
        addr: &str,
        origin: &str,
        from: Option<&Watermark>,
    ) -> Result<RecordStream, ClientError> {
        let client = LogClient::connect(addr, self.tls.as_ref()).await?;
        let (offset, instance) = match from {
            Some(mark) => (mark.offset + 1, Some(mark.instance.clone())),
            None => (0, None),
        };
        client
            .resume_stream(offset, Some(origin.to_string()), instance)
            .await
    }
}

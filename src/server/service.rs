//! Log Service
//!
//! Accepts TCP connections (optionally TLS), authorizes each request and
//! serves produce / consume / consume-stream calls against the commit log.

use super::drain::{stopped, DrainController};
use super::protocol::{
    read_frame, write_frame, ErrorCode, FrameError, Request, Response, CONSUME_ACTION,
    OBJECT_WILDCARD, PRODUCE_ACTION,
};
use crate::auth::Authorizer;
use crate::commitlog::{CommitLog, LogError, Record};
use crate::tls::{certificate_subject, ServerTlsConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::Instrument;

/// Subject used when the client presented no certificate.
pub const ANONYMOUS_SUBJECT: &str = "anonymous";

/// Log service settings.
#[derive(Clone)]
pub struct ServerConfig {
    pub commit_log: Arc<dyn CommitLog>,
    pub authorizer: Arc<Authorizer>,
    pub tls: Option<ServerTlsConfig>,
    /// How often a caught-up stream checks the log for new records
    pub poll_interval: Duration,
    /// How long a graceful stop waits for open connections
    pub drain_timeout: Duration,
}

impl ServerConfig {
    pub fn new(commit_log: Arc<dyn CommitLog>, authorizer: Authorizer) -> Self {
        Self {
            commit_log,
            authorizer: Arc::new(authorizer),
            tls: None,
            poll_interval: Duration::from_millis(50),
            drain_timeout: Duration::from_secs(5),
        }
    }

    pub fn tls(mut self, tls: Option<ServerTlsConfig>) -> Self {
        self.tls = tls;
        self
    }
}

/// Fatal serve errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),
}

/// The append/consume service.
pub struct LogServer {
    config: ServerConfig,
    drain: DrainController,
}

impl LogServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            drain: DrainController::new(),
        }
    }

    /// Accept connections until [`LogServer::graceful_stop`] is called.
    ///
    /// Returns an error only when the listener itself fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let mut stop_rx = self.drain.subscribe();
        tracing::info!(addr = ?listener.local_addr().ok(), "log service listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = stopped(&mut stop_rx) => {
                    tracing::debug!("log service stopped accepting");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) if is_transient(&e) => {
                        tracing::debug!(error = %e, "transient accept error");
                        continue;
                    }
                    Err(e) => return Err(ServerError::Accept(e)),
                },
            };

            let _ = stream.set_nodelay(true);
            let guard = self.drain.track();
            let server = self.clone();
            tokio::spawn(
                async move {
                    let _guard = guard;
                    if let Err(e) = server.accept_connection(stream, peer).await {
                        tracing::debug!(%peer, error = %e, "connection ended with error");
                    }
                }
                .in_current_span(),
            );
        }
    }

    /// Stop accepting, end open streams and wait for connections to drain.
    pub async fn graceful_stop(&self) -> bool {
        if !self.drain.stop() {
            return true;
        }
        self.drain.wait_for_drain(self.config.drain_timeout).await
    }

    pub fn open_connections(&self) -> usize {
        self.drain.open_connections()
    }

    async fn accept_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), FrameError> {
        match &self.config.tls {
            Some(tls) => {
                let tls_stream = match tls.acceptor().accept(stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::debug!(%peer, error = %e, "tls handshake failed");
                        return Ok(());
                    }
                };
                let subject = tls_stream
                    .get_ref()
                    .1
                    .peer_certificates()
                    .and_then(|certs| certs.first())
                    .and_then(certificate_subject)
                    .unwrap_or_else(|| ANONYMOUS_SUBJECT.to_string());
                self.handle_connection(tls_stream, subject, peer).await
            }
            None => {
                self.handle_connection(stream, ANONYMOUS_SUBJECT.to_string(), peer)
                    .await
            }
        }
    }

    async fn handle_connection<S>(&self, stream: S, subject: String, peer: SocketAddr) -> Result<(), FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        tracing::debug!(%peer, %subject, "connection accepted");
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut stop_rx = self.drain.subscribe();

        loop {
            let request: Request = tokio::select! {
                _ = stopped(&mut stop_rx) => return Ok(()),
                frame = read_frame(&mut reader) => match frame? {
                    Some(request) => request,
                    None => return Ok(()),
                },
            };

            match request {
                Request::Produce { value } => {
                    let response = self.produce(&subject, value);
                    write_frame(&mut writer, &response).await?;
                }
                Request::Consume { offset } => {
                    let response = self.consume(&subject, offset);
                    write_frame(&mut writer, &response).await?;
                }
                Request::ConsumeStream {
                    offset,
                    origin,
                    log_instance,
                } => {
                    let offset = self.stream_start(offset, log_instance.as_deref());
                    return self
                        .stream_records(&subject, offset, origin, &mut reader, &mut writer, &mut stop_rx)
                        .await;
                }
            }
        }
    }

    fn produce(&self, subject: &str, value: Vec<u8>) -> Response {
        if let Err(e) = self
            .config
            .authorizer
            .authorize(subject, OBJECT_WILDCARD, PRODUCE_ACTION)
        {
            return Response::error(ErrorCode::PermissionDenied, e.to_string());
        }

        match self.config.commit_log.append(Record::new(value)) {
            Ok(offset) => Response::Produced { offset },
            Err(e) => log_error_response(e),
        }
    }

    fn consume(&self, subject: &str, offset: u64) -> Response {
        if let Err(e) = self
            .config
            .authorizer
            .authorize(subject, OBJECT_WILDCARD, CONSUME_ACTION)
        {
            return Response::error(ErrorCode::PermissionDenied, e.to_string());
        }

        match self.config.commit_log.read(offset) {
            Ok(record) => Response::Record(record),
            Err(e) => log_error_response(e),
        }
    }

    /// Offsets only mean something within the log instance they came from.
    fn stream_start(&self, offset: u64, log_instance: Option<&str>) -> u64 {
        let served = self.config.commit_log.instance();
        match log_instance {
            Some(instance) if instance != served => {
                tracing::info!(
                    requested = %instance,
                    %served,
                    stale_offset = offset,
                    "log instance changed, streaming from the start"
                );
                0
            }
            _ => offset,
        }
    }

    async fn stream_records<S>(
        &self,
        subject: &str,
        mut offset: u64,
        origin: Option<String>,
        reader: &mut ReadHalf<S>,
        writer: &mut WriteHalf<S>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if let Err(e) = self
            .config
            .authorizer
            .authorize(subject, OBJECT_WILDCARD, CONSUME_ACTION)
        {
            let response = Response::error(ErrorCode::PermissionDenied, e.to_string());
            return write_frame(writer, &response).await;
        }

        let mut eof_buf = [0u8; 1];
        loop {
            if *stop_rx.borrow() {
                return Ok(());
            }

            match self.config.commit_log.read(offset) {
                Ok(record) => {
                    offset += 1;
                    if origin.as_deref().is_some_and(|o| o != record.origin) {
                        continue;
                    }
                    write_frame(writer, &Response::Record(record)).await?;
                }
                Err(LogError::OffsetOutOfRange(_)) => {
                    // Caught up: wait for new records, the client going away, or a stop.
                    tokio::select! {
                        _ = stopped(stop_rx) => return Ok(()),
                        read = reader.read(&mut eof_buf) => match read {
                            Ok(0) | Err(_) => return Ok(()),
                            Ok(_) => {}
                        },
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(offset, error = %e, "stream aborted by log error");
                    return write_frame(writer, &log_error_response(e)).await;
                }
            }
        }
    }
}

fn log_error_response(e: LogError) -> Response {
    let code = match &e {
        LogError::OffsetOutOfRange(_) => ErrorCode::OffsetOutOfRange,
        LogError::Closed => ErrorCode::Unavailable,
        _ => ErrorCode::Internal,
    };
    Response::error(code, e.to_string())
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
    )
}

//! Message sources: a byte driver plus a wire-format decoder.
//!
//! Both are picked once at startup from config. The ingest loop only sees
//! [`MessageSource::next_message`].

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serialport::{DataBits, FlowControl, Parity, StopBits};
use std::collections::VecDeque;
use std::io::{self, Read};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use super::sbp::{self, ProtocolError, SbpCodec};
use crate::config::{defaults, DriverConfig, SourceFormat};
use crate::types::NavMessage;

/// Longest accepted SBP-JSON line.
const MAX_JSON_LINE: usize = 64 * 1024;

const SERIAL_READ_CHUNK: usize = 4096;
const SERIAL_CHANNEL_DEPTH: usize = 64;

/// Bytes pumped from a blocking reader thread.
pub type BlockingReader = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("receiver I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SourceError {
    /// Protocol errors drop one message; I/O errors end the source.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

// ============================================================================
// Drivers
// ============================================================================

/// Raw receiver byte stream.
pub enum DriverStream {
    Tcp(TcpStream),
    Serial(BlockingReader),
    File(tokio::fs::File),
    Stdin(tokio::io::Stdin),
}

impl DriverStream {
    pub async fn open(config: &DriverConfig) -> io::Result<Self> {
        match config {
            DriverConfig::Tcp { host, port } => {
                let addr = format!("{host}:{port}");
                info!(address = %addr, "Connecting to receiver");

                let timeout = Duration::from_secs(defaults::DRIVER_CONNECT_TIMEOUT_SECS);
                let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
                    .await
                    .map_err(|_| {
                        io::Error::new(io::ErrorKind::TimedOut, format!("connect to {addr} timed out"))
                    })??;

                let keepalive = socket2::TcpKeepalive::new()
                    .with_time(Duration::from_secs(defaults::TCP_KEEPALIVE_SECS))
                    .with_interval(Duration::from_secs(10));
                socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;

                info!(address = %addr, "Receiver connected");
                Ok(Self::Tcp(stream))
            }
            DriverConfig::Serial { port, baud } => {
                info!(port = %port, baud, "Opening serial receiver");
                let serial = serialport::new(port.as_str(), *baud)
                    .data_bits(DataBits::Eight)
                    .parity(Parity::None)
                    .stop_bits(StopBits::One)
                    .flow_control(FlowControl::None)
                    .timeout(Duration::from_millis(defaults::SERIAL_READ_TIMEOUT_MS))
                    .open()
                    .map_err(io::Error::from)?;
                Ok(Self::Serial(pump_blocking_reader(serial, port.clone())))
            }
            DriverConfig::File { path } => {
                info!(path = %path.display(), "Reading receiver data from file");
                Ok(Self::File(tokio::fs::File::open(path).await?))
            }
            DriverConfig::Stdin => {
                info!("Reading receiver data from stdin");
                Ok(Self::Stdin(tokio::io::stdin()))
            }
        }
    }
}

impl AsyncRead for DriverStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Self::Serial(s) => Pin::new(s).poll_read(cx, buf),
            Self::File(f) => Pin::new(f).poll_read(cx, buf),
            Self::Stdin(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

/// Drive a blocking reader on the blocking pool and expose it as `AsyncRead`.
///
/// Read timeouts are retried; they only let the thread notice that the
/// consumer has gone away. `Ok(0)` ends the stream, any other error is
/// forwarded once and ends it too.
pub fn pump_blocking_reader<R>(mut reader: R, name: String) -> BlockingReader
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(SERIAL_CHANNEL_DEPTH);

    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; SERIAL_READ_CHUNK];
        while !tx.is_closed() {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        break;
                    }
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {}
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    break;
                }
            }
        }
        debug!(port = %name, "Blocking reader stopped");
    });

    let chunks = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    })
    .boxed();
    StreamReader::new(chunks)
}

// ============================================================================
// Sources
// ============================================================================

/// Closed set of message sources.
pub enum MessageSource {
    /// SBP binary frames.
    Binary(FramedRead<DriverStream, SbpCodec>),
    /// SBP-JSON, one object per line.
    Json(FramedRead<DriverStream, LinesCodec>),
    /// Pre-decoded messages (replays, tests).
    Replay(VecDeque<NavMessage>),
}

impl MessageSource {
    /// Open the configured driver and wrap it in the configured decoder.
    pub async fn open(driver: &DriverConfig, format: SourceFormat) -> io::Result<Self> {
        let stream = DriverStream::open(driver).await?;
        Ok(Self::from_stream(stream, format))
    }

    pub fn from_stream(stream: DriverStream, format: SourceFormat) -> Self {
        match format {
            SourceFormat::Sbp => Self::Binary(FramedRead::new(stream, SbpCodec::new())),
            SourceFormat::SbpJson => Self::Json(FramedRead::new(
                stream,
                LinesCodec::new_with_max_length(MAX_JSON_LINE),
            )),
        }
    }

    pub fn replay(messages: impl IntoIterator<Item = NavMessage>) -> Self {
        Self::Replay(messages.into_iter().collect())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Binary(_) => "sbp",
            Self::Json(_) => "sbp-json",
            Self::Replay(_) => "replay",
        }
    }

    /// Next fused-kind message; `Ok(None)` at end of stream.
    ///
    /// Message types that are not fused are skipped here. A `Protocol` error
    /// covers exactly one bad message and the source stays usable.
    pub async fn next_message(&mut self) -> Result<Option<NavMessage>, SourceError> {
        loop {
            match self {
                Self::Binary(frames) => match frames.next().await {
                    None => return Ok(None),
                    Some(Err(e)) => return Err(SourceError::Io(e)),
                    Some(Ok(frame)) => {
                        if let Some(msg) = sbp::decode_frame(&frame?)? {
                            return Ok(Some(msg));
                        }
                    }
                },
                Self::Json(lines) => match lines.next().await {
                    None => return Ok(None),
                    Some(Err(LinesCodecError::Io(e))) => return Err(SourceError::Io(e)),
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        return Err(ProtocolError::Json(format!(
                            "line longer than {MAX_JSON_LINE} bytes"
                        ))
                        .into());
                    }
                    Some(Ok(line)) => {
                        if let Some(msg) = sbp::decode_json_line(&line)? {
                            return Ok(Some(msg));
                        }
                    }
                },
                Self::Replay(messages) => return Ok(messages.pop_front()),
            }
        }
    }
}

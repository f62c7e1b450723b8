use std::future::Future;
use std::io::Read;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use flate2::read::{GzDecoder, ZlibDecoder};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tracing::trace;

use crate::error::MeasurementError;

pub const MAX_FRAME_LEN: usize = 16*1024*1024;
/// line tokens are short, anything longer is not a valid token
pub const MAX_LINE_LEN: usize = 1024;

/// Anything a control channel can run on - a `TcpStream` in production, an in-memory duplex
///  stream in tests
pub trait ControlStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}
impl <T: AsyncRead + AsyncWrite + Unpin + Send + Sync> ControlStream for T {}

/// The TCP control connection between client and server. It carries two kinds of data:
///
/// * line tokens, i.e. ASCII text terminated by `\n`
/// * frames: the payload length in ASCII decimal followed by `\n`, followed by exactly that many
///    bytes of payload. Payloads are JSON documents, and JSON sent by the client may be zlib or
///    gzip compressed (detected by magic bytes)
///
/// Every read is bounded by the idle timeout.
pub struct ControlChannel {
    stream: BufStream<Box<dyn ControlStream>>,
    idle_timeout: Duration,
}

impl ControlChannel {
    pub fn new(stream: impl ControlStream + 'static, idle_timeout: Duration) -> ControlChannel {
        ControlChannel {
            stream: BufStream::new(Box::new(stream)),
            idle_timeout,
        }
    }

    pub async fn write_line(&mut self, line: &str) -> anyhow::Result<()> {
        trace!("sending line {:?}", line);
        self.stream.write_all(line.as_bytes()).await.map_err(transport_error)?;
        self.stream.write_all(b"\n").await.map_err(transport_error)?;
        self.stream.flush().await.map_err(transport_error)?;
        Ok(())
    }

    /// Reads a line, stripping surrounding whitespace. EOF is an error since there is no
    ///  point in the protocol where the client may legitimately close the connection.
    pub async fn read_line(&mut self) -> anyhow::Result<String> {
        let mut line = String::new();
        let mut bounded = (&mut self.stream).take(MAX_LINE_LEN as u64);
        let num_read = with_idle_timeout(self.idle_timeout, bounded.read_line(&mut line)).await?
            .map_err(transport_error)?;
        if num_read == 0 {
            return Err(anyhow!(MeasurementError::Transport("connection closed by remote host".to_string())));
        }
        if num_read == MAX_LINE_LEN && !line.ends_with('\n') {
            return Err(anyhow!(MeasurementError::Protocol(format!("line exceeds the maximum length of {} bytes", MAX_LINE_LEN))));
        }
        trace!("received line {:?}", line);
        Ok(line.trim().to_string())
    }

    /// Reads a line and parses it, treating a parse failure as an invalid measurement setup
    pub async fn read_parsed_line<T: FromStr>(&mut self, what: &str) -> anyhow::Result<T> {
        let line = self.read_line().await?;
        line.parse()
            .map_err(|_| anyhow!(MeasurementError::Setup(format!("invalid {}: {:?}", what, line))))
    }

    pub async fn read_frame(&mut self) -> anyhow::Result<Vec<u8>> {
        let len_line = self.read_line().await?;
        let len: usize = len_line.parse()
            .map_err(|_| MeasurementError::Protocol(format!("invalid frame length {:?}", len_line)))?;
        if len > MAX_FRAME_LEN {
            return Err(anyhow!(MeasurementError::Protocol(format!("frame length {} exceeds the maximum of {}", len, MAX_FRAME_LEN))));
        }

        let mut buf = vec![0u8; len];
        with_idle_timeout(self.idle_timeout, self.stream.read_exact(&mut buf)).await?
            .map_err(transport_error)?;
        Ok(buf)
    }

    /// reads an uncompressed JSON frame
    pub async fn read_json(&mut self) -> anyhow::Result<Value> {
        let frame = self.read_frame().await?;
        parse_json(&frame)
    }

    /// Reads a JSON frame that may be zlib or gzip compressed. An empty frame is read as an
    ///  empty JSON object.
    pub async fn read_compressed_json(&mut self) -> anyhow::Result<Value> {
        let frame = self.read_frame().await?;
        if frame.is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        parse_json(&decompress(&frame)?)
    }

    pub async fn send_json(&mut self, value: &impl Serialize) -> anyhow::Result<()> {
        let s = serde_json::to_string(value)?;
        trace!("sending json {}", s);
        self.stream.write_all(format!("{}\n", s.len()).as_bytes()).await.map_err(transport_error)?;
        self.stream.write_all(s.as_bytes()).await.map_err(transport_error)?;
        self.stream.flush().await.map_err(transport_error)?;
        Ok(())
    }
}

async fn with_idle_timeout<T>(idle_timeout: Duration, f: impl Future<Output = T>) -> anyhow::Result<T> {
    tokio::time::timeout(idle_timeout, f).await
        .map_err(|_| anyhow!(MeasurementError::Timeout(format!("control connection idle for more than {:?}", idle_timeout))))
}

fn transport_error(e: std::io::Error) -> anyhow::Error {
    anyhow!(MeasurementError::Transport(e.to_string()))
}

fn parse_json(raw: &[u8]) -> anyhow::Result<Value> {
    serde_json::from_slice(raw)
        .map_err(|e| anyhow!(MeasurementError::Protocol(format!("invalid JSON: {}", e))))
}

fn decompress(raw: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut result = Vec::new();
    let outcome = match raw {
        [0x1f, 0x8b, ..] => GzDecoder::new(raw).read_to_end(&mut result),
        [0x78, 0x01 | 0x5e | 0x9c | 0xda, ..] => ZlibDecoder::new(raw).read_to_end(&mut result),
        _ => return Ok(raw.to_vec()),
    };
    outcome.map_err(|e| anyhow!(MeasurementError::Protocol(format!("failed to decompress frame: {}", e))))?;
    Ok(result)
}

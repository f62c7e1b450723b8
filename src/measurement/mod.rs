//! The trace exchange engines, one per [MeasurementType].
//!
//! Measurement types are named from the client's point of view: for `*_SEND` measurements the
//!  client sends a trace and the server receives it ([trace_receiver]), for `*_RECV` measurements
//!  the server sends a trace from its trace directory and collects the client's replies
//!  ([trace_sender]). Each of them exists in an RTP flavour and in a footer ("random") flavour
//!  ([flavor]).

pub mod flavor;
pub mod pacing;
pub mod trace_connection;
pub mod trace_receiver;
pub mod trace_sender;

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::ServerConfig;
use crate::control::channel::ControlChannel;
use crate::control::tokens::MeasurementType;
use crate::diagnostics::{CaptureRequest, CaptureSession, DiagnosticsProvider};
use crate::error::MeasurementError;
use crate::measurement::flavor::{FooterFlavor, RtpFlavor};
use crate::measurement::trace_receiver::TraceReceiver;
use crate::measurement::trace_sender::TraceSender;
use crate::trace::statistics::TraceStatistics;

/// Everything an engine needs from the session it runs in
pub struct MeasurementContext {
    pub config: Arc<ServerConfig>,
    pub diagnostics: Arc<dyn DiagnosticsProvider>,
    pub control: ControlChannel,
    /// the server's address of the control connection - trace sockets are bound to this IP
    pub server_ip: IpAddr,
    /// the client's address of the control connection
    pub client_addr: SocketAddr,
    pub output_dir: PathBuf,
}

impl MeasurementContext {
    /// Starts capturing the trace traffic on `port`, and gives the capture time to attach
    ///  before returning.
    pub async fn start_capture(&self, port: u16, pcap_path: &Path) -> CaptureSession {
        debug!("opening capture file {:?}", pcap_path);
        let capture = CaptureSession::start(self.diagnostics.as_ref(), CaptureRequest {
            address: self.client_addr.ip(),
            port,
            output_file: pcap_path.to_path_buf(),
        });
        tokio::time::sleep(self.config.capture_attach_delay).await;
        capture
    }

    /// tells the client where to send its trace packets, or where to expect them from
    pub async fn report_address(&mut self, addr: SocketAddr) -> anyhow::Result<()> {
        self.control.write_line(&addr.ip().to_string()).await?;
        self.control.write_line(&addr.port().to_string()).await
    }
}

#[async_trait]
pub trait MeasurementEngine: Send {
    async fn run(self: Box<Self>, ctx: &mut MeasurementContext) -> anyhow::Result<MeasurementResult>;
}

type EngineFactory = fn() -> Box<dyn MeasurementEngine>;

fn rtp_receiver() -> Box<dyn MeasurementEngine> {
    Box::new(TraceReceiver::<RtpFlavor>::new(MeasurementType::RtpSend))
}
fn random_receiver() -> Box<dyn MeasurementEngine> {
    Box::new(TraceReceiver::<FooterFlavor>::new(MeasurementType::RandomSend))
}
fn rtp_sender() -> Box<dyn MeasurementEngine> {
    Box::new(TraceSender::<RtpFlavor>::new(MeasurementType::RtpRecv))
}
fn random_sender() -> Box<dyn MeasurementEngine> {
    Box::new(TraceSender::<FooterFlavor>::new(MeasurementType::RandomRecv))
}

const ENGINES: [(MeasurementType, EngineFactory); 4] = [
    (MeasurementType::RtpSend, rtp_receiver),
    (MeasurementType::RtpRecv, rtp_sender),
    (MeasurementType::RandomSend, random_receiver),
    (MeasurementType::RandomRecv, random_sender),
];

pub fn engine_for(measurement_type: MeasurementType) -> anyhow::Result<Box<dyn MeasurementEngine>> {
    ENGINES.iter()
        .find(|(t, _)| *t == measurement_type)
        .map(|(_, factory)| factory())
        .ok_or_else(|| anyhow!(MeasurementError::Protocol(format!("no engine for measurement type {}", measurement_type))))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    #[serde(rename = "IP")]
    pub ip: IpAddr,
    pub port: u16,
}
impl From<SocketAddr> for Endpoint {
    fn from(value: SocketAddr) -> Self {
        Endpoint {
            ip: value.ip(),
            port: value.port(),
        }
    }
}

/// Measurements the server takes while sending a trace
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerSideInfo {
    /// round trip time per reply in millis, `-1` for replies that match no sent packet
    pub trace_rtts: Vec<f64>,
    /// send time of each packet in millis since epoch, ordered by sequence key
    pub sent_timestamps: Vec<f64>,
}

/// The outcome of a single measurement, as it is stored in the session log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementResult {
    pub timestamp: f64,
    pub measurement_type: MeasurementType,
    pub trace_id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_name: Option<String>,
    pub client_side_info: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_side_info: Option<ServerSideInfo>,
    pub statistics: TraceStatistics,
    pub server_address: Endpoint,
    pub client_address: Endpoint,
    pub trace_filename: String,
    pub pcap_filename: String,
    pub capture: Value,
}

/// Names of the files a single measurement produces in the session's output directory. They are
///  derived from the measurement's start time in whole seconds.
pub struct MeasurementFiles {
    pub trace_path: PathBuf,
    pub pcap_path: PathBuf,
}

impl MeasurementFiles {
    pub fn new(output_dir: &Path, timestamp: f64) -> MeasurementFiles {
        let base = timestamp as u64;
        MeasurementFiles {
            trace_path: output_dir.join(format!("{}.trace", base)),
            pcap_path: output_dir.join(format!("{}.pcap", base)),
        }
    }

    pub fn trace_filename(&self) -> String {
        file_name(&self.trace_path)
    }

    pub fn pcap_filename(&self) -> String {
        file_name(&self.pcap_path)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

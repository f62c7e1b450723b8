//! Network diagnostics that accompany a measurement: packet capture of the trace traffic, and
//!  traceroute towards the client. Both are implemented by running the corresponding OS tools,
//!  and both produce JSON reports that end up in the session's result log.

pub mod capture;
pub mod traceroute;

use std::fmt::Debug;
use std::net::IpAddr;
use std::path::PathBuf;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use serde_json::Value;
use tracing::warn;

use crate::diagnostics::capture::TcpdumpCapture;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub address: IpAddr,
    pub port: u16,
    pub output_file: PathBuf,
}

#[async_trait]
pub trait RunningCapture: Send {
    /// Terminates the capture and returns its report
    async fn stop(self: Box<Self>) -> anyhow::Result<Value>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait DiagnosticsProvider: Debug + Send + Sync + 'static {
    async fn traceroute(&self, target: IpAddr) -> anyhow::Result<Value>;

    fn start_capture(&self, request: CaptureRequest) -> anyhow::Result<Box<dyn RunningCapture>>;
}

/// Diagnostics through `tcpdump` and `traceroute`. Both need to be installed, and `tcpdump`
///  needs root privileges.
#[derive(Debug)]
pub struct SystemDiagnostics {
    capture_interface: String,
}
impl SystemDiagnostics {
    pub fn new(capture_interface: String) -> SystemDiagnostics {
        SystemDiagnostics { capture_interface }
    }
}

#[async_trait]
impl DiagnosticsProvider for SystemDiagnostics {
    async fn traceroute(&self, target: IpAddr) -> anyhow::Result<Value> {
        traceroute::run_traceroute(target).await
    }

    fn start_capture(&self, request: CaptureRequest) -> anyhow::Result<Box<dyn RunningCapture>> {
        let capture = TcpdumpCapture::start(&self.capture_interface, request.address, request.port, &request.output_file)?;
        Ok(Box::new(capture))
    }
}

/// A capture that may have failed to start. Failure to capture packets does not invalidate a
///  measurement, so it ends up as an error entry in the report.
pub enum CaptureSession {
    Running(Box<dyn RunningCapture>),
    Failed(String),
}

impl CaptureSession {
    pub fn start(provider: &dyn DiagnosticsProvider, request: CaptureRequest) -> CaptureSession {
        match provider.start_capture(request) {
            Ok(capture) => CaptureSession::Running(capture),
            Err(e) => {
                warn!("failed to start packet capture: {}", e);
                CaptureSession::Failed(e.to_string())
            }
        }
    }

    pub async fn stop(self) -> Value {
        match self {
            CaptureSession::Running(capture) => match capture.stop().await {
                Ok(report) => report,
                Err(e) => {
                    warn!("failed to stop packet capture: {}", e);
                    error_report(&e.to_string())
                }
            }
            CaptureSession::Failed(msg) => error_report(&msg),
        }
    }
}

/// report of a diagnostic tool that could not be run
pub fn error_report(msg: &str) -> Value {
    serde_json::json!({ "error": msg })
}

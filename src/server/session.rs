use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Datelike, Local};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::control::channel::ControlChannel;
use crate::control::tokens::{LoopToken, AVAILABLE, BUSY};
use crate::diagnostics::{error_report, DiagnosticsProvider};
use crate::error::MeasurementError;
use crate::measurement::{engine_for, Endpoint, MeasurementContext, MeasurementResult};
use crate::server::admission::AdmissionGate;
use crate::util::path::is_safe_path_component;

pub const LOG_FILE_NAME: &str = "log.json";

/// The states a measurement session goes through. Any state can lead to `Aborted` on error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshake,
    AwaitingClientInfo,
    RunningDiagnostics,
    MeasurementLoop,
    AwaitingNetworkStatus,
    Persisting,
    Done,
    Aborted,
}

/// Everything that is persisted in a session's `log.json`
#[derive(Debug, Serialize)]
pub struct SessionLog {
    pub client_info: Value,
    pub client_address: Endpoint,
    pub traceroute: Value,
    pub remote_traceroute: Value,
    pub received_traces: Vec<MeasurementResult>,
    pub network_statuses: Value,
}

/// A client's measurement session, i.e. the lifetime of a single control connection
pub struct MeasurementSession {
    state: SessionState,
    start_time: DateTime<Local>,
    ctx: MeasurementContext,
}

impl MeasurementSession {
    pub fn new(
        config: Arc<ServerConfig>,
        diagnostics: Arc<dyn DiagnosticsProvider>,
        control: ControlChannel,
        server_ip: IpAddr,
        client_addr: SocketAddr,
    ) -> MeasurementSession {
        let output_dir = config.output_dir.clone();
        MeasurementSession {
            state: SessionState::Handshake,
            start_time: Local::now(),
            ctx: MeasurementContext {
                config,
                diagnostics,
                control,
                server_ip,
                client_addr,
                output_dir,
            },
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Runs the session to completion, returning its final state. Failures are logged here and
    ///  end the session, the admission slot is released on every path.
    pub async fn run(mut self, gate: &Arc<AdmissionGate>) -> SessionState {
        let Some(_permit) = gate.try_acquire_permit() else {
            info!("refusing connection, server is busy");
            if let Err(e) = self.ctx.control.write_line(BUSY).await {
                warn!("failed to notify client: {}", e);
            }
            self.transition(SessionState::Done);
            return self.state;
        };

        match self.run_protocol().await {
            Ok(()) => self.transition(SessionState::Done),
            Err(e) => {
                match MeasurementError::of(&e) {
                    Some(MeasurementError::Transport(_)) | Some(MeasurementError::Timeout(_)) => warn!("connection failed in state {:?}: {}", self.state, e),
                    _ => error!("measurement session failed in state {:?}: {}", self.state, e),
                }
                self.transition(SessionState::Aborted);
            }
        }
        info!("closing connection");
        self.state
    }

    async fn run_protocol(&mut self) -> anyhow::Result<()> {
        self.ctx.control.write_line(AVAILABLE).await?;

        self.transition(SessionState::AwaitingClientInfo);
        let client_info = self.ctx.control.read_json().await?;
        let unique_id = client_id(&client_info)?;
        info!("client id is {}", unique_id);
        let measurement_dir = create_measurement_dir(&self.ctx.config.output_dir, unique_id, &self.start_time).await?;
        info!("measurement results directory is {:?}", measurement_dir);
        self.ctx.output_dir = measurement_dir;

        self.transition(SessionState::RunningDiagnostics);
        let traceroute = match self.ctx.diagnostics.traceroute(self.ctx.client_addr.ip()).await {
            Ok(report) => report,
            Err(e) => {
                warn!("failed to run traceroute: {}", e);
                error_report(&e.to_string())
            }
        };
        debug!("receiving traceroute from client");
        let remote_traceroute = self.ctx.control.read_compressed_json().await?;

        self.transition(SessionState::MeasurementLoop);
        let mut received_traces = Vec::new();
        loop {
            match self.ctx.control.read_line().await?.parse::<LoopToken>()? {
                LoopToken::End => {
                    info!("end of measurements");
                    break;
                }
                LoopToken::Measurement(measurement_type) => {
                    info!("starting measurement {}", measurement_type);
                    let result = engine_for(measurement_type)?
                        .run(&mut self.ctx)
                        .await?;
                    received_traces.push(result);
                }
            }
        }

        self.transition(SessionState::AwaitingNetworkStatus);
        let network_statuses = self.ctx.control.read_compressed_json().await?;

        self.transition(SessionState::Persisting);
        let log = SessionLog {
            client_info,
            client_address: self.ctx.client_addr.into(),
            traceroute,
            remote_traceroute,
            received_traces,
            network_statuses,
        };
        if let Err(e) = save_log(&self.ctx.output_dir, &log).await {
            error!("{}", e);
        }
        Ok(())
    }
}

/// Checks that the client info is complete, returning the client's unique id
fn client_id(client_info: &Value) -> anyhow::Result<&str> {
    let invalid = |msg: &str| anyhow!(MeasurementError::Setup(format!("failed to read client info: {}", msg)));

    for key in ["device_info", "phone_status", "network_status"] {
        if client_info.get(key).is_none() {
            return Err(invalid(&format!("{} is missing", key)));
        }
    }
    let unique_id = client_info["device_info"].get("unique_id")
        .ok_or_else(|| invalid("client id not found"))?
        .as_str()
        .ok_or_else(|| invalid("client id is not a string"))?;
    if !is_safe_path_component(unique_id) {
        return Err(invalid(&format!("invalid client id {:?}", unique_id)));
    }
    Ok(unique_id)
}

/// `<output_dir>/<client id>/<year>/<month>/<day>/<HH:MM.SS>`
pub fn measurement_dir(output_dir: &Path, unique_id: &str, start_time: &DateTime<Local>) -> PathBuf {
    output_dir
        .join(unique_id)
        .join(start_time.year().to_string())
        .join(start_time.month().to_string())
        .join(start_time.day().to_string())
        .join(start_time.format("%H:%M.%S").to_string())
}

async fn create_measurement_dir(output_dir: &Path, unique_id: &str, start_time: &DateTime<Local>) -> anyhow::Result<PathBuf> {
    let dir = measurement_dir(output_dir, unique_id, start_time);
    tokio::fs::create_dir_all(&dir).await
        .map_err(|e| MeasurementError::Persistence(format!("failed to create measurement dir {:?}: {}", dir, e)))?;
    Ok(dir)
}

async fn save_log(measurement_dir: &Path, log: &SessionLog) -> anyhow::Result<()> {
    let path = measurement_dir.join(LOG_FILE_NAME);
    info!("writing log file {:?}", path);
    let raw = serde_json::to_vec(log)?;
    tokio::fs::write(&path, raw).await
        .map_err(|e| MeasurementError::Persistence(format!("failed to write log file {:?}: {}", path, e)))?;
    Ok(())
}

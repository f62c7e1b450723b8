use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, instrument, warn, Instrument, Span};

use crate::config::ServerConfig;
use crate::control::channel::ControlChannel;
use crate::diagnostics::DiagnosticsProvider;
use crate::server::admission::AdmissionGate;
use crate::server::session::MeasurementSession;

/// Accepts client connections and runs a measurement session for each of them in a task of
///  its own
pub struct MeasurementServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    diagnostics: Arc<dyn DiagnosticsProvider>,
    gate: Arc<AdmissionGate>,
}

impl MeasurementServer {
    pub async fn new(config: Arc<ServerConfig>, diagnostics: Arc<dyn DiagnosticsProvider>) -> anyhow::Result<MeasurementServer> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.output_dir).await?;

        let listener = TcpListener::bind(config.listen_addr).await?;
        info!("listening on {}", listener.local_addr()?);

        Ok(MeasurementServer {
            listener,
            gate: Arc::new(AdmissionGate::new(config.max_measurements)),
            config,
            diagnostics,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// runs until accepting a connection fails
    pub async fn serve(&self) -> anyhow::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;

            let config = self.config.clone();
            let diagnostics = self.diagnostics.clone();
            let gate = self.gate.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(addr, stream, config, diagnostics, gate).await {
                    warn!("connection from {} broke with an error: {}", addr, e);
                }
            });
        }
    }
}

#[instrument(name="session", skip_all, fields(client = %addr))]
async fn handle_connection(
    addr: SocketAddr,
    stream: TcpStream,
    config: Arc<ServerConfig>,
    diagnostics: Arc<dyn DiagnosticsProvider>,
    gate: Arc<AdmissionGate>,
) -> anyhow::Result<()> {
    info!("client connected");
    stream.set_nodelay(true)?;
    let server_ip = stream.local_addr()?.ip();
    let control = ControlChannel::new(stream, config.client_idle_timeout);

    let state = MeasurementSession::new(config, diagnostics, control, server_ip, addr)
        .run(&gate)
        .instrument(Span::current())
        .await;
    debug!("session finished in state {:?}", state);
    Ok(())
}

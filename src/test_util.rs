use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream, DuplexStream};

use crate::config::ServerConfig;
use crate::control::channel::ControlChannel;
use crate::diagnostics::{CaptureRequest, DiagnosticsProvider, RunningCapture};
use crate::measurement::MeasurementContext;

/// Diagnostics that do not run any tools. Traceroute reports the target, a capture's report is
///  the port it was started for.
#[derive(Debug, Default)]
pub struct StubDiagnostics {
    pub captures: Mutex<Vec<CaptureRequest>>,
}

#[async_trait]
impl DiagnosticsProvider for StubDiagnostics {
    async fn traceroute(&self, target: IpAddr) -> anyhow::Result<Value> {
        Ok(json!({ "target": target.to_string() }))
    }

    fn start_capture(&self, request: CaptureRequest) -> anyhow::Result<Box<dyn RunningCapture>> {
        let port = request.port;
        self.captures.lock().unwrap().push(request);
        Ok(Box::new(StubCapture { port }))
    }
}

struct StubCapture {
    port: u16,
}

#[async_trait]
impl RunningCapture for StubCapture {
    async fn stop(self: Box<Self>) -> anyhow::Result<Value> {
        Ok(json!({ "port": self.port }))
    }
}

/// localhost config with short timeouts
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)));
    config.capture_attach_delay = Duration::ZERO;
    config.client_idle_timeout = Duration::from_secs(5);
    config.trace_wait_timeout = Duration::from_secs(1);
    config.trace_recv_timeout = Duration::from_millis(300);
    config.hole_punching_timeout = Duration::from_millis(500);
    config
}

/// A measurement context on an in-memory control channel, with the returned client as the other
///  end. Client and server are both at 127.0.0.1.
pub fn test_context(output_dir: &Path) -> (MeasurementContext, TestClient) {
    let (client, server) = duplex(1024*1024);
    let config = test_config();
    let ctx = MeasurementContext {
        control: ControlChannel::new(server, config.client_idle_timeout),
        config: Arc::new(config),
        diagnostics: Arc::new(StubDiagnostics::default()),
        server_ip: IpAddr::from([127, 0, 0, 1]),
        client_addr: SocketAddr::from(([127, 0, 0, 1], 50000)),
        output_dir: output_dir.to_path_buf(),
    };
    (ctx, TestClient::new(client))
}

/// The client's end of a control channel. Everything panics on failure since this is for tests.
pub struct TestClient {
    stream: BufStream<DuplexStream>,
}

impl TestClient {
    pub fn new(stream: DuplexStream) -> TestClient {
        TestClient {
            stream: BufStream::new(stream),
        }
    }

    pub async fn write_line(&mut self, line: &str) {
        self.stream.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    pub async fn write_json(&mut self, value: &Value) {
        self.write_frame(value.to_string().as_bytes()).await;
    }

    pub async fn write_compressed_json(&mut self, value: &Value) {
        use std::io::Write;
        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(value.to_string().as_bytes()).unwrap();
        self.write_frame(&encoder.finish().unwrap()).await;
    }

    pub async fn write_frame(&mut self, payload: &[u8]) {
        self.stream.write_all(format!("{}\n", payload.len()).as_bytes()).await.unwrap();
        self.stream.write_all(payload).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.stream.read_line(&mut line).await.unwrap();
        line.trim().to_string()
    }

    pub async fn read_json(&mut self) -> Value {
        let len: usize = self.read_line().await.parse().unwrap();
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).await.unwrap();
        serde_json::from_slice(&buf).unwrap()
    }

    /// true if the server closed the connection
    pub async fn is_closed(&mut self) -> bool {
        let mut buf = [0u8; 1];
        matches!(self.stream.read(&mut buf).await, Ok(0))
    }
}

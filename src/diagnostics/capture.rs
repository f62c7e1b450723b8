use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::diagnostics::RunningCapture;
use crate::util::time::unix_timestamp;

/// A running `tcpdump` process writing the UDP traffic between the server and a client to a pcap
///  file. Dropping it without calling [RunningCapture::stop] kills the process.
pub struct TcpdumpCapture {
    child: Child,
    start_time: f64,
    interface: String,
    address: IpAddr,
    port: u16,
    output_file: PathBuf,
}

impl TcpdumpCapture {
    pub fn start(interface: &str, address: IpAddr, port: u16, output_file: &Path) -> anyhow::Result<TcpdumpCapture> {
        let start_time = unix_timestamp()?;
        let child = Command::new("tcpdump")
            .args(tcpdump_args(interface, address, port, output_file))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        debug!("started tcpdump (pid {:?}) for {}:{} on {}", child.id(), address, port, interface);

        Ok(TcpdumpCapture {
            child,
            start_time,
            interface: interface.to_string(),
            address,
            port,
            output_file: output_file.to_path_buf(),
        })
    }
}

fn tcpdump_args(interface: &str, address: IpAddr, port: u16, output_file: &Path) -> Vec<String> {
    vec![
        "-w".to_string(), output_file.display().to_string(),
        "-i".to_string(), interface.to_string(),
        "host".to_string(), address.to_string(), "and".to_string(),
        "port".to_string(), port.to_string(), "and".to_string(), "udp".to_string(),
    ]
}

#[derive(Serialize)]
struct CaptureReport {
    start_time: f64,
    ret: Option<i32>,
    interface: String,
    stdout: Vec<String>,
    stderr: Vec<String>,
    address: String,
    port: u16,
    output_file: String,
}

#[async_trait]
impl RunningCapture for TcpdumpCapture {
    async fn stop(self: Box<Self>) -> anyhow::Result<Value> {
        let pid = self.child.id()
            .ok_or_else(|| anyhow!("tcpdump exited before it was stopped"))?;
        // SIGTERM lets tcpdump flush the pcap file
        if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } != 0 {
            warn!("failed to send SIGTERM to tcpdump (pid {})", pid);
        }

        let this = *self;
        let output = this.child.wait_with_output().await?;
        debug!("tcpdump (pid {}) terminated: {}", pid, output.status);

        Ok(serde_json::to_value(CaptureReport {
            start_time: this.start_time,
            ret: output.status.code(),
            interface: this.interface,
            stdout: String::from_utf8_lossy(&output.stdout).lines().map(|l| l.to_string()).collect(),
            stderr: String::from_utf8_lossy(&output.stderr).lines().map(|l| l.to_string()).collect(),
            address: this.address.to_string(),
            port: this.port,
            output_file: this.output_file.display().to_string(),
        })?)
    }
}

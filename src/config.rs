use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use anyhow::bail;

/// Server-wide settings. This is constructed once at start-up and then shared immutably (as
///  `Arc<ServerConfig>`) with every component that needs it.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// upper bound for the number of concurrently running measurement sessions - clients
    ///  connecting while this many sessions are running get a `BUSY` reply
    pub max_measurements: usize,

    /// root of the per-client result directories
    pub output_dir: PathBuf,
    /// directory containing the recorded traces the server replays to clients
    pub traces_dir: PathBuf,

    /// network interface the packet capture listens on
    pub capture_interface: String,
    /// time given to the capture process to attach before any trace packet is expected
    pub capture_attach_delay: Duration,

    /// maximum idle time on the control connection, applied to every read
    pub client_idle_timeout: Duration,
    /// timeout for the first packet of a trace. This is generous since the client may need
    ///  some time to prepare (and to set up its own side of the measurement)
    pub trace_wait_timeout: Duration,
    /// timeout between packets once the first packet of a trace was received. Expiry of this
    ///  timeout is the regular way for a receive loop to finish if the end-of-trace packet is lost
    pub trace_recv_timeout: Duration,
    pub hole_punching_timeout: Duration,

    pub trace_send_buffer_size: usize,
    pub trace_recv_buffer_size: usize,
    pub max_packet_size: usize,
}

impl ServerConfig {
    pub const DEFAULT_PORT: u16 = 12345;

    pub fn new(listen_addr: SocketAddr) -> ServerConfig {
        ServerConfig {
            listen_addr,
            max_measurements: 3,
            output_dir: PathBuf::from("results"),
            traces_dir: PathBuf::from("traces"),
            capture_interface: "eth0".to_string(),
            capture_attach_delay: Duration::from_secs(1),
            client_idle_timeout: Duration::from_secs(5*60),
            trace_wait_timeout: Duration::from_secs(120),
            trace_recv_timeout: Duration::from_secs(3),
            hole_punching_timeout: Duration::from_secs(10),
            trace_send_buffer_size: 1024*1024,
            trace_recv_buffer_size: 1024*1024,
            max_packet_size: 1500,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_measurements == 0 {
            bail!("max_measurements must be at least 1");
        }
        if self.max_packet_size < 64 || self.max_packet_size > u16::MAX as usize {
            bail!("max_packet_size must be between 64 and {}, was {}", u16::MAX, self.max_packet_size);
        }
        if self.trace_recv_timeout.is_zero() || self.trace_wait_timeout.is_zero() || self.hole_punching_timeout.is_zero() {
            bail!("trace timeouts must be non-zero");
        }
        if self.trace_recv_timeout > self.trace_wait_timeout {
            bail!("the inter-packet timeout ({:?}) should not exceed the initial wait timeout ({:?})", self.trace_recv_timeout, self.trace_wait_timeout);
        }
        if self.capture_interface.is_empty() {
            bail!("capture interface must not be empty");
        }
        Ok(())
    }
}

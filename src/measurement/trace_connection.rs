use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ServerConfig;

/// The UDP socket a single trace is exchanged on. It is bound to an ephemeral port on the IP
///  address the client reached the server at, and it is closed when this is dropped.
pub struct TraceConnection {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl TraceConnection {
    pub fn bind(ip: IpAddr, config: &ServerConfig) -> anyhow::Result<TraceConnection> {
        let addr = SocketAddr::new(ip, 0);
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

        // the kernel may cap buffer sizes, which degrades the measurement but does not prevent it
        if let Err(e) = socket.set_send_buffer_size(config.trace_send_buffer_size) {
            warn!("failed to set UDP send buffer size to {}: {}", config.trace_send_buffer_size, e);
        }
        if let Err(e) = socket.set_recv_buffer_size(config.trace_recv_buffer_size) {
            warn!("failed to set UDP receive buffer size to {}: {}", config.trace_recv_buffer_size, e);
        }

        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        let local_addr = socket.local_addr()?;
        debug!("bound trace socket to {}", local_addr);
        Ok(TraceConnection { socket, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub fn into_socket(self) -> UdpSocket {
        self.socket
    }

    /// Receives a datagram, returning `None` if none arrives before the deadline
    pub async fn recv_from_until(&self, buf: &mut [u8], deadline: Instant) -> anyhow::Result<Option<(usize, SocketAddr)>> {
        match tokio::time::timeout_at(deadline, self.socket.recv_from(buf)).await {
            Ok(result) => Ok(Some(result?)),
            Err(_) => Ok(None),
        }
    }
}

/// The timeout for receiving trace packets has two phases: a long one until the first packet
///  arrives, and a short one between packets after that. It is a deadline that only moves when
///  a packet is accepted, so datagrams that are ignored do not extend it.
#[derive(Debug, Clone, Copy)]
pub struct PhasedTimeout {
    initial: Duration,
    inter_packet: Duration,
    started: bool,
    deadline: Instant,
}

impl PhasedTimeout {
    /// starts the initial phase now
    pub fn new(initial: Duration, inter_packet: Duration) -> PhasedTimeout {
        PhasedTimeout {
            initial,
            inter_packet,
            started: false,
            deadline: Instant::now() + initial,
        }
    }

    pub fn from_config(config: &ServerConfig) -> PhasedTimeout {
        PhasedTimeout::new(config.trace_wait_timeout, config.trace_recv_timeout)
    }

    /// the length of the current phase
    pub fn current(&self) -> Duration {
        if self.started {
            self.inter_packet
        }
        else {
            self.initial
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// a packet was accepted: switches to the inter-packet phase and moves the deadline
    pub fn on_packet(&mut self) {
        self.started = true;
        self.deadline = Instant::now() + self.inter_packet;
    }
}

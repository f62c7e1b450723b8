use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashSet;
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::config::ServerConfig;
use crate::control::tokens::{MeasurementType, HOLE_PUNCHING, TRACE_END};
use crate::error::MeasurementError;
use crate::measurement::flavor::{SeqKey, TraceFlavor};
use crate::measurement::pacing::{busy_wait_until, ReplaySchedule};
use crate::measurement::trace_connection::{PhasedTimeout, TraceConnection};
use crate::measurement::{MeasurementContext, MeasurementEngine, MeasurementFiles, MeasurementResult, ServerSideInfo};
use crate::trace::statistics::TraceStatistics;
use crate::trace::trace_file::{load_trace_file, save_trace_file, Packet, Trace};
use crate::util::path::is_safe_path_component;
use crate::util::time::unix_timestamp;

/// Sends a trace from the server's trace directory to the client (`RTP_RECV` / `RANDOM_RECV`),
///  collecting the client's replies concurrently.
pub struct TraceSender<F: TraceFlavor> {
    measurement_type: MeasurementType,
    _flavor: PhantomData<fn() -> F>,
}

impl <F: TraceFlavor> TraceSender<F> {
    pub fn new(measurement_type: MeasurementType) -> TraceSender<F> {
        TraceSender {
            measurement_type,
            _flavor: Default::default(),
        }
    }
}

/// ledger entry for a packet the sender task sent
#[derive(Debug, Clone, PartialEq)]
pub struct SentPacket {
    pub timestamp: f64,
    pub payload: Bytes,
}

pub type Ledger = BTreeMap<SeqKey, SentPacket>;

/// a reply from the client, i.e. the sequence key of a packet it received, and the time the
///  reply arrived at the server
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reply {
    pub key: SeqKey,
    pub timestamp: f64,
}

#[async_trait]
impl <F: TraceFlavor> MeasurementEngine for TraceSender<F> {
    async fn run(self: Box<Self>, ctx: &mut MeasurementContext) -> anyhow::Result<MeasurementResult> {
        let timestamp = unix_timestamp()?;
        let files = MeasurementFiles::new(&ctx.output_dir, timestamp);

        let trace_name = ctx.control.read_line().await?;
        let trace_id: i32 = ctx.control.read_parsed_line("trace id").await?;
        let trace = load_trace::<F>(&ctx.config, &trace_name, trace_id).await?;
        info!("{} trace name={} id={} ({} packets, {:.1}s) pcap={:?}", F::NAME, trace_name, trace_id, trace.packets.len(), trace.duration(), files.pcap_path);

        let conn = TraceConnection::bind(ctx.server_ip, &ctx.config)?;
        let server_addr = conn.local_addr();
        let capture = ctx.start_capture(server_addr.port(), &files.pcap_path).await;

        let exchanged: anyhow::Result<_> = async {
            ctx.report_address(server_addr).await?;
            let client_side_address = receive_punch_packet(&conn, ctx.client_addr.ip(), &ctx.config).await?;
            conn.socket().connect(client_side_address).await?;
            let (ledger, replies) = exchange::<F>(conn, trace.packets, &ctx.config).await?;
            Ok((client_side_address, ledger, replies))
        }.await;
        let capture_report = capture.stop().await;
        let (client_side_address, ledger, replies) = exchanged?;
        info!("sent {} packets, received {} replies", ledger.len(), replies.len());

        let server_side_info = ServerSideInfo {
            trace_rtts: trace_rtts(&replies, &ledger),
            sent_timestamps: ledger.values()
                .map(|p| p.timestamp * 1000.0)
                .collect(),
        };

        debug!("reading measurement info from client");
        let client_side_info = ctx.control.read_compressed_json().await?;
        let (recv_timestamps, recv_seq) = validate_client_side_info(&client_side_info)?;

        let received = rebuild_received_packets(&recv_timestamps, &recv_seq, &ledger);
        let unique_received = recv_seq.iter().collect::<FxHashSet<_>>().len();
        let statistics = TraceStatistics::from_received(unique_received, ledger.len(), received.iter().map(|p| (p.timestamp, p.len())));
        info!("client received {} of {} packets: {:?}", received.len(), ledger.len(), statistics);
        ctx.control.send_json(&statistics).await?;

        let received_trace = Trace::new(F::TRACE_VERSION, trace_id, client_side_address.port(), received);
        if let Err(e) = save_trace_file(&files.trace_path, &received_trace, F::TRACE_VERSION).await {
            warn!("failed to save the trace received by the client: {}", e);
        }

        Ok(MeasurementResult {
            timestamp,
            measurement_type: self.measurement_type,
            trace_id,
            trace_size: None,
            trace_name: Some(trace_name),
            client_side_info,
            server_side_info: Some(server_side_info),
            statistics,
            server_address: server_addr.into(),
            client_address: client_side_address.into(),
            trace_filename: files.trace_filename(),
            pcap_filename: files.pcap_filename(),
            capture: capture_report,
        })
    }
}

async fn load_trace<F: TraceFlavor>(config: &ServerConfig, trace_name: &str, trace_id: i32) -> anyhow::Result<Trace> {
    if !is_safe_path_component(trace_name) {
        return Err(anyhow!(MeasurementError::Setup(format!("invalid trace name {:?}", trace_name))));
    }

    let path = config.traces_dir.join(trace_name);
    let trace = load_trace_file(&path).await
        .map_err(|e| match MeasurementError::of(&e) {
            Some(MeasurementError::Setup(_)) => e,
            _ => anyhow!(MeasurementError::Setup(format!("failed to read trace file {:?}: {}", path, e))),
        })?;

    if trace.preamble.id != trace_id {
        return Err(anyhow!(MeasurementError::Setup(format!(
            "trace id mismatch ({} instead of {}) for trace {}", trace_id, trace.preamble.id, trace_name
        ))));
    }
    F::check_trace(&trace)?;
    Ok(trace)
}

/// Waits for the client's hole punching packet. Its source address is where the client expects
///  the trace, which may differ from the control connection's address if the client is behind a NAT.
async fn receive_punch_packet(conn: &TraceConnection, client_ip: IpAddr, config: &ServerConfig) -> anyhow::Result<SocketAddr> {
    debug!("waiting for hole punching packet for {:?}", config.hole_punching_timeout);
    let deadline = tokio::time::Instant::now() + config.hole_punching_timeout;
    let mut buf = vec![0u8; config.max_packet_size];

    loop {
        let (len, from) = match tokio::time::timeout_at(deadline, conn.socket().recv_from(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => {
                error!("hole punching packet not received on time, giving up");
                return Err(anyhow!(MeasurementError::Timeout(format!("no hole punching packet received within {:?}", config.hole_punching_timeout))));
            }
        };

        if from.ip() != client_ip {
            warn!("ignoring packet from unexpected address {}", from);
            continue;
        }
        if &buf[..len] != HOLE_PUNCHING {
            return Err(anyhow!(MeasurementError::Protocol(format!("invalid hole punching packet of {} bytes", len))));
        }
        debug!("hole punching packet received from {}", from);
        return Ok(from);
    }
}

/// Sends the packets and receives the client's replies concurrently. The socket must be
///  connected to the client.
async fn exchange<F: TraceFlavor>(conn: TraceConnection, packets: Vec<Packet>, config: &ServerConfig) -> anyhow::Result<(Ledger, Vec<Reply>)> {
    let socket = Arc::new(conn.into_socket());

    let receiver = tokio::spawn(
        receive_replies::<F>(socket.clone(), config.max_packet_size, PhasedTimeout::from_config(config))
            .instrument(Span::current())
    );
    let sender = tokio::spawn(
        send_packets::<F>(socket, packets)
            .instrument(Span::current())
    );

    let ledger = match joined(sender.await) {
        Ok(ledger) => ledger,
        Err(e) => {
            receiver.abort();
            return Err(e);
        }
    };
    let replies = joined(receiver.await)?;
    Ok((ledger, replies))
}

fn joined<T>(result: Result<anyhow::Result<T>, JoinError>) -> anyhow::Result<T> {
    result?
}

async fn send_packets<F: TraceFlavor>(socket: Arc<UdpSocket>, packets: Vec<Packet>) -> anyhow::Result<Ledger> {
    debug!("sender task started");
    let mut ledger = Ledger::new();
    let mut schedule = ReplaySchedule::new();

    for (index, packet) in packets.iter().enumerate() {
        busy_wait_until(schedule.due_time(packet.timestamp)?).await;

        let send_timestamp = unix_timestamp()?;
        let (key, datagram) = F::stamp(index, &packet.payload, (send_timestamp * 1000.0) as i64)?;
        record_sent(&mut ledger, key, SentPacket {
            timestamp: send_timestamp,
            payload: datagram.clone(),
        });
        socket.send(&datagram).await
            .map_err(|e| MeasurementError::Transport(format!("failed to send packet n.{}: {}", index + 1, e)))?;
    }
    socket.send(TRACE_END).await
        .map_err(|e| MeasurementError::Transport(format!("failed to send end of trace: {}", e)))?;

    debug!("sender task finished");
    Ok(ledger)
}

/// Adds a sent packet to the ledger. A packet with the same key replaces the earlier one, which
///  happens if a recorded RTP trace repeats sequence numbers; replies can then only be matched to
///  the later packet.
fn record_sent(ledger: &mut Ledger, key: SeqKey, packet: SentPacket) -> Option<SentPacket> {
    let replaced = ledger.insert(key, packet);
    if replaced.is_some() {
        warn!("sequence key {} was sent before, replacing its ledger entry", key);
    }
    replaced
}

/// Collects replies until the client stops sending them. Timeouts end this regularly, the
///  trace is over when no replies arrive any more.
async fn receive_replies<F: TraceFlavor>(socket: Arc<UdpSocket>, max_packet_size: usize, mut timeout: PhasedTimeout) -> anyhow::Result<Vec<Reply>> {
    debug!("receiver task started");
    let mut buf = vec![0u8; max_packet_size];
    let mut replies = Vec::new();

    loop {
        let len = match tokio::time::timeout_at(timeout.deadline(), socket.recv(&mut buf)).await {
            Ok(Ok(len)) => len,
            Ok(Err(e)) => {
                warn!("failed to receive replies: {}", e);
                break;
            }
            Err(_) => {
                info!("no reply for {:?}, assuming the measurement has finished", timeout.current());
                break;
            }
        };
        let arrival = unix_timestamp()?;

        let reply = &buf[..len];
        if reply == HOLE_PUNCHING {
            debug!("duplicate hole punching packet received, ignoring it");
            continue;
        }
        if !timeout.is_started() {
            info!("first reply received");
        }
        timeout.on_packet();

        match F::reply_key(reply) {
            Some(key) => replies.push(Reply { key, timestamp: arrival }),
            None => warn!("dropping reply of {} bytes without a sequence number", len),
        }
    }

    debug!("receiver task finished");
    Ok(replies)
}

/// round trip times in millis, `-1` for replies that do not match a sent packet
fn trace_rtts(replies: &[Reply], ledger: &Ledger) -> Vec<f64> {
    replies.iter()
        .map(|r| match ledger.get(&r.key) {
            Some(sent) => 1000.0 * (r.timestamp - sent.timestamp),
            None => -1.0,
        })
        .collect()
}

/// Extracts `recv_timestamps` (millis) and `recv_seq` from the client's report
fn validate_client_side_info(info: &Value) -> anyhow::Result<(Vec<f64>, Vec<SeqKey>)> {
    let invalid = |msg: &str| anyhow!(MeasurementError::Setup(format!("invalid client side info: {}", msg)));

    let recv_timestamps = info.get("recv_timestamps")
        .and_then(|v| v.as_array())
        .ok_or_else(|| invalid("recv_timestamps is missing or not an array"))?
        .iter()
        .map(|v| v.as_f64().ok_or_else(|| invalid("recv_timestamps contains a non-numeric entry")))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let recv_seq = info.get("recv_seq")
        .and_then(|v| v.as_array())
        .ok_or_else(|| invalid("recv_seq is missing or not an array"))?
        .iter()
        .map(|v| v.as_i64().ok_or_else(|| invalid("recv_seq contains a non-integer entry")))
        .collect::<anyhow::Result<Vec<_>>>()?;

    if recv_timestamps.len() != recv_seq.len() {
        return Err(invalid(&format!("{} timestamps for {} sequence numbers", recv_timestamps.len(), recv_seq.len())));
    }
    Ok((recv_timestamps, recv_seq))
}

/// The trace as the client received it: the packets from the ledger, at the client's receive
///  times
fn rebuild_received_packets(recv_timestamps: &[f64], recv_seq: &[SeqKey], ledger: &Ledger) -> Vec<Packet> {
    recv_timestamps.iter()
        .zip(recv_seq)
        .filter_map(|(&recv_ts, key)| match ledger.get(key) {
            Some(sent) => Some(Packet::new(recv_ts / 1000.0, sent.payload.clone())),
            None => {
                error!("client reported a packet with unknown sequence number {}", key);
                None
            }
        })
        .collect()
}

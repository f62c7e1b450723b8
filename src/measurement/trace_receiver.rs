use std::marker::PhantomData;
use std::net::{IpAddr, SocketAddr};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::control::tokens::{MeasurementType, TRACE_END};
use crate::error::MeasurementError;
use crate::measurement::flavor::TraceFlavor;
use crate::measurement::trace_connection::{PhasedTimeout, TraceConnection};
use crate::measurement::{MeasurementContext, MeasurementEngine, MeasurementFiles, MeasurementResult};
use crate::trace::statistics::TraceStatistics;
use crate::trace::trace_file::{save_trace_file, Packet, Trace};
use crate::util::time::unix_timestamp;

/// Receives a trace sent by the client (`RTP_SEND` / `RANDOM_SEND`), acknowledging every packet
///  by echoing its identifying bytes.
pub struct TraceReceiver<F: TraceFlavor> {
    measurement_type: MeasurementType,
    _flavor: PhantomData<fn() -> F>,
}

impl <F: TraceFlavor> TraceReceiver<F> {
    pub fn new(measurement_type: MeasurementType) -> TraceReceiver<F> {
        TraceReceiver {
            measurement_type,
            _flavor: Default::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct ReceivedPacket {
    timestamp: f64,
    payload: Bytes,
    ack: Bytes,
}

#[async_trait]
impl <F: TraceFlavor> MeasurementEngine for TraceReceiver<F> {
    async fn run(self: Box<Self>, ctx: &mut MeasurementContext) -> anyhow::Result<MeasurementResult> {
        let timestamp = unix_timestamp()?;
        let files = MeasurementFiles::new(&ctx.output_dir, timestamp);

        let trace_id: i32 = ctx.control.read_parsed_line("trace id").await?;
        let trace_size: usize = ctx.control.read_parsed_line("trace size").await?;
        info!("{} trace id={} size={} file={:?}", F::NAME, trace_id, trace_size, files.trace_path);

        let conn = TraceConnection::bind(ctx.server_ip, &ctx.config)?;
        let server_addr = conn.local_addr();
        let capture = ctx.start_capture(server_addr.port(), &files.pcap_path).await;

        let received = match ctx.report_address(server_addr).await {
            Ok(()) => receive_packets::<F>(&conn, ctx.client_addr.ip(), &ctx.config).await,
            Err(e) => Err(e),
        };
        debug!("closing trace connection");
        drop(conn);
        let capture_report = capture.stop().await;
        let (client_port, packets) = received?;

        debug!("reading measurement info from client");
        let client_side_info = ctx.control.read_compressed_json().await?;

        let unique_received = packets.iter()
            .map(|p| &p.ack)
            .collect::<FxHashSet<_>>()
            .len();
        let statistics = TraceStatistics::from_received(unique_received, trace_size, packets.iter().map(|p| (p.timestamp, p.payload.len())));
        info!("received {} of {} packets: {:?}", packets.len(), trace_size, statistics);
        ctx.control.send_json(&statistics).await?;

        let trace = Trace::new(
            F::TRACE_VERSION,
            trace_id,
            server_addr.port(),
            packets.into_iter()
                .map(|p| Packet::new(p.timestamp, p.payload))
                .collect(),
        );
        if let Err(e) = save_trace_file(&files.trace_path, &trace, F::TRACE_VERSION).await {
            warn!("failed to save received trace: {}", e);
        }

        Ok(MeasurementResult {
            timestamp,
            measurement_type: self.measurement_type,
            trace_id,
            trace_size: Some(trace_size),
            trace_name: None,
            client_side_info,
            server_side_info: None,
            statistics,
            server_address: server_addr.into(),
            client_address: SocketAddr::new(ctx.client_addr.ip(), client_port).into(),
            trace_filename: files.trace_filename(),
            pcap_filename: files.pcap_filename(),
            capture: capture_report,
        })
    }
}

/// Receives packets until the end-of-trace packet arrives or the inter-packet timeout expires.
///  Returns the client's source port and the received packets in order of arrival.
async fn receive_packets<F: TraceFlavor>(conn: &TraceConnection, client_ip: IpAddr, config: &ServerConfig) -> anyhow::Result<(u16, Vec<ReceivedPacket>)> {
    let mut buf = vec![0u8; config.max_packet_size];
    let mut timeout = PhasedTimeout::from_config(config);
    let mut client_port = None;
    let mut packets = Vec::new();

    loop {
        let Some((len, from)) = conn.recv_from_until(&mut buf, timeout.deadline()).await? else {
            if timeout.is_started() {
                info!("no packet for {:?}, assuming the trace has ended", timeout.current());
                break;
            }
            return Err(anyhow!(MeasurementError::Timeout(format!("no trace packet received within {:?}", timeout.current()))));
        };
        let arrival = unix_timestamp()?;

        if from.ip() != client_ip {
            warn!("ignoring packet from unexpected address {}", from);
            continue;
        }
        match client_port {
            Some(port) if port != from.port() => {
                return Err(anyhow!(MeasurementError::Protocol(format!("client's source port changed from {} to {}", port, from.port()))));
            }
            _ => client_port = Some(from.port()),
        }

        if !timeout.is_started() {
            info!("first packet received");
        }
        timeout.on_packet();

        let packet = &buf[..len];
        if packet == TRACE_END {
            info!("end of trace received");
            break;
        }

        match F::ack_bytes(packet) {
            Some(ack) => {
                conn.socket().send_to(ack, from).await
                    .map_err(|e| MeasurementError::Transport(format!("failed to acknowledge packet: {}", e)))?;
                packets.push(ReceivedPacket {
                    timestamp: arrival,
                    payload: Bytes::copy_from_slice(packet),
                    ack: Bytes::copy_from_slice(ack),
                });
            }
            None => warn!("dropping packet of {} bytes that can not be identified as a {} trace packet", len, F::NAME),
        }
    }

    let client_port = client_port
        .ok_or_else(|| MeasurementError::Protocol("no packet received from the client".to_string()))?;
    Ok((client_port, packets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use serde_json::json;
    use tokio::net::UdpSocket;
    use crate::diagnostics::CaptureRequest;
    use crate::measurement::flavor::{FooterFlavor, RtpFlavor};
    use crate::test_util::{test_config, test_context, StubDiagnostics, TestClient};
    use crate::trace::footer::PacketFooter;
    use crate::trace::trace_file::{load_trace_file, TraceVersion};

    fn rtp_packet(seq: u16, len: usize) -> Vec<u8> {
        let mut result = vec![0x80, 0x00];
        result.extend_from_slice(&seq.to_be_bytes());
        result.resize(len, 0x42);
        result
    }

    fn footer_packet(seq: i32, len: usize) -> Vec<u8> {
        PacketFooter::write(&vec![7u8; len], seq, 1_700_000_000_000 + seq as i64)
    }

    async fn read_server_addr(client: &mut TestClient) -> SocketAddr {
        let ip: IpAddr = client.read_line().await.parse().unwrap();
        let port: u16 = client.read_line().await.parse().unwrap();
        SocketAddr::new(ip, port)
    }

    #[tokio::test]
    async fn test_receive_rtp_trace() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, mut client) = test_context(dir.path());

        let client_side = tokio::spawn(async move {
            client.write_line("42").await;
            client.write_line("5").await;
            let server_addr = read_server_addr(&mut client).await;

            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            socket.connect(server_addr).await.unwrap();
            let mut acks = Vec::new();
            for seq in 0..4u16 {
                socket.send(&rtp_packet(seq, 172)).await.unwrap();
                let mut buf = [0u8; 100];
                let len = socket.recv(&mut buf).await.unwrap();
                acks.push(buf[..len].to_vec());
            }
            socket.send(TRACE_END).await.unwrap();

            client.write_compressed_json(&json!({"recv_info": "abc"})).await;
            let stats = client.read_json().await;
            (acks, stats, socket.local_addr().unwrap())
        });

        let result = Box::new(TraceReceiver::<RtpFlavor>::new(MeasurementType::RtpSend)).run(&mut ctx).await.unwrap();
        let (acks, stats, client_udp_addr) = client_side.await.unwrap();

        assert_eq!(acks, (0..4).map(|seq| rtp_packet(seq, 12)).collect::<Vec<_>>());
        assert!((stats["packet_loss"].as_f64().unwrap() - 0.2).abs() < 1e-9);
        assert!((stats["avg_rate_kbits"].as_f64().unwrap() - 4.0*172.0*8.0/1024.0).abs() < 1e-9);

        assert_eq!(result.measurement_type, MeasurementType::RtpSend);
        assert_eq!(result.trace_id, 42);
        assert_eq!(result.trace_size, Some(5));
        assert_eq!(result.client_side_info, json!({"recv_info": "abc"}));
        assert_eq!(result.client_address.port, client_udp_addr.port());
        assert_eq!(result.capture, json!({"port": result.server_address.port}));

        let trace = load_trace_file(&dir.path().join(&result.trace_filename)).await.unwrap();
        assert_eq!(trace.preamble.version, TraceVersion::V3);
        assert_eq!(trace.preamble.id, 42);
        assert_eq!(trace.preamble.dport, result.server_address.port);
        assert_eq!(trace.packets.len(), 4);
        assert_eq!(trace.packets[3].payload, rtp_packet(3, 172));
    }

    #[tokio::test]
    async fn test_receive_footer_trace_ends_on_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, mut client) = test_context(dir.path());

        let client_side = tokio::spawn(async move {
            client.write_line("7").await;
            client.write_line("3").await;
            let server_addr = read_server_addr(&mut client).await;

            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            socket.connect(server_addr).await.unwrap();
            let mut acks = Vec::new();
            // the duplicate counts only once, and the short packet is dropped
            for packet in [footer_packet(0, 60), footer_packet(1, 60), footer_packet(1, 60), vec![1, 2, 3]] {
                socket.send(&packet).await.unwrap();
                let mut buf = [0u8; 100];
                if let Ok(Ok(len)) = tokio::time::timeout(Duration::from_millis(100), socket.recv(&mut buf)).await {
                    acks.push(buf[..len].to_vec());
                }
            }
            // no end-of-trace packet

            client.write_line("0").await;
            client.read_json().await
        });

        let result = Box::new(TraceReceiver::<FooterFlavor>::new(MeasurementType::RandomSend)).run(&mut ctx).await.unwrap();
        let stats = client_side.await.unwrap();

        assert!((stats["packet_loss"].as_f64().unwrap() - 1.0/3.0).abs() < 1e-9);
        assert_eq!(result.client_side_info, json!({}));
        assert_eq!(result.measurement_type, MeasurementType::RandomSend);

        let trace = load_trace_file(&dir.path().join(&result.trace_filename)).await.unwrap();
        assert_eq!(trace.preamble.version, TraceVersion::V2);
        assert_eq!(trace.packets.len(), 3);
        assert_eq!(trace.packets[1].footer.map(|f| f.seq), Some(1));
    }

    #[tokio::test]
    async fn test_footer_acks() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, mut client) = test_context(dir.path());

        let client_side = tokio::spawn(async move {
            client.write_line("7").await;
            client.write_line("1").await;
            let server_addr = read_server_addr(&mut client).await;

            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            socket.connect(server_addr).await.unwrap();
            socket.send(&footer_packet(9, 100)).await.unwrap();
            let mut buf = [0u8; 100];
            let len = socket.recv(&mut buf).await.unwrap();
            socket.send(TRACE_END).await.unwrap();

            client.write_line("0").await;
            client.read_json().await;
            buf[..len].to_vec()
        });

        Box::new(TraceReceiver::<FooterFlavor>::new(MeasurementType::RandomSend)).run(&mut ctx).await.unwrap();
        let ack = client_side.await.unwrap();
        assert_eq!(PacketFooter::load(&ack), Some(PacketFooter { seq: 9, timestamp_ms: 1_700_000_000_009 }));
        assert_eq!(ack.len(), PacketFooter::SIZE);
    }

    #[tokio::test]
    async fn test_no_packet_is_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, mut client) = test_context(dir.path());

        let client_side = tokio::spawn(async move {
            client.write_line("1").await;
            client.write_line("10").await;
            read_server_addr(&mut client).await;
            client
        });

        let e = Box::new(TraceReceiver::<RtpFlavor>::new(MeasurementType::RtpSend)).run(&mut ctx).await.unwrap_err();
        assert!(matches!(MeasurementError::of(&e), Some(MeasurementError::Timeout(_))), "{}", e);
        let _client = client_side.await.unwrap();
    }

    #[tokio::test]
    async fn test_source_port_change() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, mut client) = test_context(dir.path());

        let client_side = tokio::spawn(async move {
            client.write_line("1").await;
            client.write_line("10").await;
            let server_addr = read_server_addr(&mut client).await;

            let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            first.send_to(&rtp_packet(0, 20), server_addr).await.unwrap();
            let mut buf = [0u8; 100];
            first.recv(&mut buf).await.unwrap();

            let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            second.send_to(&rtp_packet(1, 20), server_addr).await.unwrap();
            client
        });

        let e = Box::new(TraceReceiver::<RtpFlavor>::new(MeasurementType::RtpSend)).run(&mut ctx).await.unwrap_err();
        assert!(matches!(MeasurementError::of(&e), Some(MeasurementError::Protocol(_))), "{}", e);
        let _client = client_side.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_trace_size() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, mut client) = test_context(dir.path());

        client.write_line("1").await;
        client.write_line("many").await;

        let e = Box::new(TraceReceiver::<RtpFlavor>::new(MeasurementType::RtpSend)).run(&mut ctx).await.unwrap_err();
        assert!(matches!(MeasurementError::of(&e), Some(MeasurementError::Setup(_))), "{}", e);
    }

    #[tokio::test]
    async fn test_packets_from_other_hosts_are_ignored() {
        let config = test_config();
        let conn = TraceConnection::bind(IpAddr::from([127, 0, 0, 1]), &config).unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(&rtp_packet(0, 20), conn.local_addr()).await.unwrap();

        // the client is expected at a different address, so the packet does not start the trace
        let e = receive_packets::<RtpFlavor>(&conn, IpAddr::from([10, 1, 2, 3]), &config).await.unwrap_err();
        assert!(matches!(MeasurementError::of(&e), Some(MeasurementError::Timeout(_))), "{}", e);
    }

    #[tokio::test]
    async fn test_other_hosts_do_not_extend_the_timeout() {
        let config = test_config();
        let conn = TraceConnection::bind(IpAddr::from([127, 0, 0, 1]), &config).unwrap();
        let server_addr = conn.local_addr();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&rtp_packet(0, 20), server_addr).await.unwrap();

        let noise = tokio::spawn(async move {
            let other = UdpSocket::bind("127.0.0.2:0").await.unwrap();
            for _ in 0..20 {
                other.send_to(&rtp_packet(9, 20), server_addr).await.unwrap();
                tokio::time::sleep(Duration::from_millis(150)).await;
            }
        });

        let start = Instant::now();
        let (client_port, packets) = receive_packets::<RtpFlavor>(&conn, IpAddr::from([127, 0, 0, 1]), &config).await.unwrap();
        let elapsed = start.elapsed();
        noise.abort();

        assert_eq!(client_port, client.local_addr().unwrap().port());
        assert_eq!(packets.len(), 1);
        assert!(elapsed < Duration::from_secs(1), "receiving took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_rtp_loss_counts_unique_headers() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, mut client) = test_context(dir.path());
        let diagnostics = Arc::new(StubDiagnostics::default());
        ctx.diagnostics = diagnostics.clone();

        let client_side = tokio::spawn(async move {
            client.write_line("3").await;
            client.write_line("5").await;
            let server_addr = read_server_addr(&mut client).await;

            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            socket.connect(server_addr).await.unwrap();
            for seq in [0u16, 1, 1, 2, 2, 2] {
                socket.send(&rtp_packet(seq, 40)).await.unwrap();
                let mut buf = [0u8; 100];
                socket.recv(&mut buf).await.unwrap();
            }
            socket.send(TRACE_END).await.unwrap();

            client.write_compressed_json(&json!({})).await;
            client.read_json().await
        });

        let result = Box::new(TraceReceiver::<RtpFlavor>::new(MeasurementType::RtpSend)).run(&mut ctx).await.unwrap();
        let stats = client_side.await.unwrap();

        // 3 distinct headers of 5 declared packets
        assert!((stats["packet_loss"].as_f64().unwrap() - 0.4).abs() < 1e-9);
        assert_eq!(result.statistics.packet_loss, stats["packet_loss"].as_f64().unwrap());

        let trace = load_trace_file(&dir.path().join(&result.trace_filename)).await.unwrap();
        assert_eq!(trace.packets.len(), 6);

        assert_eq!(*diagnostics.captures.lock().unwrap(), vec![CaptureRequest {
            address: IpAddr::from([127, 0, 0, 1]),
            port: result.server_address.port,
            output_file: dir.path().join(&result.pcap_filename),
        }]);
    }
}

//! Binary trace files. All numbers are in network byte order (BE).
//!
//! ```ascii
//! preamble (10 bytes):
//!  0: version (i32) - 1, 2 or 3
//!  4: trace id (i32)
//!  8: destination port (u16)
//!
//! packet record (repeated until end of file, no padding):
//!  0: timestamp (f64, seconds since epoch)
//!  8: payload length (u16)
//! 10: payload (`length` bytes)
//! ```
//!
//! All versions share this layout, they differ in what they guarantee about payloads:
//! * V1: opaque payloads
//! * V2: payloads carry a [PacketFooter] in their last bytes (if they are long enough)
//! * V3: RTP traces - every payload starts with an RTP header, which is enforced when reading
//!        and writing

use std::path::Path;
use anyhow::anyhow;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rand::RngCore;
use tracing::debug;

use crate::error::MeasurementError;
use crate::trace::footer::PacketFooter;
use crate::trace::rtp_header;
use crate::util::buf_ext::BufExt;

#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum TraceVersion {
    V1 = 1,
    V2 = 2,
    V3 = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub version: TraceVersion,
    pub id: i32,
    pub dport: u16,
}
impl Preamble {
    pub const SERIALIZED_LEN: usize = 10;

    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.version.into());
        buf.put_i32(self.id);
        buf.put_u16(self.dport);
    }

    fn try_deser(buf: &mut impl bytes::Buf) -> anyhow::Result<Preamble> {
        let raw_version = buf.get_i32_checked()?;
        let version = TraceVersion::try_from(raw_version)
            .map_err(|_| MeasurementError::Format(format!("unknown trace version {}", raw_version)))?;
        Ok(Preamble {
            version,
            id: buf.get_i32_checked()?,
            dport: buf.get_u16_checked()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub timestamp: f64,
    pub payload: Bytes,
    /// derived from the payload when reading V2 traces, `None` otherwise
    pub footer: Option<PacketFooter>,
}
impl Packet {
    pub fn new(timestamp: f64, payload: impl Into<Bytes>) -> Packet {
        Packet {
            timestamp,
            payload: payload.into(),
            footer: None,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub preamble: Preamble,
    pub packets: Vec<Packet>,
}

impl Trace {
    pub fn new(version: TraceVersion, id: i32, dport: u16, packets: Vec<Packet>) -> Trace {
        Trace {
            preamble: Preamble { version, id, dport },
            packets,
        }
    }

    /// Time between the first and the last packet in seconds
    pub fn duration(&self) -> f64 {
        match (self.packets.first(), self.packets.last()) {
            (Some(first), Some(last)) => last.timestamp - first.timestamp,
            _ => 0.0,
        }
    }

    /// Parses a trace. The version tag is read once, and the rest of the data is parsed by the
    ///  version's record reader.
    pub fn read(mut buf: &[u8]) -> anyhow::Result<Trace> {
        let preamble = Preamble::try_deser(&mut buf)?;

        let mut packets = Vec::new();
        while !buf.is_empty() {
            let record_index = packets.len() + 1;
            let packet = match preamble.version {
                TraceVersion::V1 => read_plain_record(&mut buf)?,
                TraceVersion::V2 => read_footer_record(&mut buf)?,
                TraceVersion::V3 => read_rtp_record(&mut buf, record_index)?,
            };
            packets.push(packet);
        }

        Ok(Trace {
            preamble,
            packets,
        })
    }

    /// Serializes the trace in the format of `expected_version`. The preamble's version must
    ///  match, the trace is never modified.
    ///
    /// If `randomize` is set, each payload is replaced by random bytes of the same length. This
    ///  is for exporting anonymized traces, and it does not preserve footers or RTP headers.
    pub fn write(&self, expected_version: TraceVersion, randomize: bool, buf: &mut BytesMut) -> anyhow::Result<()> {
        if self.preamble.version != expected_version {
            return Err(anyhow!(MeasurementError::Format(format!(
                "invalid trace version (got {:?}, expected {:?})", self.preamble.version, expected_version
            ))));
        }

        buf.reserve(Preamble::SERIALIZED_LEN + self.packets.iter().map(|p| p.len() + 10).sum::<usize>());
        self.preamble.ser(buf);

        let mut rng = rand::thread_rng();
        let mut random_payload = Vec::new();

        for (i, packet) in self.packets.iter().enumerate() {
            if expected_version == TraceVersion::V3 && packet.len() < rtp_header::SIZE {
                return Err(anyhow!(MeasurementError::Format(format!(
                    "packet n.{} does not contain an RTP header ({} bytes)", i + 1, packet.len()
                ))));
            }
            let length = u16::try_from(packet.len())
                .map_err(|_| MeasurementError::Format(format!("packet n.{} is too long ({} bytes)", i + 1, packet.len())))?;

            buf.put_f64(packet.timestamp);
            buf.put_u16(length);
            if randomize {
                random_payload.resize(packet.len(), 0);
                rng.fill_bytes(&mut random_payload);
                buf.put_slice(&random_payload);
            }
            else {
                buf.put_slice(&packet.payload);
            }
        }
        Ok(())
    }
}

fn read_plain_record(buf: &mut &[u8]) -> anyhow::Result<Packet> {
    let timestamp = buf.get_f64_checked()?;
    let length = buf.get_u16_checked()?;
    let payload = buf.get_bytes_checked(length as usize)
        .map_err(|_| MeasurementError::Format(format!("unexpected end of trace: truncated payload of {} bytes", length)))?;
    Ok(Packet::new(timestamp, payload))
}

fn read_footer_record(buf: &mut &[u8]) -> anyhow::Result<Packet> {
    let mut packet = read_plain_record(buf)?;
    packet.footer = PacketFooter::load(&packet.payload);
    Ok(packet)
}

fn read_rtp_record(buf: &mut &[u8], record_index: usize) -> anyhow::Result<Packet> {
    let packet = read_plain_record(buf)?;
    if packet.len() < rtp_header::SIZE {
        return Err(anyhow!(MeasurementError::Format(format!(
            "packet n.{} does not contain an RTP header ({} bytes)", record_index, packet.len()
        ))));
    }
    Ok(packet)
}

pub async fn load_trace_file(path: &Path) -> anyhow::Result<Trace> {
    debug!("reading trace file {:?}", path);
    let raw = tokio::fs::read(path).await
        .map_err(|e| MeasurementError::Setup(format!("failed to read trace file {:?}: {}", path, e)))?;
    Trace::read(&raw)
}

pub async fn save_trace_file(path: &Path, trace: &Trace, version: TraceVersion) -> anyhow::Result<()> {
    debug!("writing trace file {:?}", path);
    let mut buf = BytesMut::new();
    trace.write(version, false, &mut buf)?;
    tokio::fs::write(path, &buf).await
        .map_err(|e| MeasurementError::Persistence(format!("failed to write trace file {:?}: {}", path, e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn rtp_packet(seq: u16, len: usize) -> Vec<u8> {
        let mut result = vec![0x80, 0x00];
        result.extend_from_slice(&seq.to_be_bytes());
        result.resize(len.max(rtp_header::SIZE), 0x42);
        result
    }

    fn sample_packets(version: TraceVersion) -> Vec<Packet> {
        match version {
            TraceVersion::V1 => vec![
                Packet::new(1384000000.25, vec![1u8, 2, 3]),
                Packet::new(1384000000.5, Vec::<u8>::new()),
                Packet::new(1384000001.0, vec![7u8; 1500]),
            ],
            TraceVersion::V2 => vec![
                Packet::new(1.0, PacketFooter::write(&[0u8; 100], 0, 1000)),
                Packet::new(1.02, PacketFooter::write(&[0u8; 160], 1, 1020)),
                Packet::new(1.04, vec![1u8, 2, 3]),
            ],
            TraceVersion::V3 => vec![
                Packet::new(10.0, rtp_packet(100, 172)),
                Packet::new(10.02, rtp_packet(101, 12)),
                Packet::new(10.04, rtp_packet(102, 33)),
            ],
        }
    }

    #[rstest]
    #[case::v1(TraceVersion::V1)]
    #[case::v2(TraceVersion::V2)]
    #[case::v3(TraceVersion::V3)]
    fn test_write_read(#[case] version: TraceVersion) {
        let trace = Trace::new(version, 4711, 5004, sample_packets(version));

        let mut buf = BytesMut::new();
        trace.write(version, false, &mut buf).unwrap();
        let read = Trace::read(&buf).unwrap();

        assert_eq!(read.preamble, trace.preamble);
        assert_eq!(read.packets.len(), trace.packets.len());
        for (actual, expected) in read.packets.iter().zip(trace.packets.iter()) {
            assert_eq!(actual.timestamp, expected.timestamp);
            assert_eq!(actual.payload, expected.payload);
            match version {
                TraceVersion::V2 => assert_eq!(actual.footer, PacketFooter::load(&expected.payload)),
                _ => assert_eq!(actual.footer, None),
            }
        }
    }

    #[rstest]
    fn test_write_layout() {
        let trace = Trace::new(TraceVersion::V1, 0x01020304, 0x0506, vec![Packet::new(1.0, vec![9u8, 8])]);
        let mut buf = BytesMut::new();
        trace.write(TraceVersion::V1, false, &mut buf).unwrap();
        assert_eq!(buf.as_ref(), b"\0\0\0\x01\x01\x02\x03\x04\x05\x06\x3f\xf0\0\0\0\0\0\0\0\x02\x09\x08");
    }

    #[rstest]
    fn test_write_version_mismatch() {
        let trace = Trace::new(TraceVersion::V2, 1, 2, vec![]);
        let mut buf = BytesMut::new();
        let e = trace.write(TraceVersion::V3, false, &mut buf).unwrap_err();
        assert!(matches!(MeasurementError::of(&e), Some(MeasurementError::Format(_))));
        assert!(buf.is_empty());
    }

    #[rstest]
    fn test_write_randomized() {
        let trace = Trace::new(TraceVersion::V1, 1, 2, sample_packets(TraceVersion::V1));
        let mut buf = BytesMut::new();
        trace.write(TraceVersion::V1, true, &mut buf).unwrap();

        let read = Trace::read(&buf).unwrap();
        assert_eq!(read.packets.len(), trace.packets.len());
        for (actual, expected) in read.packets.iter().zip(trace.packets.iter()) {
            assert_eq!(actual.timestamp, expected.timestamp);
            assert_eq!(actual.len(), expected.len());
        }
        assert_ne!(read.packets[2].payload, trace.packets[2].payload);
        assert_eq!(trace, Trace::new(TraceVersion::V1, 1, 2, sample_packets(TraceVersion::V1)));
    }

    #[rstest]
    fn test_write_rtp_packet_too_short() {
        let mut packets = sample_packets(TraceVersion::V3);
        packets.insert(1, Packet::new(10.01, vec![0u8; 8]));
        let trace = Trace::new(TraceVersion::V3, 1, 2, packets);

        let e = trace.write(TraceVersion::V3, false, &mut BytesMut::new()).unwrap_err();
        match MeasurementError::of(&e) {
            Some(MeasurementError::Format(msg)) => assert!(msg.contains("packet n.2"), "{}", msg),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[rstest]
    fn test_read_rtp_packet_too_short() {
        let mut buf = BytesMut::new();
        Trace::new(TraceVersion::V1, 1, 2, vec![
            Packet::new(1.0, rtp_packet(1, 12)),
            Packet::new(2.0, rtp_packet(2, 20)),
            Packet::new(3.0, vec![0u8; 8]),
        ]).write(TraceVersion::V1, false, &mut buf).unwrap();
        // patch the version tag to make this an RTP trace
        buf[3] = 3;

        let e = Trace::read(&buf).unwrap_err();
        match MeasurementError::of(&e) {
            Some(MeasurementError::Format(msg)) => assert!(msg.contains("packet n.3"), "{}", msg),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[rstest]
    #[case::unknown_version(b"\0\0\0\x04\0\0\0\x01\0\x02")]
    #[case::negative_version(b"\xff\xff\xff\xff\0\0\0\x01\0\x02")]
    #[case::truncated_preamble(b"\0\0\0\x01\0\0")]
    #[case::truncated_record_header(b"\0\0\0\x01\0\0\0\x01\0\x02\x3f\xf0\0\0")]
    #[case::truncated_payload(b"\0\0\0\x01\0\0\0\x01\0\x02\x3f\xf0\0\0\0\0\0\0\0\x03\x01\x02")]
    #[case::empty(b"")]
    fn test_read_invalid(#[case] buf: &[u8]) {
        let e = Trace::read(buf).unwrap_err();
        assert!(matches!(MeasurementError::of(&e), Some(MeasurementError::Format(_))), "{}", e);
    }

    #[rstest]
    fn test_read_preamble_only() {
        let trace = Trace::read(b"\0\0\0\x02\0\0\0\x07\x13\x88").unwrap();
        assert_eq!(trace, Trace::new(TraceVersion::V2, 7, 5000, vec![]));
        assert_eq!(trace.duration(), 0.0);
    }

    #[tokio::test]
    async fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1384000000.trace");
        let trace = Trace::new(TraceVersion::V3, 3, 4, sample_packets(TraceVersion::V3));

        save_trace_file(&path, &trace, TraceVersion::V3).await.unwrap();
        assert_eq!(load_trace_file(&path).await.unwrap(), trace);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let e = load_trace_file(&dir.path().join("missing.trace")).await.unwrap_err();
        assert!(matches!(MeasurementError::of(&e), Some(MeasurementError::Setup(_))));
    }
}

use anyhow::anyhow;
use bytes::Bytes;

use crate::error::MeasurementError;
use crate::trace::footer::PacketFooter;
use crate::trace::rtp_header;
use crate::trace::trace_file::{Trace, TraceVersion};

/// Sequence key identifying a trace packet across a round trip
pub type SeqKey = i64;

/// The two kinds of traces that are exchanged. They differ in how packets are identified: RTP
///  traces carry an RTP header at the start of each packet, random traces have a
///  [PacketFooter] stamped into the end of each packet.
pub trait TraceFlavor: Send + Sync + 'static {
    const NAME: &'static str;

    /// the version trace files of this flavour are persisted with
    const TRACE_VERSION: TraceVersion;

    /// The bytes identifying a received packet. They are echoed back to the sender as an
    ///  acknowledgement, and unique ack bytes count as received packets. `None` if the packet is
    ///  too short to be identified.
    fn ack_bytes(payload: &[u8]) -> Option<&[u8]>;

    /// Prepares the packet with index `index` in a trace for sending, returning its sequence key
    ///  and the datagram to send.
    fn stamp(index: usize, payload: &Bytes, now_ms: i64) -> anyhow::Result<(SeqKey, Bytes)>;

    /// The sequence key in a reply the client sent for a packet it received
    fn reply_key(payload: &[u8]) -> Option<SeqKey>;

    /// verifies that a trace can be sent with this flavour
    fn check_trace(trace: &Trace) -> anyhow::Result<()>;
}

pub struct RtpFlavor;

impl TraceFlavor for RtpFlavor {
    const NAME: &'static str = "RTP";
    const TRACE_VERSION: TraceVersion = TraceVersion::V3;

    fn ack_bytes(payload: &[u8]) -> Option<&[u8]> {
        rtp_header::header(payload)
    }

    fn stamp(index: usize, payload: &Bytes, _now_ms: i64) -> anyhow::Result<(SeqKey, Bytes)> {
        let seq = rtp_header::sequence_number(payload)
            .ok_or_else(|| anyhow!(MeasurementError::Format(format!("packet n.{} does not contain an RTP header", index + 1))))?;
        Ok((seq.into(), payload.clone()))
    }

    fn reply_key(payload: &[u8]) -> Option<SeqKey> {
        rtp_header::sequence_number(payload)
            .map(SeqKey::from)
    }

    fn check_trace(trace: &Trace) -> anyhow::Result<()> {
        if trace.preamble.version != TraceVersion::V3 {
            return Err(anyhow!(MeasurementError::Setup(format!(
                "RTP traces must have version {:?}, was {:?}", TraceVersion::V3, trace.preamble.version
            ))));
        }
        Ok(())
    }
}

pub struct FooterFlavor;

impl TraceFlavor for FooterFlavor {
    const NAME: &'static str = "random";
    const TRACE_VERSION: TraceVersion = TraceVersion::V2;

    fn ack_bytes(payload: &[u8]) -> Option<&[u8]> {
        PacketFooter::extract(payload)
    }

    fn stamp(index: usize, payload: &Bytes, now_ms: i64) -> anyhow::Result<(SeqKey, Bytes)> {
        let seq = i32::try_from(index)
            .map_err(|_| MeasurementError::Format(format!("trace has too many packets ({})", index)))?;
        Ok((seq.into(), PacketFooter::write(payload, seq, now_ms).into()))
    }

    fn reply_key(payload: &[u8]) -> Option<SeqKey> {
        PacketFooter::load(payload)
            .map(|f| f.seq.into())
    }

    fn check_trace(_trace: &Trace) -> anyhow::Result<()> {
        Ok(())
    }
}

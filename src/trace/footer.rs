use bytes::{Buf, BufMut};

/// A fixed-size trailer in the last bytes of a packet's payload, used to correlate packets
///  across a round trip. Layout (network byte order):
///
/// ```ascii
/// 0: sequence number (i32)
/// 4: timestamp in millis since epoch (i64)
/// ```
///
/// Packets shorter than the footer are never tagged, which is how short control packets (e.g.
///  hole punching) stay distinguishable from trace packets.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct PacketFooter {
    pub seq: i32,
    pub timestamp_ms: i64,
}

impl PacketFooter {
    pub const SIZE: usize = std::mem::size_of::<i32>() + std::mem::size_of::<i64>();

    /// Returns a copy of `payload` with its last [PacketFooter::SIZE] bytes replaced by the
    ///  footer, or an unchanged copy if the payload is too short to hold a footer.
    pub fn write(payload: &[u8], seq: i32, timestamp_ms: i64) -> Vec<u8> {
        let mut result = payload.to_vec();
        if let Some(split) = payload.len().checked_sub(Self::SIZE) {
            result.truncate(split);
            result.put_i32(seq);
            result.put_i64(timestamp_ms);
        }
        result
    }

    pub fn load(payload: &[u8]) -> Option<PacketFooter> {
        let mut raw = Self::extract(payload)?;
        Some(PacketFooter {
            seq: raw.get_i32(),
            timestamp_ms: raw.get_i64(),
        })
    }

    /// the raw footer bytes, without parsing them
    pub fn extract(payload: &[u8]) -> Option<&[u8]> {
        let split = payload.len().checked_sub(Self::SIZE)?;
        Some(&payload[split..])
    }
}

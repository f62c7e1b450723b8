//! Accessors for the fixed 12-byte header at the start of RTP-shaped packets. Only the fields
//!  relevant for measurements are decoded:
//!
//! ```ascii
//! 0: version / flags / payload type (ignored)
//! 2: sequence number (u16 BE)
//! 4: timestamp (u32 BE)
//! 8: SSRC (ignored)
//! ```

pub const SIZE: usize = 12;

pub fn sequence_number(packet: &[u8]) -> Option<u16> {
    if packet.len() < SIZE {
        return None;
    }
    Some(u16::from_be_bytes([packet[2], packet[3]]))
}

pub fn timestamp(packet: &[u8]) -> Option<u32> {
    if packet.len() < SIZE {
        return None;
    }
    Some(u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]))
}

/// the header part of a packet, i.e. what the receiver echoes back
pub fn header(packet: &[u8]) -> Option<&[u8]> {
    packet.get(..SIZE)
}

use serde::{Deserialize, Serialize};

/// Per-trace statistics as they are reported to the client and persisted in the session log
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraceStatistics {
    /// fraction of lost packets, between 0.0 and 1.0
    pub packet_loss: f64,
    pub avg_rate_kbits: f64,
}

impl TraceStatistics {
    /// `received` are `(timestamp, length)` pairs of the received packets in order of arrival.
    pub fn from_received(unique_received: usize, declared_total: usize, received: impl IntoIterator<Item = (f64, usize)>) -> TraceStatistics {
        let mut first_ts = None;
        let mut last_ts = 0.0;
        let mut total_bytes = 0;
        for (timestamp, len) in received {
            first_ts.get_or_insert(timestamp);
            last_ts = timestamp;
            total_bytes += len;
        }

        TraceStatistics {
            packet_loss: packet_loss(unique_received, declared_total),
            avg_rate_kbits: match first_ts {
                Some(first_ts) => avg_rate_kbits(total_bytes, first_ts, last_ts),
                None => 0.0,
            },
        }
    }
}

/// NB: Duplicates or bogus packets can cause more packets to be received than were sent, so this
///      can become negative
pub fn packet_loss(unique_received: usize, declared_total: usize) -> f64 {
    1.0 - unique_received as f64 / (declared_total.max(1) as f64)
}

/// Average rate in kbit/s. Duration has a floor of one second so that a handful of packets
///  arriving in a burst does not yield an absurd rate.
pub fn avg_rate_kbits(total_bytes: usize, first_ts: f64, last_ts: f64) -> f64 {
    (total_bytes * 8) as f64 / (1024.0 * (last_ts - first_ts).max(1.0))
}

use std::time::{Duration, Instant};

use anyhow::anyhow;

use crate::error::MeasurementError;

/// Waits until `deadline` by spinning on the clock. Timer based sleeping has a granularity of a
///  millisecond at best, which distorts the inter-packet gaps of VoIP traces noticeably, so this
///  checks the clock in a loop and only yields to the scheduler between checks.
pub async fn busy_wait_until(deadline: Instant) {
    while Instant::now() < deadline {
        tokio::task::yield_now().await;
    }
}

/// Schedule for replaying a trace with the inter-packet gaps of the original recording.
///
/// Send times are computed relative to the start of the replay rather than relative to the
///  previous packet, so delays in sending one packet do not accumulate.
pub struct ReplaySchedule {
    start: Instant,
    first_timestamp: Option<f64>,
}

impl ReplaySchedule {
    pub fn new() -> ReplaySchedule {
        ReplaySchedule {
            start: Instant::now(),
            first_timestamp: None,
        }
    }

    /// The point in time at which the packet recorded at `timestamp` is due. Timestamps that
    ///  can not be scheduled (infinite, or too far from the first one) are a format error.
    pub fn due_time(&mut self, timestamp: f64) -> anyhow::Result<Instant> {
        let first = *self.first_timestamp.get_or_insert(timestamp);
        let offset = (timestamp - first).max(0.0);
        Duration::try_from_secs_f64(offset)
            .ok()
            .and_then(|offset| self.start.checked_add(offset))
            .ok_or_else(|| anyhow!(MeasurementError::Format(format!("packet timestamp {} can not be scheduled", timestamp))))
    }
}

impl Default for ReplaySchedule {
    fn default() -> Self {
        ReplaySchedule::new()
    }
}

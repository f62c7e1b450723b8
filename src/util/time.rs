use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock time as fractional seconds since the epoch - this is the timestamp representation
///  used in trace files and in the measurement results
pub fn unix_timestamp() -> anyhow::Result<f64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)?
        .as_secs_f64())
}

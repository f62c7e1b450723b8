/// Classification of the ways a session or a single measurement can fail.
///
/// Fallible code returns `anyhow::Result` throughout; when a failure belongs to one of these
///  categories, the `MeasurementError` is the root error, so callers (and tests) can recover the
///  category via `downcast_ref`. Nothing is ever retried: every failure is logged and isolated to
///  the connection it occurred on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MeasurementError {
    /// malformed / incomplete client metadata, trace id mismatch, unreadable trace file
    #[error("setup failed: {0}")]
    Setup(String),
    /// unexpected token, source port change in mid-stream, invalid punch payload
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// fatal timeouts, i.e. no data before the initial wait timeout or the hole punching timeout
    #[error("timed out: {0}")]
    Timeout(String),
    /// control connection reset or closed by the peer
    #[error("connection failed: {0}")]
    Transport(String),
    /// trace or log file could not be written
    #[error("persistence failed: {0}")]
    Persistence(String),
    /// invalid binary trace data
    #[error("invalid trace format: {0}")]
    Format(String),
}

impl MeasurementError {
    /// convenience for matching on the category of an `anyhow::Error`
    pub fn of(e: &anyhow::Error) -> Option<&MeasurementError> {
        e.downcast_ref::<MeasurementError>()
    }
}

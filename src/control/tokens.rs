use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::Serialize;

use crate::error::MeasurementError;

/// sent on the control channel if the server accepts a measurement session
pub const AVAILABLE: &str = "OK";
/// sent on the control channel if the server is running its maximum number of sessions
pub const BUSY: &str = "BUSY";
/// sent by the client on the control channel after its last measurement
pub const END_MEASUREMENTS: &str = "END";

/// UDP payload marking the end of a trace
pub const TRACE_END: &[u8] = b"QUIT";
/// UDP payload the client sends to open its NAT for a trace sent by the server
pub const HOLE_PUNCHING: &[u8] = b"I HATE NAT";

/// The kinds of measurement a client can request. The names are from the client's point of view,
///  i.e. for `RtpSend` the client sends an RTP trace and the server receives it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeasurementType {
    RtpSend,
    RtpRecv,
    RandomSend,
    RandomRecv,
}
impl MeasurementType {
    pub const ALL: [MeasurementType; 4] = [
        MeasurementType::RtpSend,
        MeasurementType::RtpRecv,
        MeasurementType::RandomSend,
        MeasurementType::RandomRecv,
    ];

    pub fn token(&self) -> &'static str {
        match self {
            MeasurementType::RtpSend => "RTP_SEND",
            MeasurementType::RtpRecv => "RTP_RECV",
            MeasurementType::RandomSend => "RANDOM_SEND",
            MeasurementType::RandomRecv => "RANDOM_RECV",
        }
    }
}
impl Display for MeasurementType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// A token read in the session's measurement loop
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LoopToken {
    Measurement(MeasurementType),
    End,
}
impl FromStr for LoopToken {
    type Err = MeasurementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == END_MEASUREMENTS {
            return Ok(LoopToken::End);
        }
        MeasurementType::ALL.iter()
            .find(|t| t.token() == s)
            .map(|&t| LoopToken::Measurement(t))
            .ok_or_else(|| MeasurementError::Protocol(format!("unknown measurement type {:?}", s)))
    }
}

//! A server for measuring the quality of VoIP calls over a client's network connection.
//!
//! Clients connect over TCP and negotiate a measurement session on that control connection.
//!  Then client and server exchange UDP packet traces (recorded RTP streams or footer-tagged
//!  "random" traces) in either direction, and both sides record timing, loss and rate of the
//!  traffic. The server persists the traces it saw together with packet captures and a JSON
//!  log of each session.

pub mod config;
pub mod control;
pub mod diagnostics;
pub mod error;
pub mod measurement;
pub mod server;
pub mod trace;
pub mod util;

#[cfg(test)]
pub mod test_util;

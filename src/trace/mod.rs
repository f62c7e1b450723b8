pub mod footer;
pub mod rtp_header;
pub mod statistics;
pub mod trace_file;

use std::net::IpAddr;
use std::process::Stdio;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::util::time::unix_timestamp;

/// Runs `traceroute` against the target and returns the report. The report is the parsed hop
///  list if `traceroute`'s output could be parsed, or the raw output otherwise.
pub async fn run_traceroute(target: IpAddr) -> anyhow::Result<Value> {
    let start_time = unix_timestamp()?;
    debug!("running traceroute to {}", target);
    let output = Command::new("traceroute")
        .arg(target.to_string())
        .stdin(Stdio::null())
        .output()
        .await?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    traceroute_report(start_time, output.status.code(), &stdout, &stderr)
}

pub fn traceroute_report(start_time: f64, ret: Option<i32>, stdout: &str, stderr: &str) -> anyhow::Result<Value> {
    let stderr = lines(stderr);
    let report = match parse_traceroute(stdout) {
        Some(parsed) => serde_json::to_value(TracerouteReport {
            start_time,
            ret,
            stderr,
            parsed,
        })?,
        None => serde_json::to_value(RawReport {
            start_time,
            ret,
            stderr,
            stdout: lines(stdout),
        })?,
    };
    Ok(report)
}

fn lines(s: &str) -> Vec<String> {
    s.lines().map(|l| l.to_string()).collect()
}

#[derive(Serialize)]
struct TracerouteReport {
    start_time: f64,
    ret: Option<i32>,
    stderr: Vec<String>,
    #[serde(flatten)]
    parsed: ParsedTraceroute,
}

#[derive(Serialize)]
struct RawReport {
    start_time: f64,
    ret: Option<i32>,
    stderr: Vec<String>,
    stdout: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ParsedTraceroute {
    #[serde(flatten)]
    header: Option<TracerouteHeader>,
    hops: Vec<Hop>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct TracerouteHeader {
    host: String,
    #[serde(rename = "IP")]
    ip: String,
    nhops_max: String,
    packet_size: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Hop {
    hop_number: String,
    host: Option<String>,
    #[serde(rename = "IP")]
    ip: Option<String>,
    rtt: Option<String>,
    unknown: Option<String>,
    line: String,
}

static HEADER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^traceroute to (?P<host>\S+) \((?P<ip>\S+)\), (?P<nhops_max>\d+) hops max, (?P<packet_size>\d+) byte packets")
        .expect("static regex pattern should always compile")
});

/// Only the first probe of a hop is evaluated, the complete line is kept in the report.
static HOP_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?P<hop_number>\d+)\s+((?P<host>\S+) \((?P<ip>\S+)\)\s+(?P<rtt>\S+) ms|(?P<unknown>\*))")
        .expect("static regex pattern should always compile")
});

/// `None` if any line does not have the expected shape
fn parse_traceroute(stdout: &str) -> Option<ParsedTraceroute> {
    let mut lines = stdout.lines();
    let header = match lines.next() {
        Some(first) => Some(parse_header(first)?),
        None => None,
    };
    let hops = lines
        .map(parse_hop)
        .collect::<Option<Vec<_>>>()?;
    Some(ParsedTraceroute { header, hops })
}

fn group(captures: &Captures, name: &str) -> Option<String> {
    captures.name(name).map(|m| m.as_str().to_string())
}

/// traceroute to example.com (93.184.216.34), 30 hops max, 60 byte packets
fn parse_header(line: &str) -> Option<TracerouteHeader> {
    let captures = HEADER_PATTERN.captures(line)?;
    Some(TracerouteHeader {
        host: group(&captures, "host")?,
        ip: group(&captures, "ip")?,
        nhops_max: group(&captures, "nhops_max")?,
        packet_size: group(&captures, "packet_size")?,
    })
}

/// Either ` 1  gateway (192.168.0.1)  0.512 ms  0.498 ms ...` or ` 2  * * *`
fn parse_hop(line: &str) -> Option<Hop> {
    let captures = HOP_PATTERN.captures(line)?;
    Some(Hop {
        hop_number: group(&captures, "hop_number")?,
        host: group(&captures, "host"),
        ip: group(&captures, "ip"),
        rtt: group(&captures, "rtt"),
        unknown: group(&captures, "unknown"),
        line: line.to_string(),
    })
}

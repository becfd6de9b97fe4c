//! Parser for the collected `ntplog.txt`.
//!
//! The log is a sequence of `=== <timestamp> ===` headers, each followed by
//! the verbatim `ntpq -p` table captured at that time. Every usable peer row
//! becomes one [`PeerSample`]; [`summarize`] folds them per remote server.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use log::{error, warn};
use serde::Serialize;

/// Reference servers of the lab and where they are.
pub const SERVER_REGIONS: &[(&str, &str)] = &[
    ("140.203.204.77", "Ireland"),
    ("ntp0.cam.ac.uk", "UK"),
    ("ptbtime1.ptb.de", "Germany"),
    ("time-a-g.nist.gov", "US"),
    ("ntp1.tuxfamily.org", "France"),
    ("ns1.anu.edu.au", "Australia"),
    ("ntp-b3.nict.go.jp", "Japan"),
];

/// ntpq cuts long host names; shorter prefixes than this are not trusted.
const MIN_TRUNCATED_LEN: usize = 12;

const TALLY_CODES: &[char] = &['*', '+', '-', ' ', 'x', 'o', '#'];

/// refids of peers that are still being set up and carry no real numbers.
const TRANSIENT_REFIDS: &[&str] = &[".STEP.", ".INIT.", ".RATE."];

const HEADER_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerSample {
    pub timestamp: NaiveDateTime,
    /// Selection tally code (`*` system peer, `+` candidate, ...).
    pub tally: Option<char>,
    pub remote: String,
    pub region: Option<&'static str>,
    pub refid: String,
    pub stratum: u8,
    #[serde(rename = "type")]
    pub kind: String,
    pub when_seconds: u64,
    pub poll: u32,
    /// Reachability shift register (printed in octal by ntpq).
    pub reach: u16,
    pub delay_ms: f64,
    pub offset_ms: f64,
    pub jitter_ms: f64,
}

impl PeerSample {
    /// Successful polls among the last eight.
    pub fn reach_count(&self) -> u32 {
        (self.reach & 0xff).count_ones()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ParsedLog {
    pub samples: Vec<PeerSample>,
    /// Rows that looked like peers but did not parse.
    pub malformed: usize,
    /// Peer rows seen before any timestamp header.
    pub orphaned: usize,
    /// Parsing stopped at an unreadable timestamp header.
    pub truncated: bool,
}

pub fn region_for(remote: &str) -> Option<&'static str> {
    SERVER_REGIONS
        .iter()
        .find(|(host, _)| {
            *host == remote || (remote.len() >= MIN_TRUNCATED_LEN && host.starts_with(remote))
        })
        .map(|(_, region)| *region)
}

fn header_timestamp(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("=== ")?;
    let end = rest.find(" ===")?;
    Some(&rest[..end])
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let (stamp, zone) = s.rsplit_once(' ')?;
    if zone.is_empty() || !zone.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    NaiveDateTime::parse_from_str(stamp, HEADER_TIME_FORMAT).ok()
}

/// `-`, `42`, `5m`, `2h`, `3d`; anything else, including values too
/// large for a `u64`, counts as zero.
pub fn when_seconds(when: &str) -> u64 {
    if when == "-" {
        return 0;
    }
    let (digits, scale) = match when.as_bytes().last() {
        Some(b'm') => (&when[..when.len() - 1], 60),
        Some(b'h') => (&when[..when.len() - 1], 3600),
        Some(b'd') => (&when[..when.len() - 1], 86_400),
        _ => (when, 1),
    };
    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(scale))
        .unwrap_or(0)
}

fn parse_row(fields: &[&str], timestamp: NaiveDateTime) -> Option<PeerSample> {
    let mut remote = fields[0];
    let mut tally = None;
    if let Some(first) = remote.chars().next() {
        if TALLY_CODES.contains(&first) {
            tally = Some(first);
            remote = &remote[first.len_utf8()..];
        }
    }

    Some(PeerSample {
        timestamp,
        tally,
        remote: remote.to_string(),
        region: region_for(remote),
        refid: fields[1].to_string(),
        stratum: fields[2].parse().ok()?,
        kind: fields[3].to_string(),
        when_seconds: when_seconds(fields[4]),
        poll: fields[5].parse().ok()?,
        reach: u16::from_str_radix(fields[6], 8).ok()?,
        delay_ms: fields[7].parse().ok()?,
        offset_ms: fields[8].parse().ok()?,
        jitter_ms: fields.get(9)?.parse().ok()?,
    })
}

pub fn parse_log(text: &str) -> ParsedLog {
    let mut parsed = ParsedLog::default();
    let mut current: Option<NaiveDateTime> = None;

    for raw in text.lines() {
        let line = raw.trim();

        if let Some(stamp) = header_timestamp(line) {
            match parse_timestamp(stamp) {
                Some(ts) => current = Some(ts),
                None => {
                    error!("Failed to parse timestamp {:?}; stopping", stamp);
                    parsed.truncated = true;
                    break;
                }
            }
            continue;
        }

        if line.is_empty() || line.starts_with("remote") || line.starts_with('=') {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        if TRANSIENT_REFIDS.contains(&fields[1]) {
            continue;
        }

        let Some(timestamp) = current else {
            parsed.orphaned += 1;
            continue;
        };

        match parse_row(&fields, timestamp) {
            Some(sample) => parsed.samples.push(sample),
            None => {
                warn!("Skipping malformed line: {}", line);
                parsed.malformed += 1;
            }
        }
    }

    parsed
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerSummary {
    pub remote: String,
    pub region: Option<&'static str>,
    pub samples: usize,
    pub mean_offset_ms: f64,
    pub max_abs_offset_ms: f64,
    pub mean_delay_ms: f64,
    pub mean_jitter_ms: f64,
    /// Average successful polls out of the last eight.
    pub mean_reach: f64,
}

pub fn summarize(samples: &[PeerSample]) -> Vec<PeerSummary> {
    let mut by_remote: BTreeMap<&str, Vec<&PeerSample>> = BTreeMap::new();
    for s in samples {
        by_remote.entry(s.remote.as_str()).or_default().push(s);
    }

    by_remote
        .into_iter()
        .map(|(remote, rows)| {
            let n = rows.len() as f64;
            let mean = |f: fn(&PeerSample) -> f64| rows.iter().map(|s| f(s)).sum::<f64>() / n;
            PeerSummary {
                remote: remote.to_string(),
                region: rows[0].region,
                samples: rows.len(),
                mean_offset_ms: mean(|s| s.offset_ms),
                max_abs_offset_ms: rows
                    .iter()
                    .map(|s| s.offset_ms.abs())
                    .fold(0.0, f64::max),
                mean_delay_ms: mean(|s| s.delay_ms),
                mean_jitter_ms: mean(|s| s.jitter_ms),
                mean_reach: mean(|s| f64::from(s.reach_count())),
            }
        })
        .collect()
}

pub fn render_summary(rows: &[PeerSummary]) -> String {
    let mut out = format!(
        "{:<20} {:<10} {:>7} {:>12} {:>12} {:>10} {:>10} {:>6}\n",
        "remote", "region", "samples", "mean off ms", "max |off| ms", "delay ms", "jitter ms", "reach"
    );
    for r in rows {
        let _ = writeln!(
            out,
            "{:<20} {:<10} {:>7} {:>12.3} {:>12.3} {:>10.3} {:>10.3} {:>6.1}",
            r.remote,
            r.region.unwrap_or("-"),
            r.samples,
            r.mean_offset_ms,
            r.max_abs_offset_ms,
            r.mean_delay_ms,
            r.mean_jitter_ms,
            r.mean_reach
        );
    }
    out
}

/// Write `samples.json` and `summary.json` into `dir`.
pub async fn write_report(dir: &Path, parsed: &ParsedLog) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let samples_path = dir.join("samples.json");
    tokio::fs::write(&samples_path, serde_json::to_vec_pretty(&parsed.samples)?)
        .await
        .with_context(|| format!("writing {}", samples_path.display()))?;

    let summary_path = dir.join("summary.json");
    tokio::fs::write(
        &summary_path,
        serde_json::to_vec_pretty(&summarize(&parsed.samples))?,
    )
    .await
    .with_context(|| format!("writing {}", summary_path.display()))?;

    Ok(samples_path)
}

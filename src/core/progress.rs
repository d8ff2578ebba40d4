//! Line parser for worker output.
//!
//! Output arrives in chunks that do not respect line boundaries. [`feed`]
//! appends a chunk to a caller-owned carry buffer, hands back an iterator over
//! the complete lines, and leaves the unterminated remainder in the carry for
//! the next call. Both `\n` and `\r` end a line (yt-dlp redraws its progress
//! line with `\r` when `--newline` is not honoured).

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;

/// Longest unterminated line kept in a carry buffer. Anything older is
/// flushed as a line of its own.
pub const MAX_CARRY: usize = 64 * 1024;

static PERCENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[download\]\s+(\S+)%").expect("valid regex"));
static TOTAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bof\s+~?\s*(\S+)").expect("valid regex"));
static SPEED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bat\s+(\S+)").expect("valid regex"));
static ETA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bETA\s+(\S+)").expect("valid regex"));
static DESTINATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[(?:download|ExtractAudio|VideoConvertor|Fixup\w*)\] Destination: (.+)$")
        .expect("valid regex")
});
static MERGER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\[Merger\] Merging formats into "(.+)"$"#).expect("valid regex"));
static ALREADY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[download\] (.+) has already been downloaded").expect("valid regex")
});

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressEvent {
    pub percent: Option<f64>,
    /// Bytes per second.
    pub speed_value: Option<f64>,
    pub speed_text: Option<String>,
    pub eta: Option<String>,
    /// Bytes.
    pub total_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Progress(ProgressEvent),
    Destination(PathBuf),
    Other(String),
}

/// Lazily parsed complete lines taken out of a carry buffer.
pub struct Lines {
    buf: Vec<u8>,
    pos: usize,
}

impl Iterator for Lines {
    type Item = ParsedLine;

    fn next(&mut self) -> Option<ParsedLine> {
        while self.pos < self.buf.len() {
            let rest = &self.buf[self.pos..];
            let end = rest
                .iter()
                .position(|b| *b == b'\n' || *b == b'\r')
                .unwrap_or(rest.len());
            let line = String::from_utf8_lossy(&rest[..end]).to_string();
            self.pos += end + 1;
            if let Some(parsed) = parse_line(&line) {
                return Some(parsed);
            }
        }
        None
    }
}

pub fn feed(carry: &mut Vec<u8>, chunk: &[u8]) -> Lines {
    carry.extend_from_slice(chunk);
    let mut complete = match carry.iter().rposition(|b| *b == b'\n' || *b == b'\r') {
        Some(last) => {
            let tail = carry.split_off(last + 1);
            std::mem::replace(carry, tail)
        }
        None => Vec::new(),
    };
    if carry.len() > MAX_CARRY {
        let excess = carry.len() - MAX_CARRY;
        complete.extend(carry.drain(..excess));
        complete.push(b'\n');
    }
    Lines { buf: complete, pos: 0 }
}

/// Flushes whatever is left in the carry once the stream has ended.
pub fn finish(carry: &mut Vec<u8>) -> Lines {
    Lines { buf: std::mem::take(carry), pos: 0 }
}

pub fn parse_line(line: &str) -> Option<ParsedLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(c) = PERCENT_RE.captures(line) {
        let percent = c
            .get(1)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .filter(|p| p.is_finite())
            .map(|p| p.clamp(0.0, 100.0));
        let total_size = TOTAL_RE.captures(line).and_then(|c| parse_size(&c[1]));
        let speed_raw = SPEED_RE.captures(line).map(|c| c[1].to_string());
        let speed_value = speed_raw
            .as_deref()
            .and_then(|s| s.strip_suffix("/s"))
            .and_then(parse_size)
            .map(|b| b as f64);
        let speed_text = speed_raw.filter(|_| speed_value.is_some());
        let eta = ETA_RE
            .captures(line)
            .map(|c| c[1].to_string())
            .filter(|e| e.chars().next().is_some_and(|ch| ch.is_ascii_digit()));

        return Some(ParsedLine::Progress(ProgressEvent { percent, speed_value, speed_text, eta, total_size }));
    }

    for re in [&*DESTINATION_RE, &*MERGER_RE, &*ALREADY_RE] {
        if let Some(c) = re.captures(line) {
            return Some(ParsedLine::Destination(PathBuf::from(c[1].trim())));
        }
    }

    Some(ParsedLine::Other(line.to_string()))
}

/// Parses `12.34MiB`, `980KiB`, `1.2GB`, `512B`. Returns `None` for `Unknown`, `N/A`, `NaN`.
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let value: f64 = num.parse().ok()?;
    let mul: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "KB" | "kB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        _ => return None,
    };
    let bytes = value * mul;
    if bytes.is_finite() && bytes >= 0.0 {
        Some(bytes.round() as u64)
    } else {
        None
    }
}

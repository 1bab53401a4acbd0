use std::net::{IpAddr, Ipv4Addr};

use chrono::Utc;

use crate::error::{BoardError, BoardResult};

const BOARDWATCH_PORT: &str = "BOARDWATCH_PORT";

const DEFAULT_PORT: u16 = 1984;

pub fn get_port() -> u16 {
    let port_from_env = std::env::var(BOARDWATCH_PORT);
    port_from_env.map_or(DEFAULT_PORT, |res| res.parse().unwrap_or(DEFAULT_PORT))
}

const BOARDWATCH_ADDR: &str = "BOARDWATCH_ADDR";

const DEFAULT_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0));

pub fn get_addr() -> IpAddr {
    let addr_from_env = std::env::var(BOARDWATCH_ADDR);
    addr_from_env.map_or(DEFAULT_ADDR, |res| res.parse().unwrap_or(DEFAULT_ADDR))
}

/// Current wall clock in whole seconds.
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// Current wall clock as (seconds, microseconds).
pub fn now_timestamp() -> (i64, u32) {
    let now = Utc::now();
    (now.timestamp(), now.timestamp_subsec_micros())
}

/// Encode a text so it fits in a single pipe-delimited field.
pub fn nlencode(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '|' => out.push_str("\\p"),
            other => out.push(other),
        }
    }
    out
}

/// Reverse of [`nlencode`]. Unknown escapes are kept verbatim.
pub fn nldecode(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('p') => out.push('|'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Parse a duration such as `30`, `30m`, `4h`, `2d` or `1w` into minutes.
pub fn parse_duration_mins(text: &str) -> BoardResult<i64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: i64 = digits
        .parse()
        .map_err(|_| BoardError::Protocol(format!("invalid duration '{text}'")))?;
    let factor = match unit.to_ascii_lowercase().as_str() {
        "" | "m" => 1,
        "h" => 60,
        "d" => 24 * 60,
        "w" => 7 * 24 * 60,
        _ => return Err(BoardError::Protocol(format!("invalid duration unit '{text}'"))),
    };
    Ok(value * factor)
}

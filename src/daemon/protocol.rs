//! Parsing of client messages
//!
//! A message is the full text a client sends on one connection. The first
//! word selects the command:
//!
//! ```text
//! status[+LIFETIME][/group:GROUP] HOST.TEST COLOR message...
//! combo                              one status block per "status" line
//! data HOST.NAME                     body on the following lines
//! enable HOST.TEST
//! disable HOST.TEST DURATION [reason]      DURATION -1 = until OK
//! ack [HOST.TEST] COOKIE DURATION [message]
//! drop HOST [TEST]
//! rename HOST NEWHOST | rename HOST TEST NEWTEST
//! modify HOST.TEST COLOR SOURCE cause...
//! notify HOST.TEST message...
//! query HOST.TEST | log HOST.TEST | board [filters] | ghostlist | ping
//! ```
//!
//! Host names use commas in place of dots (`www,example,com.http`).

use tracing::warn;

use crate::color::Color;
use crate::error::{BoardError, BoardResult};
use crate::store::{BoardQuery, DisableDuration, StatusReport};
use crate::util::parse_duration_mins;

#[derive(Debug, Clone)]
pub enum Request {
    Status(StatusReport),
    Combo(Vec<StatusReport>),
    Data {
        host: String,
        name: String,
        body: String,
    },
    Enable {
        host: String,
        test: String,
    },
    Disable {
        host: String,
        test: String,
        duration: DisableDuration,
        reason: String,
    },
    Ack {
        target: Option<(String, String)>,
        cookie: u32,
        minutes: i64,
        message: String,
    },
    Drop {
        host: String,
        test: Option<String>,
    },
    RenameHost {
        host: String,
        new_name: String,
    },
    RenameTest {
        host: String,
        test: String,
        new_name: String,
    },
    Modify {
        host: String,
        test: String,
        color: Color,
        source: String,
        cause: String,
    },
    Notify {
        host: String,
        test: String,
        message: String,
    },
    Query {
        host: String,
        test: String,
    },
    Log {
        host: String,
        test: String,
    },
    Board(BoardQuery),
    GhostList,
    Ping,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Status(_) => "status",
            Request::Combo(_) => "combo",
            Request::Data { .. } => "data",
            Request::Enable { .. } => "enable",
            Request::Disable { .. } => "disable",
            Request::Ack { .. } => "ack",
            Request::Drop { .. } => "drop",
            Request::RenameHost { .. } | Request::RenameTest { .. } => "rename",
            Request::Modify { .. } => "modify",
            Request::Notify { .. } => "notify",
            Request::Query { .. } => "query",
            Request::Log { .. } => "log",
            Request::Board(_) => "board",
            Request::GhostList => "ghostlist",
            Request::Ping => "ping",
        }
    }

    /// Commands only admin senders may issue
    pub fn is_privileged(&self) -> bool {
        matches!(
            self,
            Request::Drop { .. }
                | Request::RenameHost { .. }
                | Request::RenameTest { .. }
                | Request::Enable { .. }
                | Request::Disable { .. }
                | Request::Modify { .. }
        )
    }

    pub fn parse(text: &str) -> BoardResult<Request> {
        let (command, rest) = next_word(text);
        let base = command
            .split(['+', '/'])
            .next()
            .unwrap_or_default();

        let request = match base {
            "status" => Request::Status(parse_status(text)?),
            "combo" => Request::Combo(parse_combo(rest)),
            "data" => {
                let (target, body) = rest.split_once('\n').unwrap_or((rest, ""));
                let (host, name) = host_test(target.trim())?;
                Request::Data {
                    host,
                    name,
                    body: body.to_string(),
                }
            }
            "enable" => {
                let (host, test) = host_test(required(rest, "host.test")?.0)?;
                Request::Enable { host, test }
            }
            "disable" => {
                let (target, rest) = required(rest, "host.test")?;
                let (host, test) = host_test(target)?;
                let (duration, reason) = required(rest, "duration")?;
                let duration = match duration {
                    "-1" => DisableDuration::UntilRecovery,
                    d => DisableDuration::Minutes(parse_duration_mins(d)?),
                };
                Request::Disable {
                    host,
                    test,
                    duration,
                    reason: reason.to_string(),
                }
            }
            "ack" | "xymondack" => parse_ack(rest)?,
            "drop" => {
                let (host, rest) = required(rest, "host")?;
                let (test, _) = next_word(rest);
                Request::Drop {
                    host: decode_host(host),
                    test: Some(test).filter(|t| !t.is_empty()).map(str::to_string),
                }
            }
            "rename" => {
                let (host, rest) = required(rest, "host")?;
                let (second, rest) = required(rest, "new name")?;
                let (third, _) = next_word(rest);
                if third.is_empty() {
                    Request::RenameHost {
                        host: decode_host(host),
                        new_name: decode_host(second),
                    }
                } else {
                    Request::RenameTest {
                        host: decode_host(host),
                        test: second.to_string(),
                        new_name: third.to_string(),
                    }
                }
            }
            "modify" => {
                let (target, rest) = required(rest, "host.test")?;
                let (host, test) = host_test(target)?;
                let (color, rest) = required(rest, "color")?;
                let color =
                    Color::parse(color).ok_or_else(|| BoardError::UnknownColor(color.to_string()))?;
                let (source, cause) = required(rest, "source")?;
                Request::Modify {
                    host,
                    test,
                    color,
                    source: source.to_string(),
                    cause: cause.to_string(),
                }
            }
            "notify" => {
                let (target, message) = required(rest, "host.test")?;
                let (host, test) = host_test(target)?;
                Request::Notify {
                    host,
                    test,
                    message: message.to_string(),
                }
            }
            "query" => {
                let (host, test) = host_test(required(rest, "host.test")?.0)?;
                Request::Query { host, test }
            }
            "log" | "xymondlog" => {
                let (host, test) = host_test(required(rest, "host.test")?.0)?;
                Request::Log { host, test }
            }
            "board" | "xymondboard" => Request::Board(BoardQuery::parse(rest)?),
            "ghostlist" => Request::GhostList,
            "ping" => Request::Ping,
            "" => return Err(BoardError::Protocol("empty message".into())),
            other => return Err(BoardError::Protocol(format!("unknown command '{other}'"))),
        };
        Ok(request)
    }
}

/// Split off the first whitespace-delimited word. The remainder keeps its
/// line breaks but loses leading blanks.
fn next_word(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    let end = text.find(char::is_whitespace).unwrap_or(text.len());
    let (word, rest) = text.split_at(end);
    (word, rest.trim_start_matches([' ', '\t']))
}

fn required<'a>(text: &'a str, what: &str) -> BoardResult<(&'a str, &'a str)> {
    match next_word(text) {
        ("", _) => Err(BoardError::Protocol(format!("missing {what}"))),
        found => Ok(found),
    }
}

fn decode_host(host: &str) -> String {
    host.replace(',', ".")
}

/// Split `HOST.TEST`, the test being everything after the last dot.
fn host_test(word: &str) -> BoardResult<(String, String)> {
    match word.rsplit_once('.') {
        Some((host, test)) if !host.is_empty() && !test.is_empty() => {
            Ok((decode_host(host), test.to_string()))
        }
        _ => Err(BoardError::Protocol(format!("expected HOST.TEST, got '{word}'"))),
    }
}

fn parse_status(text: &str) -> BoardResult<StatusReport> {
    let (command, rest) = next_word(text);
    let modifiers = command.strip_prefix("status").unwrap_or_default();
    let (lifetime, group) = match modifiers.split_once('/') {
        Some((lifetime, group)) => (lifetime, Some(group)),
        None => (modifiers, None),
    };
    let lifetime_mins = match lifetime.strip_prefix('+') {
        Some(duration) => Some(parse_duration_mins(duration)?),
        None if lifetime.is_empty() => None,
        None => return Err(BoardError::Protocol(format!("bad status command '{command}'"))),
    };
    let group = group
        .and_then(|g| g.strip_prefix("group:"))
        .filter(|g| !g.is_empty())
        .map(str::to_string);

    let (target, message) = required(rest, "host.test")?;
    let (host, test) = host_test(target)?;
    let (color, _) = required(message, "color")?;
    let color = Color::parse(color).ok_or_else(|| BoardError::UnknownColor(color.to_string()))?;

    Ok(StatusReport {
        host,
        test,
        color,
        message: message.trim_end().to_string(),
        lifetime_mins,
        group,
        client_ts: None,
    })
}

/// Each line starting with `status` opens a new block. Bad blocks are
/// skipped.
fn parse_combo(body: &str) -> Vec<StatusReport> {
    let mut blocks: Vec<String> = Vec::new();
    for line in body.lines() {
        if line.starts_with("status") {
            blocks.push(String::new());
        }
        if let Some(block) = blocks.last_mut() {
            block.push_str(line);
            block.push('\n');
        }
    }
    blocks
        .iter()
        .filter_map(|block| {
            parse_status(block)
                .inspect_err(|e| warn!("combo entry skipped: {e}"))
                .ok()
        })
        .collect()
}

fn parse_ack(rest: &str) -> BoardResult<Request> {
    let (first, after_first) = required(rest, "cookie")?;
    let (target, cookie, rest) = match first.parse::<u32>() {
        Ok(cookie) => (None, cookie, after_first),
        Err(_) => {
            let target = host_test(first)?;
            let (cookie, rest) = required(after_first, "cookie")?;
            let cookie = cookie
                .parse()
                .map_err(|_| BoardError::Protocol(format!("bad cookie '{cookie}'")))?;
            (Some(target), cookie, rest)
        }
    };
    let (duration, message) = required(rest, "duration")?;
    Ok(Request::Ack {
        target,
        cookie,
        minutes: parse_duration_mins(duration)?,
        message: message.trim_end().to_string(),
    })
}

//! `board` dumps: one line per record, filtered and with selectable fields

use regex::Regex;

use crate::color::{Color, ColorSet};
use crate::error::{BoardError, BoardResult};
use crate::util::nlencode;

use super::StatusStore;
use super::host::HostMeta;
use super::record::LogRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardField {
    HostName,
    TestName,
    Color,
    Flags,
    LastChange,
    LogTime,
    ValidTime,
    AckTime,
    DisableTime,
    Sender,
    Cookie,
    Line1,
    AckMsg,
    DisMsg,
    Msg,
    Ip,
    Class,
    Pages,
    ChangeCount,
    Flapping,
    Modifiers,
}

impl BoardField {
    pub const DEFAULT: [BoardField; 12] = [
        BoardField::HostName,
        BoardField::TestName,
        BoardField::Color,
        BoardField::Flags,
        BoardField::LastChange,
        BoardField::LogTime,
        BoardField::ValidTime,
        BoardField::AckTime,
        BoardField::DisableTime,
        BoardField::Sender,
        BoardField::Cookie,
        BoardField::Line1,
    ];

    pub fn parse(name: &str) -> Option<BoardField> {
        let field = match name {
            "hostname" => BoardField::HostName,
            "testname" => BoardField::TestName,
            "color" => BoardField::Color,
            "flags" => BoardField::Flags,
            "lastchange" => BoardField::LastChange,
            "logtime" => BoardField::LogTime,
            "validtime" => BoardField::ValidTime,
            "acktime" => BoardField::AckTime,
            "disabletime" => BoardField::DisableTime,
            "sender" => BoardField::Sender,
            "cookie" => BoardField::Cookie,
            "line1" => BoardField::Line1,
            "ackmsg" => BoardField::AckMsg,
            "dismsg" => BoardField::DisMsg,
            "msg" => BoardField::Msg,
            "ip" => BoardField::Ip,
            "class" => BoardField::Class,
            "pages" | "XMH_PAGEPATH" => BoardField::Pages,
            "changecount" => BoardField::ChangeCount,
            "flapping" => BoardField::Flapping,
            "modifiers" => BoardField::Modifiers,
            _ => return None,
        };
        Some(field)
    }

    fn render(self, host: &HostMeta, test: &str, record: &LogRecord) -> String {
        match self {
            BoardField::HostName => host.name.clone(),
            BoardField::TestName => test.to_string(),
            BoardField::Color => record.color.to_string(),
            BoardField::Flags => record.testflags.clone().unwrap_or_default(),
            BoardField::LastChange => record.last_change.to_string(),
            BoardField::LogTime => record.log_time.to_string(),
            BoardField::ValidTime => record.valid_until.to_string(),
            BoardField::AckTime => record.ack_time().to_string(),
            BoardField::DisableTime => record.enable_time().to_string(),
            BoardField::Sender => record.sender.clone(),
            BoardField::Cookie => record.cookie_value().map_or(-1, i64::from).to_string(),
            BoardField::Line1 => record.first_line().to_string(),
            BoardField::AckMsg => nlencode(record.ack_message()),
            BoardField::DisMsg => nlencode(record.disable_message()),
            BoardField::Msg => nlencode(&record.message),
            BoardField::Ip => host.ip_string(),
            BoardField::Class => host.class.clone().unwrap_or_default(),
            BoardField::Pages => host.page_path(),
            BoardField::ChangeCount => record.change_count.to_string(),
            BoardField::Flapping => u8::from(record.flapping).to_string(),
            BoardField::Modifiers => record.modifier_summary(),
        }
    }
}

/// Filters and field selection for a board dump
#[derive(Debug, Clone)]
pub struct BoardQuery {
    pub host: Option<Regex>,
    pub test: Option<Regex>,
    pub page: Option<Regex>,
    pub colors: Option<ColorSet>,
    pub fields: Vec<BoardField>,
}

impl Default for BoardQuery {
    fn default() -> Self {
        Self {
            host: None,
            test: None,
            page: None,
            colors: None,
            fields: BoardField::DEFAULT.to_vec(),
        }
    }
}

impl BoardQuery {
    /// Parse space separated `key=value` criteria, e.g.
    /// `host=^web color=red,yellow fields=hostname,testname,color`.
    pub fn parse(criteria: &str) -> BoardResult<BoardQuery> {
        let mut query = BoardQuery::default();
        for word in criteria.split_whitespace() {
            let (key, value) = word
                .split_once('=')
                .ok_or_else(|| BoardError::Protocol(format!("bad board filter '{word}'")))?;
            match key {
                "host" => query.host = Some(Regex::new(value)?),
                "test" => query.test = Some(Regex::new(value)?),
                "page" => query.page = Some(Regex::new(value)?),
                "color" => query.colors = Some(ColorSet::parse_list(value)?),
                "fields" => {
                    query.fields = value
                        .split(',')
                        .map(|name| {
                            BoardField::parse(name)
                                .ok_or_else(|| BoardError::Protocol(format!("unknown field '{name}'")))
                        })
                        .collect::<BoardResult<_>>()?;
                }
                _ => return Err(BoardError::Protocol(format!("unknown board filter '{key}'"))),
            }
        }
        Ok(query)
    }

    fn admits(&self, host: &HostMeta, test: &str, color: Color) -> bool {
        self.host.as_ref().is_none_or(|re| re.is_match(&host.name))
            && self.test.as_ref().is_none_or(|re| re.is_match(test))
            && self.page.as_ref().is_none_or(|re| re.is_match(&host.page_path()))
            && self.colors.is_none_or(|set| set.contains(color))
    }
}

impl StatusStore {
    /// Dump every matching record, one `|`-separated line each.
    pub fn board(&self, query: &BoardQuery) -> String {
        let mut out = String::new();
        for host in self.hosts.iter() {
            for (key, record) in &host.records {
                let test = self.tests.name(key.test);
                if !query.admits(&host.meta, test, record.color) {
                    continue;
                }
                let line: Vec<String> = query
                    .fields
                    .iter()
                    .map(|field| field.render(&host.meta, test, record))
                    .collect();
                out.push_str(&line.join("|"));
                out.push('\n');
            }
        }
        out
    }
}

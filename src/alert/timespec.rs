//! Time-of-day windows for `TIME=` and `EXTIME=` criteria
//!
//! A spec is a comma-separated list of windows `DAYS:HHMM:HHMM`. `DAYS` is
//! `*` (every day), `W` (Monday to Friday) or any string of the digits
//! `0`-`6` with `0` meaning Sunday. Both ends of a window are inclusive.

use std::fmt;

use chrono::{Datelike, NaiveDateTime, Timelike};

use crate::error::{BoardError, BoardResult};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Window {
    /// Indexed by days since Sunday
    days: [bool; 7],
    start: u32,
    end: u32,
}

impl Window {
    fn parse(text: &str) -> BoardResult<Self> {
        let bad = || BoardError::Config(format!("invalid time window '{text}'"));
        let mut parts = text.split(':');
        let (Some(days), Some(start), Some(end), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(bad());
        };

        let mut mask = [false; 7];
        for c in days.chars() {
            match c {
                '*' => mask = [true; 7],
                'W' | 'w' => mask[1..6].iter_mut().for_each(|d| *d = true),
                '0'..='6' => mask[c as usize - '0' as usize] = true,
                _ => return Err(bad()),
            }
        }

        Ok(Window {
            days: mask,
            start: parse_hhmm(start).ok_or_else(bad)?,
            end: parse_hhmm(end).ok_or_else(bad)?,
        })
    }

    fn contains(&self, when: &NaiveDateTime) -> bool {
        let day = when.weekday().num_days_from_sunday() as usize;
        let minute = when.hour() * 60 + when.minute();
        self.days[day] && self.start <= minute && minute <= self.end
    }
}

/// `HHMM` as minutes after midnight; `2400` is accepted as end of day.
fn parse_hhmm(text: &str) -> Option<u32> {
    if text.len() != 4 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u32 = text.parse().ok()?;
    let (hours, minutes) = (value / 100, value % 100);
    if hours > 24 || minutes > 59 || (hours == 24 && minutes != 0) {
        return None;
    }
    Some(hours * 60 + minutes)
}

/// A set of weekly time windows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSpec {
    source: String,
    windows: Vec<Window>,
}

impl TimeSpec {
    pub fn parse(text: &str) -> BoardResult<Self> {
        let windows = text
            .split(',')
            .map(str::trim)
            .filter(|w| !w.is_empty())
            .map(Window::parse)
            .collect::<BoardResult<Vec<_>>>()?;
        if windows.is_empty() {
            return Err(BoardError::Config("empty time specification".into()));
        }
        Ok(Self {
            source: text.to_string(),
            windows,
        })
    }

    /// True if `when` (local time) falls inside any window.
    pub fn contains(&self, when: &NaiveDateTime) -> bool {
        self.windows.iter().any(|w| w.contains(when))
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

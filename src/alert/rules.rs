//! Alert rules file
//!
//! ## Format
//!
//! ```text
//! $ONCALL=ops@example.com,dba@example.com
//! HOST=%^web SERVICE=http,https COLOR=red DURATION>10
//!     MAIL $ONCALL REPEAT=30 RECOVERED
//!     SCRIPT /usr/local/bin/sms 5551234 FORMAT=SMS
//! PAGE=prod
//!     IGNORE
//! ```
//!
//! A line whose first token is a criteria directive starts a new rule.
//! Recipient lines add to the current rule; criteria directives after a
//! recipient on the same line restrict that recipient only. `$NAME=value`
//! lines define macros expanded in every later line. `include FILE` (or
//! `%include FILE`) reads another rules file in place, relative to the
//! directory of the file that names it.
//!
//! Every token is classified into a [`Directive`] once, and the parser acts
//! on the directive kind.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::color::ColorSet;
use crate::error::{BoardError, BoardResult};
use crate::util::parse_duration_mins;

use super::criteria::{Criteria, NamePattern, parse_colors};
use super::timespec::TimeSpec;

/// Characters that end a macro name
const MACRO_END: &str = "\t $.,|%!()[]{}+?/&@:;*";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Mail,
    Script { command: String },
    Ignore,
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::Mail => "mail",
            Method::Script { .. } => "script",
            Method::Ignore => "ignore",
        }
    }
}

/// Layout of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Plain,
    Sms,
    Pager,
    Script,
    /// Nothing is sent (`IGNORE`)
    None,
}

impl Format {
    fn parse(name: &str) -> Option<Format> {
        match name.to_ascii_uppercase().as_str() {
            "TEXT" => Some(Format::Text),
            "PLAIN" => Some(Format::Plain),
            "SMS" => Some(Format::Sms),
            "PAGER" => Some(Format::Pager),
            "SCRIPT" => Some(Format::Script),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recipient {
    /// Line the recipient was defined on
    pub cfid: usize,
    pub method: Method,
    /// Mail address or script argument
    pub target: String,
    pub format: Format,
    /// Seconds between repeated notifications
    pub repeat_secs: i64,
    /// No rules after this one are considered
    pub stop: bool,
    /// Only notified when nobody else was
    pub unmatched_only: bool,
    /// Only notices, never alerts or recoveries
    pub no_alert: bool,
    pub criteria: Criteria,
}

impl Recipient {
    fn new(cfid: usize, method: Method, target: String, repeat_secs: i64) -> Self {
        let format = match method {
            Method::Mail => Format::Text,
            Method::Script { .. } => Format::Script,
            Method::Ignore => Format::None,
        };
        Self {
            cfid,
            stop: method == Method::Ignore,
            method,
            target,
            format,
            repeat_secs,
            unmatched_only: false,
            no_alert: false,
            criteria: Criteria::default(),
        }
    }

    /// Key of this recipient's entry in the repeat table for one alert
    pub fn repeat_key(&self, host: &str, test: &str) -> String {
        format!("{host}|{test}|{}|{}", self.method.name(), self.target)
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.method {
            Method::Mail => write!(f, "MAIL {}", self.target)?,
            Method::Script { command } => write!(f, "SCRIPT {command} {}", self.target)?,
            Method::Ignore => f.write_str("IGNORE")?,
        }
        if self.stop && self.method != Method::Ignore {
            f.write_str(" STOP")?;
        }
        if self.unmatched_only {
            f.write_str(" UNMATCHED")?;
        }
        if self.no_alert {
            f.write_str(" NOALERT")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub cfid: usize,
    pub criteria: Criteria,
    pub recipients: Vec<Recipient>,
}

/// Settings the rules file inherits from the alerter configuration
#[derive(Debug, Clone, Copy)]
pub struct RuleDefaults {
    pub repeat_secs: i64,
    pub colors: ColorSet,
}

/// The parsed rules file, in file order
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Parse rules text that has no file behind it. Include lines are
    /// skipped since there is no directory to resolve them against.
    pub fn parse(text: &str, defaults: &RuleDefaults) -> RuleSet {
        let mut parser = Parser::new(defaults);
        if let Err(e) = parser.text(text, None) {
            warn!("alert rules: {e}");
        }
        parser.finish()
    }

    /// Read a rules file and every file it includes.
    pub fn load(path: &Path, defaults: &RuleDefaults) -> BoardResult<RuleSet> {
        let mut parser = Parser::new(defaults);
        parser.file(path)?;
        let rules = parser.finish();
        debug!("loaded {} alert rules from {}", rules.len(), path.display());
        Ok(rules)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dimension {
    Page,
    DisplayGroup,
    Host,
    Service,
    Class,
    Group,
}

#[derive(Debug)]
enum Criterion {
    Name {
        dimension: Dimension,
        exclude: bool,
        pattern: NamePattern,
    },
    Colors(ColorSet),
    Time(TimeSpec),
    ExTime(TimeSpec),
    MinDuration(i64),
    MaxDuration(i64),
    Recovered(bool),
    Notice(bool),
}

impl Criterion {
    fn apply(self, crit: &mut Criteria) {
        match self {
            Criterion::Name {
                dimension,
                exclude,
                pattern,
            } => {
                let filter = match dimension {
                    Dimension::Page => &mut crit.page,
                    Dimension::DisplayGroup => &mut crit.display_group,
                    Dimension::Host => &mut crit.host,
                    Dimension::Service => &mut crit.service,
                    Dimension::Class => &mut crit.class,
                    Dimension::Group => &mut crit.group,
                };
                if exclude {
                    filter.exclude = Some(pattern);
                } else {
                    filter.include = Some(pattern);
                }
            }
            Criterion::Colors(colors) => crit.colors = Some(colors),
            Criterion::Time(spec) => crit.time = Some(spec),
            Criterion::ExTime(spec) => crit.extime = Some(spec),
            Criterion::MinDuration(secs) => crit.min_duration = Some(secs),
            Criterion::MaxDuration(secs) => crit.max_duration = Some(secs),
            Criterion::Recovered(wanted) => crit.recovered = Some(wanted),
            Criterion::Notice(wanted) => crit.notice = Some(wanted),
        }
    }
}

/// File named by an include line, if the line is one
fn include_target(line: &str) -> Option<&str> {
    let (tag, rest) = line.trim().split_once(char::is_whitespace)?;
    let tag = tag.strip_prefix('%').unwrap_or(tag);
    tag.eq_ignore_ascii_case("include").then(|| rest.trim())
}

/// One classified token of the rules file
#[derive(Debug)]
enum Directive {
    Criterion(Criterion),
    Format(Format),
    Repeat(i64),
    Stop,
    Unmatched,
    NoAlert,
    Mail(Option<String>),
    Script(Option<String>),
    Ignore,
    /// Anything else: a recipient when a MAIL or SCRIPT is active
    Word(String),
}

fn name_directive(key: &str) -> Option<(Dimension, bool)> {
    let (exclude, key) = match key.strip_prefix("EX") {
        Some(rest) => (true, rest),
        None => (false, key),
    };
    let dimension = match key {
        "PAGE" | "PAGES" => Dimension::Page,
        "DISPLAYGROUP" | "DISPLAYGROUPS" => Dimension::DisplayGroup,
        "HOST" | "HOSTS" => Dimension::Host,
        "SERVICE" | "SERVICES" => Dimension::Service,
        "CLASS" => Dimension::Class,
        "GROUP" => Dimension::Group,
        _ => return None,
    };
    Some((dimension, exclude))
}

fn duration_directive(rest: &str) -> BoardResult<Option<Criterion>> {
    let criterion = if let Some(value) = rest.strip_prefix(">=") {
        Criterion::MinDuration(60 * parse_duration_mins(value)?)
    } else if let Some(value) = rest.strip_prefix('>') {
        Criterion::MinDuration(60 * parse_duration_mins(value)? + 1)
    } else if let Some(value) = rest.strip_prefix("<=") {
        Criterion::MaxDuration(60 * parse_duration_mins(value)?)
    } else if let Some(value) = rest.strip_prefix('<') {
        Criterion::MaxDuration(60 * parse_duration_mins(value)? - 1)
    } else {
        return Ok(None);
    };
    Ok(Some(criterion))
}

impl Directive {
    fn parse(token: &str, default_colors: ColorSet) -> BoardResult<Directive> {
        let upper = token.to_ascii_uppercase();
        if let Some(rest) = upper.strip_prefix("DURATION") {
            if let Some(criterion) = duration_directive(rest)? {
                return Ok(Directive::Criterion(criterion));
            }
        }

        if let Some((key, value)) = token.split_once('=') {
            let key = key.to_ascii_uppercase();
            if let Some((dimension, exclude)) = name_directive(&key) {
                return Ok(Directive::Criterion(Criterion::Name {
                    dimension,
                    exclude,
                    pattern: NamePattern::parse(value)?,
                }));
            }
            let directive = match key.as_str() {
                "COLOR" | "COLORS" => {
                    Directive::Criterion(Criterion::Colors(parse_colors(value, default_colors)?))
                }
                "TIME" | "TIMES" => Directive::Criterion(Criterion::Time(TimeSpec::parse(value)?)),
                "EXTIME" | "EXTIMES" => {
                    Directive::Criterion(Criterion::ExTime(TimeSpec::parse(value)?))
                }
                "FORMAT" => Directive::Format(
                    Format::parse(value)
                        .ok_or_else(|| BoardError::Config(format!("unknown format '{value}'")))?,
                ),
                "REPEAT" => Directive::Repeat(60 * parse_duration_mins(value)?),
                "MAIL" => Directive::Mail(Some(value.to_string())),
                "SCRIPT" => Directive::Script(Some(value.to_string())),
                _ => Directive::Word(token.to_string()),
            };
            return Ok(directive);
        }

        Ok(match upper.as_str() {
            "RECOVERED" => Directive::Criterion(Criterion::Recovered(true)),
            "NORECOVERED" => Directive::Criterion(Criterion::Recovered(false)),
            "NOTICE" => Directive::Criterion(Criterion::Notice(true)),
            "NONOTICE" => Directive::Criterion(Criterion::Notice(false)),
            "STOP" => Directive::Stop,
            "UNMATCHED" => Directive::Unmatched,
            "NOALERT" => Directive::NoAlert,
            "MAIL" => Directive::Mail(None),
            "SCRIPT" => Directive::Script(None),
            "IGNORE" => Directive::Ignore,
            _ => Directive::Word(token.to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    None,
    Rule,
    Recipient,
}

/// What the current line has started so far
#[derive(Debug, Default)]
struct LineState {
    first_token: bool,
    mail_active: bool,
    script: Option<String>,
    /// Index of the first recipient added on this line
    first_recipient: Option<usize>,
}

struct Parser<'d> {
    defaults: &'d RuleDefaults,
    rules: Vec<Rule>,
    current: Option<Rule>,
    state: State,
    macros: Vec<(String, String)>,
    /// Lines read so far across all files; numbers rules and recipients
    lines: usize,
    /// Files currently being read, outermost included
    open_files: HashSet<PathBuf>,
}

impl<'d> Parser<'d> {
    fn new(defaults: &'d RuleDefaults) -> Self {
        Self {
            defaults,
            rules: Vec::new(),
            current: None,
            state: State::None,
            macros: Vec::new(),
            lines: 0,
            open_files: HashSet::new(),
        }
    }

    fn file(&mut self, path: &Path) -> BoardResult<()> {
        let unreadable =
            |e: std::io::Error| BoardError::Config(format!("cannot read {}: {e}", path.display()));
        let text = std::fs::read_to_string(path).map_err(unreadable)?;
        let key = path.canonicalize().map_err(unreadable)?;
        if !self.open_files.insert(key.clone()) {
            return Err(BoardError::Config(format!(
                "{} includes itself",
                path.display()
            )));
        }
        let result = self.text(&text, path.parent());
        self.open_files.remove(&key);
        result
    }

    fn text(&mut self, text: &str, dir: Option<&Path>) -> BoardResult<()> {
        for raw in text.lines() {
            self.lines += 1;
            let cfid = self.lines;
            match include_target(raw) {
                Some(name) => {
                    let name = self.expand(cfid, name);
                    match dir {
                        Some(dir) => self.file(&dir.join(name))?,
                        None => warn!("line {cfid}: cannot include {name} without a rules file"),
                    }
                }
                None => self.line(cfid, raw),
            }
        }
        Ok(())
    }

    fn expand(&self, cfid: usize, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];
            let end = after
                .find(|c: char| MACRO_END.contains(c))
                .unwrap_or(after.len());
            let name = &after[..end];
            if name.is_empty() {
                out.push('$');
            } else if let Some((_, value)) = self.macros.iter().rev().find(|(n, _)| n == name) {
                out.push_str(value);
            } else {
                warn!("line {cfid}: macro ${name} is not defined");
            }
            rest = &after[end..];
        }
        out.push_str(rest);
        out
    }

    fn flush(&mut self) {
        if let Some(rule) = self.current.take() {
            if rule.recipients.is_empty() {
                warn!("alert rule at line {} has no recipients", rule.cfid);
            } else {
                self.rules.push(rule);
            }
        }
        self.state = State::None;
    }

    fn criteria_target(&mut self, cfid: usize) -> Option<&mut Criteria> {
        if self.state == State::None || self.current.is_none() {
            self.current = Some(Rule {
                cfid,
                criteria: Criteria::default(),
                recipients: Vec::new(),
            });
            self.state = State::Rule;
        }
        let rule = self.current.as_mut()?;
        let crit = match self.state {
            State::Recipient => &mut rule.recipients.last_mut()?.criteria,
            _ => &mut rule.criteria,
        };
        crit.cfid = cfid;
        Some(crit)
    }

    fn last_recipient(&mut self) -> Option<&mut Recipient> {
        if self.state != State::Recipient {
            return None;
        }
        self.current.as_mut()?.recipients.last_mut()
    }

    fn add_recipient(&mut self, line: &mut LineState, recipient: Recipient) {
        let Some(rule) = self.current.as_mut() else {
            return;
        };
        line.first_recipient.get_or_insert(rule.recipients.len());
        rule.recipients.push(recipient);
        self.state = State::Recipient;
    }

    fn line(&mut self, cfid: usize, raw: &str) {
        let text = raw.trim();
        if text.is_empty() || text.starts_with('#') {
            return;
        }
        if let Some(definition) = text.strip_prefix('$') {
            if let Some((name, value)) = definition.split_once('=') {
                let value = self.expand(cfid, value.trim());
                self.macros.push((name.trim().to_string(), value));
                return;
            }
        }

        let text = self.expand(cfid, text);
        let mut tokens = text.split_whitespace();
        let mut line = LineState {
            first_token: true,
            ..Default::default()
        };
        let repeat = self.defaults.repeat_secs;

        while let Some(token) = tokens.next() {
            let directive = match Directive::parse(token, self.defaults.colors) {
                Ok(directive) => directive,
                Err(e) => {
                    warn!("line {cfid}: ignoring '{token}': {e}");
                    continue;
                }
            };

            match directive {
                Directive::Criterion(criterion) => {
                    if line.first_token {
                        self.flush();
                    }
                    if let Some(crit) = self.criteria_target(cfid) {
                        criterion.apply(crit);
                    }
                }
                Directive::Format(format) if self.state == State::Recipient => {
                    if let Some(r) = self.last_recipient() {
                        r.format = format;
                    }
                }
                Directive::Repeat(secs) if self.state == State::Recipient => {
                    if let Some(r) = self.last_recipient() {
                        r.repeat_secs = secs;
                    }
                }
                Directive::Stop if self.state == State::Recipient => {
                    if let Some(r) = self.last_recipient() {
                        r.stop = true;
                    }
                }
                Directive::Unmatched if self.state == State::Recipient => {
                    if let Some(r) = self.last_recipient() {
                        r.unmatched_only = true;
                    }
                }
                Directive::NoAlert if self.state == State::Recipient => {
                    if let Some(r) = self.last_recipient() {
                        r.no_alert = true;
                    }
                }
                Directive::Mail(target) if self.current.is_some() => {
                    line.mail_active = true;
                    match target.or_else(|| tokens.next().map(str::to_string)) {
                        Some(target) => {
                            self.add_recipient(&mut line, Recipient::new(cfid, Method::Mail, target, repeat))
                        }
                        None => warn!("line {cfid}: MAIL without a recipient"),
                    }
                }
                Directive::Script(command) if self.current.is_some() => {
                    let command = command.or_else(|| tokens.next().map(str::to_string));
                    let target = tokens.next();
                    match (command, target) {
                        (Some(command), Some(target)) => {
                            line.script = Some(command.clone());
                            let method = Method::Script { command };
                            self.add_recipient(
                                &mut line,
                                Recipient::new(cfid, method, target.to_string(), repeat),
                            );
                        }
                        _ => warn!("line {cfid}: SCRIPT needs a command and a recipient"),
                    }
                }
                Directive::Ignore if self.current.is_some() => {
                    self.add_recipient(
                        &mut line,
                        Recipient::new(cfid, Method::Ignore, String::new(), repeat),
                    );
                }
                Directive::Word(word) if self.current.is_some() && line.mail_active => {
                    self.add_recipient(&mut line, Recipient::new(cfid, Method::Mail, word, repeat));
                }
                Directive::Word(word) if self.current.is_some() && line.script.is_some() => {
                    let command = line.script.clone().unwrap_or_default();
                    let method = Method::Script { command };
                    self.add_recipient(&mut line, Recipient::new(cfid, method, word, repeat));
                }
                other => warn!("line {cfid}: ignored unexpected token {other:?}"),
            }
            line.first_token = false;
        }

        self.share_line_settings(&line);
    }

    /// Settings given after the last recipient of a line apply to all
    /// recipients on that line.
    fn share_line_settings(&mut self, line: &LineState) {
        let (Some(first), Some(rule)) = (line.first_recipient, self.current.as_mut()) else {
            return;
        };
        let Some((last, others)) = rule.recipients[first..].split_last_mut() else {
            return;
        };
        for r in others {
            r.format = last.format;
            r.repeat_secs = last.repeat_secs;
            r.criteria = last.criteria.clone();
            r.no_alert = last.no_alert;
        }
    }

    fn finish(mut self) -> RuleSet {
        self.flush();
        RuleSet { rules: self.rules }
    }
}

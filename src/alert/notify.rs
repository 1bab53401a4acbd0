//! Notifications and their delivery
//!
//! A [`Notification`] is fully rendered by the tracker: subject, text,
//! recipient and (for scripts) the environment. A [`Dispatcher`] only has
//! to deliver it. [`CommandDispatcher`] pipes mail through the configured
//! mail command or runs the recipient's script.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::color::Color;
use crate::error::{BoardError, BoardResult};

use super::rules::{Format, Method, Recipient};
use super::tracker::{ActiveAlert, AlertState};

/// Longest message passed to scripts in `BBALPHAMSG`
const MAX_SCRIPT_MESSAGE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub host: String,
    pub test: String,
    pub state: AlertState,
    pub method: Method,
    /// Recipient with `&HOST&`, `&SERVICE&` and `&COLOR&` substituted
    pub recipient: String,
    pub subject: Option<String>,
    pub text: String,
    /// Environment for script recipients
    pub env: Vec<(String, String)>,
}

impl Notification {
    pub fn build(alert: &ActiveAlert, recipient: &Recipient, now: i64) -> Self {
        let target = expand_recipient(&recipient.target, alert);
        let text = message_text(alert, recipient.format);
        let env = match recipient.method {
            Method::Script { .. } => script_env(alert, recipient, &target, &text, now),
            _ => Vec::new(),
        };
        Self {
            host: alert.host.clone(),
            test: alert.test.clone(),
            state: alert.state,
            method: recipient.method.clone(),
            recipient: target,
            subject: subject(alert, recipient.format),
            text,
            env,
        }
    }
}

fn severity(color: Color) -> &'static str {
    match color {
        Color::Green => "is GREEN",
        Color::Clear => "has no data (CLEAR)",
        Color::Blue => "is disabled (BLUE)",
        Color::Purple => "stopped reporting (PURPLE)",
        Color::Yellow => "warning (YELLOW)",
        Color::Red => "CRITICAL (RED)",
    }
}

fn cookie_tag(alert: &ActiveAlert) -> String {
    if alert.cookie >= 0 {
        format!(" [{}]", alert.cookie)
    } else {
        String::new()
    }
}

/// Mail subject; only the text formats get one.
pub fn subject(alert: &ActiveAlert, format: Format) -> Option<String> {
    if !matches!(format, Format::Text | Format::Plain) {
        return None;
    }
    let (host, test) = (&alert.host, &alert.test);
    let subject = match alert.state {
        AlertState::Paging | AlertState::Acked => match alert.cookie {
            cookie if cookie >= 0 => {
                format!("Xymon [{cookie}] {host}:{test} {}", severity(alert.color))
            }
            _ => format!("Xymon {host}:{test} {}", severity(alert.color)),
        },
        AlertState::Notify => format!("Xymon {host}:{test} NOTICE"),
        AlertState::Recovered => format!("Xymon {host}:{test} recovered"),
        AlertState::Disabled => format!("Xymon {host}:{test} disabled"),
        AlertState::NoRecip | AlertState::Dead => return None,
    };
    Some(subject)
}

/// The status text, optionally without its leading color word.
fn message_body(message: &str, skip_color: bool) -> &str {
    if !skip_color {
        return message;
    }
    let trimmed = message.trim_start();
    let word_end = trimmed
        .find(char::is_whitespace)
        .unwrap_or(trimmed.len());
    if Color::parse(&trimmed[..word_end]).is_some() {
        trimmed[word_end..].trim_start_matches([' ', '\t'])
    } else {
        message
    }
}

/// Drop `<!-- ... -->` markup from the first line.
fn strip_flags(body: &str) -> String {
    let (first, rest) = match body.split_once('\n') {
        Some((first, rest)) => (first, Some(rest)),
        None => (body, None),
    };
    let mut out = match first.find("<!--") {
        Some(start) => {
            let tail = first[start..].find("-->").map_or("", |end| &first[start + end + 3..]);
            format!("{}{tail}", &first[..start])
        }
        None => first.to_string(),
    };
    if let Some(rest) = rest {
        out.push('\n');
        out.push_str(rest);
    }
    out
}

pub fn message_text(alert: &ActiveAlert, format: Format) -> String {
    let (host, test) = (&alert.host, &alert.test);
    if alert.state == AlertState::Notify {
        return format!("{host}:{test} INFO\n{}", alert.page_message);
    }

    match format {
        Format::Text | Format::Plain => {
            let mut text = strip_flags(message_body(&alert.page_message, true));
            text.push('\n');
            text
        }
        Format::Sms => {
            let mut text = match alert.state {
                AlertState::Recovered => format!("{host}:{test} RECOVERED"),
                AlertState::Disabled => format!("{host}:{test} DISABLED"),
                _ => format!("{host}:{test} {}{}", alert.color, cookie_tag(alert)),
            };
            let body = message_body(&alert.page_message, true);
            for line in body.lines().skip(1) {
                if line.starts_with("&red") || line.starts_with("&yellow") {
                    text.push('\n');
                    text.push_str(line);
                }
            }
            text
        }
        Format::Script => format!(
            "{host}:{test} {}{}\n{}\n",
            alert.color,
            cookie_tag(alert),
            alert.page_message
        ),
        Format::Pager | Format::None => String::new(),
    }
}

/// Substitute `&HOST&`, `&SERVICE&` and `&COLOR&` (any case).
pub fn expand_recipient(target: &str, alert: &ActiveAlert) -> String {
    let substitutions = [
        ("&HOST&", alert.host.as_str()),
        ("&SERVICE&", alert.test.as_str()),
        ("&COLOR&", alert.color.name()),
    ];
    let mut out = String::with_capacity(target.len());
    let mut rest = target;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let hit = substitutions.iter().find(|(tag, _)| {
            tail.get(..tag.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(tag))
        });
        match hit {
            Some((tag, value)) => {
                out.push_str(value);
                rest = &tail[tag.len()..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Stable identifier of one alert event
pub fn alert_id(alert: &ActiveAlert) -> String {
    let digest = md5::compute(format!("{}|{}|{}", alert.host, alert.test, alert.event_start));
    format!("{digest:x}")
}

fn crop(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn script_env(
    alert: &ActiveAlert,
    recipient: &Recipient,
    target: &str,
    text: &str,
    now: i64,
) -> Vec<(String, String)> {
    let down = now - alert.event_start;
    let recovered = match alert.state {
        AlertState::Recovered => "1",
        AlertState::Disabled => "2",
        _ => "0",
    };
    let down_msg = if recovered == "0" {
        String::new()
    } else {
        format!("Event duration : {down}")
    };
    [
        ("CFID", recipient.cfid.to_string()),
        ("BBALPHAMSG", crop(text, MAX_SCRIPT_MESSAGE).to_string()),
        ("ACKCODE", alert.cookie.to_string()),
        ("RCPT", target.to_string()),
        ("BBHOSTNAME", alert.host.clone()),
        ("BBHOSTSVC", format!("{}.{}", alert.host, alert.test)),
        (
            "BBHOSTSVCCOMMAS",
            format!("{}.{}", alert.host.replace('.', ","), alert.test),
        ),
        ("MACHIP", alert.ip.clone()),
        ("BBSVCNAME", alert.test.clone()),
        ("BBCOLORLEVEL", alert.color.to_string()),
        ("RECOVERED", recovered.to_string()),
        ("DOWNSECS", down.to_string()),
        ("EVENTSTART", alert.event_start.to_string()),
        ("DOWNSECSMSG", down_msg),
        ("ALERTID", alert_id(alert)),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Delivers rendered notifications
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, notification: Notification) -> BoardResult<()>;
}

/// Delivers through external commands
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    /// Mail program and its leading arguments, e.g. `mail` or `mailx -r x`
    mail_command: Vec<String>,
    timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(mail_command: &str, timeout: Duration) -> Self {
        Self {
            mail_command: mail_command.split_whitespace().map(str::to_string).collect(),
            timeout,
        }
    }

    async fn run(&self, mut command: Command, input: Option<&str>) -> BoardResult<()> {
        command
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        if let (Some(text), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(text.as_bytes()).await?;
            // closing stdin ends the message
            drop(stdin);
        }

        let status = tokio::time::timeout(self.timeout, child.wait())
            .await
            .map_err(|_| {
                BoardError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("command did not finish within {}s", self.timeout.as_secs()),
                ))
            })??;
        if !status.success() {
            warn!("notification command exited with {status}");
        }
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for CommandDispatcher {
    #[instrument(skip(self, notification), fields(host = %notification.host, test = %notification.test))]
    async fn dispatch(&self, notification: Notification) -> BoardResult<()> {
        match &notification.method {
            Method::Mail => {
                let Some((program, args)) = self.mail_command.split_first() else {
                    return Err(BoardError::Config("no mail command configured".into()));
                };
                let mut command = Command::new(program);
                command.args(args);
                if let Some(subject) = &notification.subject {
                    command.arg("-s").arg(subject);
                }
                command.arg(&notification.recipient);
                debug!("mailing {}", notification.recipient);
                self.run(command, Some(&notification.text)).await
            }
            Method::Script { command: script } => {
                let mut command = Command::new(script);
                command.envs(notification.env.iter().map(|(k, v)| (k, v)));
                debug!("running {script} for {}", notification.recipient);
                self.run(command, None).await
            }
            Method::Ignore => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::rules::{RuleDefaults, RuleSet};
    use crate::color::ColorSet;
    use pretty_assertions::assert_eq;

    const NOW: i64 = 1_700_000_600;

    fn alert(state: AlertState) -> ActiveAlert {
        let mut alert = ActiveAlert::new("www.example.com", "http", NOW - 600);
        alert.state = state;
        alert.color = Color::Red;
        alert.cookie = 4711;
        alert.ip = "10.0.0.1".into();
        alert.page_message =
            "red <!-- [flags:OrdAstLe] --> slow response\n&red index.html took 12s\n&green /ok\n"
                .into();
        alert
    }

    fn recipient(line: &str) -> Recipient {
        let rules = RuleSet::parse(
            &format!("HOST=*\n {line}\n"),
            &RuleDefaults {
                repeat_secs: 1800,
                colors: ColorSet::DEFAULT_ALERT,
            },
        );
        rules.rules()[0].recipients[0].clone()
    }

    #[test]
    fn test_subjects() {
        let paging = alert(AlertState::Paging);
        assert_eq!(
            subject(&paging, Format::Text).as_deref(),
            Some("Xymon [4711] www.example.com:http CRITICAL (RED)")
        );
        assert_eq!(subject(&paging, Format::Sms), None);
        assert_eq!(
            subject(&alert(AlertState::Recovered), Format::Plain).as_deref(),
            Some("Xymon www.example.com:http recovered")
        );
        assert_eq!(
            subject(&alert(AlertState::Notify), Format::Text).as_deref(),
            Some("Xymon www.example.com:http NOTICE")
        );
    }

    #[test]
    fn test_text_formats() {
        let paging = alert(AlertState::Paging);
        assert_eq!(
            message_text(&paging, Format::Plain),
            " slow response\n&red index.html took 12s\n&green /ok\n\n"
        );
        assert_eq!(
            message_text(&paging, Format::Sms),
            "www.example.com:http red [4711]\n&red index.html took 12s"
        );
        assert_eq!(message_text(&alert(AlertState::Recovered), Format::Sms),
            "www.example.com:http RECOVERED\n&red index.html took 12s");
        assert_eq!(message_text(&paging, Format::Pager), "");

        let mut notice = alert(AlertState::Notify);
        notice.page_message = "maintenance tonight".into();
        assert_eq!(
            message_text(&notice, Format::Sms),
            "www.example.com:http INFO\nmaintenance tonight"
        );
    }

    #[test]
    fn test_recipient_substitution() {
        let a = alert(AlertState::Paging);
        assert_eq!(
            expand_recipient("ops+&host&-&SERVICE&@example.com", &a),
            "ops+www.example.com-http@example.com"
        );
        assert_eq!(expand_recipient("a&b&Color&", &a), "a&bred");
    }

    #[test]
    fn test_script_environment() {
        let mut recovered = alert(AlertState::Recovered);
        recovered.color = Color::Red;
        let n = Notification::build(&recovered, &recipient("SCRIPT /bin/true &COLOR&-pager"), NOW);
        let env: std::collections::HashMap<_, _> = n.env.iter().cloned().collect();
        assert_eq!(n.recipient, "red-pager");
        assert_eq!(env["RCPT"], "red-pager");
        assert_eq!(env["BBHOSTSVC"], "www.example.com.http");
        assert_eq!(env["BBHOSTSVCCOMMAS"], "www,example,com.http");
        assert_eq!(env["RECOVERED"], "1");
        assert_eq!(env["DOWNSECS"], "600");
        assert_eq!(env["DOWNSECSMSG"], "Event duration : 600");
        assert_eq!(env["CFID"], "2");
        assert_eq!(env["ALERTID"], alert_id(&recovered));
        assert_eq!(env["ALERTID"].len(), 32);
        assert!(env["BBALPHAMSG"].starts_with("www.example.com:http red [4711]\n"));
        assert_eq!(n.subject, None);
    }

    #[tokio::test]
    async fn test_slow_command_times_out() {
        let dispatcher = CommandDispatcher::new("mail", Duration::from_millis(50));
        let mut command = Command::new("sleep");
        command.arg("5");
        let err = dispatcher.run(command, None).await.unwrap_err();
        assert!(matches!(err, BoardError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut));
    }

    #[tokio::test]
    async fn test_ignore_is_not_delivered() {
        let dispatcher = CommandDispatcher::new("", Duration::from_secs(1));
        let n = Notification::build(&alert(AlertState::Paging), &recipient("IGNORE"), NOW);
        dispatcher.dispatch(n).await.unwrap();
    }
}

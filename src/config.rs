use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::channel::ChannelKind;
use crate::color::ColorSet;

/// What to do with reports for hosts that are not configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GhostPolicy {
    /// Create the host on first report
    #[default]
    Allow,
    /// Discard the report and log it
    Drop,
    /// Discard the report but remember host and sender for the ghost list
    Log,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "crate::util::get_addr")]
    pub listen: IpAddr,
    #[serde(default = "crate::util::get_port")]
    pub port: u16,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub server: ServerConfig,

    /// Hard limit on how long a post waits for the readers of a channel
    #[serde(default = "default_post_timeout")]
    pub post_timeout_secs: u64,

    /// How often stale records are swept
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    pub checkpoint: Option<CheckpointConfig>,

    pub self_status: Option<SelfStatusConfig>,

    #[serde(default)]
    pub hosts: Vec<HostConfig>,

    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct StoreConfig {
    /// Changes within this window count towards flapping
    #[serde(default = "default_flap_threshold")]
    pub flap_threshold_secs: i64,
    /// Number of remembered state changes; 0 disables flap detection
    #[serde(default = "default_flap_count")]
    pub flap_count: usize,
    #[serde(default = "default_validity")]
    pub default_validity_mins: i64,
    #[serde(default = "default_cookie_lifetime")]
    pub cookie_lifetime_secs: i64,
    #[serde(default)]
    pub ghost_policy: GhostPolicy,
    #[serde(default = "default_alert_colors")]
    pub alert_colors: ColorSet,
    #[serde(default = "default_ok_colors")]
    pub ok_colors: ColorSet,
    /// Test whose failure turns stale siblings clear instead of purple
    #[serde(default = "default_conn_test")]
    pub conn_test: String,
    /// Origin recorded on every log record created by this daemon
    #[serde(default = "default_origin")]
    pub origin: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            flap_threshold_secs: default_flap_threshold(),
            flap_count: default_flap_count(),
            default_validity_mins: default_validity(),
            cookie_lifetime_secs: default_cookie_lifetime(),
            ghost_policy: GhostPolicy::default(),
            alert_colors: default_alert_colors(),
            ok_colors: default_ok_colors(),
            conn_test: default_conn_test(),
            origin: default_origin(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Senders allowed to drop, rename, enable, disable and modify.
    /// Loopback is always allowed; an empty list allows everyone.
    #[serde(default)]
    pub admin_senders: Vec<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: default_connection_timeout(),
            max_message_size: default_max_message_size(),
            admin_senders: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CheckpointConfig {
    pub path: PathBuf,
    #[serde(default = "default_checkpoint_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SelfStatusConfig {
    /// Host name the daemon reports its own status under
    pub host: String,
    #[serde(default = "default_self_status_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct HostConfig {
    pub name: String,
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub pages: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    pub class: Option<String>,
    /// Name of the display group the host is listed under
    pub display_group: Option<String>,
}

/// One fanout worker attached to a channel
#[derive(Debug, Clone, serde::Deserialize)]
pub struct WorkerConfig {
    pub channel: ChannelKind,
    pub name: Option<String>,
    #[serde(default)]
    pub peers: Vec<PeerSpec>,
    #[serde(default)]
    pub routing: Routing,
    pub locator: Option<LocatorConfig>,
    /// Queued messages older than this are discarded
    #[serde(default = "default_message_timeout")]
    pub message_timeout_secs: u64,
    /// Minimum time between two connection attempts to the same peer
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_secs: u64,
    /// Only messages whose header line matches are forwarded
    pub filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PeerSpec {
    /// A child process fed through its stdin
    Local {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// A remote consumer reached over TCP
    Network { address: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Routing {
    /// Everything goes to the first peer
    #[default]
    Single,
    /// Every message goes to every peer
    Broadcast,
    /// Each message goes to the peer with the shortest queue
    LeastLoaded,
    /// The peer is looked up by destination host
    Locator,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct LocatorConfig {
    /// Host name to peer address
    #[serde(default)]
    pub hosts: HashMap<String, String>,
    /// Peer for hosts without an explicit entry
    pub default: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AlerterConfig {
    /// Path of the alert rules file
    pub rules: PathBuf,
    pub checkpoint: Option<PathBuf>,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_secs: u64,
    #[serde(default = "default_mail_command")]
    pub mail_command: String,
    #[serde(default = "default_script_timeout")]
    pub script_timeout_secs: u64,
    #[serde(default = "default_repeat")]
    pub default_repeat_mins: i64,
    #[serde(default = "default_alert_colors")]
    pub alert_colors: ColorSet,
    /// Minimum time between two passes over the active alerts
    #[serde(default = "default_pass_interval")]
    pub pass_interval_secs: u64,
}

fn default_post_timeout() -> u64 {
    5
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_flap_threshold() -> i64 {
    30 * 60
}

fn default_flap_count() -> usize {
    5
}

fn default_validity() -> i64 {
    30
}

fn default_cookie_lifetime() -> i64 {
    86400
}

fn default_alert_colors() -> ColorSet {
    ColorSet::DEFAULT_ALERT
}

fn default_ok_colors() -> ColorSet {
    ColorSet::DEFAULT_OK
}

fn default_conn_test() -> String {
    String::from("conn")
}

fn default_origin() -> String {
    String::from("boardwatchd")
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_max_message_size() -> usize {
    1024 * 1024
}

fn default_checkpoint_interval() -> u64 {
    900
}

fn default_self_status_interval() -> u64 {
    300
}

fn default_message_timeout() -> u64 {
    30
}

fn default_reconnect_backoff() -> u64 {
    60
}

fn default_mail_command() -> String {
    String::from("mail")
}

fn default_script_timeout() -> u64 {
    30
}

fn default_repeat() -> i64 {
    30
}

fn default_pass_interval() -> u64 {
    10
}

fn read_json<T: DeserializeOwned + std::fmt::Debug>(path: &Path) -> anyhow::Result<T> {
    let file_content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read configuration file {}", path.display()))?;
    serde_json::from_str(&file_content)
        .with_context(|| format!("invalid configuration file {}", path.display()))
        .inspect(|config| trace!("loaded config: {config:?}"))
}

pub fn read_config_file(path: &str) -> anyhow::Result<DaemonConfig> {
    read_json(Path::new(path))
}

pub fn read_alerter_config(path: &str) -> anyhow::Result<AlerterConfig> {
    read_json(Path::new(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Color;

    #[test]
    fn test_minimal_daemon_config_uses_defaults() {
        let config: DaemonConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.port, 1984);
        assert_eq!(config.store.flap_count, 5);
        assert_eq!(config.store.default_validity_mins, 30);
        assert_eq!(config.store.ghost_policy, GhostPolicy::Allow);
        assert!(config.store.alert_colors.contains(Color::Purple));
        assert_eq!(config.server.connection_timeout_secs, 30);
        assert!(config.workers.is_empty());
    }

    #[test]
    fn test_worker_config_with_peers() {
        let json = r#"{
            "workers": [{
                "channel": "stachg",
                "routing": "least_loaded",
                "peers": [
                    {"type": "local", "command": "/usr/bin/history", "args": ["--quiet"]},
                    {"type": "network", "address": "10.0.0.2:1984"}
                ]
            }]
        }"#;
        let config: DaemonConfig = serde_json::from_str(json).unwrap();
        let worker = &config.workers[0];
        assert_eq!(worker.channel, ChannelKind::Stachg);
        assert_eq!(worker.routing, Routing::LeastLoaded);
        assert_eq!(worker.message_timeout_secs, 30);
        assert_eq!(
            worker.peers[1],
            PeerSpec::Network {
                address: "10.0.0.2:1984".to_string()
            }
        );
    }

    #[test]
    fn test_read_config_file_reports_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = read_config_file(path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("invalid configuration file"));
    }
}

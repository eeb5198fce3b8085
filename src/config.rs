// Environment configuration loading and validation

//! Configuration loading and validation
//!
//! All settings come from environment variables (optionally seeded from an
//! env file by the CLI). Parsing is strict: malformed MLAG groups, bad
//! durations, unknown selectors or invalid uplink regexes are startup
//! errors, never deferred to the poll loop.

use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Device selector for the switch listing: `role:X`, `tag:Y` or `site:Z`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Filter by device role slug
    Role(String),
    /// Filter by tag slug
    Tag(String),
    /// Filter by site slug
    Site(String),
}

impl Selector {
    /// Query-string parameter pair for the inventory API.
    pub fn as_query(&self) -> (&'static str, &str) {
        match self {
            Selector::Role(v) => ("role", v),
            Selector::Tag(v) => ("tag", v),
            Selector::Site(v) => ("site", v),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Timestamped plain text
    Text,
}

/// Immutable application configuration, constructed once at startup and
/// threaded through the component constructors.
#[derive(Debug, Clone)]
pub struct Config {
    /// Inventory base URL
    pub netbox_url: String,
    /// Inventory API token
    pub netbox_token: String,
    /// Verify TLS certificates on inventory requests
    pub netbox_verify_ssl: bool,
    /// Which devices to treat as access switches
    pub switches_selector: Selector,
    /// Seconds between poll cycles (>= 60)
    pub poll_interval: u64,
    /// Consecutive agreeing cycles required to confirm a move (>= 1)
    pub move_confirm_runs: i64,
    /// SNMP community string
    pub snmp_community: String,
    /// SNMP protocol version; only `2c` is supported
    pub snmp_version: String,
    /// SNMP request timeout in seconds (>= 1)
    pub snmp_timeout: u64,
    /// SNMP re-send attempts per request
    pub snmp_retries: u32,
    /// Explicit uplink port names
    pub uplink_ports: Vec<String>,
    /// Compiled uplink-detection patterns (case-insensitive search)
    pub uplink_patterns: Vec<Regex>,
    /// MLAG groups: group name to member switch names
    pub mlag_groups: HashMap<String, Vec<String>>,
    /// Path to the SQLite state database
    pub state_db_path: PathBuf,
    /// Minimum wall time between repeat alerts on the same endpoint
    pub remind_after: Duration,
    /// Tag applied to drifting devices
    pub move_tag_name: String,
    /// Log level filter
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let netbox_url = require_env("NETBOX_URL")?;
        let netbox_token = require_env("NETBOX_TOKEN")?;

        let config = Self {
            netbox_url: netbox_url.trim_end_matches('/').to_string(),
            netbox_token,
            netbox_verify_ssl: parse_bool(&env_or("NETBOX_VERIFY_SSL", "true"))
                .context("Invalid NETBOX_VERIFY_SSL")?,
            switches_selector: parse_selector(&env_or("SWITCHES_SELECTOR", "role:switch"))?,
            poll_interval: env_or("POLL_INTERVAL", "300")
                .parse()
                .context("Invalid POLL_INTERVAL")?,
            move_confirm_runs: env_or("MOVE_CONFIRM_RUNS", "2")
                .parse()
                .context("Invalid MOVE_CONFIRM_RUNS")?,
            snmp_community: env_or("SNMP_COMMUNITY", "public"),
            snmp_version: env_or("SNMP_VERSION", "2c"),
            snmp_timeout: env_or("SNMP_TIMEOUT", "5")
                .parse()
                .context("Invalid SNMP_TIMEOUT")?,
            snmp_retries: env_or("SNMP_RETRIES", "2")
                .parse()
                .context("Invalid SNMP_RETRIES")?,
            uplink_ports: split_csv(&env_or("UPLINK_PORTS", "")),
            uplink_patterns: compile_patterns(&env_or("UPLINK_PATTERNS", "uplink,trunk,lag,po"))?,
            mlag_groups: parse_mlag_groups(&env_or("MLAG_GROUPS", "{}"))?,
            state_db_path: PathBuf::from(env_or("STATE_DB_PATH", "./state.db")),
            remind_after: parse_duration(&env_or("REMIND_AFTER", "6h"))?,
            move_tag_name: env_or("MOVE_TAG_NAME", "ipmi-moved"),
            log_level: env_or("LOG_LEVEL", "INFO"),
            log_format: parse_log_format(&env_or("LOG_FORMAT", "json"))?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate value ranges and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.netbox_url.is_empty() {
            anyhow::bail!("NETBOX_URL cannot be empty");
        }
        if self.netbox_token.is_empty() {
            anyhow::bail!("NETBOX_TOKEN cannot be empty");
        }
        if self.poll_interval < 60 {
            anyhow::bail!("POLL_INTERVAL must be >= 60, got {}", self.poll_interval);
        }
        if self.move_confirm_runs < 1 {
            anyhow::bail!(
                "MOVE_CONFIRM_RUNS must be >= 1, got {}",
                self.move_confirm_runs
            );
        }
        if self.snmp_version != "2c" {
            anyhow::bail!(
                "SNMP_VERSION '{}' is not supported (only 2c)",
                self.snmp_version
            );
        }
        if self.snmp_timeout < 1 {
            anyhow::bail!("SNMP_TIMEOUT must be >= 1, got {}", self.snmp_timeout);
        }
        if self.move_tag_name.is_empty() {
            anyhow::bail!("MOVE_TAG_NAME cannot be empty");
        }
        Ok(())
    }

    /// SNMP timeout as a `Duration`.
    pub fn snmp_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.snmp_timeout)
    }
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| anyhow::anyhow!("{} is required", name))
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Parse a boolean from the usual environment spellings.
pub fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => anyhow::bail!("Invalid boolean value: {other}"),
    }
}

/// Parse a duration of the form `\d+[smhd]`, e.g. `30s`, `15m`, `6h`, `2d`.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let v = value.trim().to_lowercase();
    let bad = || anyhow::anyhow!("Invalid duration format: {value}. Use e.g. '6h', '30m', '1d'");
    let unit = v.chars().last().ok_or_else(bad)?;
    let amount: u64 = v[..v.len() - unit.len_utf8()].parse().map_err(|_| bad())?;
    let secs = match unit {
        's' => amount,
        'm' => amount * 60,
        'h' => amount * 3600,
        'd' => amount * 86400,
        _ => return Err(bad()),
    };
    Ok(Duration::from_secs(secs))
}

/// Parse a selector string like `role:switch`, `tag:monitored` or `site:dc1`.
pub fn parse_selector(selector: &str) -> Result<Selector> {
    let (key, value) = selector
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("Invalid selector: {selector}. Use 'role:X', 'tag:Y' or 'site:Z'"))?;
    let value = value.trim().to_string();
    if value.is_empty() {
        anyhow::bail!("Invalid selector: {selector}. Empty value");
    }
    match key.trim().to_lowercase().as_str() {
        "role" => Ok(Selector::Role(value)),
        "tag" => Ok(Selector::Tag(value)),
        "site" => Ok(Selector::Site(value)),
        other => anyhow::bail!("Unknown selector type: {other}. Use 'role', 'tag' or 'site'"),
    }
}

/// Split a comma-separated list, dropping empty items.
pub fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn compile_patterns(value: &str) -> Result<Vec<Regex>> {
    split_csv(value)
        .iter()
        .map(|p| {
            regex::RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("Invalid uplink pattern: {p}"))
        })
        .collect()
}

/// Parse the MLAG group mapping from its JSON form
/// (`{"group": ["switch1", "switch2"]}`).
pub fn parse_mlag_groups(value: &str) -> Result<HashMap<String, Vec<String>>> {
    serde_json::from_str(value).context("Invalid JSON for MLAG_GROUPS")
}

fn parse_log_format(value: &str) -> Result<LogFormat> {
    match value.trim().to_lowercase().as_str() {
        "json" => Ok(LogFormat::Json),
        "text" => Ok(LogFormat::Text),
        other => anyhow::bail!("Invalid LOG_FORMAT: {other}. Use 'json' or 'text'"),
    }
}

/// Load `KEY=VALUE` lines from an env file into the process environment.
/// Existing variables win; `#` lines and blanks are skipped.
pub fn load_env_file(path: &std::path::Path) -> Result<()> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read env file {}", path.display()))?;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if !key.is_empty() && std::env::var_os(key).is_none() {
                std::env::set_var(key, value.trim().trim_matches('"'));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            netbox_url: "https://netbox.example.com".to_string(),
            netbox_token: "test-token".to_string(),
            netbox_verify_ssl: true,
            switches_selector: Selector::Role("switch".to_string()),
            poll_interval: 300,
            move_confirm_runs: 2,
            snmp_community: "public".to_string(),
            snmp_version: "2c".to_string(),
            snmp_timeout: 5,
            snmp_retries: 2,
            uplink_ports: vec![],
            uplink_patterns: vec![],
            mlag_groups: HashMap::new(),
            state_db_path: PathBuf::from("./state.db"),
            remind_after: Duration::from_secs(6 * 3600),
            move_tag_name: "ipmi-moved".to_string(),
            log_level: "INFO".to_string(),
            log_format: LogFormat::Json,
        }
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("6h").unwrap(), Duration::from_secs(21600));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172800));
        assert_eq!(parse_duration(" 1H ").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("1.5h").is_err());
    }

    #[test]
    fn test_parse_selector() {
        assert_eq!(
            parse_selector("role:server").unwrap(),
            Selector::Role("server".to_string())
        );
        assert_eq!(
            parse_selector("tag:monitored").unwrap(),
            Selector::Tag("monitored".to_string())
        );
        assert_eq!(
            parse_selector("site:dc1").unwrap(),
            Selector::Site("dc1".to_string())
        );
    }

    #[test]
    fn test_parse_selector_invalid() {
        assert!(parse_selector("invalid").is_err());
        assert!(parse_selector("device:x").is_err());
        assert!(parse_selector("role:").is_err());
    }

    #[test]
    fn test_selector_as_query() {
        assert_eq!(
            Selector::Role("switch".to_string()).as_query(),
            ("role", "switch")
        );
        assert_eq!(Selector::Tag("t".to_string()).as_query(), ("tag", "t"));
    }

    #[test]
    fn test_split_csv() {
        assert_eq!(
            split_csv("Eth49, Eth50, Eth51"),
            vec!["Eth49", "Eth50", "Eth51"]
        );
        assert!(split_csv("").is_empty());
        assert_eq!(split_csv("a,,b,"), vec!["a", "b"]);
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true").unwrap());
        assert!(parse_bool("1").unwrap());
        assert!(!parse_bool("false").unwrap());
        assert!(!parse_bool("0").unwrap());
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn test_parse_mlag_groups() {
        let groups = parse_mlag_groups(r#"{"pair1": ["sw1", "sw2"]}"#).unwrap();
        assert_eq!(groups["pair1"], vec!["sw1", "sw2"]);
        assert!(parse_mlag_groups("{}").unwrap().is_empty());
        assert!(parse_mlag_groups("not json").is_err());
        assert!(parse_mlag_groups(r#"{"pair1": "sw1"}"#).is_err());
    }

    #[test]
    fn test_compile_patterns() {
        let patterns = compile_patterns("uplink,trunk,lag,po").unwrap();
        assert_eq!(patterns.len(), 4);
        assert!(patterns[0].is_match("Uplink1"));
        assert!(patterns[3].is_match("Po10"));
        assert!(compile_patterns("(unclosed").is_err());
    }

    #[test]
    fn test_validate_bounds() {
        assert!(base_config().validate().is_ok());

        let mut config = base_config();
        config.poll_interval = 30;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.move_confirm_runs = 0;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.snmp_version = "3".to_string();
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.snmp_timeout = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_log_format() {
        assert_eq!(parse_log_format("json").unwrap(), LogFormat::Json);
        assert_eq!(parse_log_format("TEXT").unwrap(), LogFormat::Text);
        assert!(parse_log_format("xml").is_err());
    }
}

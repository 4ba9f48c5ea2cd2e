//! Configuration loading and validation.
//!
//! The configuration is a YAML document under the top-level `warden` key.
//! Boolean knobs are tri-valued: unset means "use the default", which keeps
//! a bare config useful. Durations are strings like `30s`, `15m`, `1h`, or
//! `7d`.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::IpNet;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

/// Reserved name for the implicit group, resolver, and consumer.
pub const DEFAULT_NAME: &str = "default";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct Root {
    warden: Config,
}

/// Which rule store backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    Sqlite,
}

/// Main configuration for the warden DNS proxy.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Base directory for sessions, cached lists, and long-term data.
    #[serde(default = "default_home")]
    pub home: PathBuf,

    #[serde(default)]
    pub storage: StorageKind,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub resolvers: Vec<ResolverConfig>,

    #[serde(default)]
    pub lists: Vec<ListConfig>,

    #[serde(default)]
    pub groups: Vec<GroupConfig>,

    #[serde(default)]
    pub consumers: Vec<ConsumerConfig>,

    #[serde(default)]
    pub querylog: QueryLogConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Default for interfaces that do not set their own `tcp`.
    pub tcp: Option<bool>,
    /// Default for interfaces that do not set their own `udp`.
    pub udp: Option<bool>,
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceConfig {
    pub ip: IpAddr,
    pub port: Option<u16>,
    pub tcp: Option<bool>,
    pub udp: Option<bool>,
}

impl InterfaceConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(53)
    }

    pub fn tcp(&self, network: &NetworkConfig) -> bool {
        self.tcp.or(network.tcp).unwrap_or(true)
    }

    pub fn udp(&self, network: &NetworkConfig) -> bool {
        self.udp.or(network.udp).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResolverConfig {
    pub name: String,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub search: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListConfig {
    #[serde(default)]
    pub name: String,
    /// "allow" or "block"; anything else blocks.
    #[serde(rename = "type", default)]
    pub list_type: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub src: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default)]
    pub inherit: Vec<String>,
    #[serde(default)]
    pub resolvers: Vec<String>,
    #[serde(default)]
    pub lists: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeConfig {
    pub start: IpAddr,
    pub end: IpAddr,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchConfig {
    pub ip: Option<IpAddr>,
    pub range: Option<RangeConfig>,
    pub net: Option<IpNet>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsumerConfig {
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub matches: Vec<MatchConfig>,
    pub block: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryLogConfig {
    pub enabled: Option<bool>,
    pub persist: Option<bool>,
    pub stdout: Option<bool>,
    pub file: Option<PathBuf>,
    pub duration: Option<String>,
}

impl QueryLogConfig {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn persist(&self) -> bool {
        self.persist.unwrap_or(true)
    }

    pub fn stdout(&self) -> bool {
        self.stdout.unwrap_or(true)
    }

    /// How long query log rows are kept.
    pub fn duration(&self) -> Duration {
        duration_or(self.duration.as_deref(), Duration::from_secs(24 * 60 * 60))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    pub enabled: Option<bool>,
    pub persist: Option<bool>,
    pub interval: Option<String>,
    pub duration: Option<String>,
    pub detailed: Option<bool>,
}

impl MetricsConfig {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn persist(&self) -> bool {
        self.persist.unwrap_or(true)
    }

    /// How often a metrics snapshot row is written.
    pub fn interval(&self) -> Duration {
        duration_or(self.interval.as_deref(), Duration::from_secs(15))
    }

    /// How long metrics rows are kept.
    pub fn duration(&self) -> Duration {
        duration_or(self.duration.as_deref(), Duration::from_secs(7 * 24 * 60 * 60))
    }

    pub fn detailed(&self) -> bool {
        self.detailed.unwrap_or(false)
    }
}

fn default_home() -> PathBuf {
    PathBuf::from("/var/lib/warden")
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(content: &str) -> Result<Self> {
        let root: Root = serde_yaml::from_str(content).map_err(ConfigError::Parse)?;
        let config = root.warden;
        config.validate()?;
        Ok(config)
    }

    /// Where session-scoped state lives; discarded on the next start.
    pub fn session_root(&self) -> PathBuf {
        self.home.join("sessions")
    }

    /// Where downloaded remote lists are kept.
    pub fn cache_root(&self) -> PathBuf {
        self.home.join("cache")
    }

    /// Where long-term data (metrics, query log) lives.
    pub fn data_root(&self) -> PathBuf {
        self.home.join("data")
    }

    /// Validate cross references and parseable fields.
    fn validate(&self) -> Result<()> {
        let known = |names: &[&str], name: &str| {
            name == DEFAULT_NAME || names.contains(&name)
        };

        let group_names: Vec<&str> = self.groups.iter().map(|g| g.name.as_str()).collect();
        let list_names: Vec<&str> = self.lists.iter().map(|l| l.name.as_str()).collect();
        let resolver_names: Vec<&str> =
            self.resolvers.iter().map(|r| r.name.as_str()).collect();

        for list in &self.lists {
            if list.src.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "list '{}' has no src",
                    list.name
                ))
                .into());
            }
        }

        for group in &self.groups {
            for inherited in &group.inherit {
                if !known(&group_names, inherited) {
                    return Err(unknown("group", inherited, &group.name));
                }
            }
            for list in &group.lists {
                if !known(&list_names, list) {
                    return Err(unknown("list", list, &group.name));
                }
            }
            for resolver in &group.resolvers {
                if !known(&resolver_names, resolver) {
                    return Err(unknown("resolver", resolver, &group.name));
                }
            }
        }

        for consumer in &self.consumers {
            for group in &consumer.groups {
                if !known(&group_names, group) {
                    return Err(unknown("group", group, &consumer.name));
                }
            }
            for rule in &consumer.matches {
                if rule.ip.is_none() && rule.range.is_none() && rule.net.is_none() {
                    return Err(ConfigError::Validation(format!(
                        "consumer '{}' has an empty match rule",
                        consumer.name
                    ))
                    .into());
                }
            }
        }

        self.check_group_cycles()?;

        for (field, text) in [
            ("querylog.duration", self.querylog.duration.as_deref()),
            ("metrics.interval", self.metrics.interval.as_deref()),
            ("metrics.duration", self.metrics.duration.as_deref()),
        ] {
            if let Some(text) = text {
                parse_duration(text).map_err(|()| {
                    ConfigError::Validation(format!("{field}: bad duration '{text}'"))
                })?;
            }
        }

        Ok(())
    }

    fn check_group_cycles(&self) -> Result<()> {
        fn visit<'a>(
            name: &'a str,
            groups: &'a [GroupConfig],
            path: &mut Vec<&'a str>,
        ) -> std::result::Result<(), ConfigError> {
            if path.contains(&name) {
                return Err(ConfigError::GroupCycle(name.to_string()));
            }
            let Some(group) = groups.iter().find(|g| g.name == name) else {
                return Ok(());
            };
            path.push(name);
            for inherited in &group.inherit {
                visit(inherited, groups, path)?;
            }
            path.pop();
            Ok(())
        }

        for group in &self.groups {
            visit(&group.name, &self.groups, &mut Vec::new())?;
        }
        Ok(())
    }
}

fn unknown(kind: &'static str, name: &str, referrer: &str) -> crate::error::Error {
    ConfigError::UnknownReference {
        kind,
        name: name.to_string(),
        referrer: referrer.to_string(),
    }
    .into()
}

fn duration_or(text: Option<&str>, fallback: Duration) -> Duration {
    text.and_then(|t| parse_duration(t).ok()).unwrap_or(fallback)
}

/// Parse durations of the shape `<number><unit>` with units `s`, `m`, `h`,
/// and `d`. A bare number means seconds.
pub fn parse_duration(text: &str) -> std::result::Result<Duration, ()> {
    let text = text.trim();
    if text.is_empty() {
        return Err(());
    }

    let (value, unit) = match text.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => (&text[..idx], &text[idx..]),
        None => (text, "s"),
    };
    let value: u64 = value.parse().map_err(|_| ())?;

    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 60 * 60,
        "d" => value * 24 * 60 * 60,
        _ => return Err(()),
    };
    Ok(Duration::from_secs(seconds))
}

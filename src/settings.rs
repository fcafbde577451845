use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::de::{self, Deserializer, Unexpected, Visitor};
use serde::Deserialize;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::types::DomainName;

/// Where the upstream nameserver is taken from if none is configured.
pub const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

pub const DEFAULT_BIND_ADDRESS: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 53);

pub const DEFAULT_AUTHORITATIVE_SUFFIX: &str = "cluster.local.";

pub const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 5000;

pub const DEFAULT_ANSWER_TTL: u32 = 30;

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct Settings {
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Names ending in this suffix are answered from the Name Table
    /// and never forwarded.
    #[serde(
        default = "default_authoritative_suffix",
        deserialize_with = "deserialize_domain"
    )]
    pub authoritative_suffix: DomainName,

    /// If unset, the first nameserver in `/etc/resolv.conf`.
    #[serde(default, deserialize_with = "deserialize_nameserver")]
    pub upstream_nameserver: Option<SocketAddr>,

    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,

    #[serde(default = "default_answer_ttl")]
    pub answer_ttl: u32,

    #[serde(default)]
    pub records: Vec<StaticRecord>,

    #[serde(default)]
    pub hosts_files: Vec<PathBuf>,

    #[serde(default)]
    pub reload_interval_secs: Option<u64>,

    #[serde(default)]
    pub metrics_address: Option<SocketAddr>,
}

/// A name with a fixed address, configured rather than read from a
/// hosts file.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct StaticRecord {
    #[serde(deserialize_with = "deserialize_domain")]
    pub name: DomainName,
    pub a: Ipv4Addr,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            authoritative_suffix: default_authoritative_suffix(),
            upstream_nameserver: None,
            upstream_timeout_ms: DEFAULT_UPSTREAM_TIMEOUT_MS,
            answer_ttl: DEFAULT_ANSWER_TTL,
            records: Vec::new(),
            hosts_files: Vec::new(),
            reload_interval_secs: None,
            metrics_address: None,
        }
    }
}

impl Settings {
    /// Load settings from an optional YAML file, overlaid with
    /// `CLUSTERDNS_*` environment variables.
    ///
    /// # Errors
    ///
    /// If the file cannot be read or a value has the wrong type.
    pub fn new(filename: Option<&Path>) -> Result<Self, Error> {
        Self::from_sources(filename, environment())
    }

    fn from_sources(filename: Option<&Path>, environment: Environment) -> Result<Self, Error> {
        let mut builder = Config::builder();
        if let Some(path) = filename {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }
        builder
            .add_source(environment)
            .build()?
            .try_deserialize()
            .map_err(Error::from)
    }

    /// # Errors
    ///
    /// If a value is out of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.upstream_timeout_ms == 0 {
            return Err(Error::ZeroTimeout);
        }
        if self.reload_interval_secs == Some(0) {
            return Err(Error::ZeroReloadInterval);
        }
        Ok(())
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn reload_interval(&self) -> Option<Duration> {
        self.reload_interval_secs.map(Duration::from_secs)
    }

    /// The configured upstream, or else the first nameserver in
    /// `resolv_conf`.
    ///
    /// # Errors
    ///
    /// If nothing is configured and `resolv_conf` cannot be read or
    /// names no usable nameserver.
    pub fn upstream_nameserver_or_resolv_conf(
        &self,
        resolv_conf: &Path,
    ) -> Result<SocketAddr, Error> {
        if let Some(address) = self.upstream_nameserver {
            return Ok(address);
        }

        let data = std::fs::read_to_string(resolv_conf).map_err(|source| Error::ResolvConf {
            path: resolv_conf.to_path_buf(),
            source,
        })?;
        first_nameserver(&data).ok_or_else(|| Error::NoUpstream {
            path: resolv_conf.to_path_buf(),
        })
    }
}

/// The first usable `nameserver` line of a resolv.conf.  Scoped IPv6
/// addresses (`fe80::1%eth0`) are skipped.
pub fn first_nameserver(resolv_conf: &str) -> Option<SocketAddr> {
    resolv_conf
        .lines()
        .filter_map(|line| line.trim().strip_prefix("nameserver"))
        .filter_map(|rest| rest.split_whitespace().next())
        .find_map(parse_nameserver)
}

/// Parse `address` or `address:port`, with port 53 if none is given.
/// IPv6 addresses with a port use the bracketed form.
pub fn parse_nameserver(s: &str) -> Option<SocketAddr> {
    if let Ok(ip) = s.parse::<IpAddr>() {
        Some(SocketAddr::new(ip, 53))
    } else {
        s.parse::<SocketAddr>().ok()
    }
}

/// Errors that can arise while loading settings.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("upstream_timeout_ms must be greater than zero")]
    ZeroTimeout,
    #[error("reload_interval_secs must be greater than zero")]
    ZeroReloadInterval,
    #[error("could not read {path:?}")]
    ResolvConf {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no upstream nameserver configured, and none found in {path:?}")]
    NoUpstream { path: PathBuf },
}

fn default_bind_address() -> SocketAddr {
    DEFAULT_BIND_ADDRESS
}

fn default_authoritative_suffix() -> DomainName {
    DomainName::from_dotted_string(DEFAULT_AUTHORITATIVE_SUFFIX)
        .unwrap_or_else(DomainName::root_domain)
}

fn default_upstream_timeout_ms() -> u64 {
    DEFAULT_UPSTREAM_TIMEOUT_MS
}

fn default_answer_ttl() -> u32 {
    DEFAULT_ANSWER_TTL
}

struct DomainNameVisitor;

impl Visitor<'_> for DomainNameVisitor {
    type Value = DomainName;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a domain name")
    }

    fn visit_str<E>(self, v: &str) -> Result<DomainName, E>
    where
        E: de::Error,
    {
        v.parse()
            .map_err(|_| de::Error::invalid_value(Unexpected::Str(v), &self))
    }
}

fn deserialize_domain<'de, D>(deserializer: D) -> Result<DomainName, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_str(DomainNameVisitor)
}

struct NameserverVisitor;

impl Visitor<'_> for NameserverVisitor {
    type Value = Option<SocketAddr>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an IP address, optionally with a port")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match parse_nameserver(v) {
            Some(address) => Ok(Some(address)),
            None => Err(de::Error::invalid_value(Unexpected::Str(v), &self)),
        }
    }

    fn visit_none<E>(self) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(None)
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(None)
    }
}

fn deserialize_nameserver<'de, D>(deserializer: D) -> Result<Option<SocketAddr>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(NameserverVisitor)
}

/// `CLUSTERDNS_*` variables.  `CLUSTERDNS_HOSTS_FILES` is a
/// comma-separated list.
fn environment() -> Environment {
    Environment::with_prefix("CLUSTERDNS")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("hosts_files")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::protocol::types::test_util::*;

    #[test]
    fn default_suffix_parses() {
        assert_eq!(
            domain(DEFAULT_AUTHORITATIVE_SUFFIX),
            Settings::default().authoritative_suffix
        );
    }

    #[test]
    fn first_nameserver_skips_comments_and_scoped() {
        let resolv_conf = "# generated\n\
                           search default.svc.cluster.local\n\
                           nameserver fe80::1%eth0\n\
                           nameserver 10.0.0.53\n\
                           nameserver 8.8.8.8\n\
                           options ndots:5\n";

        assert_eq!(
            Some("10.0.0.53:53".parse().unwrap()),
            first_nameserver(resolv_conf)
        );
    }

    #[test]
    fn first_nameserver_none() {
        assert_eq!(None, first_nameserver("search local\n"));
    }

    #[test]
    fn parse_nameserver_forms() {
        assert_eq!(Some("1.1.1.1:53".parse().unwrap()), parse_nameserver("1.1.1.1"));
        assert_eq!(Some("1.1.1.1:5353".parse().unwrap()), parse_nameserver("1.1.1.1:5353"));
        assert_eq!(Some("[::1]:53".parse().unwrap()), parse_nameserver("::1"));
        assert_eq!(Some("[::1]:5353".parse().unwrap()), parse_nameserver("[::1]:5353"));
        assert_eq!(None, parse_nameserver("dns.example.com"));
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let settings = Settings {
            upstream_timeout_ms: 0,
            ..Settings::default()
        };
        assert!(matches!(settings.validate(), Err(Error::ZeroTimeout)));
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn configured_upstream_wins_over_resolv_conf() {
        let settings = Settings {
            upstream_nameserver: Some("9.9.9.9:53".parse().unwrap()),
            ..Settings::default()
        };
        assert_eq!(
            "9.9.9.9:53".parse::<SocketAddr>().unwrap(),
            settings
                .upstream_nameserver_or_resolv_conf(Path::new("/nonexistent/resolv.conf"))
                .unwrap()
        );
        assert!(matches!(
            Settings::default()
                .upstream_nameserver_or_resolv_conf(Path::new("/nonexistent/resolv.conf")),
            Err(Error::ResolvConf { .. })
        ));
    }

    #[test]
    fn loads_yaml_file() {
        let path = std::env::temp_dir()
            .join(format!("clusterdns-settings-{}.yaml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            "bind_address: 127.0.0.1:5300\n\
             authoritative_suffix: Default.Local\n\
             upstream_nameserver: 10.0.0.53\n\
             answer_ttl: 5\n\
             records:\n  \
               - name: kubernetes.default.local\n    \
                 a: 10.96.0.1\n\
             hosts_files:\n  \
               - /etc/hosts\n"
        )
        .unwrap();

        let settings = Settings::new(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!("127.0.0.1:5300".parse::<SocketAddr>().unwrap(), settings.bind_address);
        assert_eq!(domain("default.local."), settings.authoritative_suffix);
        assert_eq!(Some("10.0.0.53:53".parse().unwrap()), settings.upstream_nameserver);
        assert_eq!(DEFAULT_UPSTREAM_TIMEOUT_MS, settings.upstream_timeout_ms);
        assert_eq!(5, settings.answer_ttl);
        assert_eq!(
            vec![StaticRecord {
                name: domain("kubernetes.default.local."),
                a: Ipv4Addr::new(10, 96, 0, 1),
            }],
            settings.records
        );
        assert_eq!(vec![PathBuf::from("/etc/hosts")], settings.hosts_files);
        assert_eq!(None, settings.metrics_address);
    }

    #[test]
    fn environment_overrides_file() {
        let path = std::env::temp_dir()
            .join(format!("clusterdns-settings-env-{}.yaml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            "authoritative_suffix: file.local\n\
             answer_ttl: 5\n"
        )
        .unwrap();

        let variables = [
            ("CLUSTERDNS_AUTHORITATIVE_SUFFIX", "default.local"),
            ("CLUSTERDNS_UPSTREAM_NAMESERVER", "10.0.0.53"),
            ("CLUSTERDNS_HOSTS_FILES", "a,b"),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();

        let settings =
            Settings::from_sources(Some(&path), environment().source(Some(variables))).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(domain("default.local."), settings.authoritative_suffix);
        assert_eq!(Some("10.0.0.53:53".parse().unwrap()), settings.upstream_nameserver);
        assert_eq!(vec![PathBuf::from("a"), PathBuf::from("b")], settings.hosts_files);
        assert_eq!(5, settings.answer_ttl);
    }
}

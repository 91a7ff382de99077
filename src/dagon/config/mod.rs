//! Daemon configuration, loaded from a TOML file.

use std::path::Path;

use serde::Deserialize;

use crate::dagon::error::*;
use crate::dagon::wire;

/// Identity of the local node.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub sid: String,
    #[serde(default = "default_info")]
    pub info: String,
    #[serde(default)]
    pub hub: bool,
    #[serde(default)]
    pub hidden: bool,
}

fn default_info() -> String {
    "IRCers United".to_string()
}

/// A listening socket.
#[derive(Debug, Clone, Deserialize)]
pub struct Listen {
    #[serde(default = "default_listen_host")]
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub ssl: bool,
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

/// A peer server we may link with.
#[derive(Debug, Clone, Deserialize)]
pub struct Connect {
    /// Pattern the offered server name must match.
    pub name: String,
    /// Pattern the peer's address or hostname must match.
    pub host: String,
    /// Password the peer must present to us.
    pub accept_password: String,
    /// Password we present when connecting out.
    #[serde(default)]
    pub send_password: String,
    #[serde(default)]
    pub port: u16,
    /// The accept password is stored as a hex SHA-256 digest.
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default = "default_true")]
    pub topicburst: bool,
    #[serde(default)]
    pub autoconnect: bool,
    #[serde(default)]
    pub ssl: bool,
    /// Masks of servers this peer may introduce behind itself.
    #[serde(default)]
    pub hub_mask: Vec<String>,
    /// Masks of servers this peer may never introduce.
    #[serde(default)]
    pub leaf_mask: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// A persistent address ban applied at accept time.
#[derive(Debug, Clone, Deserialize)]
pub struct Ban {
    /// Address mask, matched against the peer address text.
    pub mask: String,
    #[serde(default = "default_ban_reason")]
    pub reason: String,
    /// Exemption rule: matching addresses bypass bans instead.
    #[serde(default)]
    pub exempt: bool,
}

fn default_ban_reason() -> String {
    "You have been banned.".to_string()
}

/// Helper worker pool settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Helper {
    /// Path of the worker executable.
    pub path: String,
    #[serde(default = "default_helper_count")]
    pub count: usize,
    #[serde(default)]
    pub ssl_cert: String,
    #[serde(default)]
    pub ssl_private_key: String,
    #[serde(default)]
    pub ssl_dh_params: String,
    #[serde(default = "default_compression_level")]
    pub compression_level: u8,
}

fn default_helper_count() -> usize {
    2
}

fn default_compression_level() -> u8 {
    6
}

/// Tunables with conventional defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_connections: usize,
    /// Seconds without traffic before a PING probe is sent; twice this
    /// without traffic drops the link.
    pub ping_time: u64,
    /// Seconds an unregistered connection may linger.
    pub registration_timeout: u64,
    pub throttle_count: usize,
    pub throttle_duration: u64,
    pub reject_count: usize,
    pub reject_duration: u64,
    pub burst_away: bool,
    pub burst_topicwho: bool,
    pub warn_no_entry: bool,
    /// Receive buffer size, also the `Z` injection bound.
    pub readbuf_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            ping_time: 120,
            registration_timeout: 30,
            throttle_count: 4,
            throttle_duration: 60,
            reject_count: 3,
            reject_duration: 120,
            burst_away: true,
            burst_topicwho: true,
            warn_no_entry: true,
            readbuf_size: 16384,
        }
    }
}

/// Logging settings, handed to the logger builder as TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// The whole daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerInfo,
    #[serde(default)]
    pub listen: Vec<Listen>,
    #[serde(default)]
    pub connect: Vec<Connect>,
    #[serde(default)]
    pub ban: Vec<Ban>,
    pub helper: Option<Helper>,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conf: Config =
            serdeconv::from_toml_file(path.as_ref()).with_kind(ErrorKind::Config)?;
        conf.validate()?;
        Ok(conf)
    }

    /// Loads a configuration from an in-memory TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let conf: Config = serdeconv::from_toml_str(s).with_kind(ErrorKind::Config)?;
        conf.validate()?;
        Ok(conf)
    }

    fn validate(&self) -> Result<()> {
        if !wire::valid_server_name(&self.server.name) {
            return Err(Error::detailed(ErrorKind::Config, "Invalid server name"));
        }
        if !wire::valid_sid(&self.server.sid) {
            return Err(Error::detailed(ErrorKind::Config, "Invalid server id"));
        }
        for c in self.connect.iter() {
            if c.accept_password.is_empty() {
                return Err(Error::detailed(
                    ErrorKind::Config,
                    "Connect block without a password",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[server]
name = "irc.a.net"
sid = "42A"
info = "A Network"
hub = true

[[listen]]
port = 6667

[[listen]]
port = 6697
ssl = true

[[connect]]
name = "irc.b.net"
host = "*"
accept_password = "s3cret"
send_password = "s3cret"
compressed = true
hub_mask = ["*"]
leaf_mask = ["*.edu"]

[[ban]]
mask = "192.0.2.*"
reason = "spam source"

[limits]
ping_time = 60
"#;

    #[test]
    fn test_load_sample() {
        let conf = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(conf.server.name, "irc.a.net");
        assert_eq!(conf.server.sid, "42A");
        assert!(conf.server.hub);
        assert_eq!(conf.listen.len(), 2);
        assert!(conf.listen[1].ssl);
        assert_eq!(conf.connect[0].leaf_mask, vec!["*.edu"]);
        assert_eq!(conf.limits.ping_time, 60);
        // defaults fill the rest
        assert_eq!(conf.limits.registration_timeout, 30);
        assert!(conf.helper.is_none());
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(SAMPLE.as_bytes()).unwrap();
        let conf = Config::load(f.path()).unwrap();
        assert_eq!(conf.server.sid, "42A");
    }

    #[test]
    fn test_reject_bad_identity() {
        let bad = SAMPLE.replace("42A", "A42");
        assert!(Config::from_toml_str(&bad).is_err());
        let bad = SAMPLE.replace("irc.a.net", "ircanet");
        assert!(Config::from_toml_str(&bad).is_err());
    }
}

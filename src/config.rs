//! Configuration for the MQTT relay
//!
//! Settings come from two places, applied in this order:
//!
//! 1. an optional TOML file (`[mqtt]` and `[relay]` sections)
//! 2. the output option string, `[mqtt[s]://]host[:port][,key[=value]]...`
//!
//! The option string wins where both set a value. Everything is validated
//! before a connection is attempted; any error here is fatal at startup.

use crate::protocol::{TemplateError, TopicTemplate};
use crate::routing::TopicSet;
use crate::transport::mqtt::{
    BrokerAddress, ConnectionOptions, Credentials, TlsOptions, TLS_NO_VERIFY,
};
use crc::{Crc, CRC_16_IBM_3740};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;
use url::{Host, Url};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Default topic suffixes below `rtl_433/<hostname>`
pub const DEVICES_PATH: &str = "devices[/type][/model][/subtype][/channel][/id]";
pub const EVENTS_PATH: &str = "events";
pub const STATES_PATH: &str = "states";

const CLIENT_ID_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

const USECHANNEL_HINT: &str = "\"usechannel=...\" has been removed. Use a topic format string:
for \"afterid\"   use e.g. \"devices=rtl_433/[hostname]/devices[/type][/model][/subtype][/id][/channel]\"
for \"beforeid\"  use e.g. \"devices=rtl_433/[hostname]/devices[/type][/model][/subtype][/channel][/id]\"
for \"replaceid\" use e.g. \"devices=rtl_433/[hostname]/devices[/type][/model][/subtype][/channel]\"
for \"no\"        use e.g. \"devices=rtl_433/[hostname]/devices[/type][/model][/subtype][/id]\"";

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlRender(#[from] toml::ser::Error),
    #[error("Invalid broker address \"{0}\"")]
    InvalidAddress(String),
    #[error("Invalid key \"{0}\" option")]
    InvalidOption(String),
    #[error("Invalid value for \"{key}\": {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("Option \"{0}\" is not supported")]
    Unsupported(String),
    #[error("{0}")]
    RemovedOption(&'static str),
    #[error("Invalid topic: {0}")]
    Template(#[from] TemplateError),
    #[error("Cannot determine hostname: {0}")]
    Hostname(String),
}

/// `[mqtt]` section, also the target of the output option string
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    /// `mqtt://host[:port]` or `mqtts://host[:port]`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing)]
    pub pass: Option<String>,
    pub retain: bool,
    pub qos: u8,
    /// Topic or template; an empty string selects the default path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devices: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub states: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_key: Option<PathBuf>,
    /// CA bundle path, `*` to accept any certificate. Setting it enables TLS.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_ca_cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_server_name: Option<String>,
}

/// `[relay]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelaySection {
    /// Overrides the local hostname in topics and the client id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Identifies the receiver device, folded into the client id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_hint: Option<String>,
}

/// Complete relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub mqtt: MqttConfig,
    pub relay: RelaySection,
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from an output option string alone
    pub fn from_output(output: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_output(output)?;
        Ok(config)
    }

    /// Apply an output option string on top of the current settings
    pub fn apply_output(&mut self, output: &str) -> Result<(), ConfigError> {
        self.mqtt.apply_output(output)?;
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.qos > 2 {
            return Err(ConfigError::InvalidValue {
                key: "qos".to_string(),
                reason: format!("{} is not 0, 1 or 2", self.mqtt.qos),
            });
        }
        if let Some(url) = &self.mqtt.url {
            parse_broker_url(url)?;
        }
        for (key, topic) in self.mqtt.topic_options() {
            if let Some(topic) = topic.filter(|t| !t.is_empty()) {
                TopicTemplate::parse(topic).map_err(|e| {
                    warn!("Invalid {} topic \"{}\"", key, topic);
                    ConfigError::Template(e)
                })?;
            }
        }
        Ok(())
    }

    /// Hostname used in topics and the client id, without the domain part
    pub fn hostname(&self) -> Result<String, ConfigError> {
        match &self.relay.hostname {
            Some(hostname) => Ok(short_hostname(hostname)),
            None => local_hostname(),
        }
    }

    pub fn client_id(&self, hostname: &str) -> String {
        client_id(hostname, self.relay.device_hint.as_deref())
    }

    /// Templates for the three channels.
    ///
    /// When none of devices/events/states is configured, all three are
    /// enabled with their default paths below `rtl_433/<hostname>`.
    pub fn topics(&self, hostname: &str) -> Result<TopicSet, ConfigError> {
        let base = base_topic(hostname);
        let mqtt = &self.mqtt;
        let none_set = mqtt.devices.is_none() && mqtt.events.is_none() && mqtt.states.is_none();

        let pick = |value: &Option<String>, suffix: &str| -> Result<Option<TopicTemplate>, ConfigError> {
            let text = match value.as_deref() {
                Some("") => format!("{base}/{suffix}"),
                Some(topic) => topic.to_string(),
                None if none_set => format!("{base}/{suffix}"),
                None => return Ok(None),
            };
            Ok(Some(TopicTemplate::parse(&text)?))
        };

        Ok(TopicSet {
            devices: pick(&mqtt.devices, DEVICES_PATH)?,
            events: pick(&mqtt.events, EVENTS_PATH)?,
            states: pick(&mqtt.states, STATES_PATH)?,
        })
    }

    /// Broker connection settings for the client
    pub fn connection_options(&self, hostname: &str) -> Result<ConnectionOptions, ConfigError> {
        let mqtt = &self.mqtt;
        let broker = match &mqtt.url {
            Some(url) => parse_broker_url(url)?,
            None => BrokerUrl::default(),
        };

        let tls_enabled = broker.tls || mqtt.tls_ca_cert.is_some();
        let default_port = if broker.tls {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_PORT
        };
        let address = BrokerAddress::new(broker.host, broker.port.unwrap_or(default_port));

        let mut options = ConnectionOptions::new(address, self.client_id(hostname));
        options.qos = mqtt.qos;
        options.retain = mqtt.retain;
        options.credentials = match (&mqtt.user, &mqtt.pass) {
            (Some(username), password) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            (None, Some(_)) => {
                warn!("MQTT password given without a user, ignoring it");
                None
            }
            (None, None) => None,
        };
        options.tls = tls_enabled.then(|| TlsOptions {
            ca_cert: mqtt
                .tls_ca_cert
                .clone()
                .or_else(|| Some(TLS_NO_VERIFY.to_string())),
            cert: mqtt.tls_cert.clone(),
            key: mqtt.tls_key.clone(),
            server_name: mqtt.tls_server_name.clone(),
        });

        Ok(options)
    }

    /// Resolved configuration as TOML, without the password
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl MqttConfig {
    fn apply_output(&mut self, output: &str) -> Result<(), ConfigError> {
        let (scheme, rest) = split_scheme(output.trim());
        let (hostport, options) = match rest.split_once(',') {
            Some((hostport, options)) => (hostport, Some(options)),
            None => (rest, None),
        };

        let hostport = hostport.trim();
        if !hostport.is_empty() || scheme.is_some() {
            let host = if hostport.is_empty() {
                DEFAULT_HOST
            } else {
                hostport
            };
            let url = format!("{}://{}", scheme.unwrap_or("mqtt"), host);
            parse_broker_url(&url)?;
            self.url = Some(url);
        }

        for option in options.into_iter().flat_map(|o| o.split(',')) {
            let (key, value) = match option.split_once('=') {
                Some((key, value)) => (key, Some(value.trim())),
                None => (option, None),
            };
            let key: String = key.chars().filter(|c| !c.is_whitespace()).collect();
            if key.is_empty() {
                continue;
            }
            self.apply_option(&key.to_ascii_lowercase(), value)?;
        }
        Ok(())
    }

    fn apply_option(&mut self, key: &str, value: Option<&str>) -> Result<(), ConfigError> {
        let owned = || value.map(str::to_string);
        match key {
            "u" | "user" => self.user = owned(),
            "p" | "pass" => self.pass = owned(),
            "r" | "retain" => self.retain = parse_flag(key, value)?,
            "q" | "qos" => self.qos = parse_qos(key, value)?,
            "d" | "devices" => self.devices = Some(value.unwrap_or_default().to_string()),
            "e" | "events" => self.events = Some(value.unwrap_or_default().to_string()),
            "s" | "states" => self.states = Some(value.unwrap_or_default().to_string()),
            "c" | "usechannel" => return Err(ConfigError::RemovedOption(USECHANNEL_HINT)),
            "tls_cert" => self.tls_cert = Some(required(key, value)?.into()),
            "tls_key" => self.tls_key = Some(required(key, value)?.into()),
            "tls_ca_cert" => self.tls_ca_cert = Some(required(key, value)?.to_string()),
            "tls_server_name" => self.tls_server_name = Some(required(key, value)?.to_string()),
            "tls_cipher_suites" | "tls_psk_identity" | "tls_psk_key" => {
                return Err(ConfigError::Unsupported(key.to_string()))
            }
            other => return Err(ConfigError::InvalidOption(other.to_string())),
        }
        Ok(())
    }

    fn topic_options(&self) -> [(&'static str, Option<&str>); 3] {
        [
            ("devices", self.devices.as_deref()),
            ("events", self.events.as_deref()),
            ("states", self.states.as_deref()),
        ]
    }
}

/// Split off `mqtt://` / `mqtts://`, or a bare `mqtt`/`mqtts` with no host
fn split_scheme(output: &str) -> (Option<&str>, &str) {
    for scheme in ["mqtts", "mqtt"] {
        if let Some(rest) = output.strip_prefix(scheme) {
            if let Some(rest) = rest.strip_prefix("://") {
                return (Some(scheme), rest);
            }
            if rest.is_empty() || rest.starts_with(',') {
                return (Some(scheme), rest);
            }
        }
    }
    (None, output)
}

#[derive(Debug, PartialEq)]
struct BrokerUrl {
    host: String,
    port: Option<u16>,
    tls: bool,
}

impl Default for BrokerUrl {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: None,
            tls: false,
        }
    }
}

fn parse_broker_url(text: &str) -> Result<BrokerUrl, ConfigError> {
    let invalid = || ConfigError::InvalidAddress(text.to_string());
    let url = Url::parse(text).map_err(|_| invalid())?;

    let tls = match url.scheme() {
        "mqtt" => false,
        "mqtts" => true,
        _ => return Err(invalid()),
    };
    if !url.username().is_empty() || !matches!(url.path(), "" | "/") || url.query().is_some() {
        return Err(invalid());
    }

    let host = match url.host() {
        Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
        Some(Host::Domain(_)) | None => DEFAULT_HOST.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => addr.to_string(),
    };

    Ok(BrokerUrl {
        host,
        port: url.port(),
        tls,
    })
}

fn required<'a>(key: &str, value: Option<&'a str>) -> Result<&'a str, ConfigError> {
    value.filter(|v| !v.is_empty()).ok_or_else(|| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: "a value is required".to_string(),
    })
}

/// Boolean option; a bare key means `true`
fn parse_flag(key: &str, value: Option<&str>) -> Result<bool, ConfigError> {
    let Some(value) = value else {
        return Ok(true);
    };
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "enable" => Ok(true),
        "false" | "no" | "off" | "disable" => Ok(false),
        other => other
            .parse::<i64>()
            .map(|n| n != 0)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: format!("\"{value}\" is not a boolean"),
            }),
    }
}

/// QoS option; a bare key means 1
fn parse_qos(key: &str, value: Option<&str>) -> Result<u8, ConfigError> {
    let Some(value) = value else {
        return Ok(1);
    };
    match value.parse::<u8>() {
        Ok(qos) if qos <= 2 => Ok(qos),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("\"{value}\" is not 0, 1 or 2"),
        }),
    }
}

/// Base topic for the default paths
pub fn base_topic(hostname: &str) -> String {
    format!("rtl_433/{hostname}")
}

/// Deterministic client id from hostname and device hint.
///
/// Stable across restarts so the broker recognizes the same receiver.
pub fn client_id(hostname: &str, device_hint: Option<&str>) -> String {
    let host_crc = CLIENT_ID_CRC.checksum(hostname.as_bytes());
    let hint_crc = CLIENT_ID_CRC.checksum(device_hint.unwrap_or_default().as_bytes());
    format!("rtl_433-{host_crc:04x}{hint_crc:04x}")
}

/// The machine's hostname, without the domain part
pub fn local_hostname() -> Result<String, ConfigError> {
    let name = hostname::get().map_err(|e| ConfigError::Hostname(e.to_string()))?;
    Ok(short_hostname(&name.to_string_lossy()))
}

fn short_hostname(name: &str) -> String {
    name.split('.').next().unwrap_or_default().to_string()
}

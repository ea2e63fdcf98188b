use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::path::Path;
use tokio::fs;

pub const DEFAULT_PATH: &str = "/etc/vpnbox/config.toml";
pub const ENV_VAR: &str = "VPNBOX_CONFIG_PATH";

const DEFAULT_HOSTAPD_DRIVER: &str = "nl80211";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub listener: String,
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub debug: Debug,
    #[serde(default)]
    pub vpn_configs: Vec<VpnOpt>,
    #[serde(default)]
    pub firewall: Firewall,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Network {
    #[serde(default)]
    pub interface_ident: String,
    #[serde(default)]
    pub subnet: String,
    #[serde(default)]
    pub wireless: Wireless,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Wireless {
    #[serde(default)]
    pub interface: String,
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_hostapd_driver")]
    pub hostapd_driver: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Debug {
    #[serde(default)]
    pub dhcp: bool,
    #[serde(default)]
    pub hostapd: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Firewall {
    #[serde(default)]
    pub vpnbox_blocked_ports: Vec<u16>,
    #[serde(default)]
    pub blocked_subnets: Vec<String>,
}

/// One selectable VPN tunnel. Credentials stay out of every serialized view.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VpnOpt {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default, skip_serializing)]
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration file not found")]
    NoFile,
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Validation(String),
}

fn default_hostapd_driver() -> String {
    DEFAULT_HOSTAPD_DRIVER.to_string()
}

impl Default for Wireless {
    fn default() -> Self {
        Wireless {
            interface: String::new(),
            ssid: String::new(),
            password: String::new(),
            hostapd_driver: default_hostapd_driver(),
        }
    }
}

impl Config {
    /// The parsed client subnet. Only valid after [`parse`] or [`read`]
    /// succeeded.
    pub fn subnet(&self) -> Result<Ipv4Network, Error> {
        self.network
            .subnet
            .parse::<Ipv4Network>()
            .map_err(|e| Error::Validation(format!("network.subnet is not a valid CIDR: {e}")))
    }

    pub fn vpn_by_name(&self, name: &str) -> Option<&VpnOpt> {
        self.vpn_configs.iter().find(|v| v.name == name)
    }
}

pub fn parse(content: &str) -> Result<Config, Error> {
    let config: Config = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

pub async fn read(path: &Path) -> Result<Config, Error> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NoFile
        } else {
            Error::IO(e)
        }
    })?;
    parse(&content)
}

fn validate(config: &Config) -> Result<(), Error> {
    if config.listener.is_empty() {
        return Err(Error::Validation("listener must be specified".to_string()));
    }
    if config.network.interface_ident.is_empty() {
        return Err(Error::Validation("network.interface_ident must be specified".to_string()));
    }
    if config.network.subnet.is_empty() {
        return Err(Error::Validation("network.subnet must be specified".to_string()));
    }
    let subnet = config.subnet()?;
    // the DHCP broadcast rewrite forces the last octet to 255
    if subnet.prefix() != 24 {
        return Err(Error::Validation(format!(
            "network.subnet must be a /24, got /{}",
            subnet.prefix()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
listener = "0.0.0.0:8080"

[network]
interface_ident = "0"
subnet = "10.0.0.1/24"
"#;

    #[test]
    fn minimal_config_parses_and_fills_driver_default() -> anyhow::Result<()> {
        let config = parse(MINIMAL)?;
        assert_eq!(config.listener, "0.0.0.0:8080");
        assert_eq!(config.network.interface_ident, "0");
        assert_eq!(config.network.wireless.hostapd_driver, "nl80211");
        assert!(config.vpn_configs.is_empty());
        Ok(())
    }

    #[test]
    fn missing_required_fields_fail_validation() {
        for content in [
            "",
            "listener = \"0.0.0.0:8080\"",
            "listener = \"0.0.0.0:8080\"\n[network]\ninterface_ident = \"0\"",
        ] {
            match parse(content) {
                Err(Error::Validation(_)) => {}
                other => panic!("expected validation error, got {other:?}"),
            }
        }
    }

    #[test]
    fn bad_subnet_fails_validation() {
        let content = "listener = \"l\"\n[network]\ninterface_ident = \"0\"\nsubnet = \"not-a-cidr\"";
        assert!(matches!(parse(content), Err(Error::Validation(_))));

        let content = "listener = \"l\"\n[network]\ninterface_ident = \"0\"\nsubnet = \"10.0.0.1/16\"";
        assert!(matches!(parse(content), Err(Error::Validation(_))));
    }

    #[test]
    fn full_config_round_trips_fields() -> anyhow::Result<()> {
        let content = r#"
name = "vpnbox"
listener = "127.0.0.1:8080"

[network]
interface_ident = "0"
subnet = "10.0.0.1/24"

[network.wireless]
interface = "wlan0"
ssid = "vpnbox"
password = "hunter22"

[debug]
dhcp = true

[[vpn_configs]]
name = "amsterdam"
path = "/etc/vpnbox/ams.ovpn"
icon = "nl"
username = "user"
password = "pass"

[firewall]
vpnbox_blocked_ports = [22, 8080]
blocked_subnets = ["192.168.1.0/24"]
"#;
        let config = parse(content)?;
        assert_eq!(config.name, "vpnbox");
        assert_eq!(config.network.wireless.ssid, "vpnbox");
        assert_eq!(config.network.wireless.hostapd_driver, "nl80211");
        assert!(config.debug.dhcp);
        assert!(!config.debug.hostapd);
        assert_eq!(config.vpn_configs.len(), 1);
        assert_eq!(config.vpn_by_name("amsterdam").map(|v| v.path.as_str()), Some("/etc/vpnbox/ams.ovpn"));
        assert!(config.vpn_by_name("berlin").is_none());
        assert_eq!(config.firewall.vpnbox_blocked_ports, vec![22, 8080]);
        Ok(())
    }

    #[test]
    fn credentials_never_serialize() -> anyhow::Result<()> {
        let opt = VpnOpt {
            name: "ams".to_string(),
            path: "/p".to_string(),
            icon: "nl".to_string(),
            username: "user".to_string(),
            password: "secret".to_string(),
        };
        let json = serde_json::to_string(&opt)?;
        assert!(!json.contains("user"));
        assert!(!json.contains("secret"));
        Ok(())
    }
}

//! Wireless-AP daemon integration: configuration generation for `hostapd`
//! and queries against its control socket.

use serde::Serialize;
use thiserror::Error;

use std::io;
use std::path::{Path, PathBuf};

use crate::config::Config;

mod socket;

pub use socket::{query, query_status};

pub const CTRL_SOCKET_DIR: &str = "/var/run/hostapd";

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error("unexpected control response: {0}")]
    UnexpectedResponse(String),
}

/// Parsed `STATUS` response from the control socket.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ApStatus {
    pub state: String,
    pub frequency: u32,
    pub channel: u32,
    pub stations_count: u32,
}

impl ApStatus {
    pub fn enabled(&self) -> bool {
        self.state == "ENABLED"
    }
}

/// Path of the daemon's control socket for a wireless interface, given the
/// configured `ctrl_interface` directory.
pub fn ctrl_socket_path(dir: &Path, wlan_interface: &str) -> PathBuf {
    dir.join(wlan_interface)
}

/// Command line for supervising the daemon with a generated config file.
pub fn command(config_path: &Path) -> (String, Vec<String>) {
    (
        "hostapd".to_string(),
        vec!["-dd".to_string(), config_path.display().to_string()],
    )
}

/// Render the daemon configuration. Radio and cipher settings are fixed;
/// only the interface, credentials and bridge vary per deployment.
pub fn generate_config(config: &Config) -> String {
    let wireless = &config.network.wireless;
    format!(
        "interface={interface}
driver={driver}

ssid={ssid}
hw_mode=g
channel=7
wmm_enabled=0
macaddr_acl=0
auth_algs=1
ignore_broadcast_ssid=0
wpa=2
wpa_passphrase={passphrase}
wpa_key_mgmt=WPA-PSK
wpa_pairwise=TKIP
rsn_pairwise=CCMP

bridge={bridge}
ctrl_interface={ctrl_dir}
",
        interface = wireless.interface,
        driver = wireless.hostapd_driver,
        ssid = wireless.ssid,
        passphrase = wireless.password,
        bridge = format!("br{}", config.network.interface_ident),
        ctrl_dir = CTRL_SOCKET_DIR,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    fn test_config() -> Config {
        config::parse(
            r#"
listener = "0.0.0.0:8080"

[network]
interface_ident = "0"
subnet = "10.0.0.1/24"

[network.wireless]
interface = "wlan0"
ssid = "thebox"
password = "hunter22"
"#,
        )
        .expect("test config")
    }

    #[test]
    fn config_renders_template_fields() {
        let rendered = generate_config(&test_config());
        for line in [
            "interface=wlan0",
            "driver=nl80211",
            "ssid=thebox",
            "hw_mode=g",
            "channel=7",
            "macaddr_acl=0",
            "auth_algs=1",
            "ignore_broadcast_ssid=0",
            "wpa=2",
            "wpa_passphrase=hunter22",
            "wpa_key_mgmt=WPA-PSK",
            "wpa_pairwise=TKIP",
            "rsn_pairwise=CCMP",
            "bridge=br0",
            "ctrl_interface=/var/run/hostapd",
        ] {
            assert!(rendered.lines().any(|l| l == line), "missing line: {line}");
        }
    }

    #[test]
    fn command_points_the_daemon_at_the_config() {
        let (program, args) = command(Path::new("/tmp/hostapd.conf"));
        assert_eq!(program, "hostapd");
        assert_eq!(args, vec!["-dd".to_string(), "/tmp/hostapd.conf".to_string()]);
    }
}

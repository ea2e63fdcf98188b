use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::hostapd::ApStatus;

/// Point-in-time snapshot of the controller, shaped for the status surface.
/// Readers tolerate mixed-epoch fields; this is never a consistent view.
#[derive(Clone, Debug, Serialize)]
pub struct ControllerState {
    pub breaker: BreakerState,
    pub config: ConfigState,
    #[serde(rename = "AP")]
    pub ap: Option<ApStatus>,
}

#[derive(Clone, Debug, Serialize)]
pub struct BreakerState {
    pub tripped: bool,
    pub last_updated: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ConfigState {
    pub vpn: VpnState,
    pub subnet: String,
    pub wireless: WirelessState,
}

#[derive(Clone, Debug, Serialize)]
pub struct VpnState {
    pub configured: bool,
    pub name: String,
    pub icon: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct WirelessState {
    #[serde(rename = "SSID")]
    pub ssid: String,
}

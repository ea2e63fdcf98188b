//! The network controller: owns the bridge, the wireless AP, the client
//! services and the VPN tunnel, and keeps watch that egress stays inside
//! it.
//!
//! Every controller-initiated mutation of kernel state is serialized by the
//! single setup mutex. Snapshot fields beside it are written only by lock
//! holders and read lock-free by [`Controller::get_state`].

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::{Instant, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use std::io::Write;
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::{self, Config, VpnOpt};
use crate::hostapd::{self, ApStatus};
use crate::state::{BreakerState, ConfigState, ControllerState, VpnState, WirelessState};
use crate::sys::{self, Pid, System};
use crate::{dhcp, dns};

mod vpn;

/// Well-known address used to interrogate the current default route.
pub const PROBE_IP: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

const BREAKER_TICK: Duration = Duration::from_secs(1);
const AP_STATUS_TICK: Duration = Duration::from_secs(3);
const HOSTAPD_POLL: Duration = Duration::from_millis(220);
const HOSTAPD_ENABLED_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] config::Error),
    #[error(transparent)]
    Sys(#[from] sys::Error),
    #[error("dhcp error: {0}")]
    Dhcp(#[from] dhcp::Error),
    #[error("dns error: {0}")]
    Dns(#[from] dns::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("timeout waiting for {0}")]
    Timeout(&'static str),
    #[error("{0} died during bring-up")]
    SubprocessDied(&'static str),
    #[error("no interface named `{0}`")]
    NoSuchInterface(String),
    #[error("No VPN with that name")]
    VpnNotFound(String),
    #[error("VPN interface has no address")]
    VpnNoAddress,
}

#[derive(Debug, Clone)]
struct Breaker {
    tripped: bool,
    updated: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct VpnTunnel {
    pid: Pid,
    opt: VpnOpt,
    // filled once the tunnel is actually up
    if_index: Option<u32>,
    addr: Option<Ipv4Addr>,
}

pub struct Options {
    pub hostapd_ctrl_dir: PathBuf,
    /// Bind and serve DHCP/DNS for bridge clients. Off only for embedders
    /// that bring their own client services.
    pub serve_dhcp_dns: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            hostapd_ctrl_dir: PathBuf::from(hostapd::CTRL_SOCKET_DIR),
            serve_dhcp_dns: true,
        }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("bridge_name", &self.bridge_name)
            .finish_non_exhaustive()
    }
}

pub struct Controller {
    config: Config,
    sys: System,
    options: Options,

    // derived at construction, immutable thereafter
    bridge_name: String,
    bridge_index: u32,
    bridge_addr: Ipv4Addr,
    subnet: Ipv4Network,
    wlan_addr: Ipv4Addr,
    tun_name: String,

    // the setup mutex: serializes every controller-initiated mutation
    setup: tokio::sync::Mutex<()>,

    // runtime state, written only while holding the setup mutex
    vpn: Mutex<Option<VpnTunnel>>,
    hostapd_pid: Mutex<Option<Pid>>,
    hostapd_conf: Mutex<Option<tempfile::NamedTempFile>>,
    masquerading: AtomicBool,
    breaker: Mutex<Breaker>,
    ap_state: Mutex<Option<ApStatus>>,

    shutdown: CancellationToken,
    tasks: TaskTracker,
}

fn ip_add(ip: Ipv4Addr, n: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip).wrapping_add(n))
}

/// The subnet's directed broadcast: the wireless gateway address with the
/// last octet forced to all-ones. Assumes /24, enforced at config load.
fn directed_broadcast(wlan_addr: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from((u32::from(wlan_addr) & 0xffff_ff00) | 0xff)
}

fn masquerade_rule(wireless_interface: &str) -> String {
    format!("-m physdev --physdev-in {wireless_interface} -j MASQUERADE")
}

impl Controller {
    pub async fn new(config: Config, sys: System) -> Result<Arc<Self>, Error> {
        Self::with_options(config, sys, Options::default()).await
    }

    pub async fn with_options(config: Config, sys: System, options: Options) -> Result<Arc<Self>, Error> {
        let subnet = config.subnet()?;
        let bridge_addr = subnet.ip();
        let wlan_addr = ip_add(bridge_addr, 1);
        let bridge_name = format!("br{}", config.network.interface_ident);
        let tun_name = format!("tun{}", config.network.interface_ident);

        let bridge_index = sys
            .netlink
            .create_bridge(&bridge_name, bridge_addr, subnet.prefix())
            .await?;

        let controller = Arc::new(Controller {
            config,
            sys,
            options,
            bridge_name,
            bridge_index,
            bridge_addr,
            subnet,
            wlan_addr,
            tun_name,
            setup: tokio::sync::Mutex::new(()),
            vpn: Mutex::new(None),
            hostapd_pid: Mutex::new(None),
            hostapd_conf: Mutex::new(None),
            masquerading: AtomicBool::new(false),
            breaker: Mutex::new(Breaker {
                tripped: false,
                updated: Utc::now(),
            }),
            ap_state: Mutex::new(None),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        if let Err(e) = controller.start_services().await {
            // the bridge is the rollback target for every later failure
            controller.shutdown.cancel();
            if let Err(rollback) = controller.sys.netlink.delete_bridge(&controller.bridge_name).await {
                tracing::warn!(error = ?rollback, "rolling back bridge");
            }
            return Err(e);
        }

        Ok(controller)
    }

    async fn start_services(self: &Arc<Self>) -> Result<(), Error> {
        let wireless = self.config.network.wireless.interface.clone();

        if !wireless.is_empty() {
            let index = self
                .sys
                .netlink
                .link_index(&wireless)
                .await?
                .ok_or_else(|| Error::NoSuchInterface(wireless.clone()))?;
            self.sys
                .netlink
                .set_interface_addr(index, self.wlan_addr, self.subnet.prefix())
                .await?;
        }

        self.apply_firewall()?;

        if !wireless.is_empty() {
            self.start_hostapd().await?;
            self.sys
                .iptables
                .append_unique("nat", "POSTROUTING", &masquerade_rule(&wireless))?;
            self.masquerading.store(true, Ordering::SeqCst);
        }

        self.spawn_workers(!wireless.is_empty()).await?;
        Ok(())
    }

    /// Blocked ports and subnets. These rules stay behind on close; only
    /// the masquerade rule is transient.
    fn apply_firewall(&self) -> Result<(), Error> {
        let subnet = Ipv4Network::new(self.subnet.network(), self.subnet.prefix())
            .unwrap_or(self.subnet);

        for port in &self.config.firewall.vpnbox_blocked_ports {
            for proto in ["tcp", "udp"] {
                let rule = format!("-s {subnet} -p {proto} --dport {port} -j DROP");
                self.sys.iptables.append_unique("filter", "INPUT", &rule)?;
            }
        }
        for blocked in &self.config.firewall.blocked_subnets {
            let rule = format!("-s {subnet} -d {blocked} -j DROP");
            self.sys.iptables.append_unique("filter", "FORWARD", &rule)?;
        }
        Ok(())
    }

    async fn start_hostapd(&self) -> Result<(), Error> {
        let rendered = hostapd::generate_config(&self.config);
        let mut conf = tempfile::Builder::new()
            .prefix("vpnbox-hostapd-")
            .suffix(".conf")
            .tempfile()?;
        conf.as_file_mut().write_all(rendered.as_bytes())?;
        conf.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;

        let (program, args) = hostapd::command(conf.path());
        let pid = self.sys.process.spawn(&program, &args, self.config.debug.hostapd)?;
        tracing::info!(pid, "started hostapd");
        *self.hostapd_pid.lock() = Some(pid);
        // the config file must outlive the daemon
        *self.hostapd_conf.lock() = Some(conf);

        let socket_path = hostapd::ctrl_socket_path(
            &self.options.hostapd_ctrl_dir,
            &self.config.network.wireless.interface,
        );
        let deadline = Instant::now() + HOSTAPD_ENABLED_TIMEOUT;
        let mut ticker = interval(HOSTAPD_POLL);
        loop {
            ticker.tick().await;
            if !self.sys.process.alive(pid) {
                return Err(Error::SubprocessDied("hostapd"));
            }
            let path = socket_path.clone();
            match tokio::task::spawn_blocking(move || hostapd::query_status(&path)).await {
                Ok(Ok(status)) if status.enabled() => {
                    tracing::info!(frequency = status.frequency, channel = status.channel, "access point enabled");
                    *self.ap_state.lock() = Some(status);
                    return Ok(());
                }
                Ok(Ok(status)) => tracing::debug!(state = %status.state, "access point not ready"),
                Ok(Err(e)) => tracing::debug!(error = ?e, "hostapd status query failed"),
                Err(e) => tracing::warn!(error = ?e, "hostapd status task failed"),
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("hostapd state=ENABLED"));
            }
        }
    }

    async fn spawn_workers(self: &Arc<Self>, wireless: bool) -> Result<(), Error> {
        let controller = Arc::clone(self);
        self.tasks.spawn(async move { controller.breaker_loop().await });

        if wireless {
            let controller = Arc::clone(self);
            self.tasks.spawn(async move { controller.ap_status_loop().await });
        }

        if self.options.serve_dhcp_dns {
            let handler = dhcp::Handler::new(self.bridge_addr, self.config.debug.dhcp);
            let socket = dhcp::FilteredSocket::bind(
                vec![self.bridge_index],
                directed_broadcast(self.wlan_addr),
                dhcp::SERVER_PORT,
            )?;
            let server = dhcp::Server::new(handler, socket, self.shutdown.clone());
            self.tasks.spawn_blocking(move || server.serve());

            let responder =
                dns::Responder::bind(&self.config.name, self.bridge_addr, self.shutdown.clone()).await?;
            self.tasks.spawn(responder.serve());
        }

        Ok(())
    }

    async fn breaker_loop(self: Arc<Self>) {
        let mut ticker = interval(BREAKER_TICK);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            self.breaker_tick().await;
        }
    }

    /// One breaker evaluation. The setup guard is dropped on every exit
    /// path; never hand-unlock here.
    async fn breaker_tick(&self) {
        let _guard = self.setup.lock().await;

        if self.breaker.lock().tripped {
            return;
        }
        let tun_index = self.vpn.lock().as_ref().and_then(|t| t.if_index);
        let Some(tun_index) = tun_index else {
            // no tunnel to guard yet, just refresh the heartbeat
            self.breaker.lock().updated = Utc::now();
            return;
        };

        match self.sys.netlink.route_get(PROBE_IP).await {
            Ok(Some(oif)) if oif == tun_index => {}
            Ok(oif) => {
                tracing::error!(?oif, tun_index, "egress left the tunnel, tripping circuit breaker");
                {
                    let mut breaker = self.breaker.lock();
                    breaker.tripped = true;
                    breaker.updated = Utc::now();
                }
                if let Err(e) = self.sys.forwarding.set_ipv4_forwarding(false) {
                    // the latch stands regardless
                    tracing::error!(error = ?e, "disabling forwarding after breaker trip");
                }
            }
            Err(e) => tracing::warn!(error = ?e, "breaker route check failed"),
        }
    }

    async fn ap_status_loop(self: Arc<Self>) {
        let socket_path = hostapd::ctrl_socket_path(
            &self.options.hostapd_ctrl_dir,
            &self.config.network.wireless.interface,
        );
        let mut ticker = interval(AP_STATUS_TICK);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let _guard = self.setup.lock().await;
            let path = socket_path.clone();
            match tokio::task::spawn_blocking(move || hostapd::query_status(&path)).await {
                Ok(Ok(status)) => *self.ap_state.lock() = Some(status),
                Ok(Err(e)) => tracing::debug!(error = ?e, "ap status query failed"),
                Err(e) => tracing::warn!(error = ?e, "ap status task failed"),
            }
        }
    }

    /// Release everything owned, in reverse order of acquisition.
    pub async fn close(&self) -> Result<(), Error> {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        if let Some(tunnel) = self.vpn.lock().take() {
            tracing::info!(pid = tunnel.pid, addr = ?tunnel.addr, "stopping openvpn");
            if self.sys.process.alive(tunnel.pid) {
                if let Err(e) = self.sys.process.kill(tunnel.pid) {
                    tracing::warn!(error = ?e, pid = tunnel.pid, "killing openvpn");
                }
            }
        }
        if let Some(pid) = self.hostapd_pid.lock().take() {
            if self.sys.process.alive(pid) {
                if let Err(e) = self.sys.process.kill(pid) {
                    tracing::warn!(error = ?e, pid, "killing hostapd");
                }
            }
        }
        self.hostapd_conf.lock().take();

        if self.masquerading.swap(false, Ordering::SeqCst) {
            let rule = masquerade_rule(&self.config.network.wireless.interface);
            if let Err(e) = self.sys.iptables.delete("nat", "POSTROUTING", &rule) {
                tracing::warn!(error = ?e, "removing masquerade rule");
            }
        }

        self.sys.netlink.delete_bridge(&self.bridge_name).await?;
        Ok(())
    }

    /// Best-effort snapshot; never takes the setup mutex.
    pub fn get_state(&self) -> ControllerState {
        let breaker = self.breaker.lock().clone();
        let (configured, name, icon) = match self.vpn.lock().as_ref() {
            Some(tunnel) => (
                tunnel.if_index.is_some(),
                tunnel.opt.name.clone(),
                tunnel.opt.icon.clone(),
            ),
            None => (false, String::new(), String::new()),
        };

        ControllerState {
            breaker: BreakerState {
                tripped: breaker.tripped,
                last_updated: breaker.updated,
            },
            config: ConfigState {
                vpn: VpnState {
                    configured,
                    name,
                    icon,
                },
                subnet: self.subnet.to_string(),
                wireless: WirelessState {
                    ssid: self.config.network.wireless.ssid.clone(),
                },
            },
            ap: self.ap_state.lock().clone(),
        }
    }

    /// Selectable tunnels with credentials stripped (the type never
    /// serializes them).
    pub fn list_vpns(&self) -> Vec<VpnOpt> {
        self.config.vpn_configs.clone()
    }

    pub async fn set_vpn_by_name(&self, name: &str) -> Result<(), Error> {
        let opt = self
            .config
            .vpn_by_name(name)
            .cloned()
            .ok_or_else(|| Error::VpnNotFound(name.to_string()))?;
        self.set_vpn(&opt).await
    }
}

//! Tunnel replacement: tear down the previous OpenVPN, bring up the next,
//! and only re-open forwarding once egress provably runs through it.

use tokio::time::{Instant, interval};

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use crate::config::VpnOpt;

use super::{Controller, Error, PROBE_IP, VpnTunnel};

const VPN_POLL: Duration = Duration::from_millis(50);
const VPN_UP_TIMEOUT: Duration = Duration::from_secs(11);
const VPN_DOWN_TIMEOUT: Duration = Duration::from_secs(5);

impl Controller {
    /// Tunnel all traffic through the given VPN, replacing any current
    /// tunnel. Serialized with the circuit breaker by the setup mutex.
    /// Partial state after a failure is not rolled back; callers may retry
    /// or close the controller.
    pub async fn set_vpn(&self, opt: &VpnOpt) -> Result<(), Error> {
        let _guard = self.setup.lock().await;

        // forwarding goes dark before the old tunnel dies; the reverse
        // order opens a window where clients route around the tunnel
        if self.sys.forwarding.ipv4_forwarding_enabled()? {
            self.sys.forwarding.set_ipv4_forwarding(false)?;
        }

        let taken = self.vpn.lock().take();
        if let Some(tunnel) = taken {
            tracing::info!(pid = tunnel.pid, old = %tunnel.opt.name, new = %opt.name, "replacing vpn tunnel");
            if self.sys.process.alive(tunnel.pid) {
                self.sys.process.kill(tunnel.pid)?;
            }
            self.wait_link_gone(Instant::now() + VPN_DOWN_TIMEOUT).await?;
        }

        // openvpn reads this once at startup; dropped (and removed) as
        // soon as the tunnel is up or bring-up failed
        let credentials = write_credentials(opt)?;

        let args = vec![
            "--config".to_string(),
            opt.path.clone(),
            "--dev".to_string(),
            self.tun_name.clone(),
            "--auth-user-pass".to_string(),
            credentials.path().display().to_string(),
            "--auth-nocache".to_string(),
        ];
        let pid = self.sys.process.spawn("openvpn", &args, true)?;
        tracing::info!(pid, name = %opt.name, "started openvpn");
        *self.vpn.lock() = Some(VpnTunnel {
            pid,
            opt: opt.clone(),
            if_index: None,
            addr: None,
        });

        let deadline = Instant::now() + VPN_UP_TIMEOUT;
        let tun_index = self.wait_link_up(deadline).await?;
        drop(credentials);

        let addrs = self.sys.netlink.link_addr_v4(tun_index).await?;
        let addr = *addrs.first().ok_or(Error::VpnNoAddress)?;

        // same deadline as the device wait
        self.wait_route_through(tun_index, deadline).await?;

        {
            let mut vpn = self.vpn.lock();
            if let Some(tunnel) = vpn.as_mut() {
                tunnel.if_index = Some(tun_index);
                tunnel.addr = Some(addr);
            }
        }

        self.sys.forwarding.set_ipv4_forwarding(true)?;
        tracing::info!(name = %opt.name, tun = %self.tun_name, %addr, "vpn tunnel up");
        Ok(())
    }

    async fn wait_link_gone(&self, deadline: Instant) -> Result<(), Error> {
        let mut ticker = interval(VPN_POLL);
        loop {
            ticker.tick().await;
            if self.sys.netlink.link_index(&self.tun_name).await?.is_none() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("vpn device teardown"));
            }
        }
    }

    async fn wait_link_up(&self, deadline: Instant) -> Result<u32, Error> {
        let mut ticker = interval(VPN_POLL);
        loop {
            ticker.tick().await;
            if let Some(index) = self.sys.netlink.link_index(&self.tun_name).await? {
                return Ok(index);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("vpn device"));
            }
        }
    }

    async fn wait_route_through(&self, tun_index: u32, deadline: Instant) -> Result<(), Error> {
        let mut ticker = interval(VPN_POLL);
        loop {
            ticker.tick().await;
            match self.sys.netlink.route_get(PROBE_IP).await {
                Ok(Some(oif)) if oif == tun_index => return Ok(()),
                Ok(_) => {}
                Err(e) => tracing::debug!(error = ?e, "route probe during vpn bring-up"),
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("route through vpn device"));
            }
        }
    }
}

fn write_credentials(opt: &VpnOpt) -> Result<tempfile::NamedTempFile, Error> {
    let mut credentials = tempfile::Builder::new().prefix("vpnbox-auth-").tempfile()?;
    credentials
        .as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    credentials
        .as_file_mut()
        .write_all(format!("{}\n{}", opt.username, opt.password).as_bytes())?;
    Ok(credentials)
}

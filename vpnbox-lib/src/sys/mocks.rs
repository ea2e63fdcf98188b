//! Stateful mocks for the system facade.
//!
//! These track actual state (links, rules, processes) rather than call
//! sequences, so tests assert on the system's state after a lifecycle
//! operation. All mocks share state through `Arc<Mutex<_>>`.

#![cfg(test)]

use async_trait::async_trait;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use super::forwarding_ops::ForwardingOps;
use super::iptables_ops::IptablesOps;
use super::netlink_ops::{NetlinkOps, RouteVia};
use super::process_ops::{Pid, ProcessOps};
use super::{Error, System};

fn check_fail(fail_on: &HashMap<String, String>, op: &str) -> Result<(), Error> {
    if let Some(msg) = fail_on.get(op) {
        Err(Error::Process(msg.clone()))
    } else {
        Ok(())
    }
}

// ============================================================================
// MockNetlinkOps
// ============================================================================

#[derive(Debug, Default)]
pub struct NetlinkState {
    pub links: Vec<(u32, String)>,
    pub next_index: u32,
    pub bridges: Vec<String>,
    pub deleted: Vec<String>,
    pub addrs: HashMap<u32, Vec<Ipv4Addr>>,
    pub attached: Vec<(u32, u32)>,
    pub routes: Vec<RouteVia>,
    /// What `route_get` reports as the current egress interface.
    pub route_oif: Option<u32>,
    pub fail_on: HashMap<String, String>,
}

#[derive(Clone, Default)]
pub struct MockNetlinkOps {
    pub state: Arc<Mutex<NetlinkState>>,
}

impl MockNetlinkOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_link(&self, name: &str) -> u32 {
        let mut s = self.state.lock().unwrap();
        s.next_index += 1;
        let index = s.next_index;
        s.links.push((index, name.to_string()));
        index
    }

    pub fn remove_link(&self, name: &str) {
        let mut s = self.state.lock().unwrap();
        s.links.retain(|(_, n)| n != name);
    }

    pub fn set_link_addr(&self, index: u32, addrs: Vec<Ipv4Addr>) {
        self.state.lock().unwrap().addrs.insert(index, addrs);
    }

    pub fn set_route_oif(&self, oif: Option<u32>) {
        self.state.lock().unwrap().route_oif = oif;
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.state.lock().unwrap().links.iter().any(|(_, n)| n == name)
    }
}

#[async_trait]
impl NetlinkOps for MockNetlinkOps {
    async fn create_bridge(&self, name: &str, ip: Ipv4Addr, _prefix: u8) -> Result<u32, Error> {
        let mut s = self.state.lock().unwrap();
        check_fail(&s.fail_on, "create_bridge")?;
        if s.links.iter().any(|(_, n)| n == name) {
            return Err(Error::DeviceExists);
        }
        s.next_index += 1;
        let index = s.next_index;
        s.links.push((index, name.to_string()));
        s.bridges.push(name.to_string());
        s.addrs.entry(index).or_default().push(ip);
        Ok(index)
    }

    async fn delete_bridge(&self, name: &str) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        check_fail(&s.fail_on, "delete_bridge")?;
        s.links.retain(|(_, n)| n != name);
        s.bridges.retain(|n| n != name);
        s.deleted.push(name.to_string());
        Ok(())
    }

    async fn attach_bridge(&self, bridge_index: u32, port_index: u32) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        check_fail(&s.fail_on, "attach_bridge")?;
        s.attached.push((bridge_index, port_index));
        Ok(())
    }

    async fn set_interface_addr(&self, if_index: u32, ip: Ipv4Addr, _prefix: u8) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        check_fail(&s.fail_on, "set_interface_addr")?;
        s.addrs.entry(if_index).or_default().push(ip);
        Ok(())
    }

    async fn add_route_via(&self, route: &RouteVia) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        check_fail(&s.fail_on, "add_route_via")?;
        s.routes.push(route.clone());
        Ok(())
    }

    async fn link_index(&self, name: &str) -> Result<Option<u32>, Error> {
        let s = self.state.lock().unwrap();
        check_fail(&s.fail_on, "link_index")?;
        Ok(s.links.iter().find_map(|(i, n)| (n == name).then_some(*i)))
    }

    async fn link_addr_v4(&self, if_index: u32) -> Result<Vec<Ipv4Addr>, Error> {
        let s = self.state.lock().unwrap();
        check_fail(&s.fail_on, "link_addr_v4")?;
        Ok(s.addrs.get(&if_index).cloned().unwrap_or_default())
    }

    async fn route_get(&self, _probe: Ipv4Addr) -> Result<Option<u32>, Error> {
        let s = self.state.lock().unwrap();
        check_fail(&s.fail_on, "route_get")?;
        Ok(s.route_oif)
    }
}

// ============================================================================
// MockIptablesOps
// ============================================================================

#[derive(Debug, Default)]
pub struct IptablesState {
    /// (table, chain) -> rules in order.
    pub rules: HashMap<(String, String), Vec<String>>,
    pub fail_on: HashMap<String, String>,
}

#[derive(Clone, Default)]
pub struct MockIptablesOps {
    pub state: Arc<Mutex<IptablesState>>,
}

impl MockIptablesOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rules(&self, table: &str, chain: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .rules
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

impl IptablesOps for MockIptablesOps {
    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool, Error> {
        let s = self.state.lock().unwrap();
        check_fail(&s.fail_on, "exists")?;
        Ok(s.rules
            .get(&(table.to_string(), chain.to_string()))
            .is_some_and(|rules| rules.iter().any(|r| r == rule)))
    }

    fn append(&self, table: &str, chain: &str, rule: &str) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        check_fail(&s.fail_on, "append")?;
        s.rules
            .entry((table.to_string(), chain.to_string()))
            .or_default()
            .push(rule.to_string());
        Ok(())
    }

    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        check_fail(&s.fail_on, "delete")?;
        let rules = s
            .rules
            .entry((table.to_string(), chain.to_string()))
            .or_default();
        let before = rules.len();
        rules.retain(|r| r != rule);
        if rules.len() == before {
            return Err(Error::Iptables(format!("rule not found: {rule}")));
        }
        Ok(())
    }
}

// ============================================================================
// MockForwardingOps
// ============================================================================

#[derive(Debug, Default)]
pub struct ForwardingState {
    pub enabled: bool,
    /// Every value ever written, in order.
    pub writes: Vec<bool>,
    pub fail_on: HashMap<String, String>,
}

#[derive(Clone, Default)]
pub struct MockForwardingOps {
    pub state: Arc<Mutex<ForwardingState>>,
}

impl MockForwardingOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().unwrap().enabled = enabled;
    }

    pub fn enabled(&self) -> bool {
        self.state.lock().unwrap().enabled
    }
}

impl ForwardingOps for MockForwardingOps {
    fn ipv4_forwarding_enabled(&self) -> Result<bool, Error> {
        let s = self.state.lock().unwrap();
        check_fail(&s.fail_on, "ipv4_forwarding_enabled")?;
        Ok(s.enabled)
    }

    fn set_ipv4_forwarding(&self, enabled: bool) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        check_fail(&s.fail_on, "set_ipv4_forwarding")?;
        s.enabled = enabled;
        s.writes.push(enabled);
        Ok(())
    }
}

// ============================================================================
// MockProcessOps
// ============================================================================

#[derive(Debug, Clone)]
pub struct SpawnedProc {
    pub pid: Pid,
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ProcessState {
    pub next_pid: Pid,
    pub spawned: Vec<SpawnedProc>,
    pub alive: Vec<Pid>,
    pub killed: Vec<Pid>,
    pub fail_on: HashMap<String, String>,
}

#[derive(Clone, Default)]
pub struct MockProcessOps {
    pub state: Arc<Mutex<ProcessState>>,
}

impl MockProcessOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dead(&self, pid: Pid) {
        self.state.lock().unwrap().alive.retain(|p| *p != pid);
    }

    pub fn spawned(&self) -> Vec<SpawnedProc> {
        self.state.lock().unwrap().spawned.clone()
    }

    pub fn alive_pids(&self) -> Vec<Pid> {
        self.state.lock().unwrap().alive.clone()
    }
}

impl ProcessOps for MockProcessOps {
    fn spawn(&self, program: &str, args: &[String], _inherit_output: bool) -> Result<Pid, Error> {
        let mut s = self.state.lock().unwrap();
        check_fail(&s.fail_on, "spawn")?;
        s.next_pid += 1;
        let pid = 1000 + s.next_pid;
        s.spawned.push(SpawnedProc {
            pid,
            program: program.to_string(),
            args: args.to_vec(),
        });
        s.alive.push(pid);
        Ok(pid)
    }

    fn alive(&self, pid: Pid) -> bool {
        self.state.lock().unwrap().alive.contains(&pid)
    }

    fn kill(&self, pid: Pid) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        check_fail(&s.fail_on, "kill")?;
        if !s.alive.contains(&pid) {
            return Err(Error::Process(format!("no such process: {pid}")));
        }
        s.alive.retain(|p| *p != pid);
        s.killed.push(pid);
        Ok(())
    }
}

// ============================================================================
// Bundle
// ============================================================================

/// All four mocks plus a [`System`] view over them. Tests keep the struct
/// around for assertions; the controller gets [`MockSystem::system`].
#[derive(Clone, Default)]
pub struct MockSystem {
    pub netlink: MockNetlinkOps,
    pub iptables: MockIptablesOps,
    pub forwarding: MockForwardingOps,
    pub process: MockProcessOps,
}

impl MockSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn system(&self) -> System {
        System {
            netlink: Arc::new(self.netlink.clone()),
            iptables: Arc::new(self.iptables.clone()),
            forwarding: Arc::new(self.forwarding.clone()),
            process: Arc::new(self.process.clone()),
        }
    }
}

//! Injected facade over the process-global system surfaces: netlink,
//! the packet filter, `/proc/sys` and the subprocess tree.
//!
//! Each backend is a small ops trait with a production implementation and a
//! stateful mock (see `mocks`), so controller behavior is testable without
//! root.

use thiserror::Error;

use std::sync::Arc;

pub mod forwarding_ops;
pub mod iptables_ops;
pub mod netlink_ops;
pub mod process_ops;

#[cfg(test)]
pub mod mocks;

pub use forwarding_ops::ForwardingOps;
pub use iptables_ops::IptablesOps;
pub use netlink_ops::{NetlinkOps, RouteVia};
pub use process_ops::{Pid, ProcessOps};

#[derive(Debug, Error)]
pub enum Error {
    #[error("interface with that name already exists")]
    DeviceExists,
    #[error("no link named `{0}`")]
    NoSuchLink(String),
    #[error("iptables error: {0}")]
    Iptables(String),
    #[error("unexpected content in {0}")]
    ForwardingFormat(String),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("errno: {0}")]
    Errno(#[from] nix::Error),
    #[cfg(target_os = "linux")]
    #[error("rtnetlink error: {0}")]
    Rtnetlink(#[from] rtnetlink::Error),
    #[error("process error: {0}")]
    Process(String),
}

/// The capability bundle handed to the controller. Cheap to clone; every
/// long-lived task holds its own copy.
#[derive(Clone)]
pub struct System {
    pub netlink: Arc<dyn NetlinkOps>,
    pub iptables: Arc<dyn IptablesOps>,
    pub forwarding: Arc<dyn ForwardingOps>,
    pub process: Arc<dyn ProcessOps>,
}

#[cfg(target_os = "linux")]
impl System {
    /// Production wiring. Spawns the netlink connection task onto the
    /// current runtime.
    pub fn real() -> Result<Self, Error> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(System {
            netlink: Arc::new(netlink_ops::RealNetlinkOps::new(handle)),
            iptables: Arc::new(iptables_ops::RealIptablesOps::new()?),
            forwarding: Arc::new(forwarding_ops::RealForwardingOps::default()),
            process: Arc::new(process_ops::RealProcessOps),
        })
    }
}

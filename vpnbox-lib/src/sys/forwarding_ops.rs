//! Read/write access to the kernel IPv4 forwarding toggle.

use std::fs;
use std::path::PathBuf;

use super::Error;

const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

pub trait ForwardingOps: Send + Sync {
    fn ipv4_forwarding_enabled(&self) -> Result<bool, Error>;
    fn set_ipv4_forwarding(&self, enabled: bool) -> Result<(), Error>;
}

/// Production [`ForwardingOps`] over `/proc/sys/net/ipv4/ip_forward`.
/// The path is injectable for tests.
pub struct RealForwardingOps {
    path: PathBuf,
}

impl Default for RealForwardingOps {
    fn default() -> Self {
        RealForwardingOps {
            path: PathBuf::from(IP_FORWARD_PATH),
        }
    }
}

impl RealForwardingOps {
    pub fn with_path(path: PathBuf) -> Self {
        RealForwardingOps { path }
    }
}

impl ForwardingOps for RealForwardingOps {
    fn ipv4_forwarding_enabled(&self) -> Result<bool, Error> {
        let content = fs::read(&self.path)?;
        // the toggle is a single byte plus newline, anything else is a
        // misread we refuse to interpret
        match content.as_slice() {
            [b'0', b'\n'] => Ok(false),
            [b'1', b'\n'] => Ok(true),
            _ => Err(Error::ForwardingFormat(self.path.display().to_string())),
        }
    }

    fn set_ipv4_forwarding(&self, enabled: bool) -> Result<(), Error> {
        let value = if enabled { "1\n" } else { "0\n" };
        fs::write(&self.path, value)?;
        Ok(())
    }
}

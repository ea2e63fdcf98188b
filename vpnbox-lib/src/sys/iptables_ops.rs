//! Abstraction over iptables chain and rule operations.
//!
//! Errors from the underlying tool are flattened to strings so they can
//! cross task boundaries.

use super::Error;

pub trait IptablesOps: Send + Sync {
    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool, Error>;
    fn append(&self, table: &str, chain: &str, rule: &str) -> Result<(), Error>;
    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<(), Error>;

    /// Append the rule unless it is already present. Idempotent.
    fn append_unique(&self, table: &str, chain: &str, rule: &str) -> Result<(), Error> {
        if self.exists(table, chain, rule)? {
            return Ok(());
        }
        self.append(table, chain, rule)
    }
}

#[cfg(target_os = "linux")]
pub use real::RealIptablesOps;

#[cfg(target_os = "linux")]
mod real {
    use super::*;

    /// Production [`IptablesOps`] backed by the `iptables` crate.
    pub struct RealIptablesOps {
        inner: iptables::IPTables,
    }

    impl RealIptablesOps {
        pub fn new() -> Result<Self, Error> {
            Ok(Self {
                inner: iptables::new(false).map_err(|e| Error::Iptables(e.to_string()))?,
            })
        }
    }

    impl IptablesOps for RealIptablesOps {
        fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool, Error> {
            self.inner
                .exists(table, chain, rule)
                .map_err(|e| Error::Iptables(e.to_string()))
        }

        fn append(&self, table: &str, chain: &str, rule: &str) -> Result<(), Error> {
            self.inner
                .append(table, chain, rule)
                .map_err(|e| Error::Iptables(e.to_string()))
        }

        fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<(), Error> {
            self.inner
                .delete(table, chain, rule)
                .map_err(|e| Error::Iptables(e.to_string()))
        }
    }
}

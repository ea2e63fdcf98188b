use clap::Parser;

use std::path::PathBuf;

use vpnbox_lib::config;

/// vpnbox - turns this machine into a wireless router that tunnels all
/// client traffic through a VPN
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// General configuration file
    #[arg(
        short,
        long,
        env = config::ENV_VAR,
        default_value = config::DEFAULT_PATH,
    )]
    pub config_path: PathBuf,
}

pub fn parse() -> Cli {
    Cli::parse()
}

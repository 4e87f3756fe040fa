use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

/// Robot-side daemon: receives deploy jobs from the cloud, installs the
/// files and reports job state back
#[derive(Parser, Debug)]
#[clap(author, version, about)]
pub struct Args {
    /// Path to the toml config file
    #[clap(long, short, default_value = "ota-daemon.toml")]
    pub config: PathBuf,

    /// Address to bind the local API to
    #[clap(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to bind the local API to
    #[clap(long, default_value_t = 9000)]
    pub port: u16,

    /// Default log filter when RUST_LOG is not set
    #[clap(long, default_value = "info")]
    pub verbose: String,
}

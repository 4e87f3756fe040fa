use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

/// Cloud side of the OTA file service: stores fleet files and coordinates
/// their deployment to robots
#[derive(Parser, Debug)]
#[clap(author, version, about)]
pub struct Args {
    /// Path to the toml config file
    #[clap(long, short, default_value = "ota-server.toml")]
    pub config: PathBuf,

    /// Address to bind the HTTP API to
    #[clap(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to bind the HTTP API to
    #[clap(long, default_value_t = 9005)]
    pub port: u16,

    /// Default log filter when RUST_LOG is not set
    #[clap(long, default_value = "info")]
    pub verbose: String,
}

//! Command line arguments parsing.

// SPDX-License-Identifier: AGPL-3.0-or-later

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Pabgpd {
    /// Configuration file in TOML
    #[arg(short = 'f', long, default_value = "pabgpd.toml")]
    pub config: PathBuf,
    /// Listen on these addresses instead of the configured ones
    #[arg(short = 'l', long)]
    pub listen_addr: Vec<IpAddr>,
    /// Listen on this port instead of the configured one
    #[arg(short = 'p', long)]
    pub listen_port: Option<u16>,
    /// Verbose mode, twice for tracing every message
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Check the configuration and exit
    #[arg(short = 'c', long)]
    pub check: bool,
}

use std::net::SocketAddr;

use clap::{Parser, Subcommand, ValueEnum};
use reqwest::Url;

use crate::size::UnitConvention;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the speed-test page and synthetic payload streams over HTTP
    Serve(Serve),
    /// Download a payload from a running server and estimate throughput
    Run(Run),
}

#[derive(Parser, Clone, Debug)]
pub struct Serve {
    /// HTTP listen address
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub host: SocketAddr,

    /// Smallest payload accepted, in megabytes
    #[arg(long, default_value_t = 1)]
    pub min_mb: u64,

    /// Largest payload accepted, in megabytes
    #[arg(long, default_value_t = 1000)]
    pub max_mb: u64,

    /// Payload size the browser page downloads, in megabytes
    #[arg(long, default_value_t = 100)]
    pub default_mb: u64,

    /// Chunk size emitted per production step, in kilobytes
    #[arg(long, default_value_t = 64)]
    pub chunk_kb: usize,

    /// Chunks buffered ahead of the socket before production pauses
    #[arg(long, default_value_t = 8)]
    pub depth: usize,

    /// Scale k/m/g suffixes by powers of 1000 instead of 1024
    #[arg(long)]
    pub decimal: bool,

    /// Upstream proxied verbatim by `GET /locations`
    #[arg(long, default_value = "https://speed.cloudflare.com/locations")]
    pub locations_upstream: Url,

    /// Disable the `/locations` proxy
    #[arg(long)]
    pub no_locations: bool,
}

impl Serve {
    pub fn units(&self) -> UnitConvention {
        UnitConvention::from_decimal_flag(self.decimal)
    }
}

#[derive(Parser, Clone, Debug)]
pub struct Run {
    /// Base URL of a `netspeed serve` instance
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    pub url: Url,

    /// Payload size to download, in megabytes
    #[arg(long, default_value_t = 100)]
    pub size_mb: u64,

    /// The server scales suffixes by powers of 1000
    #[arg(long)]
    pub decimal: bool,

    /// Run one measurement without the terminal UI and print a summary
    #[arg(long)]
    pub headless: bool,

    /// Summary format for headless runs
    #[arg(long, value_enum, default_value_t = SummaryFormat::Text)]
    pub format: SummaryFormat,
}

impl Run {
    pub fn units(&self) -> UnitConvention {
        UnitConvention::from_decimal_flag(self.decimal)
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SummaryFormat {
    Text,
    Json,
}

mod cli;
mod client;
mod estimator;
mod metrics;
mod page;
mod routes;
mod server;
mod session;
mod size;
mod stream;
mod tui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::client::run_client;
use crate::server::run_serve;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    let cli = Cli::parse();
    let result: Result<()> = match cli.command {
        Some(Commands::Serve(serve)) => run_serve(serve),
        Some(Commands::Run(run)) => run_client(run),
        None => {
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(err) = result {
        let code = exit_code_for_error(&err);
        eprintln!("error: {err:?}");
        std::process::exit(code);
    }
}

pub(crate) fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    // 2: invalid limits, 4: bind failure, 5: network error, 1: other
    for cause in err.chain() {
        if cause.is::<crate::size::ConfigError>() {
            return 2;
        }
        if cause.is::<crate::session::SessionError>() {
            return 5;
        }
        if let Some(ioe) = cause.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind::*;
            return match ioe.kind() {
                AddrInUse | AddrNotAvailable | PermissionDenied => 4,
                _ => 1,
            };
        }
    }
    1
}

mod auth;
mod cli;
mod config;
mod domain;
mod events;
mod http;
mod logger;
mod server;
mod tunnel;

use anyhow::Result;
use std::process::ExitCode;
use tracing::{error, info};

fn main() -> Result<ExitCode> {
    let result = match cli::run() {
        Ok(code) => {
            info!("egress-gate finished successfully");
            Ok(code)
        }
        Err(err) => {
            error!(error = ?err, "egress-gate failed");
            Err(err)
        }
    };
    logger::shutdown();
    result
}

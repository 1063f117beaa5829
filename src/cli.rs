use crate::config::{self, ProxyConfig, ServerOptions};
use crate::domain::DomainAllowlist;
use crate::events::{EventSink, TracingSink};
use crate::logger::{self, LogFormat, LogOptions};
use crate::server::ProxyServer;
use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "egress-gate")]
#[command(about = "Authenticated HTTP CONNECT proxy restricted to an allowlist of domains")]
#[command(
    after_help = "Credentials and the allowlist are read from PROXY_USER, PROXY_PASS and ALLOWED_DOMAINS."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text, env = "LOG_FORMAT")]
    log_format: LogFormat,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH", env = "LOG_FILE")]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn log_options(&self) -> LogOptions {
        LogOptions {
            format: self.log_format,
            file: self.log_file.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy until interrupted
    Serve(ServeArgs),

    /// Check a target against ALLOWED_DOMAINS without starting the proxy
    Check {
        /// Target as host or host:port
        target: String,
    },

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "PROXY_LISTEN", default_value = config::DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// Seconds to wait for each destination address to accept
    #[arg(long, value_name = "SECS", default_value_t = config::DEFAULT_DIAL_TIMEOUT.as_secs())]
    dial_timeout: u64,

    /// Seconds a client has to send a complete request head
    #[arg(long, value_name = "SECS", default_value_t = config::DEFAULT_HEADER_TIMEOUT.as_secs())]
    header_timeout: u64,

    /// Maximum concurrent client connections (unlimited when omitted)
    #[arg(long, value_name = "N")]
    max_connections: Option<usize>,
}

impl ServeArgs {
    fn options(&self) -> ServerOptions {
        ServerOptions {
            listen_addr: self.listen.clone(),
            dial_timeout: Duration::from_secs(self.dial_timeout),
            header_timeout: Duration::from_secs(self.header_timeout),
            max_connections: self.max_connections,
        }
    }
}

pub fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    logger::init(&cli.log_options())?;
    info!(args = ?std::env::args().collect::<Vec<_>>(), "egress-gate start");

    match cli.command {
        Commands::Serve(args) => {
            serve(&args)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check { target } => {
            let allowlist = config::allowlist_from_env()?;
            Ok(check(&allowlist, &target))
        }
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Print the verdict for `target`; denied targets exit with status 1.
fn check(allowlist: &DomainAllowlist, target: &str) -> ExitCode {
    if allowlist.check(target).is_allowed() {
        println!("allowed");
        ExitCode::SUCCESS
    } else {
        println!("denied");
        ExitCode::FAILURE
    }
}

fn serve(args: &ServeArgs) -> Result<()> {
    let config = Arc::new(ProxyConfig::from_env(args.options())?);
    info!(
        domains = %config.allowed_domains,
        count = config.allowed_domains.len(),
        user = config.credential.user(),
        "allowed domains"
    );

    let events: Arc<dyn EventSink> = Arc::new(TracingSink);
    let server = ProxyServer::bind(Arc::clone(&config), events)?;

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("Failed to install signal handler")?;

    let handle = server.spawn();
    info!(addr = %handle.local_addr(), "proxy listening");
    // Sender lives in the handler for the whole process, so this only
    // returns on a signal.
    let _ = stop_rx.recv();
    info!("shutdown requested");
    handle.shutdown();
    Ok(())
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}

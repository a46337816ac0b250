//! nodefence - cluster node fencing agent
//!
//! Invoked by the quorum subsystem with the address of a node to fence and
//! the resource identifier it may still hold, or with `--test` to exercise
//! every configured fencing path without powering anything off.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use nodefence_core::binding::BindingTable;
use nodefence_core::config::FenceConfig;
use nodefence_core::interrupt::install_handlers;
use nodefence_core::orchestrator::FenceRequest;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

use commands::exit_codes;

/// nodefence - cluster node fencing agent
#[derive(Parser, Debug)]
#[command(name = "nodefence")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address of the node to fence
    #[arg(long, env = "NODEFENCE_IP", required_unless_present = "test")]
    ip: Option<String>,

    /// Resource identifier the node must no longer hold
    #[arg(long, env = "NODEFENCE_RID", required_unless_present = "test")]
    rid: Option<String>,

    /// Self-test every configured node instead of fencing
    #[arg(long)]
    test: bool,

    /// Path to the configuration file
    #[arg(short, long, env = "NODEFENCE_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the host-binding table (overrides `hosts_file`)
    #[arg(long)]
    hosts: Option<PathBuf>,

    /// Debug logging (same as `--log-level debug`)
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// What the invocation asks for.
enum Mode {
    Fence(FenceRequest),
    SelfTest,
}

impl Cli {
    fn mode(&self) -> Mode {
        if self.test {
            return Mode::SelfTest;
        }
        Mode::Fence(FenceRequest::new(
            self.ip.clone().unwrap_or_default(),
            self.rid.clone().unwrap_or_default(),
        ))
    }
}

fn init_logging(cli: &Cli) {
    let level = if cli.verbose { "debug" } else { cli.log_level.as_str() };
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries the self-test report; logs go to stderr.
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Loads configuration and bindings, wires the transports and runs the
/// requested mode.
fn run(cli: &Cli) -> Result<u8> {
    let config = FenceConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    let hosts = cli.hosts.clone().unwrap_or_else(|| config.hosts_file.clone());
    let bindings = BindingTable::from_file(&hosts)
        .with_context(|| format!("failed to load host bindings from {}", hosts.display()))?;

    let interrupt = install_handlers().context("failed to install signal handlers")?;
    let wiring = commands::Wiring::new(&config, &interrupt);

    Ok(match cli.mode() {
        Mode::Fence(request) => commands::fence::run(&request, &bindings, &wiring),
        Mode::SelfTest => commands::selftest::run(&bindings, &wiring),
    })
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "configuration error");
            eprintln!("nodefence: {e:#}");
            exit_codes::CONFIG_ERROR
        },
    };

    // The quorum subsystem reads the outcome from the exit status alone.
    std::process::exit(i32::from(code));
}

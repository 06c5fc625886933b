//! flaky - a deliberately unreliable TCP server.
//!
//! Clients drive the server with short text commands (`ping`, `busy3`,
//! `bug2`, `fork1`, ...) and get slow replies, silent hangups, duplicated
//! frames or replies from a grandchild process. One worker process is
//! forked per connection; sockets can be leaked across forks on request.

mod error;
mod interpreter;
mod listener;
mod server;
mod session;
mod spawn;
mod throttle;

use anyhow::{Context, Result};
use clap::Parser;
use flaky_common::{
    ConfigOverrides, FileConfig, LeakMask, LogConfig, LogFormat, ResolvedConfig, init_logging,
};
use server::AcceptLoop;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "flakyd")]
#[command(author, version, about = "flaky - a buggy TCP server for testing clients")]
struct Cli {
    /// Log debug diagnostics (read/write sizes, grandchild timing)
    #[arg(short = 'D', long, env = "FLAKY_DEBUG")]
    debug: bool,

    /// Leak sockets across fork: 1 = client, 2 = listener, 3 = both
    ///
    /// Accepts decimal or 0x-prefixed hex. Without a value both are leaked.
    #[arg(
        short = 'L',
        long,
        env = "FLAKY_LEAK",
        value_name = "MASK",
        num_args = 0..=1,
        default_missing_value = "3"
    )]
    leak: Option<String>,

    /// SO_LINGER timeout in seconds; negative disables it
    #[arg(long, env = "FLAKY_LINGER", value_name = "SECS", allow_negative_numbers = true)]
    linger: Option<i64>,

    /// Extra slowdown in seconds once too many workers were spawned
    #[arg(short = 's', long, env = "FLAKY_SLOW", value_name = "SECS", allow_negative_numbers = true)]
    slow: Option<i64>,

    /// Workers spawned before the accept loop slows down
    #[arg(
        short = 'm',
        long = "max-workers",
        env = "FLAKY_MAX_WORKERS",
        value_name = "N",
        allow_negative_numbers = true
    )]
    max_workers: Option<i64>,

    /// Listen backlog
    #[arg(short = 'l', long = "listen-queue", env = "FLAKY_LISTEN_QUEUE", value_name = "N")]
    listen_queue: Option<i32>,

    /// TCP port
    #[arg(short = 'p', long, env = "FLAKY_PORT")]
    port: Option<u16>,

    /// IPv4 address to bind
    #[arg(long, env = "FLAKY_BIND")]
    bind: Option<IpAddr>,

    /// TOML config file; flags and environment take precedence
    #[arg(short = 'c', long, env = "FLAKY_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log line format (compact or json)
    #[arg(long, env = "FLAKY_LOG_FORMAT", value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    /// Print the resolved configuration as JSON and exit
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    /// Resolve the configuration. The flag is true when the leak mask was
    /// given but selected nothing and was replaced by the default.
    fn resolve(&self) -> Result<(ResolvedConfig, bool)> {
        let file = self
            .config
            .as_deref()
            .map(FileConfig::load)
            .transpose()
            .context("Failed to load configuration")?;

        let (leak, leak_defaulted) = match self.leak.as_deref() {
            Some(raw) => {
                let (mask, defaulted) = LeakMask::parse_lenient(raw);
                (Some(mask), defaulted)
            }
            None => (None, false),
        };

        let overrides = ConfigOverrides {
            debug: self.debug,
            leak,
            linger: self.linger,
            slow: self.slow,
            max_workers: self.max_workers,
            bind: self.bind,
            port: self.port,
            backlog: self.listen_queue,
        };

        let resolved = ResolvedConfig::resolve(file.as_ref(), &overrides)
            .context("Invalid configuration")?;
        Ok((resolved, leak_defaulted))
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let (config, leak_defaulted) = match cli.resolve() {
        Ok(resolved) => resolved,
        Err(err) => {
            eprintln!("FATAL: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    let mut log_config = LogConfig::from_env("info");
    if config.server.debug {
        log_config = log_config.with_level("debug");
    }
    if let Some(format) = cli.log_format {
        log_config = log_config.with_format(format);
    }
    if let Err(err) = init_logging(&log_config) {
        eprintln!("FATAL: {err}");
        return ExitCode::FAILURE;
    }

    if leak_defaulted {
        warn!(leak = %config.server.leak, "incorrect leak value, using default");
    }

    if cli.print_config {
        return match serde_json::to_string_pretty(&config) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!("FATAL: {err}");
                ExitCode::FAILURE
            }
        };
    }

    match serve(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(pid = std::process::id(), "FATAL: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Set up the process and the listener, then run the accept loop.
fn serve(config: ResolvedConfig) -> Result<()> {
    let ResolvedConfig { server, listen } = config;

    listener::ignore_child_signals().context("Failed to set signal dispositions")?;
    let socket = listener::bind_listener(&listen, &server)
        .with_context(|| format!("Failed to listen on {}", listen.socket_addr()))?;

    info!(
        pid = std::process::id(),
        server_type = %server.server_type(),
        slowdown_secs = server.extra_slowdown_secs,
        max_workers = server.max_fast_workers,
        addr = %listen.socket_addr(),
        backlog = listen.backlog,
        "start"
    );

    AcceptLoop::new(socket, server).run()?;
    Ok(())
}

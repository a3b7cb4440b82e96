use std::{fs, path::PathBuf, sync::Mutex, time};

use anyhow::Context;
use clap::Parser;

mod buffer;
mod config;
mod consts;
mod control;
mod daemon;
mod local;
mod remote;
mod transport;

/// The command line arguments that sshim expects.
///
/// The user-facing form is
/// `sshim <transport> [transport-options...] <host> <command> [args...]`;
/// everything from the transport name onward lands in `rest`. The
/// --remote/--try/--sockdir flags only ever appear on the internal
/// invocations sshim splices into the transport's argument vector.
#[derive(Parser, Debug)]
#[clap(version, about)]
pub struct Args {
    #[clap(
        short,
        long,
        action,
        long_help = "The file to write logs to

Logs are discarded entirely when this is unset: the local proxy's
stdio belongs to the invoking application and the remote proxy's
stdio IS the data channel, so nothing may ever default to stderr."
    )]
    pub log_file: Option<String>,

    #[clap(short, long, action = clap::ArgAction::Count,
           help = "Show more in logs, may be provided multiple times")]
    pub verbose: u8,

    #[clap(short, long, action, help = "A toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(long, action, help = "Run as the remote half of the relay (internal)")]
    pub remote: bool,

    #[clap(
        long = "try",
        value_name = "EPOCH",
        help = "The incarnation number of this remote proxy (internal)"
    )]
    pub epoch: Option<u64>,

    #[clap(
        long,
        value_name = "DIR",
        help = "The daemon's socket directory on the remote host (internal)"
    )]
    pub sockdir: Option<PathBuf>,

    #[clap(
        long,
        value_name = "SECONDS",
        help = "Bound on handshake exchanges, 10 seconds by default"
    )]
    pub timeout: Option<u64>,

    #[clap(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "TRANSPORT ARGS",
        help = "transport client, transport options, host, and the remote command"
    )]
    pub rest: Vec<String>,
}

pub fn run(args: Args) -> anyhow::Result<()> {
    init_logging(&args)?;

    let config = config::read_config(&args.config_file)?;

    if args.remote {
        let epoch = args.epoch.unwrap_or(0);
        let timeout = args
            .timeout
            .map(time::Duration::from_secs)
            .unwrap_or(consts::HANDSHAKE_TIMEOUT);
        match &args.sockdir {
            Some(dir) => remote::run(dir, epoch, timeout),
            None => remote::bootstrap(&args.rest, epoch, timeout),
        }
    } else {
        local::run(&args, &config)
    }
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let Some(log_file) = args.log_file.clone() else {
        return Ok(());
    };

    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };

    // Append rather than truncate: the three roles of a session may be
    // pointed at the same file.
    let file = fs::File::options()
        .create(true)
        .append(true)
        .open(log_file)
        .context("prepping log file")?;
    tracing_subscriber::fmt()
        .with_max_level(trace_level)
        .with_target(false)
        .with_writer(Mutex::new(file))
        .init();

    Ok(())
}

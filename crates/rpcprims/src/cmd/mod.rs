use std::path::{Path, PathBuf};

use clap::{Args, Subcommand, ValueEnum};
use rpcprims_rpc::RpcConfig;
use rpcprims_transport::ChannelId;

use crate::exit::{io_error, CliError, CliResult, CONFIG_INVALID};
use crate::output::OutputFormat;

pub mod call;
pub mod config;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the echo service on a Unix socket.
    Serve(ServeArgs),
    /// Make one call against a running server.
    Call(CallArgs),
    /// Print the effective runtime settings.
    Config(ConfigArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, config: &RpcConfig, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, config),
        Command::Call(args) => call::run(args, config, format),
        Command::Config(args) => config::run(args, config, format),
        Command::Version(args) => version::run(args),
    }
}

/// Settings from `path`, or the defaults when no file is given.
pub fn load_config(path: Option<&Path>) -> CliResult<RpcConfig> {
    let Some(path) = path else {
        return Ok(RpcConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .map_err(|err| io_error(&format!("reading {}", path.display()), err))?;
    serde_json::from_str(&text).map_err(|err| {
        CliError::new(
            CONFIG_INVALID,
            format!("invalid config {}: {err}", path.display()),
        )
    })
}

/// A number selects a raw channel id; anything else is hashed as a name.
pub fn parse_channel(value: &str) -> ChannelId {
    match value.parse::<u32>() {
        Ok(raw) => ChannelId::new(raw),
        Err(_) => ChannelId::from_name(value),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Channel to serve (number or name).
    #[arg(long, short = 'c', default_value = "0")]
    pub channel: String,
    /// Drive the server one transition at a time instead of running it.
    #[arg(long)]
    pub poll: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum CallMethod {
    /// Round trip; prints the echoed text.
    Echo,
    /// Oneway; the server only logs it.
    Notify,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Method to invoke on the echo service.
    #[arg(long, short = 'm', default_value = "echo")]
    pub method: CallMethod,
    /// Text argument.
    #[arg(long, short = 'd')]
    pub data: String,
    /// Channel to call on (number or name).
    #[arg(long, short = 'c', default_value = "0")]
    pub channel: String,
    /// Maximum time to wait for the reply, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,
}

#[derive(Args, Debug, Default)]
pub struct ConfigArgs {}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

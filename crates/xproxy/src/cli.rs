use std::net::IpAddr;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "xproxy",
    version,
    about = "Forward proxy for HTTP and HTTPS CONNECT with a reloadable blocklist and redirects"
)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Defaults to `run` when omitted
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the proxy with the operator console on stdin
    Run(RunArgs),
    /// Manage xproxy configuration
    Config(ConfigArgs),
}

#[derive(Args, Default)]
pub struct RunArgs {
    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to listen on
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<IpAddr>,

    /// Blocklist file (JSON array of domains)
    #[arg(long, value_name = "PATH")]
    pub blocklist: Option<PathBuf>,

    /// Redirects file (JSON object of host -> host)
    #[arg(long, value_name = "PATH")]
    pub redirects: Option<PathBuf>,

    /// Refuse connections beyond this many concurrent clients
    #[arg(long, value_name = "N")]
    pub max_connections: Option<usize>,

    /// Load an additional config file on top of defaults
    #[arg(long = "config", value_name = "PATH")]
    pub extra_config: Option<PathBuf>,

    /// Ignore global and project config files
    #[arg(long)]
    pub no_config: bool,

    /// Do not read operator commands from stdin
    #[arg(long)]
    pub no_console: bool,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub subcommand: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Write a starter config file and the default policy files
    Init {
        #[arg(long)]
        global: bool,
    },
    /// Print the effective merged configuration
    Show {
        #[arg(long, value_enum, default_value = "toml")]
        format: OutputFormat,
    },
}

#[derive(ValueEnum, Clone, Copy)]
pub enum OutputFormat {
    Toml,
    Json,
}

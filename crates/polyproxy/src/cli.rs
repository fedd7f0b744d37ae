use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "polyproxy",
    about = "Route TLS tunnels across a pool of upstream CONNECT proxies"
)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the proxy daemon
    Run(RunArgs),
    /// Validate a config file and report what it defines
    Check(CheckArgs),
    /// Print the normalized form of a config file
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Path to the config file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,
}

#[derive(Args)]
pub struct CheckArgs {
    /// Path to the config file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Path to the config file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,
}

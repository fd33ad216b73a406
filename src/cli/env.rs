use clap::Parser;
use std::path::PathBuf;

use super::commands::Commands;
use super::output::LogFormat;

#[derive(Parser, Debug)]
#[command(author, version, about = "Act on a running browser tab over CDP", long_about = None)]
#[command(propagate_version = true)]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "warn", global = true)]
    pub log_level: String,

    /// Enable debug mode
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Log line format on stderr
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// DevTools origin (`http://host:port` or `ws://...`) for implicit sessions
    #[arg(long, value_name = "ORIGIN", global = true)]
    pub cdp: Option<String>,

    /// Pretty-print the JSON result
    #[arg(long, global = true)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Commands,
}

//! Prints the configuration path the daemon would resolve, without
//! consuming any one-time config.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use ice_daq::config;

#[derive(Parser)]
#[command(name = "ice-find-config", about = "Resolve the acquisition config path")]
struct Args {
    /// Configuration file or directory (overrides the search path).
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match config::find_config(args.config.as_deref()) {
        Some(found) => {
            println!("{}", found.path.display());
            ExitCode::SUCCESS
        }
        None => {
            eprintln!(
                "no {} found in the search path (arg, ., ${}/cfg, {})",
                config::CONFIG_NAME,
                config::INSTALL_DIR_ENV,
                config::SYSTEM_CONFIG_DIR
            );
            ExitCode::from(1)
        }
    }
}

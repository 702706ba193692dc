//! ice-acq: the acquisition daemon.
//!
//! One optional positional argument names a configuration file or
//! directory; the rest of the search path is the working directory,
//! `$RNO_G_INSTALL_DIR/cfg` and `/rno-g/cfg`. SIGINT/SIGTERM shut down
//! gracefully, SIGUSR1 rereads the configuration. Exits 0 on a clean
//! shutdown, 1 on setup failure or disk-space exhaustion mid-run.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

#[derive(Parser)]
#[command(name = "ice-acq", about = "In-ice radio detector acquisition daemon")]
struct Args {
    /// Configuration file or directory (overrides the search path).
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = ice_daq::daq::install_signal_handlers() {
        error!("[main] {}", e);
        return ExitCode::from(1);
    }

    let runtime = match ice_daq::daq::start(args.config.as_deref()) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("[main] setup failed: {:#}", e);
            return ExitCode::from(1);
        }
    };

    let code = runtime.run();
    info!("[main] done");
    ExitCode::from(code as u8)
}

//! Writes a default-populated configuration file.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use ice_daq::config::AcqConfig;

#[derive(Parser)]
#[command(name = "ice-make-default-config", about = "Dump the default acquisition config")]
struct Args {
    /// Output file; stdout when omitted.
    output: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let text = AcqConfig::default().dump();
    match args.output {
        Some(path) => {
            if let Err(e) = std::fs::write(&path, text) {
                eprintln!("could not write {}: {}", path.display(), e);
                return ExitCode::from(1);
            }
            ExitCode::SUCCESS
        }
        None => {
            print!("{text}");
            ExitCode::SUCCESS
        }
    }
}

use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    analyst_center_cli::init_tracing();
    let cli = analyst_center_cli::Cli::parse();
    match analyst_center_cli::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

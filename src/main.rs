use clap::Parser;
use std::process::ExitCode;

mod cli;

use cli::{Cli, Command};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    let result = match cli.command {
        Command::Scrub(args) => cli::scrub(args),
        Command::Bandpass(args) => cli::bandpass(args),
        Command::Regress(args) => cli::regress(args),
        Command::Timecourse(args) => cli::timecourse(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

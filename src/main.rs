mod certs;
mod commands;
mod config;
mod error;
mod jsonc;
mod lock;
mod merge;
mod patch;
mod paths;
mod ports;
mod preview;
mod provider;
mod registry;
mod runner;
mod supervisor;
mod vars;
mod xml;

use clap::Parser;
use commands::Cli;

fn main() {
    let cli = Cli::parse();
    commands::init_tracing(cli.verbose);
    let json = cli.json;
    if let Err(err) = commands::run(cli) {
        commands::report_error(json, &err);
        std::process::exit(err.exit_code());
    }
}

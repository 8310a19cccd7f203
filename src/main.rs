//! vitalsink entry point: parse arguments, initialize logging, route the
//! command, and map failures to the documented exit codes.

use clap::Parser;

use vitalsink::cli::{self, Cli, CliError};

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    init_tracing(cli.verbose);

    match cli::execute(cli).await {
        Ok(()) => {}
        Err(CliError::Usage(message)) => {
            eprintln!("Error: {}", message);
            std::process::exit(1);
        }
        Err(CliError::Operational(e)) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

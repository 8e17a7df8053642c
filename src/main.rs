use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use tracing::{error, info};

use partlog::cli::{self, Cli};
use partlog::client;
use partlog::utils::logging;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = match cli.settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{e}\n");
            if let Err(e) = Cli::command().print_help() {
                eprintln!("failed to print usage: {e}");
            }
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.log_level, cli.verbose);

    let client = match client::connect(&settings) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to create the broker client");
            return ExitCode::FAILURE;
        }
    };
    info!(client = client.name(), client_id = %settings.client_id, "broker client ready");

    match cli::run(&cli, &settings, client).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "partlog stopped");
            ExitCode::FAILURE
        }
    }
}

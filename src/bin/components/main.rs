use std::process::ExitCode;

use clap::Parser;
use log::info;

use components::config_file::ConfigError;
use components::coordinator::Coordinator;
use components::inputs::{flag, parse_args};
use components::logger;

#[derive(Parser, Debug)]
#[command(
    name = "components",
    about = "Run the serverless component defined in the current directory"
)]
struct Cli {
    /// Log file path (enables file logging in addition to stderr)
    #[arg(long)]
    log_file: Option<String>,

    /// Method to call followed by its inputs, e.g. `deploy --stage=prod` or `--watch`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let args = parse_args(cli.args);

    let log_file = cli.log_file.map(std::fs::File::create).transpose()?;
    logger::init(log_file, flag(&args.inputs, "debug"))?;

    let cwd = std::env::current_dir()
        .map_err(|e| ConfigError::UnknownWorkingDirectory(e.to_string()))?;
    let outcome = Coordinator::new(cwd).run(None, args).await?;

    Ok(match outcome.exit_code() {
        Some(code) => ExitCode::from(code),
        None => {
            info!("No components project found, nothing to do");
            ExitCode::SUCCESS
        }
    })
}

//! thinknode CLI entry point.

use clap::Parser;
use std::process;

use thinknode::cli::{Cli, Commands, ConfigCommands};
use thinknode::commands::{self, Output};
use thinknode::config::resolve_config;
use thinknode::{Error, logging, storage};

fn main() {
    let cli = Cli::parse();
    let human = cli.human_readable;

    if let Err(e) = run(cli) {
        if human {
            eprintln!("Error: {}", e);
        } else {
            eprintln!("{}", serde_json::json!({ "error": e.to_string() }));
        }
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    let human = cli.human_readable;
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => storage::get_data_dir()?,
    };
    let config = resolve_config(&data_dir, cli.config.as_deref(), &cli.settings.to_overrides())?;

    // Only the long-running server logs at info and keeps a log file.
    let serving = matches!(cli.command, Commands::Serve);
    let log_dir = serving.then(|| config.log_dir());
    let _guard = logging::init_tracing(
        if serving { "info" } else { "warn" },
        log_dir.as_deref(),
        cli.log_json,
    );

    match cli.command {
        Commands::Serve => commands::serve(&config)?,
        Commands::Up => {
            let result = commands::up(&config)?;
            output(&result, human);
            if !result.gateway.is_done() {
                return Err(Error::Other("gateway failed to start".to_string()));
            }
        }
        Commands::Down => {
            let result = commands::down(&config)?;
            output(&result, human);
            if !result.is_success() {
                return Err(Error::Other("not every process could be stopped".to_string()));
            }
        }
        Commands::Start { target } => {
            let result = commands::start(&config, target)?;
            output(&result, human);
        }
        Commands::Stop { target } => {
            let result = commands::stop(&config, target)?;
            output(&result, human);
        }
        Commands::Status => {
            let result = commands::status(&config)?;
            output(&result, human);
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                let result = commands::config_show(&config)?;
                output(&result, human);
            }
        },
    }

    Ok(())
}

/// Print output in JSON or human-readable format.
fn output<T: Output>(result: &T, human: bool) {
    if human {
        println!("{}", result.to_human());
    } else {
        println!("{}", result.to_json());
    }
}

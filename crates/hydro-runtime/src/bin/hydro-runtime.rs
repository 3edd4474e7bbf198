//! CLI entrypoint for the hydroponics runtime.

#[path = "hydro-runtime/cli.rs"]
mod cli;
#[path = "hydro-runtime/run.rs"]
mod run;

use clap::Parser;

use cli::{Cli, Command};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Err(err) = dispatch(cli) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
    Ok(())
}

fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    match cli.command {
        Command::Run { config, program } => {
            runtime.block_on(run::run_program(config, program, cli.verbose))
        }
        Command::Ping { config, controller } => {
            runtime.block_on(run::run_ping(config, controller, cli.verbose))
        }
        Command::Validate { config, program } => {
            runtime.block_on(run::run_validate(config, program, cli.verbose))
        }
    }
}

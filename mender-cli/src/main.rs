use clap::Parser;

mod args;
mod cmd;
mod commands;
mod exit_codes;
mod logging;
mod output;

pub use args::*;
use commands::Command;

#[derive(Debug, Parser)]
#[command(name = "mender", version, about = "Self-healing step plan executor")]
struct Cli {
    /// Log engine decisions to stderr (`mender=debug`).
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to create tokio runtime: {e}");
            std::process::exit(exit_codes::RUNTIME_ERROR);
        }
    };

    let exit_code = rt.block_on(run_command(cli.command, cli.verbose));
    std::process::exit(exit_code);
}

async fn run_command(command: Command, verbose: bool) -> i32 {
    match command {
        Command::Validate { path, output } => cmd::validate::validate_cmd(&path, output),
        Command::Plan { path, output } => cmd::plan::plan_cmd(&path, output),
        Command::Run {
            path,
            report,
            engine,
            generator,
            output,
        } => {
            cmd::run::run_cmd(
                &path,
                report.as_deref(),
                engine,
                generator,
                output,
                verbose,
            )
            .await
        }
    }
}

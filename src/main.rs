use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use testforge::{
    commands::{run_generate, run_history, GenerateArgs, HistoryArgs},
    config::ForgeConfig,
    logger::{self, LogOptions},
};

#[derive(Parser)]
#[command(
    name = "testforge",
    version,
    about = "Generate, sandbox and validate API tests from golden tests or observed traffic."
)]
struct Cli {
    #[arg(long, global = true, help = "Config file (default: ./testforge.toml, then user config dir)")]
    config: Option<PathBuf>,

    #[arg(long, short, global = true, help = "Log run progress")]
    verbose: bool,

    #[arg(long, global = true, help = "Log everything, including sandbox and gateway detail")]
    debug: bool,

    #[arg(long, global = true, help = "Emit logs as JSON lines")]
    log_json: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the pipeline over golden tests and/or traffic captures
    Generate(GenerateArgs),
    /// Show recorded runs
    History(HistoryArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logger::init(LogOptions {
        verbose: cli.verbose,
        debug: cli.debug,
        json: cli.log_json,
    }) {
        eprintln!("testforge: logging unavailable: {e}");
    }

    let cfg = match ForgeConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("testforge: {e}");
            return ExitCode::from(2);
        }
    };

    match cli.command {
        CliCommand::Generate(args) => match run_generate(cfg, &args) {
            Ok(true) => ExitCode::SUCCESS,
            Ok(false) => ExitCode::FAILURE,
            Err(e) => {
                eprintln!("testforge: {e}");
                ExitCode::from(2)
            }
        },
        CliCommand::History(args) => match run_history(&cfg, &args) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("testforge: {e}");
                ExitCode::from(2)
            }
        },
    }
}

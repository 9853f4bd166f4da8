pub mod commands;

use clap::{Args, Parser, Subcommand};
use std::process::ExitCode;

use commands::recalculate::RecalculateTarget;

#[derive(Debug, Parser)]
#[command(
    name = "affinity",
    about = "Affinity index operator CLI",
    long_about = "Operate the affinity index: migrations, demo data, recalculation runs, config inspection and readiness checks.",
    after_help = "Examples:\n  affinity doctor --json\n  affinity seed\n  affinity recalculate --tenant tenant-northwind"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the demo tenants and transactions and index them incrementally")]
    Seed,
    #[command(about = "Recompute customer-product affinities for one tenant or all scheduled tenants")]
    Recalculate(RecalculateArgs),
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, database connectivity and schema readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct RecalculateArgs {
    #[arg(long, value_name = "TENANT_ID", help = "Recalculate a single tenant regardless of status")]
    tenant: Option<String>,
    #[arg(long, help = "Run the scheduled recalculation over every active and trial tenant now")]
    all: bool,
}

impl RecalculateArgs {
    fn target(self) -> RecalculateTarget {
        match self.tenant {
            Some(tenant_id) => RecalculateTarget::Tenant(tenant_id),
            None => RecalculateTarget::All,
        }
    }
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Recalculate(args) => commands::recalculate::run(args.target()),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

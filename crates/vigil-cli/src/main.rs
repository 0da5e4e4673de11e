use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

mod commands;

#[derive(Parser)]
#[command(name = "vigil-cli", version, about = "Vigil CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Alert rule management
    Alert {
        #[command(subcommand)]
        action: commands::alert::AlertAction,
    },
    /// Mirrored task inspection
    Task {
        #[command(subcommand)]
        action: commands::task::TaskAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
    /// Ingest task snapshots from a file or stdin
    Ingest(commands::ingest::IngestArgs),
    /// Run the recurring alert evaluation loop
    Watch(commands::watch::WatchArgs),
    /// Ingestion audit log statistics
    Webhooks,
    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args)]
struct CompletionsArgs {
    /// Shell to generate a completion script for
    #[arg(value_enum)]
    shell: Shell,
}

fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Alert { action } => commands::alert::run(action),
        Commands::Task { action } => commands::task::run(action),
        Commands::Config { action } => commands::config::run(action),
        Commands::Ingest(args) => commands::ingest::run(args),
        Commands::Watch(args) => commands::watch::run(args),
        Commands::Webhooks => commands::webhooks::run(),
        Commands::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            clap_complete::generate(args.shell, &mut command, binary_name, &mut std::io::stdout());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

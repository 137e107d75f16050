mod commands;

use clap::Parser;
use kubearchive::config::{Cli, Commands, CrdAction};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => commands::version::run()?,
        Commands::Check => commands::check::run().await?,
        Commands::Watch => commands::watch::run().await?,
        Commands::Serve { addr } => commands::serve::run(addr).await?,
        Commands::Crd { action } => match action {
            CrdAction::Generate => commands::crd::run()?,
        },
        Commands::Rbac => commands::rbac::run().await?,
    }

    Ok(())
}

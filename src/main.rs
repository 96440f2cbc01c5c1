mod args;
mod commands;

use args::{Cli, Commands};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    ociswrapper::logging::init(cli.verbose)?;

    match cli.command {
        Commands::Serve(args) => commands::serve::cmd_serve(args).await?,
    }

    Ok(())
}

use anyhow::Result;
use clap::{CommandFactory, Parser};

use shellmux::{app, logging, Cli, Commands, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    if let Some(Commands::Completions { shell }) = cli.command {
        let mut command = Cli::command();
        let name = command.get_name().to_string();
        clap_complete::generate(shell, &mut command, name, &mut std::io::stdout());
        return Ok(());
    }

    let settings = Settings::load(&cli)?;
    logging::init_tracing(settings.log_format)?;

    app::run(settings).await
}

use clap::Parser;

use media_proxy::cli::{self, Cli, Command, ConfigCommand};
use media_proxy::{config, logging, server};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        None | Some(Command::Start) => start().await,
        Some(Command::Config(ConfigCommand::Show)) => cli::handle_config_show(),
        Some(Command::Config(ConfigCommand::Get { key })) => cli::handle_config_get(&key),
        Some(Command::Config(ConfigCommand::Path)) => {
            cli::handle_config_path();
            Ok(())
        }
        Some(Command::Status { port, host }) => cli::handle_status(&host, port).await,
        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn start() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::load_config()?;
    logging::init_logging(&config.logging)?;
    server::run(config).await?;
    Ok(())
}

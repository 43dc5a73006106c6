use anyhow::Result;
use clap::Parser;

use hookrelay_cli::cli::{Cli, Commands};
use hookrelay_cli::commands;
use hookrelay_cli::config::{AppConfig, loader};
use hookrelay_cli::context::AppContext;
use hookrelay_cli::observability;
use hookrelay_cli::output::print_error;

#[tokio::main]
async fn main() {
    // Load .env if present; a missing file is not an error
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => eprintln!("Failed to load .env: {e}"),
    }

    let cli = Cli::parse();
    observability::init_tracing();

    let cfg = match loader::load_config(Some(cli.config.as_str())) {
        Ok(cfg) => cfg,
        Err(e) => {
            print_error(&format!("Configuration error: {e}"));
            std::process::exit(2);
        }
    };
    observability::apply_logging_level(&cfg.logging.level);

    match run(&cli, &cfg).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            print_error(&format!("{e:#}"));
            std::process::exit(1);
        }
    }
}

async fn run(cli: &Cli, cfg: &AppConfig) -> Result<bool> {
    let ctx = AppContext::connect(cfg).await?;
    match &cli.command {
        Commands::Drain(args) => commands::drain::run(&ctx.orchestrator, args).await,
        Commands::SendTest(args) => commands::send_test::run(&ctx, args.webhook_id).await,
        Commands::Purge(args) => commands::purge::run(&ctx, args.webhook_id).await,
    }
}

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "hookrelay")]
#[command(about = "Hookrelay: drain the webhook delivery queue and manage destinations")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "HOOKRELAY_CONFIG",
        default_value = "hookrelay.toml"
    )]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Deliver queued webhook payloads (run from cron)
    Drain(DrainArgs),
    /// Send a sample payload to a webhook and report the result
    SendTest(WebhookArgs),
    /// Delete every queued payload of a webhook
    Purge(WebhookArgs),
}

#[derive(Args, Debug)]
pub struct DrainArgs {
    /// Only drain this webhook
    #[arg(long)]
    pub webhook_id: Option<i64>,

    /// First queue row ID of the range (requires --webhook-id and --max-id)
    #[arg(long)]
    pub min_id: Option<i64>,

    /// Last queue row ID of the range, inclusive
    #[arg(long)]
    pub max_id: Option<i64>,
}

#[derive(Args, Debug)]
pub struct WebhookArgs {
    #[arg(long)]
    pub webhook_id: i64,
}

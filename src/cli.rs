use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "telegram-agent-bridge",
    about = "Exposes a personal Telegram account to AI agents as a small set of JSON-RPC tools"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the environment configuration and exit.
    Validate,
}

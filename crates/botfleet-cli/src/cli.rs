use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

/// Output format for CLI commands
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl OutputFormat {
    #[allow(dead_code)]
    pub fn is_json(self) -> bool {
        matches!(self, OutputFormat::Json)
    }
}

#[derive(Parser)]
#[command(name = "botfleet")]
#[command(version, about = "BotFleet - Telegram bot fleet delivery engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Primary database path (defaults to ~/.botfleet/botfleet.db)
    #[arg(long, global = true, env = "BOTFLEET_DB_PATH")]
    pub db_path: Option<String>,

    /// Config file path (defaults to ~/.botfleet/config.toml)
    #[arg(long, global = true, env = "BOTFLEET_CONFIG")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the delivery engine until interrupted
    Serve,

    /// Bot provisioning
    Bot {
        #[command(subcommand)]
        command: BotCommands,
    },

    /// Webhook delivery control
    Webhook {
        #[command(subcommand)]
        command: WebhookCommands,
    },

    /// Delivery health for the fleet or a single bot
    Health {
        /// Bot to inspect; omit for the whole fleet
        bot_id: Option<String>,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum BotCommands {
    /// Register a bot with the engine
    Add {
        bot_id: String,

        /// Provider bot token
        #[arg(long, env = "BOTFLEET_BOT_TOKEN", hide_env_values = true)]
        token: String,

        /// Skip the provider getMe validation round-trip
        #[arg(long)]
        skip_verify: bool,
    },

    /// List registered bots
    List,

    /// Start polling delivery for a bot
    Start { bot_id: String },

    /// Stop all delivery for a bot without removing it
    Stop { bot_id: String },

    /// Deregister a bot, tearing down live delivery
    Remove { bot_id: String },
}

#[derive(Subcommand)]
pub enum WebhookCommands {
    /// Switch a bot to webhook delivery
    Enable { bot_id: String },

    /// Switch a bot off webhook delivery
    Disable {
        bot_id: String,

        /// Delivery mode to resume afterwards
        #[arg(long, value_enum, default_value = "polling")]
        resume: ResumeTarget,
    },

    /// Show delivery mode and provider-side webhook state
    Status { bot_id: String },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ResumeTarget {
    Polling,
    Disabled,
}

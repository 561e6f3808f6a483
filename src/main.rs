//! Trading Memory - persistent bias memory and consistency checks
//!
//! Every command connects to the configured storage backend, runs one
//! operation and prints the structured result as JSON.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

// Use the library crate
use trading_memory::cli::commands;
use trading_memory::config::Config;
use trading_memory::store::{Bias, MarketCondition};

/// Trading Memory - bias persistence and consistency enforcement
#[derive(Parser)]
#[command(name = "trading-memory")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "trading-memory.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the current bias (one symbol) or an overview (several)
    Bias {
        #[arg(required = true)]
        symbols: Vec<String>,
    },

    /// Store a decision
    Store {
        symbol: String,

        /// bias_establishment, position_entry, signal_blocked, session_close, system_reset
        decision_type: String,

        /// Decision content as a JSON object
        content: String,
    },

    /// Check a proposed bias against the consistency rules
    Check {
        symbol: String,

        /// bullish, bearish or neutral
        proposed_bias: Bias,

        /// Why the bias should change
        #[arg(short, long)]
        reasoning: String,

        /// Current market price
        #[arg(short, long)]
        price: Option<f64>,

        /// normal, volatile or choppy
        #[arg(long, default_value = "normal")]
        market_condition: MarketCondition,

        /// Skip the minimum holding period
        #[arg(long)]
        override_time_gate: bool,

        /// Action being considered (informational)
        #[arg(long)]
        action: Option<String>,
    },

    /// Show recent decisions for a symbol
    History {
        symbol: String,

        /// Number of records to show
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Only show this decision type
        #[arg(short = 't', long)]
        decision_type: Option<String>,
    },

    /// Show recent position entries for a symbol
    Positions { symbol: String },

    /// Delete all stored state for a symbol
    Reset {
        symbol: String,

        /// Why the reset is needed (recorded in the audit log)
        #[arg(short, long)]
        reason: String,

        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Check storage health
    Health,

    /// Show current configuration (password masked)
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // Initialize tracing; RUST_LOG overrides the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    // Execute command
    let result = match cli.command {
        Commands::Bias { symbols } => commands::bias(&config, &symbols).await,
        Commands::Store {
            symbol,
            decision_type,
            content,
        } => commands::store(&config, &symbol, &decision_type, &content).await,
        Commands::Check {
            symbol,
            proposed_bias,
            reasoning,
            price,
            market_condition,
            override_time_gate,
            action,
        } => {
            commands::check(
                &config,
                &symbol,
                proposed_bias,
                &reasoning,
                price,
                market_condition,
                override_time_gate,
                action,
            )
            .await
        }
        Commands::History {
            symbol,
            limit,
            decision_type,
        } => commands::history(&config, &symbol, limit, decision_type).await,
        Commands::Positions { symbol } => commands::positions(&config, &symbol).await,
        Commands::Reset { symbol, reason, yes } => {
            commands::reset(&config, &symbol, &reason, yes).await
        }
        Commands::Health => commands::health(&config).await,
        Commands::Config => commands::show_config(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

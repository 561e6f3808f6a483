//! CLI command implementations

use anyhow::{Context, Result};
use dialoguer::Confirm;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Config;
use crate::consistency::ConsistencyRequest;
use crate::service::{BiasResponse, Outcome, TradingMemory};
use crate::store::{Bias, MarketCondition};

/// Connect to storage, run `f`, then shut down regardless of the result
async fn with_memory<F, Fut, T>(config: &Config, f: F) -> Result<T>
where
    F: FnOnce(TradingMemory) -> Fut,
    Fut: std::future::Future<Output = (TradingMemory, T)>,
{
    let memory = TradingMemory::from_config(config.clone());
    memory
        .start()
        .await
        .context("Failed to connect to storage")?;
    let (memory, value) = f(memory).await;
    memory.shutdown().await;
    Ok(value)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print an outcome and turn a failure into a non-zero exit
fn report<T: Serialize>(outcome: &Outcome<T>) -> Result<()> {
    print_json(outcome)?;
    match outcome.failure() {
        Some(payload) => anyhow::bail!("{}", payload.message),
        None => Ok(()),
    }
}

/// Show the current bias for one or more symbols
pub async fn bias(config: &Config, symbols: &[String]) -> Result<()> {
    if let [symbol] = symbols {
        let symbol = symbol.clone();
        let response = with_memory(config, |memory| async move {
            let response = memory.get_current_bias(&symbol).await;
            (memory, response)
        })
        .await?;
        print_json(&response)?;
        return match response {
            BiasResponse::Rejected(payload) | BiasResponse::Error(payload) => {
                anyhow::bail!("{}", payload.message)
            }
            _ => Ok(()),
        };
    }

    let symbols = symbols.to_vec();
    let outcome = with_memory(config, |memory| async move {
        let outcome = memory.bias_overview(&symbols).await;
        (memory, outcome)
    })
    .await?;
    report(&outcome)
}

/// Store a decision; `content` is a JSON object
pub async fn store(config: &Config, symbol: &str, decision_type: &str, content: &str) -> Result<()> {
    let content: Value = serde_json::from_str(content).context("Decision content must be valid JSON")?;
    let (symbol, decision_type) = (symbol.to_string(), decision_type.to_string());

    let outcome = with_memory(config, |memory| async move {
        let outcome = memory.store_decision(&symbol, &decision_type, content).await;
        (memory, outcome)
    })
    .await?;
    report(&outcome)
}

/// Validate a proposed bias against the consistency rules
#[allow(clippy::too_many_arguments)]
pub async fn check(
    config: &Config,
    symbol: &str,
    proposed_bias: Bias,
    reasoning: &str,
    price: Option<f64>,
    market_condition: MarketCondition,
    override_time_gate: bool,
    action: Option<String>,
) -> Result<()> {
    let mut request = ConsistencyRequest::new(symbol, proposed_bias, reasoning)
        .with_market_condition(market_condition);
    if let Some(price) = price {
        request = request.with_price(price);
    }
    if override_time_gate {
        request = request.with_override();
    }
    if let Some(action) = action {
        request = request.with_action(action);
    }

    let outcome = with_memory(config, |memory| async move {
        let outcome = memory.check_consistency(request).await;
        (memory, outcome)
    })
    .await?;
    report(&outcome)
}

/// Show recent decisions, newest first
pub async fn history(
    config: &Config,
    symbol: &str,
    limit: usize,
    decision_type: Option<String>,
) -> Result<()> {
    let symbol = symbol.to_string();
    let outcome = with_memory(config, |memory| async move {
        let outcome = memory
            .decision_history(&symbol, limit, decision_type.as_deref())
            .await;
        (memory, outcome)
    })
    .await?;
    report(&outcome)
}

pub async fn positions(config: &Config, symbol: &str) -> Result<()> {
    let symbol = symbol.to_string();
    let outcome = with_memory(config, |memory| async move {
        let outcome = memory.position_data(&symbol).await;
        (memory, outcome)
    })
    .await?;
    report(&outcome)
}

/// Delete all state for a symbol
pub async fn reset(config: &Config, symbol: &str, reason: &str, yes: bool) -> Result<()> {
    let mut confirmed = yes;
    if !confirmed {
        confirmed = Confirm::new()
            .with_prompt(format!(
                "Delete bias, history, decisions and positions for {}? This cannot be undone.",
                symbol.trim().to_uppercase()
            ))
            .default(false)
            .interact()?;

        if !confirmed {
            info!("Reset cancelled by user");
            return Ok(());
        }
    }

    warn!(symbol = %symbol, "Force reset confirmed");
    let (symbol, reason) = (symbol.to_string(), reason.to_string());
    let outcome = with_memory(config, |memory| async move {
        let outcome = memory.force_reset(&symbol, confirmed, &reason).await;
        (memory, outcome)
    })
    .await?;
    report(&outcome)
}

/// Check storage connectivity and print the health report
pub async fn health(config: &Config) -> Result<()> {
    let memory = TradingMemory::from_config(config.clone());
    let started = memory.start().await;
    let report = memory.health();
    print_json(&report)?;
    memory.shutdown().await;

    started.context("Storage is unreachable")?;
    if !report.storage_healthy {
        anyhow::bail!("Storage health check failed");
    }
    Ok(())
}

/// Show current configuration (password masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

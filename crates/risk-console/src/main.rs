//! Risk Console
//!
//! Operator commands against the persisted risk state: inspect it, reset
//! daily or weekly counters, flip the kill switch, and record manual exits.
//!
//! The console edits the state file directly. A running bot keeps its own
//! copy in memory, so stop it first (or expect it to overwrite the change
//! on its next write).

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use market_core::config::Config;
use market_core::types::ExitReason;
use risk_manager::{RiskManager, RiskSummary};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "riskctl")]
#[command(about = "Inspect and override the intraday bot's risk state")]
#[command(version)]
struct Cli {
    /// Config file (defaults to RISK_CONFIG_FILE, then built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Skip the typed confirmation
    #[arg(short, long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show today's risk summary
    Status {
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Start a fresh trading day (archives the current state)
    ResetDaily,
    /// Zero the weekly P&L and trade counters
    ResetWeekly,
    /// Engage or clear the kill switch
    #[command(subcommand)]
    KillSwitch(KillSwitchCommand),
    /// Record exits for positions closed outside the bot
    ForceExit(ForceExitArgs),
}

#[derive(Subcommand, Debug)]
enum KillSwitchCommand {
    Activate {
        #[arg(long)]
        reason: String,
    },
    Deactivate {
        /// Operator clearing the switch
        #[arg(long)]
        authorized_by: String,
    },
}

#[derive(Args, Debug)]
struct ForceExitArgs {
    /// Exit one symbol
    #[arg(long, conflicts_with = "all", required_unless_present = "all")]
    symbol: Option<String>,

    /// Exit every open position
    #[arg(long)]
    all: bool,

    /// Fill price per symbol, e.g. --fill NIFTY24500CE=182.5 (repeatable)
    #[arg(long = "fill", value_parser = parse_fill, required = true)]
    fills: Vec<(String, Decimal)>,
}

fn parse_fill(raw: &str) -> std::result::Result<(String, Decimal), String> {
    let (symbol, price) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected SYMBOL=PRICE, got '{}'", raw))?;
    let price = Decimal::from_str(price.trim()).map_err(|e| format!("bad price: {}", e))?;
    if symbol.trim().is_empty() || price <= Decimal::ZERO {
        return Err(format!("invalid fill '{}'", raw));
    }
    Ok((symbol.trim().to_string(), price))
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so `status --json` stays machine readable
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "riskctl=info,risk_manager=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => {
            dotenvy::dotenv().ok();
            Config::load(Some(path))
                .with_context(|| format!("Failed to load config from {:?}", path))?
        }
        None => Config::from_env().context("Failed to load configuration")?,
    };

    // Status never touches the file
    if let Command::Status { json } = cli.command {
        let risk = RiskManager::from_config_read_only(&config)
            .await
            .context("Failed to read risk state")?;
        let summary = risk.summary().await;
        if json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        } else {
            print_summary(&summary);
        }
        return Ok(());
    }

    let risk = RiskManager::from_config(&config)
        .await
        .context("Failed to open risk state")?;

    match cli.command {
        // Read-only, handled above
        Command::Status { .. } => return Ok(()),
        Command::ResetDaily => {
            confirm(cli.yes, "Reset today's P&L, trade counts, and open positions", "RESET")?;
            risk.reset_daily().await;
            info!("Daily state reset");
        }
        Command::ResetWeekly => {
            confirm(cli.yes, "Reset weekly P&L and trade count", "RESET")?;
            risk.reset_weekly().await;
            info!("Weekly counters reset");
        }
        Command::KillSwitch(KillSwitchCommand::Activate { reason }) => {
            confirm(cli.yes, "Halt all new entries", "KILL")?;
            risk.activate_kill_switch(&reason).await;
        }
        Command::KillSwitch(KillSwitchCommand::Deactivate { authorized_by }) => {
            if !risk.is_kill_switch_active() {
                println!("Kill switch is not active");
                return Ok(());
            }
            confirm(cli.yes, "Resume new entries", "RESUME")?;
            risk.deactivate_kill_switch(&authorized_by).await?;
        }
        Command::ForceExit(args) => force_exit(&risk, args, cli.yes).await?,
    }

    risk.save().await.context("Failed to write risk state")?;
    Ok(())
}

async fn force_exit(risk: &RiskManager, args: ForceExitArgs, yes: bool) -> Result<()> {
    let open = risk.open_positions().await;
    if open.is_empty() {
        println!("No open positions");
        return Ok(());
    }

    let targets: Vec<String> = match &args.symbol {
        Some(symbol) => {
            if !open.iter().any(|p| &p.symbol == symbol) {
                bail!("No open position for {}", symbol);
            }
            vec![symbol.clone()]
        }
        None => open.iter().map(|p| p.symbol.clone()).collect(),
    };

    let fills: BTreeMap<String, Decimal> = args.fills.into_iter().collect();
    let missing: Vec<&str> = targets
        .iter()
        .filter(|s| !fills.contains_key(*s))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        bail!("Missing --fill price for: {}", missing.join(", "));
    }

    for position in open.iter().filter(|p| targets.contains(&p.symbol)) {
        println!(
            "  {}: {} @ {} -> {}",
            position.symbol, position.quantity, position.entry_price, fills[&position.symbol]
        );
    }
    confirm(yes, "Record these exits as manual", "EXIT")?;

    for symbol in &targets {
        match risk
            .register_exit(symbol, fills[symbol], ExitReason::Manual)
            .await?
        {
            Some(trade) => println!("  {} closed, P&L {}", symbol, trade.pnl),
            None => println!("  {} was already closed", symbol),
        }
    }
    Ok(())
}

/// Ask the operator to type `word` unless `--yes` was given.
fn confirm(yes: bool, action: &str, word: &str) -> Result<()> {
    if yes {
        return Ok(());
    }
    print!("{}. Type '{}' to confirm: ", action, word);
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    if answer.trim() != word {
        bail!("Cancelled");
    }
    Ok(())
}

fn print_summary(summary: &RiskSummary) {
    let status = if summary.kill_switch.active {
        format!(
            "KILL SWITCH ACTIVE ({})",
            summary.kill_switch.message.as_deref().unwrap_or("no reason")
        )
    } else if summary.circuit_breaker.tripped {
        match summary.circuit_breaker.resume_at {
            Some(until) => format!("CIRCUIT BREAKER (until {})", until),
            None => "CIRCUIT BREAKER".to_string(),
        }
    } else {
        "TRADING ENABLED".to_string()
    };

    println!("Trading date: {}", summary.trading_date);
    println!("Status:       {}", status);
    println!();
    println!("Today");
    println!(
        "  P&L:                {} (remaining loss {})",
        summary.daily_pnl, summary.remaining_daily_loss
    );
    println!(
        "  Trades:             {}/{}",
        summary.daily_trades, summary.max_trades_per_day
    );
    match summary.win_rate() {
        Some(rate) => println!(
            "  Winners/losers:     {}/{} ({}%)",
            summary.daily_winners,
            summary.daily_losers,
            rate.round_dp(1)
        ),
        None => println!("  Winners/losers:     0/0"),
    }
    println!("  Consecutive losses: {}", summary.consecutive_losses);
    println!(
        "  Capital deployed:   {}/{}",
        summary.capital_deployed, summary.max_capital_deployed
    );
    println!();
    println!("This week");
    println!("  P&L:    {}", summary.weekly_pnl);
    println!("  Trades: {}", summary.weekly_trades);

    if !summary.open_positions.is_empty() {
        println!();
        println!("Open positions");
        for p in &summary.open_positions {
            println!(
                "  {} {:?} {} @ {} stop {} phase {:?}",
                p.symbol, p.direction, p.quantity, p.entry_price, p.current_stop_loss, p.phase
            );
        }
    }
    if !summary.blocked_symbols.is_empty() {
        println!();
        println!("Blocked symbols");
        for (symbol, until) in &summary.blocked_symbols {
            println!("  {} until {}", symbol, until);
        }
    }
    if !summary.recent_trades.is_empty() {
        println!();
        println!("Recent trades");
        for t in &summary.recent_trades {
            println!(
                "  {} {} {} -> {} P&L {}",
                t.symbol, t.exit_reason, t.entry_price, t.exit_price, t.pnl
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fill() {
        assert_eq!(
            parse_fill("NIFTY24500CE=182.5").unwrap(),
            ("NIFTY24500CE".to_string(), Decimal::new(1825, 1))
        );
        assert!(parse_fill("NIFTY24500CE").is_err());
        assert!(parse_fill("X=0").is_err());
        assert!(parse_fill("=10").is_err());
    }

    #[test]
    fn test_force_exit_requires_target() {
        assert!(Cli::try_parse_from(["riskctl", "force-exit", "--fill", "X=1"]).is_err());
        assert!(Cli::try_parse_from(["riskctl", "force-exit", "--all", "--fill", "X=1"]).is_ok());
        assert!(Cli::try_parse_from([
            "riskctl", "force-exit", "--all", "--symbol", "X", "--fill", "X=1"
        ])
        .is_err());
    }

    #[test]
    fn test_cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}

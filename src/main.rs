//! Spot Trading Bot
//!
//! Trades spot pairs on an SMA crossover signal, gated by daily-loss,
//! balance, and position-count limits, with exchange-side stop-loss and
//! take-profit orders on every entry.

mod api;
mod bot;
mod error;
mod models;
mod trading;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::{BinanceClient, Gateway, PaperExchange};
use crate::bot::{handle_command, normalize_symbol, run_console, Bot, ConsoleCommand};
use crate::trading::{ExchangeConfig, ExchangeKind, TradingConfig, TradingEngine};

/// Spot trading bot CLI.
#[derive(Parser)]
#[command(name = "spotbot")]
#[command(about = "SMA crossover spot trading bot with risk limits", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Simulate fills locally against live market data
    #[arg(long, global = true)]
    paper: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler and interactive console
    Run {
        /// Enable automated trading immediately
        #[arg(long)]
        auto_start: bool,
    },

    /// Run one trade attempt and exit
    Trade {
        /// Instrument (e.g., BTC/USDT); defaults to DEFAULT_SYMBOL
        symbol: Option<String>,
    },

    /// Show the current price
    Price {
        symbol: Option<String>,
    },

    /// Show the current trading signal
    Signal {
        symbol: Option<String>,
    },

    /// Show account balances
    Balance,

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("Invalid log level")?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let trading_config = TradingConfig::from_env().context("Invalid trading configuration")?;
    let exchange_config = load_exchange_config(cli.paper)?;

    if let Commands::Config = cli.command {
        print_config(&trading_config, &exchange_config);
        return Ok(());
    }

    let gateway = build_gateway(&exchange_config, &trading_config)?;
    let engine = TradingEngine::new(trading_config, gateway);

    let command = match cli.command {
        Commands::Run { auto_start } => return run(engine, auto_start).await,
        Commands::Trade { symbol } => ConsoleCommand::Trade(parse_symbol(symbol)?),
        Commands::Price { symbol } => ConsoleCommand::Price(parse_symbol(symbol)?),
        Commands::Signal { symbol } => ConsoleCommand::Signal(parse_symbol(symbol)?),
        Commands::Balance => ConsoleCommand::Balance,
        Commands::Config => return Ok(()),
    };

    println!("{}", handle_command(&engine, command).await?);
    Ok(())
}

async fn run(engine: TradingEngine, auto_start: bool) -> Result<()> {
    if auto_start {
        engine.start_trading();
    }

    let mut bot = Bot::new(engine.clone());
    let shutdown = bot.shutdown_handle();

    let console = tokio::spawn(async move {
        if let Err(e) = run_console(engine, shutdown).await {
            warn!(error = %e, "Console stopped");
        }
    });

    bot.run().await?;
    console.abort();
    info!("Goodbye");
    Ok(())
}

/// Load exchange settings, forcing paper mode when requested on the CLI.
fn load_exchange_config(paper: bool) -> Result<ExchangeConfig> {
    ExchangeConfig::from_lookup(|key| {
        if paper && key == "EXCHANGE_NAME" {
            return Some(ExchangeKind::Paper.to_string());
        }
        std::env::var(key).ok()
    })
    .context("Invalid exchange configuration")
}

fn build_gateway(exchange: &ExchangeConfig, trading: &TradingConfig) -> Result<Arc<dyn Gateway>> {
    let gateway: Arc<dyn Gateway> = match exchange.kind {
        ExchangeKind::Binance => {
            Arc::new(BinanceClient::new(exchange).context("Failed to create Binance client")?)
        }
        ExchangeKind::Paper => {
            let market = BinanceClient::public(exchange.sandbox)
                .context("Failed to create market data client")?;
            Arc::new(PaperExchange::new(
                Arc::new(market),
                &trading.quote_asset,
                exchange.paper_balance,
                exchange.paper_fee_rate,
            ))
        }
    };
    info!(exchange = %exchange.kind, sandbox = exchange.sandbox, "Gateway initialized");
    Ok(gateway)
}

fn parse_symbol(symbol: Option<String>) -> Result<Option<String>> {
    symbol
        .map(|s| normalize_symbol(&s).map_err(anyhow::Error::msg))
        .transpose()
}

fn print_config(trading: &TradingConfig, exchange: &ExchangeConfig) {
    let set = |v: &Option<String>| if v.is_some() { "set" } else { "not set" };

    println!("\n=== Trading Configuration ===\n");
    println!("Instrument:");
    println!("  Default Symbol:       {}", trading.default_symbol);
    println!("  Quote Asset:          {}", trading.quote_asset);
    println!("  Timeframe:            {}", trading.timeframe);

    println!("\nSizing & Exits:");
    println!("  Trade Amount:         {} {}", trading.trade_amount, trading.quote_asset);
    println!("  Stop Loss:            {}%", trading.stop_loss_percent);
    println!("  Take Profit:          {}%", trading.take_profit_percent);

    println!("\nRisk Management:");
    println!("  Max Positions:        {}", trading.max_positions);
    println!("  Max Daily Loss:       {} {}", trading.max_daily_loss, trading.quote_asset);
    println!("  Min Balance:          {} {}", trading.min_balance, trading.quote_asset);

    println!("\nSignal:");
    println!("  SMA Windows:          {}/{}", trading.short_window, trading.long_window);
    println!("  Min Confidence:       {:.2}", trading.min_confidence);
    println!("  Poll Interval:        {}s", trading.poll_interval_secs);
    println!("  Gateway Timeout:      {}s", trading.gateway_timeout_secs);

    println!("\n=== Exchange Configuration ===\n");
    println!("  Exchange:             {}", exchange.kind);
    println!("  Sandbox:              {}", exchange.sandbox);
    println!("  API Key:              {}", set(&exchange.api_key));
    println!("  API Secret:           {}", set(&exchange.api_secret));
    if exchange.kind == ExchangeKind::Paper {
        println!("  Paper Balance:        {} {}", exchange.paper_balance, trading.quote_asset);
        println!("  Paper Fee Rate:       {}", exchange.paper_fee_rate);
    }
}

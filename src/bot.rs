//! Bot runner: periodic trading loop and interactive console.
//!
//! Handles:
//! - Syncing open positions against their protective orders every tick
//! - Trading the default instrument while automated trading is on
//! - Logging a daily summary when the UTC date changes
//! - Operator commands read from stdin

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::models::{Balance, Position};
use crate::trading::{CloseOutcome, TradingEngine};

/// Scheduler around a shared [`TradingEngine`].
pub struct Bot {
    engine: TradingEngine,
    last_summary_day: NaiveDate,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl Bot {
    pub fn new(engine: TradingEngine) -> Self {
        Self {
            engine,
            last_summary_day: Utc::now().date_naive(),
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Handle for stopping the loop from elsewhere (console, signals).
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.shutdown.clone(),
            wake: self.wake.clone(),
        }
    }

    /// Run until Ctrl-C or a shutdown request.
    pub async fn run(&mut self) -> Result<()> {
        let period = Duration::from_secs(self.engine.config().poll_interval_secs);
        info!(
            exchange = %self.engine.exchange_name(),
            symbol = %self.engine.config().default_symbol,
            poll_interval = ?period,
            trading = self.engine.is_trading(),
            "Starting bot run loop"
        );

        let mut poll_interval = interval(period);
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Register shutdown handler
        let handle = self.shutdown_handle();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            handle.trigger();
        });

        while !self.shutdown.load(Ordering::SeqCst) {
            tokio::select! {
                _ = poll_interval.tick() => {}
                _ = self.wake.notified() => continue,
            }

            if let Err(e) = self.tick().await {
                error!(error = %e, "Error in bot tick");
            }
        }

        let status = self.engine.get_status().await;
        info!(
            open_positions = status.open_positions,
            daily_pnl = %status.daily_pnl,
            "Bot stopped"
        );
        if status.open_positions > 0 {
            warn!("Open positions are not persisted; their protective orders stay on the exchange");
        }
        Ok(())
    }

    /// Single iteration of the main loop.
    async fn tick(&mut self) -> Result<()> {
        debug!("Bot tick");

        // 1. Close positions whose exits filled
        for closed in self.engine.sync_positions().await? {
            info!(
                instrument = %closed.position.instrument,
                reason = %closed.reason,
                realized_pnl = %closed.realized_pnl,
                "Position closed by exchange"
            );
        }

        // 2. Trade the default instrument
        if self.engine.is_trading() {
            let symbol = self.engine.config().default_symbol.clone();
            let outcome = self.engine.execute_trade(&symbol).await?;
            debug!(instrument = %symbol, outcome = %outcome, "Scheduled trade attempt");
        }

        // 3. Daily summary on UTC rollover
        let today = Utc::now().date_naive();
        if today > self.last_summary_day {
            self.log_daily_summary(self.last_summary_day).await;
            self.last_summary_day = today;
        }

        Ok(())
    }

    async fn log_daily_summary(&self, day: NaiveDate) {
        let status = self.engine.get_status().await;
        match self.engine.get_portfolio_summary().await {
            Ok(summary) => info!(
                day = %day,
                daily_pnl = %status.daily_pnl,
                portfolio_value = %summary.total_value,
                quote_asset = %summary.quote_asset,
                open_positions = status.open_positions,
                "Daily summary"
            ),
            Err(e) => warn!(
                day = %day,
                daily_pnl = %status.daily_pnl,
                open_positions = status.open_positions,
                error = %e,
                "Daily summary (portfolio unavailable)"
            ),
        }
    }
}

/// Cloneable stop switch for a running [`Bot`].
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ==================== Console ====================

/// Operator command typed at the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Start,
    Stop,
    Status,
    Positions,
    Portfolio,
    Balance,
    Price(Option<String>),
    Signal(Option<String>),
    Trade(Option<String>),
    Close(String),
    Help,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let command = parts
            .next()
            .map(|c| c.trim_start_matches('/').to_lowercase())
            .ok_or_else(|| "Empty command".to_string())?;
        let symbol = parts.next().map(normalize_symbol).transpose()?;
        if parts.next().is_some() {
            return Err(format!("Too many arguments for '{}'", command));
        }

        let no_args = |cmd: ConsoleCommand| match symbol {
            Some(_) => Err(format!("'{}' takes no arguments", command)),
            None => Ok(cmd),
        };

        match command.as_str() {
            "start" => no_args(ConsoleCommand::Start),
            "stop" => no_args(ConsoleCommand::Stop),
            "status" => no_args(ConsoleCommand::Status),
            "positions" => no_args(ConsoleCommand::Positions),
            "portfolio" => no_args(ConsoleCommand::Portfolio),
            "balance" => no_args(ConsoleCommand::Balance),
            "help" => no_args(ConsoleCommand::Help),
            "quit" | "exit" => no_args(ConsoleCommand::Quit),
            "price" => Ok(ConsoleCommand::Price(symbol)),
            "signal" => Ok(ConsoleCommand::Signal(symbol)),
            "trade" => Ok(ConsoleCommand::Trade(symbol)),
            "close" => symbol
                .map(ConsoleCommand::Close)
                .ok_or_else(|| "Usage: close <SYMBOL>".to_string()),
            other => Err(format!("Unknown command '{}'. Type 'help' for commands.", other)),
        }
    }
}

/// Upper-case a pair and require BASE/QUOTE notation.
pub fn normalize_symbol(raw: &str) -> Result<String, String> {
    let symbol = raw.trim().to_uppercase();
    if !symbol.contains('/') {
        return Err(format!("Invalid symbol '{}'. Use format: BTC/USDT", raw));
    }
    Ok(symbol)
}

const HELP: &str = "\
Commands:
  start              Start automated trading
  stop               Stop automated trading
  status             Engine status and daily P&L
  positions          Open positions
  portfolio          Portfolio value in quote currency
  balance            Account balances
  price [SYMBOL]     Current price (default instrument if omitted)
  signal [SYMBOL]    Current trading signal
  trade [SYMBOL]     Run one trade attempt now
  close <SYMBOL>     Close an open position at market
  help               This help
  quit               Stop the bot";

/// Execute a console command and render the reply.
pub async fn handle_command(engine: &TradingEngine, command: ConsoleCommand) -> Result<String> {
    let default_symbol = || engine.config().default_symbol.clone();

    let reply = match command {
        ConsoleCommand::Start => {
            if engine.start_trading() {
                "Automated trading started".to_string()
            } else {
                "Trading is already running".to_string()
            }
        }
        ConsoleCommand::Stop => {
            if engine.stop_trading() {
                "Automated trading stopped".to_string()
            } else {
                "Trading is not running".to_string()
            }
        }
        ConsoleCommand::Status => engine.get_status().await.to_string(),
        ConsoleCommand::Positions => format_positions(&engine.positions().await),
        ConsoleCommand::Portfolio => match engine.get_portfolio_summary().await {
            Ok(summary) => {
                let mut out = format!(
                    "Portfolio value: {:.2} {}\nOpen positions:  {}",
                    summary.total_value,
                    summary.quote_asset,
                    summary.positions.len()
                );
                if !summary.unpriced.is_empty() {
                    out.push_str(&format!("\nUnpriced:        {}", summary.unpriced.join(", ")));
                }
                out
            }
            Err(e) => format!("Error fetching portfolio: {}", e),
        },
        ConsoleCommand::Balance => match engine.balances().await {
            Ok(balances) => format_balances(&balances),
            Err(e) => format!("Error fetching balance: {}", e),
        },
        ConsoleCommand::Price(symbol) => {
            let symbol = symbol.unwrap_or_else(default_symbol);
            match engine.quote(&symbol).await {
                Ok(q) => format!(
                    "{}\n  Last:   {}\n  24h:    {}%\n  High:   {}\n  Low:    {}\n  Volume: {}",
                    symbol, q.last, q.change_pct, q.high, q.low, q.volume
                ),
                Err(e) => format!("Error fetching price for {}: {}", symbol, e),
            }
        }
        ConsoleCommand::Signal(symbol) => {
            let symbol = symbol.unwrap_or_else(default_symbol);
            match engine.evaluate_signal(&symbol).await {
                Ok(signal) => format!(
                    "{}: {} (confidence {:.2})",
                    symbol,
                    signal.action.to_string().to_uppercase(),
                    signal.confidence
                ),
                Err(e) => format!("Error computing signal for {}: {}", symbol, e),
            }
        }
        ConsoleCommand::Trade(symbol) => {
            let symbol = symbol.unwrap_or_else(default_symbol);
            let outcome = engine.execute_trade(&symbol).await?;
            match outcome.order() {
                Some(order) => format!("Trade executed: {} (order {})", outcome, order.id),
                None => outcome.to_string(),
            }
        }
        ConsoleCommand::Close(symbol) => match engine.close_position(&symbol).await? {
            CloseOutcome::Closed(closed) => format!(
                "Closed {} at {} (P&L {:.2})",
                symbol, closed.exit_price, closed.realized_pnl
            ),
            CloseOutcome::NotOpen => format!("No open position for {}", symbol),
            CloseOutcome::Failed(e) => format!("Failed to close {}: {}", symbol, e),
        },
        ConsoleCommand::Help => HELP.to_string(),
        ConsoleCommand::Quit => "Shutting down...".to_string(),
    };
    Ok(reply)
}

/// Read commands from stdin until `quit`, EOF, or shutdown.
pub async fn run_console(engine: TradingEngine, shutdown: ShutdownHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Type 'help' for commands.");

    while !shutdown.is_triggered() {
        let Some(line) = lines.next_line().await? else {
            debug!("Console input closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<ConsoleCommand>() {
            Ok(command) => command,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };
        let quit = command == ConsoleCommand::Quit;

        match handle_command(&engine, command).await {
            Ok(reply) => println!("{}", reply),
            Err(e) => {
                error!(error = %e, "Console command failed");
                println!("Error: {}", e);
            }
        }

        if quit {
            shutdown.trigger();
        }
    }
    Ok(())
}

fn format_positions(positions: &[Position]) -> String {
    if positions.is_empty() {
        return "No open positions".to_string();
    }
    let mut out = format!(
        "{:<12} {:<6} {:>14} {:>12} {:>12} {:>12}",
        "SYMBOL", "SIDE", "QUANTITY", "ENTRY", "STOP", "TARGET"
    );
    for p in positions {
        out.push_str(&format!(
            "\n{:<12} {:<6} {:>14} {:>12} {:>12} {:>12}",
            p.instrument,
            p.direction.as_str(),
            p.quantity,
            p.entry_price,
            p.stop_price.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
            p.take_profit_price.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
        ));
    }
    out
}

fn format_balances(balances: &[Balance]) -> String {
    if balances.is_empty() {
        return "No balances".to_string();
    }
    let mut out = format!("{:<8} {:>16} {:>16}", "ASSET", "FREE", "LOCKED");
    for b in balances {
        out.push_str(&format!("\n{:<8} {:>16} {:>16}", b.asset, b.free, b.locked));
    }
    out
}

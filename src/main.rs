// ─────────────────────────────────────────────────────────────────────────────
// swing-engine-rs: scheduled-tick equity swing engine
//
// One external invocation = one tick. A full tick runs:
//   reconcile pending orders → reconcile positions → exit monitor →
//   scanner phase 1 → scanner phase 2 → execution router → persist state
// Ticks never overlap (file lock); runtime errors degrade their stage and the
// tick always completes with a summary.
// ─────────────────────────────────────────────────────────────────────────────
mod broker;
mod config;
mod exits;
mod indicators;
mod marketdata;
mod regime;
mod router;
mod scanner;
mod signal;
mod state;
mod store;
mod strength;
mod structure;
mod tracker;

use std::time::Instant;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use broker::{BrokerClient, LiveBroker, SimBroker};
use config::{EngineConfig, EngineError, KnowledgeBase, Watchlist};
use marketdata::MarketDataClient;
use signal::{Candidate, ExecMode, ScoreConfig};
use state::{PaperLedger, SentSignal, TickLock, TradingState};
use store::{BarStore, Interval};
use structure::StructureParams;

#[derive(Parser)]
#[command(name = "swing-engine-rs", about = "Scheduled-tick equity swing engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full control loop once
    FullScan,
    /// Run only the exit monitor and reconcilers (high-frequency risk control)
    ExitOnly,
    /// Backfill the local OHLCV store
    SyncStore {
        /// Comma-separated tickers (e.g. TSLA,KO,NVDA)
        #[arg(long, default_value = "")]
        tickers: String,
        /// Sync the configured watchlist instead
        #[arg(long)]
        watchlist: bool,
        #[arg(long, default_value = "1h")]
        interval: String,
        #[arg(long, default_value_t = 120)]
        days: i64,
        /// Auto-backfill if the local gap exceeds N days
        #[arg(long = "gap-threshold", default_value_t = 7)]
        gap_threshold: i64,
        /// Cap for auto-backfill lookback days
        #[arg(long = "max-auto-days", default_value_t = 730)]
        max_auto_days: i64,
    },
    /// One-shot reconciliation of local trading state against the broker
    Reconcile,
    /// Manually set a stop-out cooldown for a symbol
    Stopout {
        symbol: String,
        #[arg(long)]
        hours: Option<f64>,
        #[arg(long, default_value = "stopout")]
        reason: String,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let cfg = match EngineConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("[CONFIG] {}", e);
            std::process::exit(2);
        }
    };
    info!(
        "swing-engine-rs starting ({}{})",
        if cfg.env.is_live() { "live" } else { "paper" },
        if cfg.env.live_armed() && cfg.env.live_submit { ", SUBMITS ARMED" } else { "" }
    );

    let result = match cli.command {
        Command::FullScan => run_full_scan(&cfg).await,
        Command::ExitOnly => run_exit_only(&cfg).await,
        Command::SyncStore { tickers, watchlist, interval, days, gap_threshold, max_auto_days } => {
            run_sync_store(&cfg, &tickers, watchlist, &interval, days, gap_threshold, max_auto_days)
                .await
        }
        Command::Reconcile => run_reconcile(&cfg).await,
        Command::Stopout { symbol, hours, reason } => run_stopout(&cfg, &symbol, hours, &reason),
    };

    match result {
        Ok(()) => {}
        Err(EngineError::StateConflict(msg)) => {
            // another tick is active; exit quietly without touching state
            warn!("[TICK] {}", msg);
        }
        Err(EngineError::Configuration(msg)) => {
            error!("[CONFIG] {}", msg);
            std::process::exit(2);
        }
        Err(e) => {
            // runtime errors never propagate a non-zero exit from a tick
            error!("[TICK] {}", e);
        }
    }
}

fn make_broker(cfg: &EngineConfig) -> Result<Box<dyn BrokerClient>, EngineError> {
    if LiveBroker::has_credentials() {
        return Ok(Box::new(LiveBroker::from_env()?));
    }
    if cfg.env.live_armed() {
        return Err(EngineError::Configuration(
            "live trading enabled but broker credentials are missing".into(),
        ));
    }
    warn!("[BROKER] no credentials, using in-memory sim broker");
    Ok(Box::new(SimBroker::new(cfg.paper_equity)))
}

fn signal_key(sig: &Candidate, now: DateTime<Utc>) -> String {
    format!("{}_{}_{}", sig.ticker, now.format("%Y-%m-%d"), sig.score / 10 * 10)
}

fn deadline_hit(started: Instant, cfg: &EngineConfig, stage: &str) -> bool {
    if started.elapsed().as_secs() > cfg.tick_deadline_secs {
        warn!(
            "[TICK] deadline ({}s) reached after {}, deferring the rest to the next tick",
            cfg.tick_deadline_secs, stage
        );
        true
    } else {
        false
    }
}

// ─── full-scan tick ──────────────────────────────────────────────────────────

async fn run_full_scan(cfg: &EngineConfig) -> Result<(), EngineError> {
    let _lock = TickLock::acquire(cfg.lock_path())?;
    let started = Instant::now();
    let now = Utc::now();

    let store = BarStore::new(cfg.store_dir());
    let md = MarketDataClient::from_env()?;
    let mut broker = make_broker(cfg)?;
    let ledger = PaperLedger::new(cfg.ledger_path());
    let watchlist = Watchlist::load(&cfg.data_dir.join("watchlist.json"))?;
    let kb = KnowledgeBase::load(&cfg.data_dir.join("knowledge_base.json"));
    let mut state = TradingState::load(&cfg.state_path());

    // 1+2: advance pending orders, then square the position book
    tracker::reconcile_pending_orders(broker.as_mut(), &mut state, cfg.cooldown_hours).await;
    if let Err(e) = tracker::reconcile_open_positions(broker.as_mut(), &mut state).await {
        warn!("[TICK] position reconcile degraded: {}", e);
    }
    state.save(&cfg.state_path())?;
    if deadline_hit(started, cfg, "reconciliation") {
        return Ok(());
    }

    // 3: exits before any new risk goes on
    exits::run_exit_monitor(broker.as_mut(), &mut state, &ledger, cfg, now).await;
    state.save(&cfg.state_path())?;
    if deadline_hit(started, cfg, "exit monitor") {
        return Ok(());
    }

    // 4: market regime gates the whole buy side
    let regime = regime::get_market_regime(&store, &md, cfg, true).await;
    info!("[REGIME] {}", regime.detail);
    if !regime.signal_allowed {
        info!("[TICK] {} regime: buy scanning suspended", regime.regime.as_str());
        state.record_no_signal();
        println!("NO_SIGNAL");
        state.save(&cfg.state_path())?;
        return Ok(());
    }

    let (ret5_gate_pct, ret5_level) = regime::ret5_gate(state.no_signal_streak);
    info!(
        "[GATE] {}: ret_5d <= {:.1}% (no-signal streak {})",
        ret5_level, ret5_gate_pct, state.no_signal_streak
    );

    // 5: two-phase scan
    let score_cfg = ScoreConfig::default();
    let struct_params = StructureParams::default();
    let p1 = scanner::phase1_filter(&store, &md, &watchlist.tickers, cfg.scan_concurrency).await;
    if deadline_hit(started, cfg, "scanner phase 1") {
        state.save(&cfg.state_path())?;
        return Ok(());
    }
    let scored = scanner::phase2_score(
        &store,
        &md,
        &p1,
        cfg,
        &kb,
        &score_cfg,
        &struct_params,
        now.naive_utc(),
    )
    .await;
    if deadline_hit(started, cfg, "scanner phase 2") {
        state.save(&cfg.state_path())?;
        return Ok(());
    }

    // ret5 hard gate → routing → per-symbol threshold
    let raw_count = scored.len();
    let mut routed_count = 0usize;
    let mut passing: Vec<Candidate> = Vec::new();
    for mut sig in scored {
        if sig.ret_5d > ret5_gate_pct {
            continue;
        }
        scanner::route_exec_mode(&mut sig, cfg.atr_pct14_max);
        if sig.exec_mode == ExecMode::Skip {
            continue;
        }
        routed_count += 1;
        let threshold = regime::score_threshold(&sig.ticker, &regime, &watchlist);
        sig.score_threshold = threshold;
        if sig.score >= threshold {
            passing.push(sig);
        }
    }
    info!(
        "[FILTER] raw {} -> routed {} -> above threshold {}",
        raw_count,
        routed_count,
        passing.len()
    );

    // per-day signal dedup (ticker + date + score bucket)
    let mut new_buy: Vec<Candidate> = Vec::new();
    for sig in passing {
        let key = signal_key(&sig, now);
        if state.sent_signal_seen(&key) {
            continue;
        }
        state.mark_signal_sent(
            &key,
            SentSignal {
                ticker: sig.ticker.clone(),
                score: sig.score,
                price: sig.price,
                time: now.to_rfc3339(),
            },
        );
        new_buy.push(sig);
    }

    let (strong, normal): (Vec<Candidate>, Vec<Candidate>) =
        new_buy.iter().cloned().partition(|s| s.is_strong(&score_cfg));

    for sig in &strong {
        println!("BUY_SIGNAL:{}:{}", sig.ticker, sig.score);
        info!(
            "[BUY] {} score={} mode={} price=${} sl=${} tp=${} ({})",
            sig.ticker,
            sig.score,
            sig.exec_mode.as_str(),
            sig.price,
            sig.sl_price,
            sig.tp_price,
            sig.exec_reason
        );
    }
    if !normal.is_empty() {
        println!("BUY_SIGNAL_BATCH:{}", normal.len());
        let mut by_score = normal.clone();
        by_score.sort_by(|a, b| b.score.cmp(&a.score));
        for s in by_score.iter().take(10) {
            info!("[BATCH] {} | {} | score {} | ${}", s.ticker, s.exec_mode.as_str(), s.score, s.price);
        }
    }

    // 6: execution router — strong set only, at most one order
    let out = router::run_execution_select(
        broker.as_mut(),
        &store,
        &mut state,
        &ledger,
        &strong,
        cfg,
        now,
    )
    .await;
    state.last_exec_skip = Some(router::build_skip_summary(&out.skips, now));

    // 7: summary + streak accounting
    if new_buy.is_empty() {
        state.record_no_signal();
        println!("NO_SIGNAL");
    } else {
        state.record_new_buys();
        println!(
            "SCAN_SUMMARY: buys={} strong={} ordered={}",
            new_buy.len(),
            strong.len(),
            if out.placed.is_some() { 1 } else { 0 }
        );
    }
    state.save(&cfg.state_path())?;
    Ok(())
}

// ─── exit-only tick ──────────────────────────────────────────────────────────

async fn run_exit_only(cfg: &EngineConfig) -> Result<(), EngineError> {
    let _lock = TickLock::acquire(cfg.lock_path())?;
    let now = Utc::now();

    let mut broker = make_broker(cfg)?;
    let ledger = PaperLedger::new(cfg.ledger_path());
    let mut state = TradingState::load(&cfg.state_path());

    tracker::reconcile_pending_orders(broker.as_mut(), &mut state, cfg.cooldown_hours).await;
    if let Err(e) = tracker::reconcile_open_positions(broker.as_mut(), &mut state).await {
        warn!("[TICK] position reconcile degraded: {}", e);
    }

    if state.open_positions.is_empty() {
        info!("EXIT_ONLY: no open positions in local state");
        state.save(&cfg.state_path())?;
        return Ok(());
    }

    let out = exits::run_exit_monitor(broker.as_mut(), &mut state, &ledger, cfg, now).await;
    info!(
        "EXIT_ONLY: events={} submitted={} escalated={}",
        out.events, out.submitted, out.escalated
    );
    state.save(&cfg.state_path())?;
    Ok(())
}

// ─── sync-store ──────────────────────────────────────────────────────────────

async fn run_sync_store(
    cfg: &EngineConfig,
    tickers: &str,
    use_watchlist: bool,
    interval: &str,
    days: i64,
    gap_threshold: i64,
    max_auto_days: i64,
) -> Result<(), EngineError> {
    let interval: Interval = interval.parse()?;
    let mut list: Vec<String> = if use_watchlist {
        Watchlist::load(&cfg.data_dir.join("watchlist.json"))?.tickers
    } else {
        tickers
            .split(',')
            .map(|t| t.trim().to_uppercase())
            .filter(|t| !t.is_empty())
            .collect()
    };
    if list.is_empty() {
        return Err(EngineError::Configuration(
            "no tickers provided; use --tickers or --watchlist".into(),
        ));
    }
    // the daily store always carries the benchmark for RS baselines
    if interval == Interval::Day1 && !list.contains(&cfg.benchmark) {
        list.insert(0, cfg.benchmark.clone());
    }

    let store = BarStore::new(cfg.store_dir());
    let md = MarketDataClient::from_env()?;
    for t in &list {
        match store
            .sync_and_load(&md, t, interval, days, gap_threshold, max_auto_days)
            .await
        {
            Ok(bars) => {
                let range = match (bars.first(), bars.last()) {
                    (Some(a), Some(b)) => format!("{} -> {}", a.ts, b.ts),
                    _ => "-".to_string(),
                };
                println!("{:<8} {} rows={:>6}  range={}", t, interval.as_str(), bars.len(), range);
            }
            Err(e) => warn!("[SYNC] {} failed: {}", t, e),
        }
    }
    Ok(())
}

// ─── reconcile / stopout ─────────────────────────────────────────────────────

async fn run_reconcile(cfg: &EngineConfig) -> Result<(), EngineError> {
    let _lock = TickLock::acquire(cfg.lock_path())?;
    let mut broker = make_broker(cfg)?;
    let mut state = TradingState::load(&cfg.state_path());
    let summary = tracker::reconcile_open_positions(broker.as_mut(), &mut state).await?;
    state.save(&cfg.state_path())?;
    println!(
        "RECONCILE added={:?} removed={:?} broker={} local={}",
        summary.added, summary.removed, summary.broker_count, summary.local_count
    );
    Ok(())
}

fn run_stopout(
    cfg: &EngineConfig,
    symbol: &str,
    hours: Option<f64>,
    reason: &str,
) -> Result<(), EngineError> {
    let _lock = TickLock::acquire(cfg.lock_path())?;
    let hours = hours.unwrap_or(cfg.cooldown_hours);
    let until = state::iso_after_hours(hours);
    let mut state = TradingState::load(&cfg.state_path());
    state.set_cooldown(symbol, &until, reason);
    state.save(&cfg.state_path())?;
    println!("COOLDOWN_SET {} until {} reason={}", symbol, until, reason);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::StructureScan;
    use chrono::NaiveDate;

    #[test]
    fn signal_key_buckets_by_tens() {
        let bar_time = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap().and_hms_opt(10, 0, 0).unwrap();
        let sig = Candidate {
            ticker: "TSLA".into(),
            score: 87,
            kb_tag: String::new(),
            price: 50.0,
            bar_time,
            bar_close: 50.0,
            price_source: "1H_bar_close",
            scan_time: bar_time,
            rsi14: 30.0,
            bb_pct: 0.1,
            macd_hist: -0.1,
            vol_ratio: 1.0,
            ret_5d: -4.0,
            atr_pct14: 2.0,
            above_ma200: true,
            above_ma50: true,
            ma50_slope: 0.0,
            rs_1y: 0.0,
            suggest_price: 50.0,
            suggest_note: String::new(),
            tp_price: 56.5,
            sl_price: 46.0,
            rr_ratio: 1.6,
            risk_mode: "strong",
            details: Vec::new(),
            warnings: Vec::new(),
            structure: StructureScan::default(),
            exec_mode: ExecMode::Mr,
            exec_reason: String::new(),
            stabilization_confirmed: false,
            score_threshold: 70,
        };
        let now = DateTime::parse_from_rfc3339("2025-01-01T12:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(signal_key(&sig, now), "TSLA_2025-01-01_80");
    }
}

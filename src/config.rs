// ─────────────────────────────────────────────────────────────────────────────
// config.rs — Engine configuration and trading-environment guards
//
// Every knob is resolved from the environment exactly once at startup and
// carried through the tick as plain data. The hot path never re-reads env.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("upstream data error: {0}")]
    UpstreamData(String),
    #[error("broker error: {0}")]
    Broker(String),
    #[error("tick already running: {0}")]
    StateConflict(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

// ─── Trading environment ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingEnvKind {
    Paper,
    Live,
}

/// Cross-cutting paper/live flags, resolved once and passed down explicitly.
#[derive(Debug, Clone, Copy)]
pub struct TradingEnv {
    pub kind: TradingEnvKind,
    /// `LIVE_TRADING` hard-enable guard. Without it every live submit fails.
    pub live_enabled: bool,
    /// `LIVE_SUBMIT=1` switches from dry-run to real submission under live.
    pub live_submit: bool,
}

impl TradingEnv {
    pub fn from_env() -> Self {
        let kind = match std::env::var("TRADING_ENV").as_deref() {
            Ok("live") | Ok("LIVE") | Ok("Live") => TradingEnvKind::Live,
            _ => TradingEnvKind::Paper,
        };
        let live_enabled = std::env::var("LIVE_TRADING")
            .map(|v| {
                let v = v.trim().to_uppercase();
                matches!(v.as_str(), "YES" | "TRUE" | "1" | "YES_I_KNOW")
            })
            .unwrap_or(false);
        let live_submit = std::env::var("LIVE_SUBMIT")
            .map(|v| v.trim() == "1")
            .unwrap_or(false);
        Self { kind, live_enabled, live_submit }
    }

    pub fn is_live(&self) -> bool {
        self.kind == TradingEnvKind::Live
    }

    /// True only when real orders may reach the broker.
    pub fn live_armed(&self) -> bool {
        self.is_live() && self.live_enabled
    }
}

// ─── Engine config ───────────────────────────────────────────────────────────

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// All tunables for one tick. Defaults mirror the documented env surface.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub env: TradingEnv,
    pub data_dir: PathBuf,
    pub benchmark: String,
    pub vix_symbol: String,

    // capital + sizing
    pub paper_equity: f64,
    pub risk_pct_equity: f64,
    pub min_notional: f64,
    pub max_notional: f64,
    pub min_sl_pct: f64,
    pub max_sl_pct: f64,
    pub max_position_pct: f64,

    // router gates
    pub max_open_pos: u32,
    pub max_new_buys_per_day: u32,
    pub max_price_pct_equity: f64,
    pub min_price_usd: f64,
    pub min_dollar_vol_20d: f64,
    pub low_price_liquidity_below: f64,
    pub price_drift_max_pct: f64,
    pub quote_drift_max_pct: f64,
    pub total_risk_cap: f64,
    pub min_cash_buffer_usd: f64,
    pub atr_pct14_max: f64,

    // exits
    pub cooldown_hours: f64,
    pub exit_escalate_max_attempts: u32,

    // scheduling
    pub scan_concurrency: usize,
    pub tick_deadline_secs: u64,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, EngineError> {
        let env = TradingEnv::from_env();
        if env.is_live() && !env.live_enabled {
            log::warn!("[CONFIG] TRADING_ENV=live without LIVE_TRADING hard-enable; all submits will dry-run");
        }
        let data_dir = PathBuf::from(env_str("DATA_DIR", "data"));
        Ok(Self {
            env,
            data_dir,
            benchmark: env_str("BENCHMARK", "SPY"),
            vix_symbol: env_str("VIX_SYMBOL", "^VIX"),

            paper_equity: env_f64("PAPER_EQUITY", 100_000.0),
            risk_pct_equity: env_f64("RISK_PCT_EQUITY", 0.003),
            min_notional: env_f64("MIN_NOTIONAL", 300.0),
            max_notional: env_f64("MAX_NOTIONAL", 6000.0),
            min_sl_pct: env_f64("MIN_SL_PCT", 0.03),
            max_sl_pct: env_f64("MAX_SL_PCT", 0.10),
            max_position_pct: env_f64("MAX_POSITION_PCT", 0.08),

            max_open_pos: env_u32("MAX_OPEN_POS", 1),
            max_new_buys_per_day: env_u32("MAX_NEW_BUYS_PER_DAY", 1),
            max_price_pct_equity: env_f64("MAX_PRICE_PCT_EQUITY", 0.35),
            min_price_usd: env_f64("MIN_PRICE_USD", 5.0),
            min_dollar_vol_20d: env_f64("MIN_DOLLAR_VOL_20D", 2e7),
            low_price_liquidity_below: env_f64("LOW_PRICE_LIQUIDITY_BELOW", 15.0),
            price_drift_max_pct: env_f64("PRICE_DRIFT_MAX_PCT", 0.015),
            quote_drift_max_pct: env_f64("QUOTE_DRIFT_MAX_PCT", 0.006),
            total_risk_cap: env_f64("TOTAL_RISK_CAP", 0.02),
            min_cash_buffer_usd: env_f64("MIN_CASH_BUFFER_USD", 50.0),
            atr_pct14_max: env_f64("ATR_PCT14_MAX", 3.5),

            cooldown_hours: env_f64("COOLDOWN_HOURS", 24.0),
            exit_escalate_max_attempts: env_u32("EXIT_ESCALATE_MAX_ATTEMPTS", 3),

            scan_concurrency: env_u32("SCAN_CONCURRENCY", 8) as usize,
            tick_deadline_secs: env_u32("TICK_DEADLINE_SECS", 300) as u64,
        })
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn trades_dir(&self) -> PathBuf {
        self.data_dir.join("trades")
    }

    pub fn state_path(&self) -> PathBuf {
        self.trades_dir().join("trading_state.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.trades_dir().join("paper_ledger.jsonl")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.trades_dir().join("tick.lock")
    }

    pub fn regime_cache_path(&self) -> PathBuf {
        self.data_dir.join("cache").join("regime.json")
    }
}

// ─── Watchlist + knowledge base ──────────────────────────────────────────────

/// Watchlist file: `{"tickers": [...], "speculative": [...]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Watchlist {
    #[serde(default)]
    pub tickers: Vec<String>,
    #[serde(default)]
    pub speculative: HashSet<String>,
}

impl Watchlist {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!("watchlist {}: {}", path.display(), e))
        })?;
        let mut wl: Watchlist = serde_json::from_str(&raw)?;
        for t in &mut wl.tickers {
            *t = t.trim().to_uppercase();
        }
        wl.tickers.retain(|t| !t.is_empty());
        Ok(wl)
    }

    pub fn is_speculative(&self, ticker: &str) -> bool {
        self.speculative.contains(ticker)
    }
}

/// Operator priority tiers. Tier-1 names get the full score bonus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeBase {
    #[serde(default)]
    pub tier1_core: Vec<String>,
    #[serde(default)]
    pub tier2_focus: Vec<String>,
}

impl KnowledgeBase {
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                log::warn!("[CONFIG] knowledge base parse failed: {}. Using empty.", e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn score_bonus(&self, ticker: &str) -> i32 {
        if self.tier1_core.iter().any(|t| t == ticker) {
            15
        } else if self.tier2_focus.iter().any(|t| t == ticker) {
            8
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kb_bonus_tiers() {
        let kb = KnowledgeBase {
            tier1_core: vec!["NVDA".into()],
            tier2_focus: vec!["KO".into()],
        };
        assert_eq!(kb.score_bonus("NVDA"), 15);
        assert_eq!(kb.score_bonus("KO"), 8);
        assert_eq!(kb.score_bonus("TSLA"), 0);
    }

    #[test]
    fn trading_env_defaults_to_paper() {
        // No TRADING_ENV in a clean test process unless the harness sets it.
        std::env::remove_var("TRADING_ENV");
        std::env::remove_var("LIVE_TRADING");
        let env = TradingEnv::from_env();
        assert_eq!(env.kind, TradingEnvKind::Paper);
        assert!(!env.live_armed());
    }
}

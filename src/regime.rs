// ─────────────────────────────────────────────────────────────────────────────
// regime.rs — Market-regime classifier and entry thresholds
//
// "Don't fight the tape": benchmark trend + 20-day momentum + VIX decide how
// strong a signal has to be before it may buy, and whether buying is allowed
// at all. The result is cached for an hour so hourly ticks share one read.
// ─────────────────────────────────────────────────────────────────────────────
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, Watchlist};
use crate::indicators::rolling_mean;
use crate::marketdata::MarketDataClient;
use crate::store::{BarStore, Interval};

pub const CACHE_TTL_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegimeKind {
    Bull,
    Neutral,
    Bear,
    Panic,
}

impl RegimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegimeKind::Bull => "bull",
            RegimeKind::Neutral => "neutral",
            RegimeKind::Bear => "bear",
            RegimeKind::Panic => "panic",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketRegime {
    pub regime: RegimeKind,
    pub min_score: i32,
    pub vs_ma50: f64,
    pub vs_ma200: f64,
    pub ret_20d: f64,
    pub vix: Option<f64>,
    pub detail: String,
    pub signal_allowed: bool,
    pub generated_at: String,
    #[serde(default)]
    pub cached_at: String,
}

impl Default for MarketRegime {
    fn default() -> Self {
        Self {
            regime: RegimeKind::Neutral,
            min_score: 80,
            vs_ma50: 0.0,
            vs_ma200: 0.0,
            ret_20d: 0.0,
            vix: None,
            detail: "benchmark data unavailable".to_string(),
            signal_allowed: true,
            generated_at: Utc::now().format("%Y-%m-%d %H:%M").to_string(),
            cached_at: String::new(),
        }
    }
}

/// Pure classification, priority strict-to-loose: panic, bear, neutral, bull.
pub fn classify(vs_ma50: f64, vs_ma200: f64, ret_20d: f64, vix: Option<f64>) -> MarketRegime {
    let mut r = MarketRegime {
        vs_ma50: round2(vs_ma50),
        vs_ma200: round2(vs_ma200),
        ret_20d: round2(ret_20d),
        vix,
        ..Default::default()
    };

    if let Some(v) = vix {
        if v > 35.0 {
            r.regime = RegimeKind::Panic;
            r.min_score = 95;
            r.signal_allowed = false;
            r.detail = format!("VIX={:.1} panic, buy signals suspended | vs MA200={:.1}%", v, vs_ma200);
            return r;
        }
    }

    if vs_ma200 < -5.0 && ret_20d < -5.0 {
        r.regime = RegimeKind::Bear;
        r.min_score = 90;
        r.signal_allowed = true;
        r.detail = format!(
            "bear: {:.1}% below MA200, 20d {:.1}% | only score>={} passes",
            vs_ma200.abs(),
            ret_20d,
            r.min_score
        );
    } else if vs_ma50 < -3.0 || ret_20d < -2.0 {
        r.regime = RegimeKind::Neutral;
        r.min_score = 80;
        r.signal_allowed = true;
        r.detail = format!(
            "choppy: vs MA50={:.1}% | 20d={:.1}% | raised to score>={}",
            vs_ma50, ret_20d, r.min_score
        );
    } else {
        r.regime = RegimeKind::Bull;
        r.min_score = 70;
        r.signal_allowed = true;
        r.detail = format!(
            "healthy: vs MA50={:.1}% vs MA200={:.1}% | 20d={:.1}% | score>={}",
            vs_ma50, vs_ma200, ret_20d, r.min_score
        );
    }

    // elevated VIX keeps the bar up even in a bull tape
    if let Some(v) = vix {
        if v > 25.0 && r.regime == RegimeKind::Bull {
            r.min_score = r.min_score.max(75);
            r.detail = format!("{} | VIX={:.1} elevated, threshold {}", r.detail, v, r.min_score);
        }
    }
    r
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Per-symbol threshold on top of the regime floor: speculative names need 80
/// even in a bull tape; choppy tape raises everything to 80.
pub fn score_threshold(ticker: &str, regime: &MarketRegime, watchlist: &Watchlist) -> i32 {
    let base = regime.min_score;
    match regime.regime {
        RegimeKind::Bull => {
            if watchlist.is_speculative(ticker) {
                base.max(80)
            } else {
                base
            }
        }
        RegimeKind::Neutral => base.max(80),
        _ => base,
    }
}

/// Dynamic ret5 entry gate: long droughts loosen the pullback requirement so
/// low-volatility names still get a turn.
pub fn ret5_gate(no_signal_streak: u32) -> (f64, &'static str) {
    if no_signal_streak >= 30 {
        (-2.0, "L2")
    } else if no_signal_streak >= 20 {
        (-2.5, "L1")
    } else {
        (-3.0, "L0")
    }
}

// ─── Cache ───────────────────────────────────────────────────────────────────

fn load_cache(path: &Path, now: DateTime<Utc>) -> Option<MarketRegime> {
    let raw = std::fs::read_to_string(path).ok()?;
    let cached: MarketRegime = serde_json::from_str(&raw).ok()?;
    let ts = DateTime::parse_from_rfc3339(&cached.cached_at).ok()?.with_timezone(&Utc);
    if now - ts < Duration::minutes(CACHE_TTL_MINUTES) {
        Some(cached)
    } else {
        None
    }
}

fn save_cache(path: &Path, regime: &mut MarketRegime, now: DateTime<Utc>) {
    regime.cached_at = now.to_rfc3339();
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    match serde_json::to_string_pretty(regime) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                warn!("[REGIME] cache write failed: {}", e);
            }
        }
        Err(e) => warn!("[REGIME] cache serialize failed: {}", e),
    }
}

/// Classify the current tick from benchmark daily history (+ VIX when it can
/// be fetched). A valid cache entry short-circuits everything.
pub async fn get_market_regime(
    store: &BarStore,
    md: &MarketDataClient,
    cfg: &EngineConfig,
    use_cache: bool,
) -> MarketRegime {
    let cache_path = cfg.regime_cache_path();
    let now = Utc::now();
    if use_cache {
        if let Some(cached) = load_cache(&cache_path, now) {
            return cached;
        }
    }

    let bars = match store
        .sync_and_load(md, &cfg.benchmark, Interval::Day1, 400, 7, 730)
        .await
    {
        Ok(bars) if bars.len() >= 30 => bars,
        Ok(_) | Err(_) => {
            warn!("[REGIME] benchmark {} history unavailable, defaulting to neutral", cfg.benchmark);
            return MarketRegime::default();
        }
    };

    let close: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let n = close.len();
    let price = close[n - 1];
    let ma50 = last_finite(&rolling_mean(&close, 50)).unwrap_or(price);
    let ma200 = last_finite(&rolling_mean(&close, 200)).unwrap_or(price);
    let ret_20d = if n >= 21 { (price / close[n - 21] - 1.0) * 100.0 } else { 0.0 };

    let vs_ma50 = if ma50 != 0.0 { (price / ma50 - 1.0) * 100.0 } else { 0.0 };
    let vs_ma200 = if ma200 != 0.0 { (price / ma200 - 1.0) * 100.0 } else { 0.0 };

    // VIX is best-effort; its absence only disables the panic/elevated rules
    let vix = fetch_vix(md, &cfg.vix_symbol).await;

    let mut regime = classify(vs_ma50, vs_ma200, ret_20d, vix);
    regime.generated_at = now.format("%Y-%m-%d %H:%M").to_string();
    save_cache(&cache_path, &mut regime, now);
    regime
}

fn last_finite(xs: &[f64]) -> Option<f64> {
    xs.iter().rev().find(|v| !v.is_nan()).copied()
}

async fn fetch_vix(md: &MarketDataClient, symbol: &str) -> Option<f64> {
    let end = Utc::now().naive_utc() + Duration::days(1);
    let start = end - Duration::days(7);
    match md.fetch_ohlcv(symbol, Interval::Day1, start, end).await {
        Ok(bars) => bars.last().map(|b| (b.close * 10.0).round() / 10.0),
        Err(e) => {
            warn!("[REGIME] VIX fetch failed: {}", e);
            None
        }
    }
}

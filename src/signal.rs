// ─────────────────────────────────────────────────────────────────────────────
// signal.rs — Per-bar entry scoring and stabilization confirmation
//
// The scorer is a pure function of the bar's indicator row plus injected
// inputs (relative strength, knowledge-base bonus, ScoreConfig). Nothing in
// here reads ambient state, so backtests replay it bit-for-bit.
// ─────────────────────────────────────────────────────────────────────────────
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::indicators::IndicatorRow;
use crate::strength::RS_SENTINEL;
use crate::structure::StructureScan;

pub const PRICE_SOURCE: &str = "1H_bar_close";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecMode {
    Struct,
    Mr,
    Skip,
}

impl ExecMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecMode::Struct => "STRUCT",
            ExecMode::Mr => "MR",
            ExecMode::Skip => "SKIP",
        }
    }
}

/// Scoring knobs. Injected, never read from env mid-scan.
#[derive(Debug, Clone)]
pub struct ScoreConfig {
    pub min_score: i32,
    pub strong_trend_min_score: i32,
    pub take_profit: f64,
    pub take_profit_strong: f64,
    pub stop_loss: f64,
    pub stop_loss_strong: f64,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            min_score: 70,
            strong_trend_min_score: 85,
            take_profit: 0.13,
            take_profit_strong: 0.20,
            stop_loss: -0.08,
            stop_loss_strong: -0.08,
        }
    }
}

/// A scored bar emitted by the scanner.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub ticker: String,
    pub score: i32,
    pub kb_tag: String,
    /// Price discipline: always the triggering 1h bar close.
    pub price: f64,
    pub bar_time: NaiveDateTime,
    pub bar_close: f64,
    pub price_source: &'static str,
    pub scan_time: NaiveDateTime,

    pub rsi14: f64,
    pub bb_pct: f64,
    pub macd_hist: f64,
    pub vol_ratio: f64,
    /// Percent, e.g. −5.5.
    pub ret_5d: f64,
    /// Percent, e.g. 2.1 means ATR14 is 2.1% of price.
    pub atr_pct14: f64,
    pub above_ma200: bool,
    pub above_ma50: bool,
    pub ma50_slope: f64,
    pub rs_1y: f64,

    pub suggest_price: f64,
    pub suggest_note: String,
    pub tp_price: f64,
    pub sl_price: f64,
    pub rr_ratio: f64,
    pub risk_mode: &'static str,

    pub details: Vec<String>,
    pub warnings: Vec<String>,

    pub structure: StructureScan,
    pub exec_mode: ExecMode,
    pub exec_reason: String,

    pub stabilization_confirmed: bool,
    pub score_threshold: i32,
}

impl Candidate {
    pub fn is_strong(&self, cfg: &ScoreConfig) -> bool {
        self.score >= cfg.strong_trend_min_score || self.exec_mode == ExecMode::Struct
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Score the latest bar. The caller attaches structure/exec routing after.
pub fn score_signal(
    row: &IndicatorRow,
    ticker: &str,
    rs_1y: f64,
    kb_bonus: i32,
    cfg: &ScoreConfig,
    now: NaiveDateTime,
) -> Candidate {
    let mut score = 0i32;
    let mut details = Vec::new();
    let mut warnings = Vec::new();

    let rsi = row.rsi14;
    let bb = row.bb_pct20;
    let macd_h = row.macd_hist;
    let vol_r = row.vol_ratio;
    let ret5d = row.ret_5 * 100.0;
    let above200 = row.above_ma200 == 1;
    let above50 = row.above_ma50 == 1;

    // trend
    if above200 {
        score += 30;
        details.push("MA200 above: long-term trend intact".to_string());
    } else if above50 {
        score += 15;
        details.push("above MA50 but below MA200 (mid-term trend only)".to_string());
        warnings.push("not above MA200, elevated risk".to_string());
    } else {
        details.push("below both MA50 and MA200 (downtrend)".to_string());
        warnings.push("trend broken, caution".to_string());
    }

    // RSI pullback depth
    if rsi < 25.0 {
        score += 30;
        details.push(format!("RSI deeply oversold = {:.1}", rsi));
    } else if rsi < 32.0 {
        score += 25;
        details.push(format!("RSI oversold = {:.1}", rsi));
    } else if rsi < 40.0 {
        score += 15;
        details.push(format!("RSI low = {:.1}", rsi));
    } else if rsi < 50.0 {
        score += 5;
        details.push(format!("RSI neutral = {:.1}", rsi));
    } else {
        details.push(format!("RSI high = {:.1}, no pullback yet", rsi));
    }

    // Bollinger position
    if bb < 0.10 {
        score += 20;
        details.push(format!("tagging lower band, BB% = {:.3}", bb));
    } else if bb < 0.20 {
        score += 15;
        details.push(format!("near lower band, BB% = {:.3}", bb));
    } else if bb < 0.35 {
        score += 8;
        details.push(format!("lower-middle band, BB% = {:.3}", bb));
    } else {
        details.push(format!("band position high, BB% = {:.3}", bb));
    }

    // MACD in negative territory = still in the pullback
    if macd_h < 0.0 {
        score += 10;
        details.push(format!("MACD hist negative = {:.3}", macd_h));
    } else {
        details.push(format!("MACD hist positive = {:.3}, momentum up", macd_h));
    }

    // volume sanity
    if vol_r > 0.5 && vol_r < 1.5 {
        score += 5;
        details.push(format!("volume ratio normal = {:.2}", vol_r));
    } else if vol_r > 2.0 {
        score += 3;
        details.push(format!("volume ratio elevated = {:.2}", vol_r));
    }

    // pullback depth over 5 bars
    if ret5d < -10.0 {
        score += 5;
        details.push(format!("deep 5-bar pullback {:.1}%", ret5d));
    } else if ret5d < -5.0 {
        score += 3;
        details.push(format!("5-bar pullback {:.1}%", ret5d));
    } else if ret5d > 5.0 {
        warnings.push(format!("already up {:.1}% over 5 bars, chase risk", ret5d));
    }

    // operator priority tiers
    let kb_tag = if kb_bonus >= 15 {
        details.push(format!("core holding weight +{}", kb_bonus));
        "core".to_string()
    } else if kb_bonus > 0 {
        details.push(format!("focus list weight +{}", kb_bonus));
        "focus".to_string()
    } else {
        String::new()
    };
    score += kb_bonus;

    // relative strength vs benchmark; sentinel means unknown, never a penalty
    if rs_1y != RS_SENTINEL {
        if rs_1y > 10.0 {
            score += 10;
            details.push(format!("strongly outperforming, RS_1Y={:+.1}%", rs_1y));
        } else if rs_1y > 0.0 {
            score += 5;
            details.push(format!("outperforming, RS_1Y={:+.1}%", rs_1y));
        } else if rs_1y > -10.0 {
            details.push(format!("slightly lagging, RS_1Y={:+.1}%", rs_1y));
        } else {
            details.push(format!("badly lagging, RS_1Y={:+.1}%", rs_1y));
        }
    } else {
        details.push("RS_1Y unknown (insufficient history)".to_string());
    }

    score = score.min(100);

    let price = row.close;
    let is_strong = score >= cfg.strong_trend_min_score;
    let tp_pct = if is_strong { cfg.take_profit_strong } else { cfg.take_profit };
    let sl_pct = if is_strong { cfg.stop_loss_strong } else { cfg.stop_loss };
    let rr_ratio = tp_pct / sl_pct.abs();

    // suggested entry from RSI regime and MA20/MA50 proximity
    let ma20 = if row.ma20.is_nan() { price } else { row.ma20 };
    let ma50 = if row.ma50.is_nan() { price } else { row.ma50 };
    let (suggest_price, suggest_note) = if rsi < 25.0 {
        (round2(price * 1.005), "deeply oversold, take the market".to_string())
    } else if rsi < 35.0 && bb < 0.2 {
        (round2(price * 0.995), "deep pullback, bid slightly below".to_string())
    } else if price < ma20 * 0.98 {
        (round2(ma20 * 0.995), format!("wait for a retest of MA20 (${:.2})", ma20))
    } else if price < ma50 * 0.98 {
        (round2(ma50 * 0.995), format!("wait for a retest of MA50 (${:.2})", ma50))
    } else {
        (round2(price * 0.99), "pulling back, bid slightly below".to_string())
    };

    let tp_price = round2(suggest_price * (1.0 + tp_pct));
    let sl_price = round2(suggest_price * (1.0 + sl_pct));

    Candidate {
        ticker: ticker.to_string(),
        score,
        kb_tag,
        price: round2(price),
        bar_time: row.ts,
        bar_close: round2(price),
        price_source: PRICE_SOURCE,
        scan_time: now,
        rsi14: (rsi * 10.0).round() / 10.0,
        bb_pct: (bb * 1000.0).round() / 1000.0,
        macd_hist: (macd_h * 10_000.0).round() / 10_000.0,
        vol_ratio: round2(vol_r),
        ret_5d: (ret5d * 10.0).round() / 10.0,
        atr_pct14: if row.atr_pct14.is_nan() {
            f64::NAN
        } else {
            (row.atr_pct14 * 100.0 * 100.0).round() / 100.0
        },
        above_ma200: above200,
        above_ma50: above50,
        ma50_slope: if row.ma50_slope.is_nan() { 0.0 } else { row.ma50_slope },
        rs_1y,
        suggest_price,
        suggest_note,
        tp_price,
        sl_price,
        rr_ratio: round2(rr_ratio),
        risk_mode: if is_strong { "strong" } else { "normal" },
        details,
        warnings,
        structure: StructureScan::default(),
        exec_mode: ExecMode::Skip,
        exec_reason: String::new(),
        stabilization_confirmed: false,
        score_threshold: cfg.min_score,
    }
}

// ─── Stabilization ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Stabilization {
    pub confirmed: bool,
    pub score_bonus: i32,
    pub signals: Vec<String>,
}

/// Is the oversold reading actually turning, or still a falling knife?
/// Looks at RSI direction, volume drying up, higher lows and the last
/// candle's lower shadow over roughly the last 10 bars.
pub fn check_stabilization(rows: &[IndicatorRow]) -> Stabilization {
    if rows.len() < 10 {
        return Stabilization::default();
    }
    let n = rows.len();
    let mut signals = Vec::new();
    let mut bonus = 0i32;

    let rsi_curr = rows[n - 1].rsi14;
    let rsi_prev = rows[n - 2].rsi14;
    let rsi_prev2 = rows[n - 3].rsi14;

    if rsi_curr > rsi_prev && rsi_prev > rsi_prev2 {
        bonus += 8;
        signals.push(format!(
            "RSI rising two bars ({:.0} -> {:.0} -> {:.0}), buyers stepping in",
            rsi_prev2, rsi_prev, rsi_curr
        ));
    } else if rsi_curr > rsi_prev {
        bonus += 4;
        signals.push(format!("RSI turning up ({:.0} -> {:.0})", rsi_prev, rsi_curr));
    } else {
        bonus -= 5;
        signals.push(format!("RSI still falling ({:.0} -> {:.0}), not stabilized", rsi_prev, rsi_curr));
    }

    // pullback volume vs 20-bar baseline
    let vol_5: f64 = rows[n - 5..].iter().map(|r| r.volume).sum::<f64>() / 5.0;
    let start20 = n.saturating_sub(20);
    let w20 = &rows[start20..];
    let vol_20: f64 = w20.iter().map(|r| r.volume).sum::<f64>() / w20.len() as f64;
    if vol_20 > 0.0 {
        let ratio = vol_5 / vol_20;
        if ratio < 0.7 {
            bonus += 6;
            signals.push(format!("volume drying up ({:.2}x), healthy shakeout", ratio));
        } else if ratio < 1.0 {
            bonus += 3;
            signals.push(format!("volume moderate ({:.2}x)", ratio));
        } else {
            signals.push(format!("selling on volume ({:.2}x), pressure remains", ratio));
        }
    }

    // higher lows over the last 6 bars
    if n >= 6 {
        let recent_low = rows[n - 3..].iter().map(|r| r.low).fold(f64::MAX, f64::min);
        let prior_low = rows[n - 6..n - 3].iter().map(|r| r.low).fold(f64::MAX, f64::min);
        if recent_low > prior_low {
            bonus += 5;
            signals.push("higher lows, base forming".to_string());
        }
    }

    // lower shadow on the last candle
    let last = &rows[n - 1];
    let body = (last.close - last.open).abs();
    let lower_shadow = last.open.min(last.close) - last.low;
    if body > 0.0 && lower_shadow > body * 1.5 {
        bonus += 4;
        signals.push("long lower shadow, visible support".to_string());
    }

    let bonus = bonus.clamp(-5, 20);
    Stabilization { confirmed: bonus >= 5, score_bonus: bonus, signals }
}

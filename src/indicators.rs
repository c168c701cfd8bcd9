// ─────────────────────────────────────────────────────────────────────────────
// indicators.rs — Technical feature engine
//
// Pure function over a chronologically ordered bar slice. Warmup values are
// NaN; trend flags are 0/1 ints so rows stay numerically composable. Every
// feature at index i depends only on bars [0..=i].
// ─────────────────────────────────────────────────────────────────────────────
use chrono::NaiveDateTime;

use crate::store::Bar;

/// One bar extended with the full feature set.
#[derive(Debug, Clone)]
pub struct IndicatorRow {
    pub ts: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,

    pub ma5: f64,
    pub ma10: f64,
    pub ma20: f64,
    pub ma50: f64,
    pub ma120: f64,
    pub ma200: f64,
    pub ema5: f64,
    pub ema10: f64,
    pub ema20: f64,
    pub ema50: f64,
    pub ema120: f64,
    pub ema200: f64,

    pub macd: f64,
    pub macd_signal: f64,
    pub macd_hist: f64,

    pub rsi6: f64,
    pub rsi14: f64,
    pub rsi21: f64,

    pub bb_mid20: f64,
    pub bb_upper20: f64,
    pub bb_lower20: f64,
    pub bb_pct20: f64,
    pub bb_width20: f64,

    pub atr14: f64,
    pub atr_pct14: f64,

    pub kdj_k: f64,
    pub kdj_d: f64,
    pub kdj_j: f64,

    pub vol_ma5: f64,
    pub vol_ma20: f64,
    pub vol_ratio: f64,

    pub high_52w: f64,
    pub low_52w: f64,
    pub pct_from_52w_high: f64,
    pub pct_from_52w_low: f64,

    pub ret_1: f64,
    pub ret_3: f64,
    pub ret_5: f64,
    pub ret_10: f64,
    pub ret_20: f64,

    pub above_ma20: i32,
    pub above_ma50: i32,
    pub above_ma200: i32,
    pub ma20_slope: f64,
    pub ma50_slope: f64,

    pub is_gap_up: i32,
    pub is_gap_down: i32,
    pub body_ratio: f64,

    /// MA5×MA20 crossover marker: +1 golden, −1 death, 0 none.
    pub ma5_cross_ma20: i32,
    /// MACD×signal crossover marker, same encoding.
    pub macd_cross: i32,
}

// ─── Rolling primitives ──────────────────────────────────────────────────────

/// Rolling mean with full-window warmup: NaN until `n` finite values line up.
pub fn rolling_mean(xs: &[f64], n: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; xs.len()];
    if n == 0 {
        return out;
    }
    for i in (n - 1)..xs.len() {
        let w = &xs[i + 1 - n..=i];
        if w.iter().any(|v| v.is_nan()) {
            continue;
        }
        out[i] = w.iter().sum::<f64>() / n as f64;
    }
    out
}

/// Rolling sample standard deviation (ddof = 1).
pub fn rolling_std(xs: &[f64], n: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; xs.len()];
    if n < 2 {
        return out;
    }
    for i in (n - 1)..xs.len() {
        let w = &xs[i + 1 - n..=i];
        if w.iter().any(|v| v.is_nan()) {
            continue;
        }
        let mean = w.iter().sum::<f64>() / n as f64;
        let var = w.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1) as f64;
        out[i] = var.sqrt();
    }
    out
}

pub fn rolling_max(xs: &[f64], n: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; xs.len()];
    for i in (n.saturating_sub(1))..xs.len() {
        let w = &xs[i + 1 - n..=i];
        if w.iter().any(|v| v.is_nan()) {
            continue;
        }
        out[i] = w.iter().cloned().fold(f64::MIN, f64::max);
    }
    out
}

pub fn rolling_min(xs: &[f64], n: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; xs.len()];
    for i in (n.saturating_sub(1))..xs.len() {
        let w = &xs[i + 1 - n..=i];
        if w.iter().any(|v| v.is_nan()) {
            continue;
        }
        out[i] = w.iter().cloned().fold(f64::MAX, f64::min);
    }
    out
}

/// Recursive EMA (adjust = false). NaN inputs leave the state untouched.
pub fn ewm_alpha(xs: &[f64], alpha: f64) -> Vec<f64> {
    let mut out = vec![f64::NAN; xs.len()];
    let mut state = f64::NAN;
    for (i, &x) in xs.iter().enumerate() {
        if x.is_nan() {
            out[i] = state;
            continue;
        }
        state = if state.is_nan() { x } else { alpha * x + (1.0 - alpha) * state };
        out[i] = state;
    }
    out
}

pub fn ewm_span(xs: &[f64], span: usize) -> Vec<f64> {
    ewm_alpha(xs, 2.0 / (span as f64 + 1.0))
}

pub fn ewm_com(xs: &[f64], com: f64) -> Vec<f64> {
    ewm_alpha(xs, 1.0 / (1.0 + com))
}

pub fn pct_change(xs: &[f64], n: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; xs.len()];
    for i in n..xs.len() {
        let prev = xs[i - n];
        if prev != 0.0 && !prev.is_nan() && !xs[i].is_nan() {
            out[i] = xs[i] / prev - 1.0;
        }
    }
    out
}

/// RSI from rolling means of gains and losses over `n` bars.
pub fn rsi(close: &[f64], n: usize) -> Vec<f64> {
    let len = close.len();
    let mut gain = vec![f64::NAN; len];
    let mut loss = vec![f64::NAN; len];
    for i in 1..len {
        let d = close[i] - close[i - 1];
        gain[i] = d.max(0.0);
        loss[i] = (-d).max(0.0);
    }
    let g = rolling_mean(&gain, n);
    let l = rolling_mean(&loss, n);
    g.iter()
        .zip(l.iter())
        .map(|(&g, &l)| {
            if g.is_nan() || l.is_nan() || l == 0.0 {
                f64::NAN
            } else {
                100.0 - 100.0 / (1.0 + g / l)
            }
        })
        .collect()
}

fn cross_marker(fast: &[f64], slow: &[f64]) -> Vec<i32> {
    let mut out = vec![0; fast.len()];
    for i in 1..fast.len() {
        let (f, s, fp, sp) = (fast[i], slow[i], fast[i - 1], slow[i - 1]);
        if f.is_nan() || s.is_nan() || fp.is_nan() || sp.is_nan() {
            continue;
        }
        if f > s && fp <= sp {
            out[i] = 1;
        } else if f < s && fp >= sp {
            out[i] = -1;
        }
    }
    out
}

// ─── The engine ──────────────────────────────────────────────────────────────

pub fn compute(bars: &[Bar]) -> Vec<IndicatorRow> {
    let n = bars.len();
    let close: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let open: Vec<f64> = bars.iter().map(|b| b.open).collect();
    let high: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let low: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let volume: Vec<f64> = bars.iter().map(|b| b.volume).collect();

    let ma5 = rolling_mean(&close, 5);
    let ma10 = rolling_mean(&close, 10);
    let ma20 = rolling_mean(&close, 20);
    let ma50 = rolling_mean(&close, 50);
    let ma120 = rolling_mean(&close, 120);
    let ma200 = rolling_mean(&close, 200);
    let ema5 = ewm_span(&close, 5);
    let ema10 = ewm_span(&close, 10);
    let ema20 = ewm_span(&close, 20);
    let ema50 = ewm_span(&close, 50);
    let ema120 = ewm_span(&close, 120);
    let ema200 = ewm_span(&close, 200);

    let ema12 = ewm_span(&close, 12);
    let ema26 = ewm_span(&close, 26);
    let macd: Vec<f64> = ema12.iter().zip(&ema26).map(|(a, b)| a - b).collect();
    let macd_signal = ewm_span(&macd, 9);
    let macd_hist: Vec<f64> = macd.iter().zip(&macd_signal).map(|(a, b)| a - b).collect();

    let rsi6 = rsi(&close, 6);
    let rsi14 = rsi(&close, 14);
    let rsi21 = rsi(&close, 21);

    let bb_mid = rolling_mean(&close, 20);
    let bb_std = rolling_std(&close, 20);
    let mut bb_upper = vec![f64::NAN; n];
    let mut bb_lower = vec![f64::NAN; n];
    let mut bb_pct = vec![f64::NAN; n];
    let mut bb_width = vec![f64::NAN; n];
    for i in 0..n {
        if bb_mid[i].is_nan() || bb_std[i].is_nan() {
            continue;
        }
        bb_upper[i] = bb_mid[i] + 2.0 * bb_std[i];
        bb_lower[i] = bb_mid[i] - 2.0 * bb_std[i];
        let span = bb_upper[i] - bb_lower[i];
        if span > 0.0 {
            bb_pct[i] = (close[i] - bb_lower[i]) / span;
        }
        if bb_mid[i] != 0.0 {
            bb_width[i] = span / bb_mid[i];
        }
    }

    // true range: first bar has no prior close, so plain high-low
    let mut tr = vec![f64::NAN; n];
    for i in 0..n {
        let hl = high[i] - low[i];
        tr[i] = if i == 0 {
            hl
        } else {
            hl.max((high[i] - close[i - 1]).abs())
                .max((low[i] - close[i - 1]).abs())
        };
    }
    let atr14 = rolling_mean(&tr, 14);
    let atr_pct14: Vec<f64> = atr14
        .iter()
        .zip(&close)
        .map(|(&a, &c)| if c != 0.0 { a / c } else { f64::NAN })
        .collect();

    let low9 = rolling_min(&low, 9);
    let high9 = rolling_max(&high, 9);
    let rsv: Vec<f64> = (0..n)
        .map(|i| {
            if low9[i].is_nan() || high9[i].is_nan() {
                f64::NAN
            } else {
                (close[i] - low9[i]) / (high9[i] - low9[i] + 1e-9) * 100.0
            }
        })
        .collect();
    let kdj_k = ewm_com(&rsv, 2.0);
    let kdj_d = ewm_com(&kdj_k, 2.0);
    let kdj_j: Vec<f64> = kdj_k.iter().zip(&kdj_d).map(|(k, d)| 3.0 * k - 2.0 * d).collect();

    let vol_ma5 = rolling_mean(&volume, 5);
    let vol_ma20 = rolling_mean(&volume, 20);
    let vol_ratio: Vec<f64> = volume
        .iter()
        .zip(&vol_ma20)
        .map(|(&v, &m)| if m > 0.0 { v / m } else { f64::NAN })
        .collect();

    let high_52w = rolling_max(&high, 252);
    let low_52w = rolling_min(&low, 252);

    let ret_1 = pct_change(&close, 1);
    let ret_3 = pct_change(&close, 3);
    let ret_5 = pct_change(&close, 5);
    let ret_10 = pct_change(&close, 10);
    let ret_20 = pct_change(&close, 20);

    let ma5_cross_ma20 = cross_marker(&ma5, &ma20);
    let macd_cross = cross_marker(&macd, &macd_signal);

    let mut rows = Vec::with_capacity(n);
    for i in 0..n {
        let b = bars[i];
        let above = |ma: f64| if !ma.is_nan() && b.close > ma { 1 } else { 0 };
        let slope = |ma: &[f64]| {
            if i >= 5 && !ma[i].is_nan() && !ma[i - 5].is_nan() && ma[i - 5] != 0.0 {
                (ma[i] - ma[i - 5]) / ma[i - 5]
            } else {
                f64::NAN
            }
        };
        let body = (b.close - b.open).abs();
        let range = b.high - b.low;
        rows.push(IndicatorRow {
            ts: b.ts,
            open: b.open,
            high: b.high,
            low: b.low,
            close: b.close,
            volume: b.volume,
            ma5: ma5[i],
            ma10: ma10[i],
            ma20: ma20[i],
            ma50: ma50[i],
            ma120: ma120[i],
            ma200: ma200[i],
            ema5: ema5[i],
            ema10: ema10[i],
            ema20: ema20[i],
            ema50: ema50[i],
            ema120: ema120[i],
            ema200: ema200[i],
            macd: macd[i],
            macd_signal: macd_signal[i],
            macd_hist: macd_hist[i],
            rsi6: rsi6[i],
            rsi14: rsi14[i],
            rsi21: rsi21[i],
            bb_mid20: bb_mid[i],
            bb_upper20: bb_upper[i],
            bb_lower20: bb_lower[i],
            bb_pct20: bb_pct[i],
            bb_width20: bb_width[i],
            atr14: atr14[i],
            atr_pct14: atr_pct14[i],
            kdj_k: kdj_k[i],
            kdj_d: kdj_d[i],
            kdj_j: kdj_j[i],
            vol_ma5: vol_ma5[i],
            vol_ma20: vol_ma20[i],
            vol_ratio: vol_ratio[i],
            high_52w: high_52w[i],
            low_52w: low_52w[i],
            pct_from_52w_high: if high_52w[i].is_nan() || high_52w[i] == 0.0 {
                f64::NAN
            } else {
                (b.close - high_52w[i]) / high_52w[i]
            },
            pct_from_52w_low: if low_52w[i].is_nan() || low_52w[i] == 0.0 {
                f64::NAN
            } else {
                (b.close - low_52w[i]) / low_52w[i]
            },
            ret_1: ret_1[i],
            ret_3: ret_3[i],
            ret_5: ret_5[i],
            ret_10: ret_10[i],
            ret_20: ret_20[i],
            above_ma20: above(ma20[i]),
            above_ma50: above(ma50[i]),
            above_ma200: above(ma200[i]),
            ma20_slope: slope(&ma20),
            ma50_slope: slope(&ma50),
            is_gap_up: if i > 0 && b.open > close[i - 1] { 1 } else { 0 },
            is_gap_down: if i > 0 && b.open < close[i - 1] { 1 } else { 0 },
            body_ratio: body / (range + 1e-9),
            ma5_cross_ma20: ma5_cross_ma20[i],
            macd_cross: macd_cross[i],
        });
    }
    rows
}

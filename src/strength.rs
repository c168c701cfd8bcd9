// ─────────────────────────────────────────────────────────────────────────────
// strength.rs — Relative strength vs the benchmark
//
// RS_1Y = (symbol 1y return − benchmark 1y return) × 100 over aligned daily
// closes. The −999 sentinel means "unknown" and must never be read as a
// genuine underperformance number.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::BTreeMap;

use crate::store::{Bar, BarStore, Interval};

pub const RS_SENTINEL: f64 = -999.0;
pub const TRADING_DAYS_1Y: usize = 252;
const MIN_ALIGNED: usize = TRADING_DAYS_1Y + 10;

/// Core computation over already-loaded daily bars.
pub fn rs_1y_from_bars(stock: &[Bar], benchmark: &[Bar]) -> f64 {
    if stock.is_empty() || benchmark.is_empty() {
        return RS_SENTINEL;
    }
    let bench_by_ts: BTreeMap<_, _> = benchmark.iter().map(|b| (b.ts, b.close)).collect();
    let mut aligned: Vec<(f64, f64)> = Vec::new();
    for b in stock {
        if let Some(&bc) = bench_by_ts.get(&b.ts) {
            aligned.push((b.close, bc));
        }
    }
    if aligned.len() < MIN_ALIGNED {
        return RS_SENTINEL;
    }

    let last = aligned.len() - 1;
    let anchor = aligned.len() - TRADING_DAYS_1Y;
    let (s_last, b_last) = aligned[last];
    let (s_prev, b_prev) = aligned[anchor];
    if s_prev <= 0.0 || b_prev <= 0.0 {
        return RS_SENTINEL;
    }
    let stock_1y = s_last / s_prev - 1.0;
    let bench_1y = b_last / b_prev - 1.0;
    let rs = (stock_1y - bench_1y) * 100.0;
    (rs * 100.0).round() / 100.0
}

/// Store-backed wrapper: prefers local daily history for both legs.
pub fn rs_1y(store: &BarStore, symbol: &str, benchmark: &str) -> f64 {
    let stock = match store.load_local(symbol, Interval::Day1) {
        Ok(bars) => bars,
        Err(e) => {
            log::warn!("[RS] {} load failed: {}", symbol, e);
            return RS_SENTINEL;
        }
    };
    let bench = match store.load_local(benchmark, Interval::Day1) {
        Ok(bars) => bars,
        Err(e) => {
            log::warn!("[RS] benchmark {} load failed: {}", benchmark, e);
            return RS_SENTINEL;
        }
    };
    rs_1y_from_bars(&stock, &bench)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn daily(len: usize, start_px: f64, daily_ret: f64) -> Vec<Bar> {
        let mut t = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let mut px = start_px;
        (0..len)
            .map(|_| {
                let b = Bar { ts: t, open: px, high: px, low: px, close: px, volume: 1e6 };
                t += Duration::days(1);
                px *= 1.0 + daily_ret;
                b
            })
            .collect()
    }

    #[test]
    fn sentinel_below_min_aligned() {
        // exactly one short of the 262-bar requirement
        let stock = daily(MIN_ALIGNED - 1, 100.0, 0.001);
        let bench = daily(MIN_ALIGNED - 1, 400.0, 0.0005);
        assert_eq!(rs_1y_from_bars(&stock, &bench), RS_SENTINEL);

        let stock = daily(MIN_ALIGNED, 100.0, 0.001);
        let bench = daily(MIN_ALIGNED, 400.0, 0.0005);
        assert_ne!(rs_1y_from_bars(&stock, &bench), RS_SENTINEL);
    }

    #[test]
    fn anchor_sits_exactly_252_bars_back() {
        // closes 1..=300: the 1y anchor must be index len-252 = 48, close 49
        let mut t = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let mut stock = Vec::new();
        let mut bench = Vec::new();
        for i in 0..300 {
            let px = (i + 1) as f64;
            stock.push(Bar { ts: t, open: px, high: px, low: px, close: px, volume: 1e6 });
            bench.push(Bar { ts: t, open: 100.0, high: 100.0, low: 100.0, close: 100.0, volume: 1e6 });
            t += Duration::days(1);
        }
        // benchmark is flat, so rs = (300/49 − 1) × 100 rounded to 2 decimals
        let rs = rs_1y_from_bars(&stock, &bench);
        assert_eq!(rs, 512.24);
    }

    #[test]
    fn outperformer_is_positive() {
        let stock = daily(300, 100.0, 0.002);
        let bench = daily(300, 400.0, 0.0005);
        let rs = rs_1y_from_bars(&stock, &bench);
        assert!(rs > 0.0, "rs {}", rs);
    }

    #[test]
    fn same_series_is_zero() {
        let stock = daily(300, 100.0, 0.001);
        let bench = daily(300, 100.0, 0.001);
        let rs = rs_1y_from_bars(&stock, &bench);
        assert!(rs.abs() < 1e-9, "rs {}", rs);
    }

    #[test]
    fn misaligned_calendars_use_intersection() {
        let stock = daily(300, 100.0, 0.001);
        // benchmark missing the last 50 sessions: intersection shrinks below min
        let bench = daily(250, 400.0, 0.001);
        assert_eq!(rs_1y_from_bars(&stock, &bench), RS_SENTINEL);
    }
}

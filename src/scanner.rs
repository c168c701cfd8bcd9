// ─────────────────────────────────────────────────────────────────────────────
// scanner.rs — Two-phase watchlist scanner
//
// Phase 1 sweeps the whole watchlist on cheap daily indicators. Phase 2 loads
// hourly history for the survivors, runs the full feature engine, scores the
// latest bar, and attaches structure + stabilization. Both phases fan out
// with a bounded number of loads in flight.
// ─────────────────────────────────────────────────────────────────────────────
use chrono::NaiveDateTime;
use futures_util::stream::{self, StreamExt};
use log::{info, warn};

use crate::config::{EngineConfig, KnowledgeBase};
use crate::indicators::{self, rolling_mean, rolling_std, rsi};
use crate::marketdata::MarketDataClient;
use crate::signal::{check_stabilization, score_signal, Candidate, ExecMode, ScoreConfig};
use crate::store::{Bar, BarStore, Interval};
use crate::strength::rs_1y;
use crate::structure::{detect, StructureParams};

const PHASE1_LOOKBACK_DAYS: i64 = 90;
const PHASE2_LOOKBACK_DAYS: i64 = 120;
const GAP_DAYS_THRESHOLD: i64 = 7;
const MAX_AUTO_LOOKBACK_DAYS: i64 = 730;

#[derive(Debug, Clone)]
pub struct Phase1Candidate {
    pub ticker: String,
    pub rsi_d: f64,
    pub bb_d: f64,
    pub ret5d: f64,
    pub price: f64,
}

/// Cheap daily pre-filter: depressed RSI, lower band half, recent pullback.
pub fn phase1_check(ticker: &str, bars: &[Bar]) -> Option<Phase1Candidate> {
    if bars.len() < 20 {
        return None;
    }
    let close: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let n = close.len();
    let latest = close[n - 1];

    let rsi14 = *rsi(&close, 14).last()?;
    let ma20 = *rolling_mean(&close, 20).last()?;
    let std20 = *rolling_std(&close, 20).last()?;
    let bb_pct = if std20 > 0.0 { (latest - (ma20 - 2.0 * std20)) / (4.0 * std20) } else { 0.5 };
    let ret_5d = if n >= 5 { (latest / close[n - 5] - 1.0) * 100.0 } else { 0.0 };

    if rsi14 < 58.0 && bb_pct < 0.55 && ret_5d < 5.0 {
        Some(Phase1Candidate {
            ticker: ticker.to_string(),
            rsi_d: (rsi14 * 10.0).round() / 10.0,
            bb_d: (bb_pct * 1000.0).round() / 1000.0,
            ret5d: (ret_5d * 10.0).round() / 10.0,
            price: (latest * 100.0).round() / 100.0,
        })
    } else {
        None
    }
}

pub async fn phase1_filter(
    store: &BarStore,
    md: &MarketDataClient,
    tickers: &[String],
    concurrency: usize,
) -> Vec<Phase1Candidate> {
    info!("[SCAN] phase 1: pre-filtering {} symbols on daily bars", tickers.len());
    let results: Vec<Option<Phase1Candidate>> = stream::iter(tickers.iter().cloned())
        .map(move |ticker| async move {
            match store
                .sync_and_load(
                    md,
                    &ticker,
                    Interval::Day1,
                    PHASE1_LOOKBACK_DAYS,
                    GAP_DAYS_THRESHOLD,
                    MAX_AUTO_LOOKBACK_DAYS,
                )
                .await
            {
                Ok(bars) => phase1_check(&ticker, &bars),
                Err(e) => {
                    warn!("[SCAN] {} daily load failed: {}", ticker, e);
                    None
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let candidates: Vec<Phase1Candidate> = results.into_iter().flatten().collect();
    info!("[SCAN] phase 1 done: {} candidates", candidates.len());
    candidates
}

/// Full scoring of one symbol's hourly window: indicators, base score,
/// structure scan, stabilization bonus. None when the window is too short or
/// the score misses the base threshold.
pub fn score_from_rows(
    ticker: &str,
    bars: &[Bar],
    rs: f64,
    kb_bonus: i32,
    score_cfg: &ScoreConfig,
    struct_params: &StructureParams,
    now: NaiveDateTime,
) -> Option<Candidate> {
    if bars.len() < 30 {
        return None;
    }
    let rows = indicators::compute(bars);
    let last = rows.len() - 1;

    let mut sig = score_signal(&rows[last], ticker, rs, kb_bonus, score_cfg, now);
    sig.structure = detect(&rows, last, struct_params);

    let stab = check_stabilization(&rows);
    sig.score = (sig.score + stab.score_bonus).min(100);
    sig.stabilization_confirmed = stab.confirmed;
    let mut details = stab.signals;
    details.append(&mut sig.details);
    sig.details = details;

    if sig.score >= score_cfg.min_score {
        Some(sig)
    } else {
        None
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn phase2_score(
    store: &BarStore,
    md: &MarketDataClient,
    candidates: &[Phase1Candidate],
    cfg: &EngineConfig,
    kb: &KnowledgeBase,
    score_cfg: &ScoreConfig,
    struct_params: &StructureParams,
    now: NaiveDateTime,
) -> Vec<Candidate> {
    info!("[SCAN] phase 2: scoring {} candidates on 1h bars", candidates.len());
    let results: Vec<Option<Candidate>> = stream::iter(candidates.iter().cloned())
        .map(move |c| async move {
            let bars = match store
                .sync_and_load(
                    md,
                    &c.ticker,
                    Interval::Hour1,
                    PHASE2_LOOKBACK_DAYS,
                    GAP_DAYS_THRESHOLD,
                    MAX_AUTO_LOOKBACK_DAYS,
                )
                .await
            {
                Ok(bars) => bars,
                Err(e) => {
                    warn!("[SCAN] {} hourly load failed: {}", c.ticker, e);
                    return None;
                }
            };
            let rs = rs_1y(store, &c.ticker, &cfg.benchmark);
            let kb_bonus = kb.score_bonus(&c.ticker);
            let sig = score_from_rows(&c.ticker, &bars, rs, kb_bonus, score_cfg, struct_params, now);
            if let Some(sig) = &sig {
                info!(
                    "[SCAN] {:<6} score={:>3} rsi={:>5.1} bb={:>6.3} ma200={} stab={}",
                    sig.ticker,
                    sig.score,
                    sig.rsi14,
                    sig.bb_pct,
                    if sig.above_ma200 { "y" } else { "n" },
                    if sig.stabilization_confirmed { "y" } else { "n" }
                );
            }
            sig
        })
        .buffer_unordered(cfg.scan_concurrency.max(1))
        .collect()
        .await;

    let signals: Vec<Candidate> = results.into_iter().flatten().collect();
    info!("[SCAN] phase 2 done: {} signals", signals.len());
    signals
}

/// Assign the execution routing mode (§ execution policy):
/// structure + MA200 + calm ATR → STRUCT; deep band tag → MR; else SKIP.
pub fn route_exec_mode(sig: &mut Candidate, atr_pct14_max: f64) {
    let atr_ok = !sig.atr_pct14.is_nan() && sig.atr_pct14 <= atr_pct14_max;
    let has_struct = !sig.structure.signals.is_empty() && sig.structure.best.is_some();

    if has_struct && sig.above_ma200 && atr_ok {
        let kind = sig
            .structure
            .best
            .as_ref()
            .map(|b| match b.kind {
                crate::structure::StructureKind::OneBuy => "1buy",
                crate::structure::StructureKind::TwoBuy => "2buy",
            })
            .unwrap_or("-");
        sig.exec_mode = ExecMode::Struct;
        sig.exec_reason = format!("STRUCT({}) ma200+ atr%<={}", kind, atr_pct14_max);
    } else if sig.bb_pct < 0.10 {
        sig.exec_mode = ExecMode::Mr;
        sig.exec_reason = if sig.rsi14 < 25.0 {
            "MR bb<0.10 rsi<25".to_string()
        } else {
            "MR bb<0.10".to_string()
        };
    } else {
        sig.exec_mode = ExecMode::Skip;
        sig.exec_reason = "skip: no-struct and bb>=0.10".to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::{StructureKind, StructureSignal};
    use chrono::{Duration, NaiveDate};

    fn daily_series(closes: &[f64]) -> Vec<Bar> {
        let mut t = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        closes
            .iter()
            .map(|&c| {
                let b = Bar { ts: t, open: c, high: c * 1.01, low: c * 0.99, close: c, volume: 1e6 };
                t += Duration::days(1);
                b
            })
            .collect()
    }

    #[test]
    fn phase1_keeps_pullbacks_only() {
        // 60 flat bars then a slide: RSI depressed, lower band, negative ret5
        let mut closes: Vec<f64> = vec![100.0; 60];
        for i in 0..10 {
            closes.push(100.0 - (i + 1) as f64 * 1.2);
        }
        let pullback = daily_series(&closes);
        let c = phase1_check("X", &pullback).expect("pullback passes");
        assert!(c.rsi_d < 58.0);
        assert!(c.ret5d < 0.0);

        // a runaway uptrend must be filtered
        let ripping = daily_series(&(0..70).map(|i| 50.0 + i as f64).collect::<Vec<_>>());
        assert!(phase1_check("Y", &ripping).is_none());
    }

    #[test]
    fn phase1_needs_twenty_bars() {
        let short = daily_series(&[10.0; 10]);
        assert!(phase1_check("X", &short).is_none());
    }

    fn hourly_pullback() -> Vec<Bar> {
        let mut closes: Vec<f64> = (0..240).map(|i| 40.0 + i as f64 * 0.25).collect();
        let peak = *closes.last().unwrap();
        closes.extend((1..=8).map(|i| peak - i as f64 * 1.5));
        let mut t = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap().and_hms_opt(10, 0, 0).unwrap();
        closes
            .iter()
            .map(|&c| {
                let b = Bar { ts: t, open: c + 0.2, high: c + 0.5, low: c - 0.5, close: c, volume: 1e6 };
                t += Duration::hours(1);
                b
            })
            .collect()
    }

    #[test]
    fn score_from_rows_anchors_to_bar_close() {
        let bars = hourly_pullback();
        let now = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap().and_hms_opt(12, 0, 0).unwrap();
        let cfg = ScoreConfig { min_score: 0, ..ScoreConfig::default() };
        let sig = score_from_rows("X", &bars, 5.0, 0, &cfg, &StructureParams::default(), now)
            .expect("scored");
        let last = bars.last().unwrap();
        assert_eq!(sig.bar_time, last.ts);
        assert!((sig.bar_close - last.close).abs() < 0.01);
        assert_eq!(sig.price_source, "1H_bar_close");
        // stabilization notes are prepended to details
        assert!(!sig.details.is_empty());
    }

    #[test]
    fn score_from_rows_enforces_min_window() {
        let bars = hourly_pullback();
        let now = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap().and_hms_opt(12, 0, 0).unwrap();
        assert!(score_from_rows(
            "X",
            &bars[..20],
            5.0,
            0,
            &ScoreConfig::default(),
            &StructureParams::default(),
            now
        )
        .is_none());
    }

    fn base_candidate() -> Candidate {
        let bars = hourly_pullback();
        let now = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap().and_hms_opt(12, 0, 0).unwrap();
        let cfg = ScoreConfig { min_score: 0, ..ScoreConfig::default() };
        score_from_rows("X", &bars, 5.0, 0, &cfg, &StructureParams::default(), now).unwrap()
    }

    fn fake_struct_signal(entry: f64) -> StructureSignal {
        StructureSignal {
            kind: StructureKind::OneBuy,
            box_high: entry * 0.98,
            box_low: entry * 0.9,
            breakout_i: 0,
            entry,
            sl: entry * 0.95,
            tp: entry * 1.08,
            rr: 5.0 / 3.0,
            zone_level: None,
        }
    }

    #[test]
    fn routing_prefers_struct_then_mr() {
        let mut with_struct = base_candidate();
        with_struct.above_ma200 = true;
        with_struct.atr_pct14 = 2.0;
        let s = fake_struct_signal(with_struct.price);
        with_struct.structure.signals.push(s.clone());
        with_struct.structure.best = Some(s);
        route_exec_mode(&mut with_struct, 3.5);
        assert_eq!(with_struct.exec_mode, ExecMode::Struct);
        assert!(with_struct.exec_reason.starts_with("STRUCT(1buy)"));

        let mut mr = base_candidate();
        mr.bb_pct = 0.05;
        route_exec_mode(&mut mr, 3.5);
        assert_eq!(mr.exec_mode, ExecMode::Mr);

        let mut skip = base_candidate();
        skip.bb_pct = 0.50;
        route_exec_mode(&mut skip, 3.5);
        assert_eq!(skip.exec_mode, ExecMode::Skip);
    }

    #[test]
    fn atr_gate_is_inclusive_at_the_max() {
        let mut sig = base_candidate();
        sig.above_ma200 = true;
        sig.atr_pct14 = 3.5; // exactly the cap
        let s = fake_struct_signal(sig.price);
        sig.structure.signals.push(s.clone());
        sig.structure.best = Some(s);
        route_exec_mode(&mut sig, 3.5);
        assert_eq!(sig.exec_mode, ExecMode::Struct);

        sig.atr_pct14 = 3.51;
        sig.bb_pct = 0.5;
        route_exec_mode(&mut sig, 3.5);
        assert_ne!(sig.exec_mode, ExecMode::Struct);
    }
}

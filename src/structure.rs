// ─────────────────────────────────────────────────────────────────────────────
// structure.rs — Breakout + pullback structure detector (1buy / 2buy)
//
// Finds "box breakout, pullback held, reclaim confirmed" setups on the 1h
// window without look-ahead: everything at bar i reads bars [0..=i] only.
// The stop is the structural invalidation level, not a fixed percent.
// ─────────────────────────────────────────────────────────────────────────────
use serde::{Deserialize, Serialize};

use crate::indicators::IndicatorRow;

#[derive(Debug, Clone)]
pub struct StructureParams {
    pub box_lookback: usize,
    /// Breakout must clear box_high by this many ATRs.
    pub breakout_buffer_atr: f64,
    /// Breakout must be at least this many bars before the target bar.
    pub min_breakout_bars_ago: usize,
    pub pullback_max_bars: usize,
    /// How far below the level the pullback may pierce and still count as held.
    pub hold_buffer_atr: f64,
    /// Reclaim confirmation: close back above level by this many ATRs.
    pub confirm_close_buffer_atr: f64,
    pub require_above_ma200: bool,
    pub require_ma200_slope_nonneg: bool,
    pub rr: f64,
}

impl Default for StructureParams {
    fn default() -> Self {
        Self {
            box_lookback: 80,
            breakout_buffer_atr: 0.2,
            min_breakout_bars_ago: 2,
            pullback_max_bars: 30,
            hold_buffer_atr: 0.3,
            confirm_close_buffer_atr: 0.1,
            require_above_ma200: true,
            require_ma200_slope_nonneg: true,
            rr: 5.0 / 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StructureKind {
    #[serde(rename = "1buy")]
    OneBuy,
    #[serde(rename = "2buy")]
    TwoBuy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureSignal {
    pub kind: StructureKind,
    pub box_high: f64,
    pub box_low: f64,
    pub breakout_i: usize,
    pub entry: f64,
    pub sl: f64,
    pub tp: f64,
    pub rr: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone_level: Option<f64>,
}

impl StructureSignal {
    pub fn risk_pct(&self) -> f64 {
        if self.entry <= 0.0 {
            return 1.0;
        }
        (self.entry - self.sl).max(0.0) / self.entry
    }
}

/// Up to two signals for one bar, plus the preferred one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructureScan {
    pub signals: Vec<StructureSignal>,
    pub best: Option<StructureSignal>,
}

fn ma200_slope_pct(rows: &[IndicatorRow], end: usize, window: usize) -> f64 {
    let w = window.max(5);
    if end + 1 < w + 1 {
        return 0.0;
    }
    let a = rows[end + 1 - w].ma200;
    let b = rows[end].ma200;
    if a.is_nan() || b.is_nan() || a == 0.0 {
        return 0.0;
    }
    (b / a - 1.0) * 100.0
}

fn box_high_low(rows: &[IndicatorRow], end_i: usize, lookback: usize) -> Option<(f64, f64)> {
    if rows.is_empty() {
        return None;
    }
    let lb = lookback.max(20);
    let start = end_i.saturating_sub(lb - 1);
    let w = &rows[start..=end_i];
    let hi = w.iter().map(|r| r.high).fold(f64::MIN, f64::max);
    let lo = w.iter().map(|r| r.low).fold(f64::MAX, f64::min);
    Some((hi, lo))
}

/// Shared preamble for both setups: trend filters, box, breakout location.
/// Returns (atr, box_high, box_low, breakout_i) when a validated breakout
/// exists in the post-box window.
fn breakout_context(
    rows: &[IndicatorRow],
    i: usize,
    p: &StructureParams,
) -> Option<(f64, f64, f64, usize)> {
    if i < p.box_lookback + p.pullback_max_bars + 5 {
        return None;
    }
    let row = &rows[i];
    if row.close <= 0.0 {
        return None;
    }
    if p.require_above_ma200 && row.above_ma200 != 1 {
        return None;
    }
    if p.require_ma200_slope_nonneg && ma200_slope_pct(rows, i, 50) < 0.0 {
        return None;
    }

    let atr = if row.atr14.is_nan() || row.atr14 < 0.0 { 0.0 } else { row.atr14 };

    let box_end = i - p.pullback_max_bars;
    let (box_high, box_low) = box_high_low(rows, box_end, p.box_lookback)?;
    let breakout_req = box_high + p.breakout_buffer_atr * atr;

    let breakout_i = rows[box_end + 1..=i]
        .iter()
        .position(|r| r.close > breakout_req)
        .map(|pos| box_end + 1 + pos)?;

    Some((atr, box_high, box_low, breakout_i))
}

/// 1buy: breakout, shallow pullback that tags the level and holds, reclaim.
pub fn one_buy_signal(
    rows: &[IndicatorRow],
    i: usize,
    p: &StructureParams,
) -> Option<StructureSignal> {
    let (atr, box_high, box_low, breakout_i) = breakout_context(rows, i, p)?;
    if i - breakout_i < p.min_breakout_bars_ago {
        return None;
    }
    let close = rows[i].close;

    let pb = &rows[breakout_i..=i];
    let pb_min_low = pb.iter().map(|r| r.low).fold(f64::MAX, f64::min);
    let hold_floor = box_high - p.hold_buffer_atr * atr;
    if !(pb_min_low <= box_high && pb_min_low >= hold_floor) {
        return None;
    }

    let confirm_req = box_high + p.confirm_close_buffer_atr * atr;
    if close <= confirm_req {
        return None;
    }

    let sl = pb_min_low - 0.1 * atr;
    if sl >= close {
        return None;
    }
    let tp = close + p.rr * (close - sl);

    Some(StructureSignal {
        kind: StructureKind::OneBuy,
        box_high,
        box_low,
        breakout_i,
        entry: close,
        sl,
        tp,
        rr: p.rr,
        zone_level: None,
    })
}

/// 2buy: established breakout, deeper pullback into the box-high/MA50 zone,
/// reclaim above both.
pub fn two_buy_signal(
    rows: &[IndicatorRow],
    i: usize,
    p: &StructureParams,
) -> Option<StructureSignal> {
    let (atr, box_high, box_low, breakout_i) = breakout_context(rows, i, p)?;
    // a 2buy needs an actual trend leg first, not a fresh breakout
    if i - breakout_i < 6 {
        return None;
    }
    let row = &rows[i];
    let close = row.close;
    let ma50 = if row.ma50.is_nan() { close } else { row.ma50 };

    let pb = &rows[breakout_i..=i];
    let pb_min_low = pb.iter().map(|r| r.low).fold(f64::MAX, f64::min);

    let zone_level = box_high.max(ma50);
    let zone_floor = zone_level - p.hold_buffer_atr * atr;
    if !(pb_min_low <= zone_level && pb_min_low >= zone_floor) {
        return None;
    }

    let confirm_req = zone_level + p.confirm_close_buffer_atr * atr;
    if close <= confirm_req {
        return None;
    }

    let sl = pb_min_low - 0.1 * atr;
    if sl >= close {
        return None;
    }
    let tp = close + p.rr * (close - sl);

    Some(StructureSignal {
        kind: StructureKind::TwoBuy,
        box_high,
        box_low,
        breakout_i,
        entry: close,
        sl,
        tp,
        rr: p.rr,
        zone_level: Some(zone_level),
    })
}

/// Run both detectors at bar `i` and pick the preferred signal: sane risk
/// (≤8% of entry) first, then the tighter stop, then the later setup type.
pub fn detect(rows: &[IndicatorRow], i: usize, p: &StructureParams) -> StructureScan {
    let mut signals = Vec::new();
    if let Some(s) = one_buy_signal(rows, i, p) {
        signals.push(s);
    }
    if let Some(s) = two_buy_signal(rows, i, p) {
        signals.push(s);
    }

    let best = signals
        .iter()
        .max_by(|a, b| {
            let ka = (a.risk_pct() <= 0.08) as u8;
            let kb = (b.risk_pct() <= 0.08) as u8;
            ka.cmp(&kb)
                .then(b.risk_pct().partial_cmp(&a.risk_pct()).unwrap_or(std::cmp::Ordering::Equal))
                .then((a.kind == StructureKind::TwoBuy).cmp(&(b.kind == StructureKind::TwoBuy)))
        })
        .cloned();

    StructureScan { signals, best }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators;
    use crate::store::Bar;
    use chrono::{Duration, NaiveDate};

    /// Long base, breakout, pullback that tags the box high, reclaim.
    fn breakout_pullback_series() -> Vec<Bar> {
        let mut closes: Vec<f64> = Vec::new();
        // 220 bars of uptrend so MA200 sits below price with rising slope
        for i in 0..220 {
            closes.push(60.0 + i as f64 * 0.05);
        }
        // 80-bar box around ~71
        for i in 0..80 {
            closes.push(71.0 + if i % 2 == 0 { 0.3 } else { -0.3 });
        }
        // breakout leg
        for i in 0..10 {
            closes.push(72.5 + i as f64 * 0.25);
        }
        // pullback toward the box high, then reclaim
        for i in 0..12 {
            closes.push(74.0 - i as f64 * 0.2);
        }
        for i in 0..8 {
            closes.push(71.8 + i as f64 * 0.35);
        }
        let mut t = NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        closes
            .iter()
            .map(|&c| {
                let b = Bar { ts: t, open: c - 0.1, high: c + 0.25, low: c - 0.25, close: c, volume: 1e6 };
                t += Duration::hours(1);
                b
            })
            .collect()
    }

    #[test]
    fn signal_invariants_hold() {
        let rows = indicators::compute(&breakout_pullback_series());
        let i = rows.len() - 1;
        let scan = detect(&rows, i, &StructureParams::default());
        for s in &scan.signals {
            assert!(s.entry > s.sl, "entry {} sl {}", s.entry, s.sl);
            assert!(s.tp > s.entry, "tp {} entry {}", s.tp, s.entry);
            assert!((s.tp - s.entry) - s.rr * (s.entry - s.sl) < 1e-9);
        }
        if let Some(best) = &scan.best {
            assert!(scan.signals.iter().any(|s| s.kind == best.kind));
        }
    }

    #[test]
    fn too_little_history_is_none() {
        let rows = indicators::compute(&breakout_pullback_series()[..60]);
        let p = StructureParams::default();
        assert!(one_buy_signal(&rows, rows.len() - 1, &p).is_none());
        assert!(two_buy_signal(&rows, rows.len() - 1, &p).is_none());
    }

    #[test]
    fn below_ma200_is_filtered() {
        // downtrend: above_ma200 = 0 at the end
        let mut t = NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let bars: Vec<Bar> = (0..400)
            .map(|i| {
                let c = 200.0 - i as f64 * 0.2;
                let b = Bar { ts: t, open: c, high: c + 0.5, low: c - 0.5, close: c, volume: 1e6 };
                t += Duration::hours(1);
                b
            })
            .collect();
        let rows = indicators::compute(&bars);
        let p = StructureParams::default();
        assert!(one_buy_signal(&rows, rows.len() - 1, &p).is_none());
    }

    #[test]
    fn best_prefers_sane_risk() {
        let wide = StructureSignal {
            kind: StructureKind::OneBuy,
            box_high: 10.0,
            box_low: 8.0,
            breakout_i: 0,
            entry: 10.0,
            sl: 8.5, // 15% risk
            tp: 12.5,
            rr: 5.0 / 3.0,
            zone_level: None,
        };
        let tight = StructureSignal {
            kind: StructureKind::TwoBuy,
            sl: 9.5, // 5% risk
            ..wide.clone()
        };
        // replicate the ordering key directly
        assert!(tight.risk_pct() <= 0.08);
        assert!(wide.risk_pct() > 0.08);
    }
}

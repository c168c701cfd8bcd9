// ─────────────────────────────────────────────────────────────────────────────
// router.rs — Execution router
//
// Turns the tick's strong candidates into at most one buy order. Every
// precondition failure becomes a (symbol, reason, key) triple; the full tally
// is persisted under last_exec_skip so an operator can audit why a tick did
// nothing.
// ─────────────────────────────────────────────────────────────────────────────
use chrono::{DateTime, NaiveDateTime, Utc};
use log::{info, warn};
use serde_json::json;

use crate::broker::{
    execute_intent, make_intent, quote_twice, to_broker_symbol, BrokerClient, OrderIntent,
    QuoteSnapshot, Side,
};
use crate::config::EngineConfig;
use crate::signal::{Candidate, ExecMode};
use crate::state::{ExecSkipSummary, PaperLedger, PendingOrder, SkipTally, TradingState};
use crate::store::{BarStore, Interval};

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

// ─── Sizing ──────────────────────────────────────────────────────────────────

/// Marketable limit: cross the spread a touch so a stale quote still fills.
pub fn marketable_limit_price(
    side: Side,
    bid: Option<f64>,
    ask: Option<f64>,
    last: Option<f64>,
) -> Option<f64> {
    match side {
        Side::Buy => ask.filter(|a| *a > 0.0).or_else(|| last.map(|l| l * 1.002)),
        Side::Sell => bid.filter(|b| *b > 0.0).or_else(|| last.map(|l| l * 0.998)),
    }
}

/// Risk-budget sizing with notional floor and caps.
pub fn compute_qty(equity: f64, entry: f64, sl: f64, cfg: &EngineConfig) -> u32 {
    if equity <= 0.0 || entry <= 0.0 || sl <= 0.0 {
        return 0;
    }
    let risk_per_share = entry - sl;
    if risk_per_share <= 0.0 {
        return 0;
    }
    let risk_budget = equity * cfg.risk_pct_equity;
    let mut qty = (risk_budget / risk_per_share).floor() as i64;

    if (qty as f64) * entry < cfg.min_notional {
        qty = (cfg.min_notional / entry).floor() as i64;
    }
    if qty <= 0 {
        return 0;
    }
    if (qty as f64) * entry > cfg.max_notional {
        qty = (cfg.max_notional / entry).floor() as i64;
    }
    qty.max(0) as u32
}

/// Mean 20-day dollar volume from the local daily store.
fn dollar_vol_20d(store: &BarStore, ticker: &str) -> Option<f64> {
    let bars = store.load_local(ticker, Interval::Day1).ok()?;
    if bars.len() < 20 {
        return None;
    }
    let w = &bars[bars.len() - 20..];
    Some(w.iter().map(|b| b.close * b.volume).sum::<f64>() / 20.0)
}

// ─── Intent construction ─────────────────────────────────────────────────────

/// Build a buy intent from a scored candidate and a quote, or the skip reason
/// that disqualified it.
pub fn build_order_intent(
    sig: &Candidate,
    quote: &QuoteSnapshot,
    equity: f64,
    cfg: &EngineConfig,
    store: &BarStore,
    now: NaiveDateTime,
) -> Result<OrderIntent, String> {
    match sig.exec_mode {
        ExecMode::Struct | ExecMode::Mr => {}
        ExecMode::Skip => return Err("SKIP_MODE".to_string()),
    }

    // MR must not catch a falling knife: demand some MA50 support
    if sig.exec_mode == ExecMode::Mr && !(sig.above_ma50 || sig.ma50_slope >= 0.0) {
        return Err("SKIP_MR_TREND".to_string());
    }

    let symbol = to_broker_symbol(&sig.ticker);
    let entry_ref = sig.price;
    let sl = sig.sl_price;
    let tp = sig.tp_price;

    let limit_px = match marketable_limit_price(Side::Buy, quote.bid, quote.ask, quote.last) {
        Some(px) if px > 0.0 => px,
        _ if entry_ref > 0.0 => entry_ref * 1.002,
        _ => return Err("SKIP_NO_QUOTE".to_string()),
    };

    // thin low-priced names get a dollar-volume floor
    let px_check = quote.last.unwrap_or(limit_px);
    if px_check > 0.0 && px_check < cfg.low_price_liquidity_below {
        match dollar_vol_20d(store, &sig.ticker) {
            Some(dv) if dv >= cfg.min_dollar_vol_20d => {}
            _ => return Err("SKIP_LOW_LIQUIDITY".to_string()),
        }
    }

    let sl_pct = if limit_px > 0.0 { (limit_px - sl) / limit_px } else { 1.0 };
    if sl_pct > cfg.max_sl_pct {
        return Err("SKIP_SL_WIDE".to_string());
    }
    if sl_pct < cfg.min_sl_pct {
        return Err("SKIP_SL_RANGE".to_string());
    }

    let mut qty = compute_qty(equity, limit_px, sl, cfg);
    if qty == 0 {
        // minimum one-share start for small accounts
        qty = 1;
    }

    let cap_notional = (equity * cfg.max_position_pct).max(cfg.min_notional);
    let notional = qty as f64 * limit_px;
    if notional > cap_notional {
        return Err("SKIP_NOTIONAL_CAP".to_string());
    }
    if notional > cfg.max_notional {
        return Err("SKIP_NOTIONAL_MAX".to_string());
    }

    let remark = format!(
        "paper|{}|score={}|reason={}|bar={}",
        sig.exec_mode.as_str(),
        sig.score,
        sig.exec_reason,
        sig.bar_time.format("%Y-%m-%d %H:%M"),
    );
    let source = json!({
        "ticker": sig.ticker,
        "exec_mode": sig.exec_mode.as_str(),
        "exec_reason": sig.exec_reason,
        "score": sig.score,
        "price_source": sig.price_source,
        "scan_time": sig.scan_time.format("%Y-%m-%d %H:%M").to_string(),
    });

    Ok(make_intent(
        &symbol,
        Side::Buy,
        qty,
        round2(limit_px),
        Some(round2(sl)),
        Some(round2(tp)),
        &remark,
        source,
        now,
    ))
}

// ─── Intent evaluation ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct IntentMetrics {
    pub notional: f64,
    pub sl_pct: f64,
    pub risk_usd: f64,
    pub score: f64,
}

/// Execution score: prefer stronger signals, tighter stops, smaller tickets.
pub fn compute_metrics(intent: &OrderIntent, signal_score: f64) -> IntentMetrics {
    let entry = intent.limit_price;
    let sl = intent.sl_price.unwrap_or(0.0);
    let qty = intent.qty as f64;

    let notional = entry * qty;
    let sl_pct = if entry > 0.0 && sl > 0.0 { (entry - sl) / entry } else { 1.0 };
    let risk_usd = ((entry - sl) * qty).max(0.0);
    let score = signal_score - sl_pct * 50.0 - notional / 1000.0;

    IntentMetrics { notional, sl_pct, risk_usd, score }
}

// ─── Idempotency key ─────────────────────────────────────────────────────────

pub fn idempotency_key(sig: &Candidate) -> String {
    format!(
        "{}|{}|{}",
        sig.ticker,
        sig.exec_mode.as_str(),
        sig.bar_time.format("%Y-%m-%d %H:%M")
    )
}

// ─── Select + commit ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ExecOutcome {
    pub placed: Option<(String, OrderIntent)>,
    pub skips: Vec<(String, String, String)>,
}

pub fn build_skip_summary(skips: &[(String, String, String)], now: DateTime<Utc>) -> ExecSkipSummary {
    let mut tallies: Vec<SkipTally> = Vec::new();
    for (symbol, reason, _key) in skips {
        match tallies.iter_mut().find(|t| &t.reason == reason) {
            Some(t) => {
                t.count += 1;
                if t.samples.len() < 2 {
                    t.samples.push(symbol.clone());
                }
            }
            None => tallies.push(SkipTally {
                reason: reason.clone(),
                count: 1,
                samples: vec![symbol.clone()],
            }),
        }
    }
    tallies.sort_by(|a, b| b.count.cmp(&a.count));
    ExecSkipSummary {
        ts: now.format("%Y-%m-%dT%H:%M:%S%z").to_string(),
        skipped: skips.len() as u32,
        reasons: tallies,
    }
}

/// One pass of the capital-constrained execution select: evaluate all strong
/// candidates, rank the buildable intents, commit the top one.
pub async fn run_execution_select(
    broker: &mut dyn BrokerClient,
    store: &BarStore,
    state: &mut TradingState,
    ledger: &PaperLedger,
    strong: &[Candidate],
    cfg: &EngineConfig,
    now: DateTime<Utc>,
) -> ExecOutcome {
    let mut out = ExecOutcome::default();
    if strong.is_empty() {
        return out;
    }

    let equity = match broker.available_cash("USD").await {
        Ok(Some(cash)) if cash > 0.0 => cash,
        _ => cfg.paper_equity,
    };

    let day_key = now.format("%Y-%m-%d").to_string();
    if state.daily_count(&day_key) >= cfg.max_new_buys_per_day {
        info!("[EXEC] daily buy limit reached ({})", cfg.max_new_buys_per_day);
        for sig in strong {
            out.skips.push((
                to_broker_symbol(&sig.ticker),
                "SKIP_DAILY_LIMIT".to_string(),
                idempotency_key(sig),
            ));
        }
        return out;
    }

    let mut ranked: Vec<(f64, OrderIntent, String)> = Vec::new();

    for sig in strong {
        let key = idempotency_key(sig);
        let lp_symbol = to_broker_symbol(&sig.ticker);

        if state.was_executed(&key) {
            out.skips.push((lp_symbol, "SKIP_IDEMPOTENT".to_string(), key));
            continue;
        }
        if state.has_pending_symbol_side(&lp_symbol, "Buy") {
            out.skips.push((lp_symbol, "SKIP_PENDING_BUY".to_string(), key));
            continue;
        }
        if let Some(reason) = state.cooldown_active(&lp_symbol, now) {
            out.skips.push((lp_symbol, format!("SKIP_COOLDOWN:{}", reason), key));
            continue;
        }

        // quote context; the double read guards against a moving tape
        let quote = if cfg.quote_drift_max_pct > 0.0 {
            match quote_twice(broker, &lp_symbol).await {
                Ok((_q1, q2, drift)) => {
                    if drift > cfg.quote_drift_max_pct {
                        out.skips.push((lp_symbol, format!("SKIP_QUOTE_DRIFT:{:.3}", drift), key));
                        continue;
                    }
                    q2
                }
                Err(e) => {
                    warn!("[EXEC] {} quote failed: {}", lp_symbol, e);
                    out.skips.push((lp_symbol, "SKIP_NO_QUOTE".to_string(), key));
                    continue;
                }
            }
        } else {
            match broker.quote(&lp_symbol).await {
                Ok(q) => q,
                Err(e) => {
                    warn!("[EXEC] {} quote failed: {}", lp_symbol, e);
                    out.skips.push((lp_symbol, "SKIP_NO_QUOTE".to_string(), key));
                    continue;
                }
            }
        };

        if let Some(last) = quote.last {
            if last > 0.0 && last > equity * cfg.max_price_pct_equity {
                out.skips.push((lp_symbol, format!("SKIP_HIGH_PRICE:{:.2}", last), key));
                continue;
            }
            if last > 0.0 && last < cfg.min_price_usd {
                out.skips.push((lp_symbol, format!("SKIP_LOW_PRICE:{:.2}", last), key));
                continue;
            }
            // drift between the signal bar close and the live tape
            if sig.price > 0.0 && last > 0.0 {
                let drift = (last - sig.price).abs() / sig.price;
                if drift > cfg.price_drift_max_pct {
                    out.skips.push((lp_symbol, format!("SKIP_PRICE_DRIFT:{:.3}", drift), key));
                    continue;
                }
            }
        }

        match build_order_intent(sig, &quote, equity, cfg, store, now.naive_utc()) {
            Ok(intent) => {
                let metrics = compute_metrics(&intent, sig.score as f64);
                ranked.push((metrics.score, intent, key));
            }
            Err(reason) => {
                out.skips.push((lp_symbol, reason, key));
            }
        }
    }

    ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    if !out.skips.is_empty() {
        info!("[EXEC_SKIP] skipped={}", out.skips.len());
        let summary = build_skip_summary(&out.skips, now);
        for t in summary.reasons.iter().take(8) {
            info!("  - {}: {} (e.g. {})", t.reason, t.count, t.samples.join(","));
        }
    }

    let Some((best_score, best_intent, best_key)) = ranked.into_iter().next() else {
        return out;
    };

    // commit-time guards on the single selected intent
    if state.open_positions.len() as u32 >= cfg.max_open_pos {
        out.skips.push((best_intent.symbol.clone(), "SKIP_MAX_OPEN_POS".to_string(), best_key));
        return out;
    }
    let sl = best_intent.sl_price.unwrap_or(0.0);
    let new_risk = ((best_intent.limit_price - sl) * best_intent.qty as f64).max(0.0);
    let cur_risk = state.total_open_risk_usd();
    if cur_risk + new_risk > equity * cfg.total_risk_cap {
        out.skips.push((best_intent.symbol.clone(), "SKIP_RISK_CAP".to_string(), best_key));
        return out;
    }
    let notional = best_intent.limit_price * best_intent.qty as f64;
    if equity - notional < cfg.min_cash_buffer_usd {
        out.skips.push((
            best_intent.symbol.clone(),
            format!("SKIP_CASH_BUFFER:{}", cfg.min_cash_buffer_usd),
            best_key,
        ));
        return out;
    }

    // audit trail first, then the (gated) submission
    if let Err(e) = ledger.append(&best_intent, Some(best_intent.limit_price), "FILLED") {
        warn!("[EXEC] ledger append failed: {}", e);
    }
    info!(
        "PAPER_ORDER:{}:{}:{}@{} exec_score={:.1}",
        best_intent.symbol,
        best_intent.side.as_str(),
        best_intent.qty,
        best_intent.limit_price,
        best_score
    );

    let r = execute_intent(broker, &best_intent, &cfg.env).await;
    match (r.ok, r.dry_run) {
        (true, true) => info!(
            "LIVE_ORDER_DRYRUN:{}:{}:{}@{}",
            best_intent.symbol,
            best_intent.side.as_str(),
            best_intent.qty,
            best_intent.limit_price
        ),
        (true, false) => info!(
            "LIVE_ORDER_OK:{}:order_id={}",
            best_intent.symbol,
            r.order_id.as_deref().unwrap_or("-")
        ),
        _ => warn!(
            "LIVE_ORDER_FAIL:{}:{}",
            best_intent.symbol,
            r.error.as_deref().unwrap_or("unknown")
        ),
    }

    if let Some(order_id) = &r.order_id {
        state.add_pending_order(
            order_id,
            PendingOrder {
                symbol: best_intent.symbol.clone(),
                side: best_intent.side.as_str().to_string(),
                qty: best_intent.qty,
                limit_price: Some(best_intent.limit_price),
                sl: best_intent.sl_price,
                tp: best_intent.tp_price,
                status: "PENDING".to_string(),
                filled_qty: None,
                avg_price: None,
                updated_at: String::new(),
                reason: None,
            },
        );
    }

    state.mark_executed(
        &best_key,
        json!({ "symbol": best_intent.symbol, "qty": best_intent.qty }),
    );
    state.add_open_position(
        &best_intent.symbol,
        best_intent.qty as f64,
        best_intent.limit_price,
        best_intent.sl_price,
        best_intent.tp_price,
        json!({ "key": best_key }),
    );
    state.inc_daily(&day_key);

    out.placed = r.order_id.map(|oid| (oid, best_intent));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SimBroker;
    use crate::config::{TradingEnv, TradingEnvKind};
    use crate::signal::{Candidate, ExecMode};
    use crate::structure::StructureScan;
    use chrono::NaiveDate;

    fn test_cfg(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            env: TradingEnv { kind: TradingEnvKind::Paper, live_enabled: false, live_submit: false },
            data_dir: dir.to_path_buf(),
            benchmark: "SPY".into(),
            vix_symbol: "^VIX".into(),
            paper_equity: 10_000.0,
            risk_pct_equity: 0.003,
            min_notional: 300.0,
            max_notional: 6000.0,
            min_sl_pct: 0.03,
            max_sl_pct: 0.10,
            max_position_pct: 0.08,
            max_open_pos: 1,
            max_new_buys_per_day: 1,
            max_price_pct_equity: 0.35,
            min_price_usd: 5.0,
            min_dollar_vol_20d: 2e7,
            low_price_liquidity_below: 15.0,
            price_drift_max_pct: 0.015,
            quote_drift_max_pct: 0.0,
            total_risk_cap: 0.02,
            min_cash_buffer_usd: 50.0,
            atr_pct14_max: 3.5,
            cooldown_hours: 24.0,
            exit_escalate_max_attempts: 3,
            scan_concurrency: 8,
            tick_deadline_secs: 300,
        }
    }

    fn candidate(ticker: &str, score: i32, price: f64, sl: f64, tp: f64, mode: ExecMode) -> Candidate {
        let bar_time = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap().and_hms_opt(10, 0, 0).unwrap();
        Candidate {
            ticker: ticker.into(),
            score,
            kb_tag: String::new(),
            price,
            bar_time,
            bar_close: price,
            price_source: "1H_bar_close",
            scan_time: bar_time,
            rsi14: 28.0,
            bb_pct: 0.08,
            macd_hist: -0.2,
            vol_ratio: 1.0,
            ret_5d: -5.5,
            atr_pct14: 2.0,
            above_ma200: true,
            above_ma50: true,
            ma50_slope: 0.01,
            rs_1y: 5.0,
            suggest_price: price,
            suggest_note: String::new(),
            tp_price: tp,
            sl_price: sl,
            rr_ratio: 1.6,
            risk_mode: "normal",
            details: Vec::new(),
            warnings: Vec::new(),
            structure: StructureScan::default(),
            exec_mode: mode,
            exec_reason: "test".into(),
            stabilization_confirmed: true,
            score_threshold: 70,
        }
    }

    fn quote(symbol: &str, last: f64, bid: f64, ask: f64) -> QuoteSnapshot {
        QuoteSnapshot {
            symbol: symbol.into(),
            last: Some(last),
            bid: Some(bid),
            ask: Some(ask),
            ts: Utc::now(),
        }
    }

    #[test]
    fn happy_path_sizing_matches_hand_math() {
        // equity 10k, limit 50.12, sl 46.00: floor(30 / 4.12) = 7 shares
        let dir = tempfile::tempdir().expect("tmp");
        let cfg = test_cfg(dir.path());
        let store = BarStore::new(dir.path().join("store"));
        let sig = candidate("X", 80, 50.0, 46.0, 56.5, ExecMode::Mr);
        let q = quote("X.US", 50.11, 50.10, 50.12);
        let now = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap().and_hms_opt(12, 0, 0).unwrap();
        let intent = build_order_intent(&sig, &q, 10_000.0, &cfg, &store, now).unwrap();
        assert_eq!(intent.qty, 7);
        assert_eq!(intent.limit_price, 50.12);
        assert_eq!(intent.side, Side::Buy);
        assert_eq!(intent.sl_price, Some(46.0));
        // 7 × 50.12 = 350.84, above min notional and below the 800 cap
        let m = compute_metrics(&intent, sig.score as f64);
        assert!((m.notional - 350.84).abs() < 1e-9);
    }

    #[test]
    fn wide_stop_is_rejected() {
        let dir = tempfile::tempdir().expect("tmp");
        let cfg = test_cfg(dir.path());
        let store = BarStore::new(dir.path().join("store"));
        // 20% stop distance
        let sig = candidate("X", 90, 50.0, 40.0, 60.0, ExecMode::Mr);
        let q = quote("X.US", 50.0, 49.9, 50.1);
        let now = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap().and_hms_opt(12, 0, 0).unwrap();
        let err = build_order_intent(&sig, &q, 10_000.0, &cfg, &store, now).unwrap_err();
        assert_eq!(err, "SKIP_SL_WIDE");
    }

    #[test]
    fn mr_without_trend_support_is_rejected() {
        let dir = tempfile::tempdir().expect("tmp");
        let cfg = test_cfg(dir.path());
        let store = BarStore::new(dir.path().join("store"));
        let mut sig = candidate("X", 90, 50.0, 46.0, 56.5, ExecMode::Mr);
        sig.above_ma50 = false;
        sig.ma50_slope = -0.01;
        let q = quote("X.US", 50.0, 49.9, 50.1);
        let now = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap().and_hms_opt(12, 0, 0).unwrap();
        assert_eq!(
            build_order_intent(&sig, &q, 10_000.0, &cfg, &store, now).unwrap_err(),
            "SKIP_MR_TREND"
        );
    }

    #[test]
    fn low_priced_illiquid_name_is_rejected() {
        let dir = tempfile::tempdir().expect("tmp");
        let cfg = test_cfg(dir.path());
        let store = BarStore::new(dir.path().join("store"));
        // $10 name with no local daily history to prove liquidity
        let sig = candidate("PENNY", 90, 10.0, 9.5, 11.5, ExecMode::Mr);
        let q = quote("PENNY.US", 10.0, 9.99, 10.01);
        let now = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap().and_hms_opt(12, 0, 0).unwrap();
        assert_eq!(
            build_order_intent(&sig, &q, 10_000.0, &cfg, &store, now).unwrap_err(),
            "SKIP_LOW_LIQUIDITY"
        );
    }

    #[test]
    fn exec_score_prefers_tight_stops_and_small_tickets() {
        let now = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap().and_hms_opt(12, 0, 0).unwrap();
        let tight = make_intent("A.US", Side::Buy, 7, 50.0, Some(48.0), None, "", serde_json::Value::Null, now);
        let wide = make_intent("B.US", Side::Buy, 7, 50.0, Some(45.5), None, "", serde_json::Value::Null, now);
        let mt = compute_metrics(&tight, 85.0);
        let mw = compute_metrics(&wide, 85.0);
        assert!(mt.score > mw.score);
    }

    #[tokio::test]
    async fn cooldown_blocks_and_is_tallied() {
        let dir = tempfile::tempdir().expect("tmp");
        let cfg = test_cfg(dir.path());
        let store = BarStore::new(dir.path().join("store"));
        let ledger = PaperLedger::new(dir.path().join("ledger.jsonl"));
        let mut state = TradingState::default();
        state.set_cooldown("X.US", &crate::state::iso_after_hours(12.0), "stopout");

        let mut sim = SimBroker::new(10_000.0);
        sim.set_quote("X.US", 50.11, 50.10, 50.12);
        let strong = vec![candidate("X", 90, 50.11, 46.0, 56.5, ExecMode::Struct)];
        let out =
            run_execution_select(&mut sim, &store, &mut state, &ledger, &strong, &cfg, Utc::now())
                .await;
        assert!(out.placed.is_none());
        assert!(out.skips.iter().any(|(_, r, _)| r.starts_with("SKIP_COOLDOWN:stopout")));
        assert!(state.pending_orders.is_empty());
    }

    #[tokio::test]
    async fn idempotency_key_prevents_second_order() {
        let dir = tempfile::tempdir().expect("tmp");
        let cfg = test_cfg(dir.path());
        let store = BarStore::new(dir.path().join("store"));
        let ledger = PaperLedger::new(dir.path().join("ledger.jsonl"));
        let mut state = TradingState::default();
        let mut sim = SimBroker::new(10_000.0);
        sim.set_quote("X.US", 50.11, 50.10, 50.12);
        let strong = vec![candidate("X", 90, 50.11, 46.0, 56.5, ExecMode::Struct)];

        let now = Utc::now();
        let first =
            run_execution_select(&mut sim, &store, &mut state, &ledger, &strong, &cfg, now).await;
        assert!(first.placed.is_some());
        assert_eq!(state.pending_orders.len(), 1);
        assert_eq!(state.open_positions.len(), 1);

        // same candidate next pass: daily limit would also block, so lift it
        let mut cfg2 = cfg.clone();
        cfg2.max_new_buys_per_day = 10;
        // remove the optimistic position so only idempotency can block
        state.open_positions.clear();
        state.pending_orders.clear();
        let second =
            run_execution_select(&mut sim, &store, &mut state, &ledger, &strong, &cfg2, now).await;
        assert!(second.placed.is_none());
        assert!(second.skips.iter().any(|(_, r, _)| r == "SKIP_IDEMPOTENT"));
    }

    #[tokio::test]
    async fn daily_limit_blocks_all() {
        let dir = tempfile::tempdir().expect("tmp");
        let cfg = test_cfg(dir.path());
        let store = BarStore::new(dir.path().join("store"));
        let ledger = PaperLedger::new(dir.path().join("ledger.jsonl"));
        let mut state = TradingState::default();
        let now = Utc::now();
        state.inc_daily(&now.format("%Y-%m-%d").to_string());

        let mut sim = SimBroker::new(10_000.0);
        sim.set_quote("X.US", 50.11, 50.10, 50.12);
        let strong = vec![candidate("X", 90, 50.11, 46.0, 56.5, ExecMode::Struct)];
        let out =
            run_execution_select(&mut sim, &store, &mut state, &ledger, &strong, &cfg, now).await;
        assert!(out.placed.is_none());
        assert!(out.skips.iter().all(|(_, r, _)| r == "SKIP_DAILY_LIMIT"));
    }

    #[tokio::test]
    async fn price_drift_blocks() {
        let dir = tempfile::tempdir().expect("tmp");
        let cfg = test_cfg(dir.path());
        let store = BarStore::new(dir.path().join("store"));
        let ledger = PaperLedger::new(dir.path().join("ledger.jsonl"));
        let mut state = TradingState::default();
        let mut sim = SimBroker::new(10_000.0);
        // tape ran 4% above the signal bar close
        sim.set_quote("X.US", 52.11, 52.10, 52.12);
        let strong = vec![candidate("X", 90, 50.11, 46.0, 56.5, ExecMode::Struct)];
        let out =
            run_execution_select(&mut sim, &store, &mut state, &ledger, &strong, &cfg, Utc::now())
                .await;
        assert!(out.placed.is_none());
        assert!(out.skips.iter().any(|(_, r, _)| r.starts_with("SKIP_PRICE_DRIFT")));
    }

    #[tokio::test]
    async fn commit_records_key_position_and_counter() {
        let dir = tempfile::tempdir().expect("tmp");
        let cfg = test_cfg(dir.path());
        let store = BarStore::new(dir.path().join("store"));
        let ledger = PaperLedger::new(dir.path().join("ledger.jsonl"));
        let mut state = TradingState::default();
        let mut sim = SimBroker::new(10_000.0);
        sim.set_quote("X.US", 50.11, 50.10, 50.12);
        let strong = vec![candidate("X", 90, 50.11, 46.0, 56.5, ExecMode::Struct)];
        let now = Utc::now();
        let out =
            run_execution_select(&mut sim, &store, &mut state, &ledger, &strong, &cfg, now).await;

        let (oid, intent) = out.placed.expect("placed");
        assert!(oid.starts_with("DRYRUN-X.US-Buy-"));
        assert_eq!(intent.qty, 7);
        assert!(state.was_executed("X|STRUCT|2025-01-01 10:00"));
        assert_eq!(state.daily_count(&now.format("%Y-%m-%d").to_string()), 1);
        let pos = &state.open_positions["X.US"];
        assert_eq!(pos.qty, Some(7.0));
        assert_eq!(pos.entry, Some(50.12));
        // notional respects the position cap: 350.84 ≤ max(800, 300)
        let notional = intent.limit_price * intent.qty as f64;
        assert!(notional <= (10_000.0 * cfg.max_position_pct).max(cfg.min_notional));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// exits.rs — Exit monitor and stop-loss escalator
//
// Walks local open positions against live quotes, emits STOP_LOSS /
// TAKE_PROFIT events, submits marketable sells, and chases unfilled
// stop-loss sells with cancel/replace at progressively worse prices.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde_json::json;

use crate::broker::{execute_intent, make_intent, BrokerClient, OrderIntent, QuoteSnapshot, Side};
use crate::config::EngineConfig;
use crate::router::marketable_limit_price;
use crate::state::{iso_after_hours, OpenPosition, PaperLedger, PendingOrder, TradingState};

pub const STOP_LOSS: &str = "STOP_LOSS";
pub const TAKE_PROFIT: &str = "TAKE_PROFIT";
pub const STOP_LOSS_ESCALATE: &str = "STOP_LOSS_ESCALATE";

/// Cancel/replace limit discounts off the last trade, by attempt number.
pub const ESCALATION_DISCOUNTS: [f64; 4] = [0.998, 0.995, 0.990, 0.985];

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExitEvent {
    pub symbol: String,
    pub kind: &'static str,
    pub last: f64,
    pub entry: f64,
    pub sl: Option<f64>,
    pub tp: Option<f64>,
}

/// Pure trigger check over the local position map and the latest quotes.
/// Stop-loss wins when both levels are breached on the same read.
pub fn check_open_positions(
    open_positions: &BTreeMap<String, OpenPosition>,
    quotes: &HashMap<String, f64>,
) -> Vec<ExitEvent> {
    let mut events = Vec::new();
    for (sym, rec) in open_positions {
        let entry = match rec.entry {
            Some(e) if e > 0.0 => e,
            _ => continue,
        };
        let last = match quotes.get(sym) {
            Some(&l) if l > 0.0 => l,
            _ => continue,
        };
        if let Some(sl) = rec.sl {
            if last <= sl {
                events.push(ExitEvent {
                    symbol: sym.clone(),
                    kind: STOP_LOSS,
                    last,
                    entry,
                    sl: rec.sl,
                    tp: rec.tp,
                });
                continue;
            }
        }
        if let Some(tp) = rec.tp {
            if last >= tp {
                events.push(ExitEvent {
                    symbol: sym.clone(),
                    kind: TAKE_PROFIT,
                    last,
                    entry,
                    sl: rec.sl,
                    tp: rec.tp,
                });
            }
        }
    }
    events
}

/// Marketable sell for an exit event: bid, falling back to last × 0.998.
pub fn build_exit_intent(
    symbol: &str,
    qty: u32,
    quote: &QuoteSnapshot,
    reason: &str,
    now: chrono::NaiveDateTime,
) -> Option<OrderIntent> {
    if symbol.is_empty() || qty == 0 {
        return None;
    }
    let limit_px = marketable_limit_price(Side::Sell, quote.bid, quote.ask, quote.last)?;
    Some(make_intent(
        symbol,
        Side::Sell,
        qty,
        round2(limit_px),
        None,
        None,
        &format!("exit|{}", reason),
        json!({ "reason": reason }),
        now,
    ))
}

/// Replacement limit for escalation attempt `n`, clamped to the last rung.
pub fn escalation_price(last: f64, attempt: u32) -> f64 {
    let idx = (attempt as usize).min(ESCALATION_DISCOUNTS.len() - 1);
    round2(last * ESCALATION_DISCOUNTS[idx])
}

#[derive(Debug, Default)]
pub struct ExitOutcome {
    pub events: usize,
    pub submitted: usize,
    pub escalated: usize,
}

/// One pass of the exit monitor. Escalation and the ordinary exit intent are
/// mutually exclusive within a tick.
pub async fn run_exit_monitor(
    broker: &mut dyn BrokerClient,
    state: &mut TradingState,
    ledger: &PaperLedger,
    cfg: &EngineConfig,
    now: DateTime<Utc>,
) -> ExitOutcome {
    let mut out = ExitOutcome::default();
    if state.open_positions.is_empty() {
        return out;
    }

    // quotes for every held symbol; per-symbol fetches are totally ordered
    let mut quotes: HashMap<String, f64> = HashMap::new();
    let symbols: Vec<String> = state.open_positions.keys().cloned().collect();
    for sym in &symbols {
        match broker.quote(sym).await {
            Ok(q) => {
                if let Some(last) = q.last {
                    quotes.insert(sym.clone(), last);
                }
            }
            Err(e) => warn!("[EXIT] {} quote failed: {}", sym, e),
        }
    }

    let events = check_open_positions(&state.open_positions, &quotes);
    out.events = events.len();
    if events.is_empty() {
        return out;
    }

    // broker-reported quantities; zero means our local state is stale
    let mut qty_map: HashMap<String, u32> = HashMap::new();
    match broker.stock_positions().await {
        Ok(positions) => {
            for p in positions {
                let qty = p.quantity.unwrap_or(0.0);
                if qty > 0.0 {
                    qty_map.insert(p.symbol.to_uppercase(), qty as u32);
                }
            }
        }
        Err(e) => warn!("[EXIT] position fetch failed: {}", e),
    }

    for ev in events {
        let qty = qty_map.get(&ev.symbol.to_uppercase()).copied().unwrap_or(0);
        if qty == 0 {
            info!("[EXIT] {} triggered {} but broker qty=0, skipping", ev.symbol, ev.kind);
            continue;
        }

        let pending_sells = state.pending_sells_for(&ev.symbol);
        if !pending_sells.is_empty() {
            if ev.kind == STOP_LOSS {
                escalate_stop_loss(broker, state, ledger, cfg, &ev, qty, &pending_sells, now, &mut out)
                    .await;
            } else {
                info!("[EXIT] {} {} with a sell already pending, skipping", ev.symbol, ev.kind);
            }
            // never stack a second sell in the same tick
            continue;
        }

        let quote = match broker.quote(&ev.symbol).await {
            Ok(q) => q,
            Err(e) => {
                warn!("[EXIT] {} quote failed: {}", ev.symbol, e);
                continue;
            }
        };
        let Some(intent) = build_exit_intent(&ev.symbol, qty, &quote, ev.kind, now.naive_utc())
        else {
            warn!("[EXIT] {} no usable quote for exit intent", ev.symbol);
            continue;
        };

        if let Err(e) = ledger.append(&intent, Some(intent.limit_price), "PENDING") {
            warn!("[EXIT] ledger append failed: {}", e);
        }
        let r = execute_intent(broker, &intent, &cfg.env).await;
        if let Some(order_id) = &r.order_id {
            state.add_pending_order(
                order_id,
                PendingOrder {
                    symbol: intent.symbol.clone(),
                    side: intent.side.as_str().to_string(),
                    qty: intent.qty,
                    limit_price: Some(intent.limit_price),
                    sl: None,
                    tp: None,
                    status: "PENDING".to_string(),
                    filled_qty: None,
                    avg_price: None,
                    updated_at: String::new(),
                    reason: Some(ev.kind.to_string()),
                },
            );
        }
        if r.ok {
            out.submitted += 1;
            info!(
                "LIVE_EXIT_{}:{}:{}:{}@{}",
                if r.dry_run { "DRYRUN" } else { "OK" },
                intent.symbol,
                intent.side.as_str(),
                intent.qty,
                intent.limit_price
            );
        } else {
            warn!("LIVE_EXIT_FAIL:{}:{}", intent.symbol, r.error.as_deref().unwrap_or("unknown"));
        }
    }
    out
}

/// Cancel every pending sell and replace with a more aggressive limit.
#[allow(clippy::too_many_arguments)]
async fn escalate_stop_loss(
    broker: &mut dyn BrokerClient,
    state: &mut TradingState,
    ledger: &PaperLedger,
    cfg: &EngineConfig,
    ev: &ExitEvent,
    qty: u32,
    pending_sells: &[String],
    now: DateTime<Utc>,
    out: &mut ExitOutcome,
) {
    let attempt = state.exit_escalation_attempt(&ev.symbol);
    if attempt >= cfg.exit_escalate_max_attempts {
        warn!(
            "[EXIT] {} escalation exhausted ({} attempts), leaving pending sell in place",
            ev.symbol, attempt
        );
        return;
    }

    for oid in pending_sells {
        // cancel is idempotent; a failure just means the order already died
        if let Err(e) = broker.cancel_order(oid).await {
            warn!("[EXIT] cancel {} failed: {}", oid, e);
        }
        state.remove_pending_order(oid);
    }

    let quote = match broker.quote(&ev.symbol).await {
        Ok(q) => q,
        Err(e) => {
            warn!("[EXIT] {} escalation quote failed: {}", ev.symbol, e);
            return;
        }
    };
    let px = match quote.last {
        Some(last) if last > 0.0 => escalation_price(last, attempt),
        _ => match marketable_limit_price(Side::Sell, quote.bid, quote.ask, quote.last) {
            Some(px) => round2(px),
            None => {
                warn!("[EXIT] {} escalation has no price reference", ev.symbol);
                return;
            }
        },
    };

    let intent = make_intent(
        &ev.symbol,
        Side::Sell,
        qty,
        px,
        None,
        None,
        &format!("exit_escalate|STOP_LOSS|a{}", attempt),
        json!({ "reason": STOP_LOSS, "attempt": attempt }),
        now.naive_utc(),
    );
    if let Err(e) = ledger.append(&intent, Some(intent.limit_price), "PENDING") {
        warn!("[EXIT] ledger append failed: {}", e);
    }
    let r = execute_intent(broker, &intent, &cfg.env).await;
    state.inc_exit_escalation(&ev.symbol);

    if let Some(order_id) = &r.order_id {
        state.add_pending_order(
            order_id,
            PendingOrder {
                symbol: ev.symbol.clone(),
                side: "Sell".to_string(),
                qty,
                limit_price: Some(px),
                sl: None,
                tp: None,
                status: "PENDING".to_string(),
                filled_qty: None,
                avg_price: None,
                updated_at: String::new(),
                reason: Some(STOP_LOSS_ESCALATE.to_string()),
            },
        );
    }
    if r.ok {
        out.escalated += 1;
        info!(
            "LIVE_EXIT_ESCALATE_{}:{}:attempt={} limit={}",
            if r.dry_run { "DRYRUN" } else { "SUBMIT" },
            ev.symbol,
            attempt,
            px
        );
    } else {
        warn!(
            "LIVE_EXIT_ESCALATE_FAIL:{}:{}",
            ev.symbol,
            r.error.as_deref().unwrap_or("unknown")
        );
    }
}

/// Post-fill transition shared with the tracker: drop the position and, on a
/// stop-out, start the cooldown clock.
pub fn apply_sell_fill(state: &mut TradingState, symbol: &str, reason: Option<&str>, cooldown_hours: f64) {
    state.remove_open_position(symbol);
    if matches!(reason, Some(STOP_LOSS) | Some(STOP_LOSS_ESCALATE)) {
        state.set_cooldown(symbol, &iso_after_hours(cooldown_hours), "stopout");
        state.clear_exit_escalation(symbol);
        info!("[EXIT] {} stopped out, cooldown {}h", symbol, cooldown_hours);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SimBroker;
    use crate::config::{EngineConfig, TradingEnv, TradingEnvKind};
    use serde_json::Value;

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

    fn position(entry: f64, sl: Option<f64>, tp: Option<f64>) -> OpenPosition {
        OpenPosition {
            qty: Some(7.0),
            entry: Some(entry),
            sl,
            tp,
            at: String::new(),
            meta: Value::Null,
        }
    }

    #[test]
    fn stop_loss_and_take_profit_triggers() {
        let mut positions = BTreeMap::new();
        positions.insert("X.US".to_string(), position(50.12, Some(46.0), Some(56.5)));
        positions.insert("Y.US".to_string(), position(20.0, Some(18.0), Some(24.0)));

        let mut quotes = HashMap::new();
        quotes.insert("X.US".to_string(), 45.90); // through the stop
        quotes.insert("Y.US".to_string(), 24.10); // through the target

        let mut events = check_open_positions(&positions, &quotes);
        events.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, STOP_LOSS);
        assert_eq!(events[1].kind, TAKE_PROFIT);
    }

    #[test]
    fn quiet_tape_triggers_nothing() {
        let mut positions = BTreeMap::new();
        positions.insert("X.US".to_string(), position(50.0, Some(46.0), Some(56.5)));
        let mut quotes = HashMap::new();
        quotes.insert("X.US".to_string(), 50.5);
        assert!(check_open_positions(&positions, &quotes).is_empty());
    }

    #[test]
    fn stub_positions_without_entry_are_ignored() {
        let mut positions = BTreeMap::new();
        positions.insert(
            "Y.US".to_string(),
            OpenPosition { qty: Some(3.0), entry: None, sl: None, tp: None, at: String::new(), meta: Value::Null },
        );
        let mut quotes = HashMap::new();
        quotes.insert("Y.US".to_string(), 10.0);
        assert!(check_open_positions(&positions, &quotes).is_empty());
    }

    #[test]
    fn escalation_ladder_prices() {
        assert_eq!(escalation_price(45.50, 0), 45.41);
        assert_eq!(escalation_price(45.50, 1), 45.27);
        assert_eq!(escalation_price(45.50, 2), 45.05);
        assert_eq!(escalation_price(45.50, 3), 44.82);
        // past the ladder it stays at the deepest rung
        assert_eq!(escalation_price(45.50, 9), 44.82);
    }

    #[tokio::test]
    async fn stop_loss_submits_marketable_sell() {
        let dir = tempfile::tempdir().expect("tmp");
        let cfg = test_cfg(dir.path());
        let ledger = PaperLedger::new(dir.path().join("ledger.jsonl"));
        let mut state = TradingState::default();
        state.add_open_position("X.US", 7.0, 50.12, Some(46.0), Some(56.5), Value::Null);

        let mut sim = SimBroker::new(10_000.0);
        sim.set_quote("X.US", 45.90, 45.88, 45.92);
        sim.set_position("X.US", 7.0);

        let out = run_exit_monitor(&mut sim, &mut state, &ledger, &cfg, Utc::now()).await;
        assert_eq!(out.events, 1);
        assert_eq!(out.submitted, 1);
        let (oid, rec) = state.pending_orders.iter().next().expect("pending sell");
        assert!(oid.starts_with("DRYRUN-X.US-Sell-"));
        assert_eq!(rec.reason.as_deref(), Some(STOP_LOSS));
        // marketable: the bid
        assert_eq!(rec.limit_price, Some(45.88));
    }

    #[tokio::test]
    async fn zero_broker_qty_skips_stale_position() {
        let dir = tempfile::tempdir().expect("tmp");
        let cfg = test_cfg(dir.path());
        let ledger = PaperLedger::new(dir.path().join("ledger.jsonl"));
        let mut state = TradingState::default();
        state.add_open_position("X.US", 7.0, 50.12, Some(46.0), None, Value::Null);

        let mut sim = SimBroker::new(10_000.0);
        sim.set_quote("X.US", 45.90, 45.88, 45.92);
        // broker reports no shares

        let out = run_exit_monitor(&mut sim, &mut state, &ledger, &cfg, Utc::now()).await;
        assert_eq!(out.events, 1);
        assert_eq!(out.submitted, 0);
        assert!(state.pending_orders.is_empty());
    }

    #[tokio::test]
    async fn escalation_cancels_then_replaces() {
        let dir = tempfile::tempdir().expect("tmp");
        let cfg = test_cfg(dir.path());
        let ledger = PaperLedger::new(dir.path().join("ledger.jsonl"));
        let mut state = TradingState::default();
        state.add_open_position("X.US", 7.0, 50.12, Some(46.0), None, Value::Null);
        state.add_pending_order(
            "OID-SELL-1",
            PendingOrder {
                symbol: "X.US".into(),
                side: "Sell".into(),
                qty: 7,
                limit_price: Some(45.90),
                sl: None,
                tp: None,
                status: "PENDING".into(),
                filled_qty: None,
                avg_price: None,
                updated_at: String::new(),
                reason: Some(STOP_LOSS.into()),
            },
        );

        let mut sim = SimBroker::new(10_000.0);
        sim.set_quote("X.US", 45.50, 45.48, 45.52);
        sim.set_position("X.US", 7.0);

        let out = run_exit_monitor(&mut sim, &mut state, &ledger, &cfg, Utc::now()).await;
        assert_eq!(out.escalated, 1);
        assert_eq!(out.submitted, 0, "no plain sell in the same tick as an escalation");
        assert_eq!(sim.cancelled, vec!["OID-SELL-1".to_string()]);
        assert_eq!(state.exit_escalation_attempt("X.US"), 1);

        // the replacement is the only pending sell, at 45.50 × 0.998 = 45.41
        let sells = state.pending_sells_for("X.US");
        assert_eq!(sells.len(), 1);
        let rec = &state.pending_orders[&sells[0]];
        assert_eq!(rec.limit_price, Some(45.41));
        assert_eq!(rec.reason.as_deref(), Some(STOP_LOSS_ESCALATE));
    }

    #[tokio::test]
    async fn escalation_stops_at_max_attempts() {
        let dir = tempfile::tempdir().expect("tmp");
        let cfg = test_cfg(dir.path());
        let ledger = PaperLedger::new(dir.path().join("ledger.jsonl"));
        let mut state = TradingState::default();
        state.add_open_position("X.US", 7.0, 50.12, Some(46.0), None, Value::Null);
        state.add_pending_order(
            "OID-SELL-1",
            PendingOrder {
                symbol: "X.US".into(),
                side: "Sell".into(),
                qty: 7,
                limit_price: Some(45.90),
                sl: None,
                tp: None,
                status: "PENDING".into(),
                filled_qty: None,
                avg_price: None,
                updated_at: String::new(),
                reason: Some(STOP_LOSS.into()),
            },
        );
        for _ in 0..3 {
            state.inc_exit_escalation("X.US");
        }

        let mut sim = SimBroker::new(10_000.0);
        sim.set_quote("X.US", 45.50, 45.48, 45.52);
        sim.set_position("X.US", 7.0);

        let out = run_exit_monitor(&mut sim, &mut state, &ledger, &cfg, Utc::now()).await;
        assert_eq!(out.escalated, 0);
        assert!(sim.cancelled.is_empty());
        // the original pending sell is left untouched
        assert_eq!(state.pending_sells_for("X.US"), vec!["OID-SELL-1".to_string()]);
    }

    #[test]
    fn sell_fill_on_stopout_sets_cooldown() {
        let mut state = TradingState::default();
        state.add_open_position("X.US", 7.0, 50.12, Some(46.0), None, Value::Null);
        state.inc_exit_escalation("X.US");
        apply_sell_fill(&mut state, "X.US", Some(STOP_LOSS), 24.0);
        assert!(state.open_positions.is_empty());
        assert!(state.cooldown_active("X.US", Utc::now()).is_some());
        assert_eq!(state.exit_escalation_attempt("X.US"), 0);
    }

    #[test]
    fn sell_fill_on_take_profit_sets_no_cooldown() {
        let mut state = TradingState::default();
        state.add_open_position("X.US", 7.0, 50.12, None, Some(56.5), Value::Null);
        apply_sell_fill(&mut state, "X.US", Some(TAKE_PROFIT), 24.0);
        assert!(state.open_positions.is_empty());
        assert!(state.cooldown_active("X.US", Utc::now()).is_none());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// tracker.rs — Pending-order tracker and position reconciler
//
// Advances every pending order toward a terminal status: dry-run ids fill
// immediately, real ids are matched against today's orders with an
// order-detail fallback. Afterwards the local position map is diffed against
// the broker's book so drift never survives a tick.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::HashMap;

use log::{info, warn};
use serde_json::json;

use crate::broker::{BrokerClient, OrderDetail};
use crate::exits::apply_sell_fill;
use crate::state::{OpenPosition, TradingState};

const TERMINAL_FILLED: [&str; 4] = ["FILLED", "DONE", "SUCCESS", "FILLED_ALL"];
const TERMINAL_DEAD: [&str; 5] = ["CANCELED", "CANCELLED", "REJECTED", "FAILED", "EXPIRED"];

fn is_filled(status: &str) -> bool {
    TERMINAL_FILLED.contains(&status)
}

fn is_dead(status: &str) -> bool {
    TERMINAL_DEAD.contains(&status)
}

#[derive(Debug, Default, PartialEq)]
pub struct TrackerSummary {
    pub pending: usize,
    pub updated: usize,
    pub removed: usize,
}

/// Apply the buy-side fill transition. Partial buy fills patch the quantity;
/// sell fills always remove the whole position (kept asymmetric on purpose).
fn apply_buy_fill(
    state: &mut TradingState,
    symbol: &str,
    qty: u32,
    filled_qty: Option<f64>,
    avg_price: f64,
    sl: Option<f64>,
    tp: Option<f64>,
    source: &str,
    order_id: Option<&str>,
) {
    let qty = match filled_qty {
        Some(f) if f > 0.0 => f,
        _ => qty as f64,
    };
    let meta = match order_id {
        Some(oid) => json!({ "source": source, "order_id": oid }),
        None => json!({ "source": source }),
    };
    state.add_open_position(symbol, qty, avg_price, sl, tp, meta);
}

/// Advance every pending order one step. Dry-run ids simulate an immediate
/// fill at the limit price.
pub async fn reconcile_pending_orders(
    broker: &mut dyn BrokerClient,
    state: &mut TradingState,
    cooldown_hours: f64,
) -> TrackerSummary {
    let mut summary = TrackerSummary { pending: state.pending_orders.len(), ..Default::default() };
    if summary.pending == 0 {
        return summary;
    }

    // one best-effort snapshot of today's orders for all real ids
    let order_ids: Vec<String> = state.pending_orders.keys().cloned().collect();
    let needs_broker = order_ids.iter().any(|oid| !oid.starts_with("DRYRUN-"));
    let today_map: HashMap<String, crate::broker::OrderSummary> = if needs_broker {
        match broker.today_orders().await {
            Ok(orders) => orders
                .into_iter()
                .filter(|o| !o.order_id.is_empty())
                .map(|o| (o.order_id.clone(), o))
                .collect(),
            Err(e) => {
                warn!("[TRACK] today_orders failed: {}. Using order_detail only.", e);
                HashMap::new()
            }
        }
    } else {
        HashMap::new()
    };

    for oid in order_ids {
        let Some(rec) = state.pending_orders.get(&oid).cloned() else { continue };

        if oid.starts_with("DRYRUN-") {
            state.patch_pending_order(&oid, Some("FILLED"), None, None);
            summary.updated += 1;
            let side = rec.side.to_lowercase();
            if side == "buy" {
                apply_buy_fill(
                    state,
                    &rec.symbol,
                    rec.qty,
                    None,
                    rec.limit_price.unwrap_or(0.0),
                    rec.sl,
                    rec.tp,
                    "dryrun_fill",
                    None,
                );
            } else if side == "sell" {
                apply_sell_fill(state, &rec.symbol, rec.reason.as_deref(), cooldown_hours);
            }
            state.remove_pending_order(&oid);
            summary.removed += 1;
            continue;
        }

        // real order: today_orders first, order_detail as fallback
        let (status, filled_qty, avg_price) = match today_map.get(&oid) {
            Some(summ) => (summ.status.clone(), summ.filled_qty, summ.avg_price),
            None => match broker.order_detail(&oid).await {
                Ok(OrderDetail { status, filled_qty, avg_price }) => {
                    (status, filled_qty, avg_price)
                }
                Err(e) => {
                    warn!("[TRACK] order_detail {} failed: {}", oid, e);
                    continue;
                }
            },
        };
        let status_uc = status.trim().to_uppercase();
        if status_uc.is_empty() {
            continue;
        }

        state.patch_pending_order(&oid, Some(&status_uc), filled_qty, avg_price);
        summary.updated += 1;

        if is_filled(&status_uc) {
            let side = rec.side.to_lowercase();
            if side == "buy" {
                let avg = avg_price.or(rec.limit_price).unwrap_or(0.0);
                apply_buy_fill(
                    state,
                    &rec.symbol,
                    rec.qty,
                    filled_qty,
                    avg,
                    rec.sl,
                    rec.tp,
                    "broker_fill",
                    Some(&oid),
                );
            } else if side == "sell" {
                apply_sell_fill(state, &rec.symbol, rec.reason.as_deref(), cooldown_hours);
            }
            state.remove_pending_order(&oid);
            summary.removed += 1;
        } else if is_dead(&status_uc) {
            state.remove_pending_order(&oid);
            summary.removed += 1;
        }
    }

    if summary.updated > 0 || summary.removed > 0 {
        info!("[ORDER_RECONCILE] updated={} removed={}", summary.updated, summary.removed);
    }
    summary
}

#[derive(Debug, Default)]
pub struct ReconcileSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub broker_count: usize,
    pub local_count: usize,
}

/// Diff local open positions against the broker book. Locals the broker no
/// longer holds are dropped; broker-only positions get a stub record with
/// unknown entry/sl/tp rather than guessed levels.
pub async fn reconcile_open_positions(
    broker: &mut dyn BrokerClient,
    state: &mut TradingState,
) -> Result<ReconcileSummary, crate::config::EngineError> {
    let broker_pos = broker.stock_positions().await?;
    let broker_syms: HashMap<String, &crate::broker::StockPosition> = broker_pos
        .iter()
        .filter(|p| !p.symbol.is_empty())
        .map(|p| (p.symbol.to_uppercase(), p))
        .collect();

    let mut summary = ReconcileSummary { broker_count: broker_syms.len(), ..Default::default() };

    let local_syms: Vec<String> = state.open_positions.keys().cloned().collect();
    for sym in &local_syms {
        if !broker_syms.contains_key(&sym.to_uppercase()) {
            state.remove_open_position(sym);
            summary.removed.push(sym.clone());
        }
    }

    let local_upper: Vec<String> = state.open_positions.keys().map(|k| k.to_uppercase()).collect();
    for (sym_u, p) in &broker_syms {
        if !local_upper.contains(sym_u) {
            state.open_positions.insert(
                p.symbol.clone(),
                OpenPosition {
                    qty: p.quantity,
                    entry: None,
                    sl: None,
                    tp: None,
                    at: "reconciled".to_string(),
                    meta: json!({ "source": "broker_reconcile" }),
                },
            );
            summary.added.push(p.symbol.clone());
        }
    }

    summary.local_count = state.open_positions.len();
    if !summary.added.is_empty() || !summary.removed.is_empty() {
        info!(
            "[RECONCILE] added={} removed={} broker={} local={}",
            summary.added.len(),
            summary.removed.len(),
            summary.broker_count,
            summary.local_count
        );
    }
    Ok(summary)
}

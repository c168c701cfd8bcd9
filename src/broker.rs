// ─────────────────────────────────────────────────────────────────────────────
// broker.rs — Broker client (quotes + trading)
//
// One trait, two implementations: LiveBroker speaks token-authenticated REST
// to the brokerage OpenAPI; SimBroker is the in-memory stand-in used under
// paper env and in tests. Submission is additionally hard-gated by the
// trading-environment flags — a constructed LiveBroker alone cannot trade.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{EngineError, TradingEnv};

const REQUEST_TIMEOUT_SECS: u64 = 10;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum BrokerError {
    Network(String),
    Api(String),
    Parse(String),
    LiveDisabled,
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Network(s) => write!(f, "Network Error: {}", s),
            BrokerError::Api(s) => write!(f, "API Error: {}", s),
            BrokerError::Parse(s) => write!(f, "Parse Error: {}", s),
            BrokerError::LiveDisabled => write!(f, "Live trading blocked: hard-enable flag not set"),
        }
    }
}

impl From<BrokerError> for EngineError {
    fn from(e: BrokerError) -> Self {
        EngineError::Broker(e.to_string())
    }
}

// ─── Shared models ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }
}

/// An immutable order description prior to submission. Day-limit only;
/// sl/tp ride along for bookkeeping and are never sent to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub created_at: NaiveDateTime,
    pub symbol: String,
    pub side: Side,
    pub qty: u32,
    pub order_type: String,
    pub limit_price: f64,
    pub sl_price: Option<f64>,
    pub tp_price: Option<f64>,
    pub remark: String,
    pub source: Value,
}

pub fn make_intent(
    symbol: &str,
    side: Side,
    qty: u32,
    limit_price: f64,
    sl_price: Option<f64>,
    tp_price: Option<f64>,
    remark: &str,
    source: Value,
    now: NaiveDateTime,
) -> OrderIntent {
    let mut remark = remark.to_string();
    remark.truncate(64);
    OrderIntent {
        created_at: now,
        symbol: symbol.to_string(),
        side,
        qty,
        order_type: "LO".to_string(),
        limit_price,
        sl_price,
        tp_price,
        remark,
        source,
    }
}

#[derive(Debug, Clone)]
pub struct QuoteSnapshot {
    pub symbol: String,
    pub last: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct StockPosition {
    pub symbol: String,
    pub quantity: Option<f64>,
    pub cost_price: Option<f64>,
    pub market_value: Option<f64>,
    pub unrealized_pl: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct OrderSummary {
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub status: String,
    pub qty: Option<f64>,
    pub filled_qty: Option<f64>,
    pub avg_price: Option<f64>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OrderDetail {
    pub status: String,
    pub filled_qty: Option<f64>,
    pub avg_price: Option<f64>,
}

/// Watchlist tickers are bare upper-case; the broker wants a market suffix.
pub fn to_broker_symbol(ticker: &str) -> String {
    let t = ticker.trim().to_uppercase();
    if t.contains('.') {
        t
    } else {
        format!("{}.US", t)
    }
}

// ─── Broker trait ────────────────────────────────────────────────────────────

#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn quote(&mut self, symbol: &str) -> Result<QuoteSnapshot, BrokerError>;
    async fn available_cash(&mut self, currency: &str) -> Result<Option<f64>, BrokerError>;
    async fn stock_positions(&mut self) -> Result<Vec<StockPosition>, BrokerError>;
    async fn submit_order(&mut self, intent: &OrderIntent) -> Result<String, BrokerError>;
    async fn cancel_order(&mut self, order_id: &str) -> Result<(), BrokerError>;
    async fn today_orders(&mut self) -> Result<Vec<OrderSummary>, BrokerError>;
    async fn order_detail(&mut self, order_id: &str) -> Result<OrderDetail, BrokerError>;
}

/// Two successive pulls for the staleness gate. Per-symbol quote calls are
/// totally ordered within a tick, so the drift is meaningful.
pub async fn quote_twice(
    broker: &mut dyn BrokerClient,
    symbol: &str,
) -> Result<(QuoteSnapshot, QuoteSnapshot, f64), BrokerError> {
    let q1 = broker.quote(symbol).await?;
    let q2 = broker.quote(symbol).await?;
    let drift = match (q1.last, q2.last) {
        (Some(a), Some(b)) if a > 0.0 => (b - a).abs() / a,
        _ => 0.0,
    };
    Ok((q1, q2, drift))
}

// ─── Submission (env-gated) ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SubmitResult {
    pub ok: bool,
    pub dry_run: bool,
    pub order_id: Option<String>,
    pub error: Option<String>,
}

pub fn dryrun_order_id(intent: &OrderIntent) -> String {
    format!(
        "DRYRUN-{}-{}-{}",
        intent.symbol,
        intent.side.as_str(),
        intent.created_at.format("%Y-%m-%dT%H:%M:%S")
    )
}

/// Submit under live env. Dry-run unless `LIVE_SUBMIT=1`; refuses entirely
/// without the hard-enable flag.
pub async fn submit_live_order(
    broker: &mut dyn BrokerClient,
    intent: &OrderIntent,
    env: &TradingEnv,
) -> SubmitResult {
    if !env.live_armed() {
        return SubmitResult {
            ok: false,
            dry_run: false,
            order_id: None,
            error: Some(BrokerError::LiveDisabled.to_string()),
        };
    }
    if !env.live_submit {
        return SubmitResult {
            ok: true,
            dry_run: true,
            order_id: Some(dryrun_order_id(intent)),
            error: None,
        };
    }
    match broker.submit_order(intent).await {
        Ok(order_id) => SubmitResult { ok: true, dry_run: false, order_id: Some(order_id), error: None },
        Err(e) => SubmitResult { ok: false, dry_run: false, order_id: None, error: Some(e.to_string()) },
    }
}

/// Unified execution seam for the router and the exit monitor: live env goes
/// through the hard gate; paper env always synthesizes a dry-run id.
pub async fn execute_intent(
    broker: &mut dyn BrokerClient,
    intent: &OrderIntent,
    env: &TradingEnv,
) -> SubmitResult {
    if env.live_armed() {
        submit_live_order(broker, intent, env).await
    } else {
        SubmitResult {
            ok: true,
            dry_run: true,
            order_id: Some(dryrun_order_id(intent)),
            error: None,
        }
    }
}

// ─── Sim broker (in-memory) ──────────────────────────────────────────────────

#[derive(Default)]
pub struct SimBroker {
    pub cash: f64,
    pub quotes: HashMap<String, QuoteSnapshot>,
    pub positions: Vec<StockPosition>,
    pub today: Vec<OrderSummary>,
    pub details: HashMap<String, OrderDetail>,
    pub submitted: Vec<OrderIntent>,
    pub cancelled: Vec<String>,
    next_id: u64,
}

impl SimBroker {
    pub fn new(cash: f64) -> Self {
        Self { cash, ..Default::default() }
    }

    pub fn set_quote(&mut self, symbol: &str, last: f64, bid: f64, ask: f64) {
        self.quotes.insert(
            symbol.to_string(),
            QuoteSnapshot {
                symbol: symbol.to_string(),
                last: Some(last),
                bid: Some(bid),
                ask: Some(ask),
                ts: Utc::now(),
            },
        );
    }

    pub fn set_position(&mut self, symbol: &str, qty: f64) {
        self.positions.push(StockPosition {
            symbol: symbol.to_string(),
            quantity: Some(qty),
            ..Default::default()
        });
    }
}

#[async_trait]
impl BrokerClient for SimBroker {
    async fn quote(&mut self, symbol: &str) -> Result<QuoteSnapshot, BrokerError> {
        Ok(self.quotes.get(symbol).cloned().unwrap_or(QuoteSnapshot {
            symbol: symbol.to_string(),
            last: None,
            bid: None,
            ask: None,
            ts: Utc::now(),
        }))
    }

    async fn available_cash(&mut self, _currency: &str) -> Result<Option<f64>, BrokerError> {
        Ok(Some(self.cash))
    }

    async fn stock_positions(&mut self) -> Result<Vec<StockPosition>, BrokerError> {
        Ok(self.positions.clone())
    }

    async fn submit_order(&mut self, intent: &OrderIntent) -> Result<String, BrokerError> {
        self.next_id += 1;
        self.submitted.push(intent.clone());
        Ok(format!("SIM-{}", self.next_id))
    }

    async fn cancel_order(&mut self, order_id: &str) -> Result<(), BrokerError> {
        self.cancelled.push(order_id.to_string());
        Ok(())
    }

    async fn today_orders(&mut self) -> Result<Vec<OrderSummary>, BrokerError> {
        Ok(self.today.clone())
    }

    async fn order_detail(&mut self, order_id: &str) -> Result<OrderDetail, BrokerError> {
        self.details
            .get(order_id)
            .cloned()
            .ok_or_else(|| BrokerError::Api(format!("unknown order {}", order_id)))
    }
}

// ─── Live broker (REST) ──────────────────────────────────────────────────────

pub struct LiveBroker {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl LiveBroker {
    /// Credentials come from env and are never persisted anywhere.
    pub fn from_env() -> Result<Self, EngineError> {
        let base_url = std::env::var("BROKER_API_URL")
            .map_err(|_| EngineError::Configuration("BROKER_API_URL not set".into()))?;
        let token = std::env::var("BROKER_ACCESS_TOKEN")
            .map_err(|_| EngineError::Configuration("BROKER_ACCESS_TOKEN not set".into()))?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| EngineError::Configuration(format!("http client: {}", e)))?;
        Ok(Self { http, base_url, token })
    }

    pub fn has_credentials() -> bool {
        std::env::var("BROKER_API_URL").is_ok() && std::env::var("BROKER_ACCESS_TOKEN").is_ok()
    }

    async fn get(&self, path: &str) -> Result<Value, BrokerError> {
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(BrokerError::Api(format!("{} -> {}", path, resp.status())));
        }
        resp.json().await.map_err(|e| BrokerError::Parse(e.to_string()))
    }
}

fn v_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn field_f64(obj: &Value, names: &[&str]) -> Option<f64> {
    names.iter().find_map(|n| obj.get(*n).and_then(v_f64))
}

fn field_str(obj: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|n| obj.get(*n))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
}

fn parse_order_summary(o: &Value) -> OrderSummary {
    OrderSummary {
        order_id: field_str(o, &["order_id", "id"]).unwrap_or_default(),
        symbol: field_str(o, &["symbol"]).unwrap_or_default(),
        side: field_str(o, &["side"]).unwrap_or_default(),
        status: field_str(o, &["status"]).unwrap_or_default(),
        qty: field_f64(o, &["quantity", "qty"]),
        filled_qty: field_f64(o, &["filled_quantity", "filled_qty"]),
        avg_price: field_f64(o, &["average_price", "avg_price"]),
        updated_at: field_str(o, &["updated_at", "update_time"]),
    }
}

#[async_trait]
impl BrokerClient for LiveBroker {
    async fn quote(&mut self, symbol: &str) -> Result<QuoteSnapshot, BrokerError> {
        let body = self.get(&format!("/v1/quote/realtime?symbols={}", symbol)).await?;
        let list = body
            .pointer("/data/secu_quote")
            .or_else(|| body.get("data"))
            .and_then(Value::as_array);
        let q = list.and_then(|l| l.first());
        Ok(match q {
            Some(q) => QuoteSnapshot {
                symbol: symbol.to_string(),
                last: field_f64(q, &["last_done", "last"]),
                bid: field_f64(q, &["bid_price", "bid"]),
                ask: field_f64(q, &["ask_price", "ask"]),
                ts: Utc::now(),
            },
            None => QuoteSnapshot {
                symbol: symbol.to_string(),
                last: None,
                bid: None,
                ask: None,
                ts: Utc::now(),
            },
        })
    }

    async fn available_cash(&mut self, currency: &str) -> Result<Option<f64>, BrokerError> {
        let body = self.get("/v1/asset/account").await?;
        let items = body
            .pointer("/data/list")
            .or_else(|| body.get("data"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let want = currency.to_uppercase();
        for item in &items {
            let infos = item.get("cash_infos").and_then(Value::as_array);
            let Some(infos) = infos else { continue };
            for c in infos {
                let cur = field_str(c, &["currency"]).unwrap_or_default().to_uppercase();
                if cur == want {
                    return Ok(field_f64(c, &["available_cash"]));
                }
            }
        }
        Ok(None)
    }

    async fn stock_positions(&mut self) -> Result<Vec<StockPosition>, BrokerError> {
        let body = self.get("/v1/asset/stock").await?;
        let mut out = Vec::new();
        // response may wrap positions in account channels
        let channels = body
            .pointer("/data/list")
            .or_else(|| body.pointer("/data/channels"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for ch in &channels {
            let positions = ch
                .get("stock_info")
                .or_else(|| ch.get("positions"))
                .and_then(Value::as_array);
            let Some(positions) = positions else { continue };
            for p in positions {
                let Some(symbol) = field_str(p, &["symbol", "code"]) else { continue };
                if symbol.is_empty() {
                    continue;
                }
                out.push(StockPosition {
                    symbol,
                    quantity: field_f64(p, &["quantity", "qty"]),
                    cost_price: field_f64(p, &["cost_price"]),
                    market_value: field_f64(p, &["market_value", "market_val"]),
                    unrealized_pl: field_f64(p, &["unrealized_pl"]),
                });
            }
        }
        Ok(out)
    }

    async fn submit_order(&mut self, intent: &OrderIntent) -> Result<String, BrokerError> {
        if intent.order_type != "LO" {
            return Err(BrokerError::Api(format!("unsupported order_type={}", intent.order_type)));
        }
        let payload = serde_json::json!({
            "symbol": intent.symbol,
            "order_type": "LO",
            "side": intent.side.as_str(),
            "submitted_quantity": intent.qty.to_string(),
            "time_in_force": "Day",
            "submitted_price": format!("{:.2}", intent.limit_price),
            "remark": intent.remark,
        });
        let resp = self
            .http
            .post(format!("{}/v1/trade/order", self.base_url))
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(BrokerError::Api(format!("submit -> {}", resp.status())));
        }
        let body: Value = resp.json().await.map_err(|e| BrokerError::Parse(e.to_string()))?;
        match body.pointer("/data/order_id").or_else(|| body.get("order_id")) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(BrokerError::Parse("submit response missing order_id".into())),
        }
    }

    async fn cancel_order(&mut self, order_id: &str) -> Result<(), BrokerError> {
        let resp = self
            .http
            .delete(format!("{}/v1/trade/order?order_id={}", self.base_url, order_id))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(BrokerError::Api(format!("cancel {} -> {}", order_id, resp.status())));
        }
        Ok(())
    }

    async fn today_orders(&mut self) -> Result<Vec<OrderSummary>, BrokerError> {
        let body = self.get("/v1/trade/order/today").await?;
        let orders = body
            .pointer("/data/orders")
            .or_else(|| body.get("orders"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(orders.iter().map(parse_order_summary).collect())
    }

    async fn order_detail(&mut self, order_id: &str) -> Result<OrderDetail, BrokerError> {
        let body = self.get(&format!("/v1/trade/order?order_id={}", order_id)).await?;
        let o = body.get("data").unwrap_or(&body);
        Ok(OrderDetail {
            status: field_str(o, &["status"]).unwrap_or_default(),
            filled_qty: field_f64(o, &["filled_quantity", "filled_qty"]),
            avg_price: field_f64(o, &["average_price", "avg_price"]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap().and_hms_opt(10, 0, 0).unwrap()
    }

    #[test]
    fn symbol_mapping() {
        assert_eq!(to_broker_symbol("tsla"), "TSLA.US");
        assert_eq!(to_broker_symbol("NVDA.US"), "NVDA.US");
        assert_eq!(to_broker_symbol(" ko "), "KO.US");
    }

    #[test]
    fn dryrun_id_shape() {
        let intent = make_intent(
            "X.US",
            Side::Buy,
            7,
            50.12,
            Some(46.0),
            Some(56.5),
            "test",
            Value::Null,
            now(),
        );
        assert_eq!(dryrun_order_id(&intent), "DRYRUN-X.US-Buy-2025-01-01T10:00:00");
    }

    #[test]
    fn remark_truncated_to_64() {
        let long = "x".repeat(200);
        let intent = make_intent("X.US", Side::Buy, 1, 10.0, None, None, &long, Value::Null, now());
        assert_eq!(intent.remark.len(), 64);
    }

    #[tokio::test]
    async fn submit_blocked_without_hard_enable() {
        let mut sim = SimBroker::new(1000.0);
        let intent = make_intent("X.US", Side::Buy, 1, 10.0, None, None, "t", Value::Null, now());
        let env = TradingEnv {
            kind: crate::config::TradingEnvKind::Live,
            live_enabled: false,
            live_submit: true,
        };
        let r = submit_live_order(&mut sim, &intent, &env).await;
        assert!(!r.ok);
        assert!(sim.submitted.is_empty());
    }

    #[tokio::test]
    async fn live_without_submit_flag_dry_runs() {
        let mut sim = SimBroker::new(1000.0);
        let intent = make_intent("X.US", Side::Sell, 2, 9.0, None, None, "t", Value::Null, now());
        let env = TradingEnv {
            kind: crate::config::TradingEnvKind::Live,
            live_enabled: true,
            live_submit: false,
        };
        let r = submit_live_order(&mut sim, &intent, &env).await;
        assert!(r.ok && r.dry_run);
        assert!(r.order_id.unwrap().starts_with("DRYRUN-"));
        assert!(sim.submitted.is_empty());
    }

    #[tokio::test]
    async fn paper_env_synthesizes_dryrun() {
        let mut sim = SimBroker::new(1000.0);
        let intent = make_intent("X.US", Side::Buy, 1, 10.0, None, None, "t", Value::Null, now());
        let env = TradingEnv {
            kind: crate::config::TradingEnvKind::Paper,
            live_enabled: false,
            live_submit: false,
        };
        let r = execute_intent(&mut sim, &intent, &env).await;
        assert!(r.ok && r.dry_run);
        assert!(r.order_id.unwrap().starts_with("DRYRUN-X.US-Buy-"));
    }

    #[tokio::test]
    async fn quote_twice_reports_drift() {
        let mut sim = SimBroker::new(1000.0);
        sim.set_quote("X.US", 100.0, 99.9, 100.1);
        let (q1, q2, drift) = quote_twice(&mut sim, "X.US").await.unwrap();
        assert_eq!(q1.last, q2.last);
        assert_eq!(drift, 0.0);
    }
}

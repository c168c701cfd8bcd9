// ─────────────────────────────────────────────────────────────────────────────
// state.rs — Durable trading state, paper ledger, tick lock
//
// The trading-state document is the only mutable shared resource. It is read
// once at tick start, mutated in memory, and written whole at commit points;
// the tick lock serializes whole ticks so writes never interleave.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::OrderIntent;
use crate::config::EngineError;

pub const STATE_VERSION: u32 = 1;

fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%z").to_string()
}

pub fn iso_after_hours(hours: f64) -> String {
    let until = Utc::now() + Duration::seconds((hours * 3600.0) as i64);
    until.format("%Y-%m-%dT%H:%M:%S%z").to_string()
}

fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z")
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

// ─── Document records ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutedKey {
    pub at: String,
    #[serde(default)]
    pub meta: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cooldown {
    pub until: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPosition {
    pub qty: Option<f64>,
    pub entry: Option<f64>,
    pub sl: Option<f64>,
    pub tp: Option<f64>,
    pub at: String,
    #[serde(default)]
    pub meta: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    pub symbol: String,
    pub side: String,
    pub qty: u32,
    pub limit_price: Option<f64>,
    #[serde(default)]
    pub sl: Option<f64>,
    #[serde(default)]
    pub tp: Option<f64>,
    pub status: String,
    #[serde(default)]
    pub filled_qty: Option<f64>,
    #[serde(default)]
    pub avg_price: Option<f64>,
    pub updated_at: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipTally {
    pub reason: String,
    pub count: u32,
    pub samples: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecSkipSummary {
    pub ts: String,
    pub skipped: u32,
    pub reasons: Vec<SkipTally>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentSignal {
    pub ticker: String,
    pub score: i32,
    pub price: f64,
    pub time: String,
}

// ─── The document ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingState {
    pub version: u32,
    pub updated_at: String,
    #[serde(default)]
    pub executed_keys: BTreeMap<String, ExecutedKey>,
    #[serde(default)]
    pub daily: BTreeMap<String, u32>,
    #[serde(default)]
    pub cooldowns: BTreeMap<String, Cooldown>,
    #[serde(default)]
    pub open_positions: BTreeMap<String, OpenPosition>,
    #[serde(default)]
    pub pending_orders: BTreeMap<String, PendingOrder>,
    #[serde(default)]
    pub exit_escalations: BTreeMap<String, u32>,
    #[serde(default)]
    pub last_exec_skip: Option<ExecSkipSummary>,
    #[serde(default)]
    pub no_signal_streak: u32,
    #[serde(default)]
    pub sent_signals: BTreeMap<String, SentSignal>,
}

impl Default for TradingState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: now_iso(),
            executed_keys: BTreeMap::new(),
            daily: BTreeMap::new(),
            cooldowns: BTreeMap::new(),
            open_positions: BTreeMap::new(),
            pending_orders: BTreeMap::new(),
            exit_escalations: BTreeMap::new(),
            last_exec_skip: None,
            no_signal_streak: 0,
            sent_signals: BTreeMap::new(),
        }
    }
}

impl TradingState {
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match serde_json::from_str::<TradingState>(&content) {
                    Ok(state) => {
                        info!(
                            "[STATE] loaded {:?}: positions={} pending={} streak={}",
                            path,
                            state.open_positions.len(),
                            state.pending_orders.len(),
                            state.no_signal_streak
                        );
                        return state;
                    }
                    Err(e) => error!("[STATE] parse failed: {}", e),
                },
                Err(e) => error!("[STATE] read failed: {}", e),
            }
        }
        info!("[STATE] no state file, starting fresh");
        TradingState::default()
    }

    /// Write the whole document. `updated_at` never goes backwards even if
    /// the wall clock does.
    pub fn save(&mut self, path: &Path) -> Result<(), EngineError> {
        let now = now_iso();
        let prev = parse_iso(&self.updated_at);
        let next = parse_iso(&now);
        self.updated_at = match (prev, next) {
            (Some(p), Some(n)) if n < p => self.updated_at.clone(),
            _ => now,
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    // ── idempotency ──────────────────────────────────────────────────────────

    pub fn was_executed(&self, key: &str) -> bool {
        self.executed_keys.contains_key(key)
    }

    pub fn mark_executed(&mut self, key: &str, meta: Value) {
        self.executed_keys.insert(key.to_string(), ExecutedKey { at: now_iso(), meta });
    }

    // ── daily counters ───────────────────────────────────────────────────────

    pub fn daily_count(&self, day_key: &str) -> u32 {
        self.daily.get(day_key).copied().unwrap_or(0)
    }

    pub fn inc_daily(&mut self, day_key: &str) {
        *self.daily.entry(day_key.to_string()).or_insert(0) += 1;
    }

    // ── cooldowns ────────────────────────────────────────────────────────────

    pub fn set_cooldown(&mut self, symbol: &str, until_iso: &str, reason: &str) {
        self.cooldowns.insert(
            symbol.to_string(),
            Cooldown { until: until_iso.to_string(), reason: reason.to_string() },
        );
    }

    /// Expired entries are cleared lazily on read.
    pub fn cooldown_active(&mut self, symbol: &str, now: DateTime<Utc>) -> Option<String> {
        let cd = self.cooldowns.get(symbol)?;
        match parse_iso(&cd.until) {
            Some(until) if now < until => Some(cd.reason.clone()),
            _ => {
                self.cooldowns.remove(symbol);
                None
            }
        }
    }

    // ── open positions ───────────────────────────────────────────────────────

    pub fn add_open_position(
        &mut self,
        symbol: &str,
        qty: f64,
        entry: f64,
        sl: Option<f64>,
        tp: Option<f64>,
        meta: Value,
    ) {
        self.open_positions.insert(
            symbol.to_string(),
            OpenPosition {
                qty: Some(qty),
                entry: Some(entry),
                sl,
                tp,
                at: now_iso(),
                meta,
            },
        );
    }

    pub fn remove_open_position(&mut self, symbol: &str) -> Option<OpenPosition> {
        self.open_positions.remove(symbol)
    }

    /// Sum of (entry − sl) × qty over positions with full risk data.
    pub fn total_open_risk_usd(&self) -> f64 {
        self.open_positions
            .values()
            .filter_map(|p| {
                let (qty, entry, sl) = (p.qty?, p.entry?, p.sl?);
                Some(((entry - sl) * qty).max(0.0))
            })
            .sum()
    }

    // ── pending orders ───────────────────────────────────────────────────────

    pub fn add_pending_order(&mut self, order_id: &str, mut rec: PendingOrder) {
        rec.updated_at = now_iso();
        self.pending_orders.insert(order_id.to_string(), rec);
    }

    pub fn patch_pending_order(
        &mut self,
        order_id: &str,
        status: Option<&str>,
        filled_qty: Option<f64>,
        avg_price: Option<f64>,
    ) {
        if let Some(rec) = self.pending_orders.get_mut(order_id) {
            if let Some(s) = status {
                rec.status = s.to_uppercase();
            }
            if filled_qty.is_some() {
                rec.filled_qty = filled_qty;
            }
            if avg_price.is_some() {
                rec.avg_price = avg_price;
            }
            rec.updated_at = now_iso();
        }
    }

    pub fn remove_pending_order(&mut self, order_id: &str) -> Option<PendingOrder> {
        self.pending_orders.remove(order_id)
    }

    pub fn has_pending_symbol_side(&self, symbol: &str, side: &str) -> bool {
        self.pending_orders.values().any(|rec| {
            rec.symbol.eq_ignore_ascii_case(symbol) && rec.side.eq_ignore_ascii_case(side)
        })
    }

    pub fn pending_sells_for(&self, symbol: &str) -> Vec<String> {
        self.pending_orders
            .iter()
            .filter(|(_, rec)| {
                rec.symbol.eq_ignore_ascii_case(symbol) && rec.side.eq_ignore_ascii_case("sell")
            })
            .map(|(oid, _)| oid.clone())
            .collect()
    }

    // ── exit escalation ──────────────────────────────────────────────────────

    pub fn exit_escalation_attempt(&self, symbol: &str) -> u32 {
        self.exit_escalations.get(symbol).copied().unwrap_or(0)
    }

    pub fn inc_exit_escalation(&mut self, symbol: &str) {
        *self.exit_escalations.entry(symbol.to_string()).or_insert(0) += 1;
    }

    pub fn clear_exit_escalation(&mut self, symbol: &str) {
        self.exit_escalations.remove(symbol);
    }

    // ── signal streak + dedup ────────────────────────────────────────────────

    pub fn record_no_signal(&mut self) {
        self.no_signal_streak += 1;
    }

    pub fn record_new_buys(&mut self) {
        self.no_signal_streak = 0;
    }

    pub fn sent_signal_seen(&self, key: &str) -> bool {
        self.sent_signals.contains_key(key)
    }

    pub fn mark_signal_sent(&mut self, key: &str, sig: SentSignal) {
        self.sent_signals.insert(key.to_string(), sig);
    }
}

// ─── Paper ledger ────────────────────────────────────────────────────────────

/// Append-only NDJSON audit log of every intent the engine committed to.
pub struct PaperLedger {
    path: PathBuf,
}

#[derive(Serialize)]
struct LedgerRecord<'a> {
    #[serde(flatten)]
    intent: &'a OrderIntent,
    status: &'a str,
    fill_price: Option<f64>,
    updated_at: String,
}

impl PaperLedger {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn append(
        &self,
        intent: &OrderIntent,
        fill_price: Option<f64>,
        status: &str,
    ) -> Result<(), EngineError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let rec = LedgerRecord { intent, status, fill_price, updated_at: now_iso() };
        let line = serde_json::to_string(&rec)?;
        let mut f = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(f, "{}", line)?;
        Ok(())
    }
}

// ─── Tick lock ───────────────────────────────────────────────────────────────

/// Process-wide tick exclusion via an exclusive lock file. A second tick
/// starting while one is active gets a StateConflict and must exit without
/// writing anything.
pub struct TickLock {
    path: PathBuf,
}

impl TickLock {
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut f) => {
                let _ = writeln!(f, "{} pid={}", now_iso(), std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(
                EngineError::StateConflict(format!("lock held at {}", path.display())),
            ),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for TickLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("[LOCK] failed to release {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{make_intent, Side};
    use chrono::NaiveDate;

    #[test]
    fn cooldown_lazy_expiry() {
        let mut st = TradingState::default();
        st.set_cooldown("X.US", &iso_after_hours(24.0), "stopout");
        assert_eq!(st.cooldown_active("X.US", Utc::now()).as_deref(), Some("stopout"));
        // move "now" past the window
        let later = Utc::now() + Duration::hours(25);
        assert!(st.cooldown_active("X.US", later).is_none());
        // lazily cleared
        assert!(st.cooldowns.is_empty());
    }

    #[test]
    fn updated_at_is_monotonic() {
        let dir = tempfile::tempdir().expect("tmp");
        let path = dir.path().join("trading_state.json");
        let mut st = TradingState::default();
        // poison with a future timestamp; save must not step backwards
        let future = (Utc::now() + Duration::hours(1)).format("%Y-%m-%dT%H:%M:%S%z").to_string();
        st.updated_at = future.clone();
        st.save(&path).unwrap();
        assert_eq!(st.updated_at, future);
    }

    #[test]
    fn state_round_trip() {
        let dir = tempfile::tempdir().expect("tmp");
        let path = dir.path().join("trading_state.json");
        let mut st = TradingState::default();
        st.mark_executed("X|STRUCT|2025-01-01 10:00", serde_json::json!({"qty": 7}));
        st.inc_daily("2025-01-01");
        st.add_open_position("X.US", 7.0, 50.12, Some(46.0), Some(56.5), Value::Null);
        st.save(&path).unwrap();

        let loaded = TradingState::load(&path);
        assert!(loaded.was_executed("X|STRUCT|2025-01-01 10:00"));
        assert_eq!(loaded.daily_count("2025-01-01"), 1);
        assert_eq!(loaded.open_positions["X.US"].qty, Some(7.0));
    }

    #[test]
    fn open_risk_skips_stub_positions() {
        let mut st = TradingState::default();
        st.add_open_position("X.US", 7.0, 50.0, Some(46.0), None, Value::Null);
        // broker-reconciled stub with unknown entry/sl
        st.open_positions.insert(
            "Y.US".into(),
            OpenPosition { qty: Some(3.0), entry: None, sl: None, tp: None, at: now_iso(), meta: Value::Null },
        );
        assert!((st.total_open_risk_usd() - 28.0).abs() < 1e-9);
    }

    #[test]
    fn pending_lookup_is_case_insensitive() {
        let mut st = TradingState::default();
        st.add_pending_order(
            "OID1",
            PendingOrder {
                symbol: "X.US".into(),
                side: "Sell".into(),
                qty: 7,
                limit_price: Some(45.9),
                sl: None,
                tp: None,
                status: "PENDING".into(),
                filled_qty: None,
                avg_price: None,
                updated_at: String::new(),
                reason: Some("STOP_LOSS".into()),
            },
        );
        assert!(st.has_pending_symbol_side("x.us", "sell"));
        assert_eq!(st.pending_sells_for("X.US"), vec!["OID1".to_string()]);
    }

    #[test]
    fn tick_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().expect("tmp");
        let path = dir.path().join("tick.lock");
        let lock = TickLock::acquire(&path).unwrap();
        match TickLock::acquire(&path) {
            Err(EngineError::StateConflict(_)) => {}
            other => panic!("expected StateConflict, got {:?}", other.map(|_| ())),
        }
        drop(lock);
        // released: can acquire again
        let _relock = TickLock::acquire(&path).unwrap();
    }

    #[test]
    fn ledger_appends_ndjson() {
        let dir = tempfile::tempdir().expect("tmp");
        let path = dir.path().join("paper_ledger.jsonl");
        let ledger = PaperLedger::new(&path);
        let now = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap().and_hms_opt(10, 0, 0).unwrap();
        let intent = make_intent("X.US", Side::Buy, 7, 50.12, Some(46.0), None, "r", Value::Null, now);
        ledger.append(&intent, Some(50.12), "FILLED").unwrap();
        ledger.append(&intent, None, "PENDING").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["status"], "FILLED");
        assert_eq!(first["symbol"], "X.US");
    }
}

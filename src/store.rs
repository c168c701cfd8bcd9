// ─────────────────────────────────────────────────────────────────────────────
// store.rs — Local OHLCV time-series store
//
// One CSV file per (symbol, interval) under data/store/{interval}/{SYMBOL}.csv.
// Bars are append-only, deduplicated by timestamp, sorted ascending. Sync
// merges a sliding upstream window so history accumulates past the upstream
// provider's own rolling limits.
// ─────────────────────────────────────────────────────────────────────────────
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{Duration, NaiveDateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::EngineError;
use crate::marketdata::MarketDataClient;

const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// One OHLCV observation. Timestamps are naive (timezone stripped upstream).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interval {
    Hour1,
    Day1,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Hour1 => "1h",
            Interval::Day1 => "1d",
        }
    }
}

impl FromStr for Interval {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1h" => Ok(Interval::Hour1),
            "1d" => Ok(Interval::Day1),
            other => Err(EngineError::Configuration(format!(
                "unsupported interval: {}",
                other
            ))),
        }
    }
}

pub struct BarStore {
    base_dir: PathBuf,
}

impl BarStore {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self { base_dir: base_dir.as_ref().to_path_buf() }
    }

    fn path(&self, symbol: &str, interval: Interval) -> PathBuf {
        let safe: String = symbol
            .chars()
            .map(|c| if c == '/' || c == ':' { '_' } else { c })
            .collect();
        self.base_dir
            .join(interval.as_str())
            .join(format!("{}.csv", safe))
    }

    /// All locally stored bars, ascending by timestamp. Missing file → empty.
    pub fn load_local(&self, symbol: &str, interval: Interval) -> Result<Vec<Bar>, EngineError> {
        let path = self.path(symbol, interval);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut rdr = csv::Reader::from_path(&path)?;
        let mut bars = Vec::new();
        for rec in rdr.records() {
            let rec = rec?;
            let bar = parse_record(&rec).ok_or_else(|| {
                EngineError::UpstreamData(format!("corrupt row in {}", path.display()))
            })?;
            bars.push(bar);
        }
        bars.sort_by_key(|b| b.ts);
        bars.dedup_by_key(|b| b.ts);
        Ok(bars)
    }

    pub fn save_local(
        &self,
        symbol: &str,
        interval: Interval,
        bars: &[Bar],
    ) -> Result<(), EngineError> {
        let path = self.path(symbol, interval);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut wtr = csv::Writer::from_path(&path)?;
        wtr.write_record(["ts", "open", "high", "low", "close", "volume"])?;
        for b in bars {
            wtr.write_record([
                b.ts.format(TS_FORMAT).to_string(),
                b.open.to_string(),
                b.high.to_string(),
                b.low.to_string(),
                b.close.to_string(),
                b.volume.to_string(),
            ])?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Fetch `now - lookback_days .. now + 1d` upstream and merge into local.
    /// Last writer wins on duplicate timestamps. An empty fetch never erases
    /// existing local data.
    pub async fn sync(
        &self,
        md: &MarketDataClient,
        symbol: &str,
        interval: Interval,
        lookback_days: i64,
    ) -> Result<Vec<Bar>, EngineError> {
        let existing = self.load_local(symbol, interval)?;

        let end = Utc::now().naive_utc() + Duration::days(1);
        let start = end - Duration::days(lookback_days);

        let fetched = match md.fetch_ohlcv(symbol, interval, start, end).await {
            Ok(bars) => bars,
            Err(e) => {
                warn!("[STORE] {} {} fetch failed: {}. Serving local only.", symbol, interval.as_str(), e);
                return Ok(existing);
            }
        };
        if fetched.is_empty() && !existing.is_empty() {
            return Ok(existing);
        }

        let merged = merge_bars(existing, fetched);
        self.save_local(symbol, interval, &merged)?;
        Ok(merged)
    }

    /// `sync`, but auto-extends the lookback when the local store has a gap
    /// bigger than `gap_days_threshold` (e.g. the job was down for a week).
    pub async fn sync_and_load(
        &self,
        md: &MarketDataClient,
        symbol: &str,
        interval: Interval,
        lookback_days: i64,
        gap_days_threshold: i64,
        max_auto_lookback_days: i64,
    ) -> Result<Vec<Bar>, EngineError> {
        let mut lookback = lookback_days;
        let existing = self.load_local(symbol, interval)?;
        if let Some(last) = existing.last() {
            let gap_days = (Utc::now().naive_utc() - last.ts).num_days();
            if gap_days > gap_days_threshold {
                let widened = (gap_days + lookback_days).min(max_auto_lookback_days);
                if widened > lookback {
                    info!(
                        "[STORE] {} {} local gap {}d > {}d, widening lookback to {}d",
                        symbol,
                        interval.as_str(),
                        gap_days,
                        gap_days_threshold,
                        widened
                    );
                    lookback = widened;
                }
            }
        }
        self.sync(md, symbol, interval, lookback).await
    }
}

fn parse_record(rec: &csv::StringRecord) -> Option<Bar> {
    if rec.len() < 6 {
        return None;
    }
    Some(Bar {
        ts: NaiveDateTime::parse_from_str(rec.get(0)?, TS_FORMAT).ok()?,
        open: rec.get(1)?.parse().ok()?,
        high: rec.get(2)?.parse().ok()?,
        low: rec.get(3)?.parse().ok()?,
        close: rec.get(4)?.parse().ok()?,
        volume: rec.get(5)?.parse().ok()?,
    })
}

/// Merge two ascending bar sets; the `incoming` side wins on duplicate ts.
pub fn merge_bars(existing: Vec<Bar>, incoming: Vec<Bar>) -> Vec<Bar> {
    let mut merged = existing;
    merged.extend(incoming);
    merged.sort_by_key(|b| b.ts);
    // keep the last occurrence per timestamp
    merged.reverse();
    merged.dedup_by_key(|b| b.ts);
    merged.reverse();
    merged
}

#[cfg(test)]
pub(crate) fn bar(ts: &str, close: f64) -> Bar {
    let ts = NaiveDateTime::parse_from_str(ts, TS_FORMAT).expect("test ts");
    Bar { ts, open: close, high: close, low: close, close, volume: 1000.0 }
}

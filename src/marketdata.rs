// ─────────────────────────────────────────────────────────────────────────────
// marketdata.rs — Upstream historical OHLCV client
//
// Speaks a chart-style JSON endpoint: epoch-second timestamp array plus
// parallel open/high/low/close/volume arrays. Prices arrive split/dividend
// adjusted; we strip timezone info and drop null slots defensively.
// ─────────────────────────────────────────────────────────────────────────────
use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;

use crate::config::EngineError;
use crate::store::{Bar, Interval};

const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
const REQUEST_TIMEOUT_SECS: u64 = 20;

pub struct MarketDataClient {
    http: reqwest::Client,
    base_url: String,
}

impl MarketDataClient {
    pub fn from_env() -> Result<Self, EngineError> {
        let base_url = std::env::var("MARKET_DATA_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| EngineError::Configuration(format!("http client: {}", e)))?;
        Ok(Self { http, base_url })
    }

    pub async fn fetch_ohlcv(
        &self,
        symbol: &str,
        interval: Interval,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<Bar>, EngineError> {
        let url = format!(
            "{}/{}?interval={}&period1={}&period2={}&events=div%2Csplit",
            self.base_url,
            symbol,
            interval.as_str(),
            start.and_utc().timestamp(),
            end.and_utc().timestamp(),
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::UpstreamData(format!("{}: {}", symbol, e)))?;
        if !resp.status().is_success() {
            return Err(EngineError::UpstreamData(format!(
                "{}: upstream status {}",
                symbol,
                resp.status()
            )));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::UpstreamData(format!("{}: bad json: {}", symbol, e)))?;
        parse_chart(symbol, &body)
    }
}

/// Pull bars out of the chart envelope. Rows with any null OHLC are skipped.
pub fn parse_chart(symbol: &str, body: &Value) -> Result<Vec<Bar>, EngineError> {
    let result = body
        .pointer("/chart/result/0")
        .ok_or_else(|| EngineError::UpstreamData(format!("{}: empty chart result", symbol)))?;

    let timestamps = match result.get("timestamp").and_then(Value::as_array) {
        Some(ts) => ts,
        // a valid response with no rows (holiday, delisted range)
        None => return Ok(Vec::new()),
    };
    let quote = result
        .pointer("/indicators/quote/0")
        .ok_or_else(|| EngineError::UpstreamData(format!("{}: missing quote block", symbol)))?;

    let series = |name: &str| -> Vec<Option<f64>> {
        quote
            .get(name)
            .and_then(Value::as_array)
            .map(|a| a.iter().map(Value::as_f64).collect())
            .unwrap_or_default()
    };
    let open = series("open");
    let high = series("high");
    let low = series("low");
    let close = series("close");
    let volume = series("volume");

    let mut bars = Vec::with_capacity(timestamps.len());
    for (i, ts) in timestamps.iter().enumerate() {
        let epoch = match ts.as_i64() {
            Some(e) => e,
            None => continue,
        };
        let ts = match DateTime::from_timestamp(epoch, 0) {
            Some(dt) => dt.naive_utc(),
            None => continue,
        };
        let (o, h, l, c) = match (
            open.get(i).copied().flatten(),
            high.get(i).copied().flatten(),
            low.get(i).copied().flatten(),
            close.get(i).copied().flatten(),
        ) {
            (Some(o), Some(h), Some(l), Some(c)) => (o, h, l, c),
            _ => continue,
        };
        let v = volume.get(i).copied().flatten().unwrap_or(0.0);
        bars.push(Bar { ts, open: o, high: h, low: l, close: c, volume: v });
    }
    bars.sort_by_key(|b| b.ts);
    bars.dedup_by_key(|b| b.ts);
    Ok(bars)
}

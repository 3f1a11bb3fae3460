use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::error::{AppError, Result};
use crate::quotes::{PricePoint, QuoteSeries, TimeRange};
use crate::settings::Settings;

use super::limiter::RateLimiter;
use super::single_flight::SingleFlight;

const QUERY_ENDPOINT: &str = "https://www.alphavantage.co/query";
const INTRADAY_INTERVAL: &str = "5min";

/// Boundary the scheduler fetches through; mocked in scheduler tests.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch(&self, symbol: &str, range: TimeRange) -> Result<QuoteSeries>;
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub endpoint: String,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub requests_per_minute: u32,
    pub max_token_wait: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            endpoint: QUERY_ENDPOINT.to_string(),
            timeout: Duration::from_secs(10),
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            requests_per_minute: 5,
            max_token_wait: Duration::from_secs(30),
        }
    }
}

impl FetchConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            requests_per_minute: settings.requests_per_minute,
            ..Self::default()
        }
    }
}

/// Quote client for the Alpha Vantage-style REST API. Every request passes
/// through the token bucket; transient failures retry with exponential
/// backoff; a rejected API key surfaces immediately without burning the
/// retry budget. Concurrent fetches for one symbol collapse into a single
/// network call.
///
/// The API key is read from the settings snapshot per request, so a key
/// changed at runtime takes effect on the next cycle without rebuilding the
/// client.
pub struct AlphaVantageClient {
    client: Client,
    settings: watch::Receiver<Arc<Settings>>,
    config: FetchConfig,
    limiter: RateLimiter,
    inflight: SingleFlight<QuoteSeries>,
}

impl AlphaVantageClient {
    pub fn new(settings: watch::Receiver<Arc<Settings>>, config: FetchConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        let limiter = RateLimiter::new(config.requests_per_minute, config.max_token_wait);
        Ok(Self {
            client,
            settings,
            config,
            limiter,
            inflight: SingleFlight::new(),
        })
    }

    fn api_key(&self) -> String {
        self.settings.borrow().api_key.clone()
    }

    async fn fetch_with_retry(&self, symbol: &str, range: TimeRange) -> Result<QuoteSeries> {
        let mut attempt: u32 = 0;
        loop {
            let result = match self.limiter.acquire().await {
                Ok(()) => self.request(symbol, range).await,
                Err(err) => Err(err),
            };

            match result {
                Ok(series) => return Ok(series),
                Err(AppError::Auth) => return Err(AppError::Auth),
                Err(err) if attempt + 1 < self.config.max_attempts => {
                    let delay = self.config.backoff_base * 2u32.pow(attempt);
                    warn!(
                        "Fetch attempt {} for {} failed ({}); retrying in {:?}",
                        attempt + 1,
                        symbol,
                        err,
                        delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn request(&self, symbol: &str, range: TimeRange) -> Result<QuoteSeries> {
        let api_key = self.api_key();
        if api_key.is_empty() {
            return Err(AppError::Auth);
        }

        let function = if range.is_intraday() {
            "TIME_SERIES_INTRADAY"
        } else {
            "TIME_SERIES_DAILY"
        };

        let mut params: Vec<(&str, String)> = vec![
            ("function", function.to_string()),
            ("symbol", symbol.to_string()),
            ("outputsize", "full".to_string()),
            ("apikey", api_key),
        ];
        if range.is_intraday() {
            params.push(("interval", INTRADAY_INTERVAL.to_string()));
        }

        debug!("Requesting {} for {}", function, symbol);
        let response = self
            .client
            .get(&self.config.endpoint)
            .query(&params)
            .send()
            .await
            .map_err(|err| classify_transport_error(symbol, err))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Err(AppError::Auth),
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(AppError::RateLimited(Duration::from_secs(60)))
            }
            status => return Err(AppError::fetch(symbol, format!("HTTP status {}", status))),
        }

        let body = response
            .text()
            .await
            .map_err(|err| classify_transport_error(symbol, err))?;
        parse_series(symbol, range, &body, Utc::now())
    }
}

#[async_trait]
impl QuoteSource for AlphaVantageClient {
    async fn fetch(&self, symbol: &str, range: TimeRange) -> Result<QuoteSeries> {
        self.inflight
            .run(symbol, self.fetch_with_retry(symbol, range))
            .await
    }
}

fn classify_transport_error(symbol: &str, err: reqwest::Error) -> AppError {
    if err.is_timeout() {
        AppError::fetch(symbol, "request timed out")
    } else {
        AppError::fetch(symbol, err.to_string())
    }
}

/// Decode a time-series payload. The provider reports soft errors inside a
/// 200 response: `Error Message` for bad requests (including a rejected
/// key), `Note`/`Information` when the per-minute quota is exhausted.
fn parse_series(
    symbol: &str,
    range: TimeRange,
    body: &str,
    now: DateTime<Utc>,
) -> Result<QuoteSeries> {
    let root: Value = serde_json::from_str(body)
        .map_err(|err| AppError::fetch(symbol, format!("invalid JSON payload: {}", err)))?;

    if let Some(message) = root.get("Error Message").and_then(Value::as_str) {
        let lowered = message.to_lowercase();
        if lowered.contains("apikey") || lowered.contains("api key") {
            return Err(AppError::Auth);
        }
        return Err(AppError::fetch(symbol, message));
    }

    if root.get("Note").is_some() || root.get("Information").is_some() {
        return Err(AppError::RateLimited(Duration::from_secs(60)));
    }

    let entries = root
        .as_object()
        .and_then(|obj| {
            obj.iter()
                .find(|(key, _)| key.starts_with("Time Series"))
                .map(|(_, value)| value)
        })
        .and_then(Value::as_object)
        .ok_or_else(|| AppError::fetch(symbol, "time series payload missing"))?;

    let window_start = range.window_start(now);
    let mut points = Vec::with_capacity(entries.len());

    for (stamp, fields) in entries {
        let Some(fields) = fields.as_object() else {
            continue;
        };
        let Some(timestamp) = parse_timestamp(stamp) else {
            continue;
        };
        if let Some(start) = window_start {
            if timestamp < start {
                continue;
            }
        }

        let Some(open) = field_f64(fields, "1. open") else {
            continue;
        };
        let Some(high) = field_f64(fields, "2. high") else {
            continue;
        };
        let Some(low) = field_f64(fields, "3. low") else {
            continue;
        };
        let Some(close) = field_f64(fields, "4. close") else {
            continue;
        };

        points.push(PricePoint {
            timestamp,
            open,
            high,
            low,
            close,
            volume: field_u64(fields, "5. volume"),
        });
    }

    points.sort_by_key(|point| point.timestamp);

    if points.is_empty() {
        return Err(AppError::fetch(symbol, "no data points in requested window"));
    }

    Ok(QuoteSeries {
        symbol: symbol.to_string(),
        points,
        range,
        fetched_at: now,
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(datetime) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&datetime));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

fn field_f64(fields: &serde_json::Map<String, Value>, key: &str) -> Option<f64> {
    let value = fields.get(key)?;
    value
        .as_str()
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| value.as_f64())
}

fn field_u64(fields: &serde_json::Map<String, Value>, key: &str) -> Option<u64> {
    let value = fields.get(key)?;
    value
        .as_str()
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| value.as_u64())
}

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Window of history shown on the chart, mirroring the ranges the quote API
/// can serve. Short ranges resolve to intraday candles, longer ones to daily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeRange {
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "3d")]
    ThreeDays,
    #[serde(rename = "1w")]
    OneWeek,
    #[serde(rename = "1m")]
    OneMonth,
    #[serde(rename = "3m")]
    ThreeMonths,
    #[serde(rename = "6m")]
    SixMonths,
    #[serde(rename = "1y")]
    OneYear,
    #[serde(rename = "all")]
    All,
}

impl TimeRange {
    pub fn is_intraday(self) -> bool {
        matches!(
            self,
            TimeRange::OneDay | TimeRange::ThreeDays | TimeRange::OneWeek
        )
    }

    /// Lower bound of the window relative to `now`. `All` has no bound.
    pub fn window_start(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let span = match self {
            TimeRange::OneDay => Duration::days(1),
            TimeRange::ThreeDays => Duration::days(3),
            TimeRange::OneWeek => Duration::weeks(1),
            TimeRange::OneMonth => Duration::days(30),
            TimeRange::ThreeMonths => Duration::days(90),
            TimeRange::SixMonths => Duration::days(180),
            TimeRange::OneYear => Duration::days(365),
            TimeRange::All => return None,
        };
        Some(now - span)
    }

    pub fn label(self) -> &'static str {
        match self {
            TimeRange::OneDay => "1 Day",
            TimeRange::ThreeDays => "3 Days",
            TimeRange::OneWeek => "1 Week",
            TimeRange::OneMonth => "1 Month",
            TimeRange::ThreeMonths => "3 Months",
            TimeRange::SixMonths => "6 Months",
            TimeRange::OneYear => "1 Year",
            TimeRange::All => "All Time",
        }
    }
}

/// One OHLC sample as returned by the quote endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<u64>,
}

/// Fetched history for a single symbol. Points are ordered ascending by
/// timestamp; the fetcher constructs the series and the cache owns it after
/// `put`.
#[derive(Debug, Clone)]
pub struct QuoteSeries {
    pub symbol: String,
    pub points: Vec<PricePoint>,
    pub range: TimeRange,
    pub fetched_at: DateTime<Utc>,
}

impl QuoteSeries {
    /// Latest quote derived from the series, so a cycle needs exactly one
    /// network call per symbol.
    pub fn latest_quote(&self) -> Option<Quote> {
        let last = self.points.last()?;
        let reference = self
            .points
            .first()
            .map(|p| p.close)
            .filter(|c| c.abs() > f64::EPSILON)
            .unwrap_or(last.close);
        let change = last.close - reference;
        let change_percent = if reference.abs() > f64::EPSILON {
            change / reference * 100.0
        } else {
            0.0
        };
        Some(Quote {
            symbol: self.symbol.clone(),
            price: last.close,
            change,
            change_percent,
            as_of: last.timestamp,
        })
    }
}

/// Snapshot of the most recent price, used for the last-price marker and the
/// up/down accent on the rendered panel.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub change: f64,
    pub change_percent: f64,
    pub as_of: DateTime<Utc>,
}

impl Quote {
    pub fn is_gain(&self) -> bool {
        self.change >= 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn point(ts: DateTime<Utc>, close: f64) -> PricePoint {
        PricePoint {
            timestamp: ts,
            open: close,
            high: close,
            low: close,
            close,
            volume: None,
        }
    }

    #[test]
    fn latest_quote_uses_first_close_as_reference() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 3, 4, 21, 0, 0).unwrap();
        let series = QuoteSeries {
            symbol: "AAPL".to_string(),
            points: vec![point(t0, 100.0), point(t1, 105.0)],
            range: TimeRange::OneDay,
            fetched_at: t1,
        };

        let quote = series.latest_quote().expect("quote");
        assert!((quote.price - 105.0).abs() < 1e-9);
        assert!((quote.change - 5.0).abs() < 1e-9);
        assert!((quote.change_percent - 5.0).abs() < 1e-9);
        assert!(quote.is_gain());
    }

    #[test]
    fn latest_quote_empty_series_is_none() {
        let series = QuoteSeries {
            symbol: "AAPL".to_string(),
            points: Vec::new(),
            range: TimeRange::OneDay,
            fetched_at: Utc::now(),
        };
        assert!(series.latest_quote().is_none());
    }

    #[test]
    fn window_start_matches_range() {
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
        let start = TimeRange::OneWeek.window_start(now).unwrap();
        assert_eq!(now - start, Duration::weeks(1));
        assert!(TimeRange::All.window_start(now).is_none());
    }

    #[test]
    fn intraday_split() {
        assert!(TimeRange::OneDay.is_intraday());
        assert!(TimeRange::OneWeek.is_intraday());
        assert!(!TimeRange::OneMonth.is_intraday());
        assert!(!TimeRange::All.is_intraday());
    }
}

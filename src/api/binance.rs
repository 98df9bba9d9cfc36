use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use super::MarketData;
use crate::error::BotError;
use crate::models::Bar;
use crate::Result;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;
/// Binance caps a single klines request at 1500 rows
const MAX_KLINES: u32 = 1500;

type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Raw kline row:
/// [open_time, open, high, low, close, volume, close_time, quote_volume,
///  trades, taker_buy_base, taker_buy_quote, ignore]
#[allow(dead_code)]
#[derive(Debug, Deserialize)]
struct KlineRow(
    i64,
    String,
    String,
    String,
    String,
    String,
    i64,
    String,
    u64,
    String,
    String,
    serde_json::Value,
);

#[derive(Debug, Deserialize)]
struct TickerPrice {
    symbol: String,
    price: String,
}

/// Binance USDⓈ-M futures public REST client
///
/// Cloneable; all clones share one rate limiter.
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
    rate_limiter: Arc<BinanceRateLimiter>,
    initial_backoff: Duration,
}

impl BinanceClient {
    pub fn new(base_url: impl Into<String>, requests_per_minute: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| BotError::Config(format!("failed to build HTTP client: {}", e)))?;

        let rpm = NonZeroU32::new(requests_per_minute)
            .ok_or_else(|| BotError::Config("requests_per_minute must be non-zero".into()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_minute(rpm))),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    /// Override the first retry delay (doubles on each attempt)
    pub fn with_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// GET with rate limiting and exponential backoff on failure
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_error = None;

        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            match self.get_json_once(&url, query).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt < MAX_RETRIES {
                        let backoff = self.initial_backoff * 2_u32.pow(attempt - 1);
                        tracing::warn!(
                            "Attempt {}/{} failed for {}: {}. Retrying in {:?}...",
                            attempt,
                            MAX_RETRIES,
                            path,
                            e,
                            backoff
                        );
                        sleep(backoff).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BotError::Data("all retry attempts failed".into())))
    }

    /// Every symbol quoted on a ticker endpoint
    async fn ticker_symbols(&self, path: &str) -> Result<Vec<String>> {
        let tickers: Vec<TickerPrice> = self.get_json(path, &[]).await?;
        Ok(tickers.into_iter().map(|t| t.symbol).collect())
    }

    /// Symbols listed on the spot market; the client must point at the spot API
    pub async fn spot_symbols(&self) -> Result<Vec<String>> {
        self.ticker_symbols("/api/v3/ticker/price").await
    }

    /// Symbols listed on the USDⓈ-M futures market
    pub async fn futures_symbols(&self) -> Result<Vec<String>> {
        self.ticker_symbols("/fapi/v1/ticker/price").await
    }

    async fn get_json_once<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let response = self.client.get(url).query(query).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BotError::Data(format!("HTTP {}: {}", status, body)));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl MarketData for BinanceClient {
    async fn fetch_bars(&self, symbol: &str, interval: &str, count: u32) -> Result<Vec<Bar>> {
        let limit = count.clamp(1, MAX_KLINES);
        let rows: Vec<KlineRow> = self
            .get_json(
                "/fapi/v1/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        let now = Utc::now();
        let bars = rows
            .into_iter()
            .map(|row| kline_to_bar(symbol, row, now))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(symbol, interval, count = bars.len(), "Fetched historical bars");
        Ok(bars)
    }

    async fn get_price(&self, symbol: &str) -> Result<f64> {
        let ticker: TickerPrice = self
            .get_json("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())])
            .await?;
        let price = parse_num("price", &ticker.price)?;
        if price <= 0.0 {
            return Err(BotError::Data(format!("non-positive price for {}", symbol)));
        }
        Ok(price)
    }
}

fn kline_to_bar(symbol: &str, row: KlineRow, now: DateTime<Utc>) -> Result<Bar> {
    let open_time = millis(row.0)?;
    let close_time = millis(row.6)?;

    let bar = Bar {
        symbol: symbol.to_string(),
        open_time,
        open: parse_num("open", &row.1)?,
        high: parse_num("high", &row.2)?,
        low: parse_num("low", &row.3)?,
        close: parse_num("close", &row.4)?,
        volume: parse_num("volume", &row.5)?,
        buy_volume: parse_num("taker_buy_base", &row.9)?,
        quote_volume: parse_num("quote_volume", &row.7)?,
        close_time,
        // the last row of a klines response is the bar still forming
        is_final: close_time <= now,
    };
    bar.validate()
}

pub(crate) fn parse_num(field: &str, raw: &str) -> Result<f64> {
    raw.parse::<f64>()
        .map_err(|_| BotError::Data(format!("invalid {} value: {:?}", field, raw)))
}

pub(crate) fn millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| BotError::Data(format!("timestamp out of range: {}", ms)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(server: &mockito::ServerGuard) -> BinanceClient {
        BinanceClient::new(server.url(), 6000)
            .unwrap()
            .with_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_fetch_bars_parses_klines() {
        let mut server = mockito::Server::new_async().await;
        let now_ms = Utc::now().timestamp_millis();
        let body = format!(
            r#"[
                [1700000000000, "100.0", "105.0", "99.0", "104.0", "10.0", 1700003599999, "1020.5", 42, "6.0", "612.0", "0"],
                [{open}, "104.0", "106.0", "103.0", "105.0", "3.0", {close}, "312.0", 7, "1.0", "104.0", "0"]
            ]"#,
            open = now_ms - 1000,
            close = now_ms + 3_600_000
        );
        let mock = server
            .mock("GET", "/fapi/v1/klines")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
                mockito::Matcher::UrlEncoded("interval".into(), "1h".into()),
                mockito::Matcher::UrlEncoded("limit".into(), "2".into()),
            ]))
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let bars = client(&server).fetch_bars("BTCUSDT", "1h", 2).await.unwrap();

        mock.assert_async().await;
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].open, 100.0);
        assert_eq!(bars[0].high, 105.0);
        assert_eq!(bars[0].quote_volume, 1020.5);
        assert_eq!(bars[0].buy_volume, 6.0);
        assert!(bars[0].is_final);
        // still forming
        assert!(!bars[1].is_final);
    }

    #[tokio::test]
    async fn test_malformed_kline_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/fapi/v1/klines")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            // high below low
            .with_body(r#"[[1700000000000, "100.0", "90.0", "99.0", "95.0", "10.0", 1700003599999, "1.0", 1, "1.0", "1.0", "0"]]"#)
            .create_async()
            .await;

        let result = client(&server).fetch_bars("BTCUSDT", "1h", 1).await;
        assert!(matches!(result, Err(BotError::MalformedBar { .. })));
    }

    #[tokio::test]
    async fn test_get_price() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/fapi/v1/ticker/price")
            .match_query(mockito::Matcher::UrlEncoded("symbol".into(), "ETHUSDT".into()))
            .with_status(200)
            .with_body(r#"{"symbol":"ETHUSDT","price":"2450.25","time":1700000000000}"#)
            .create_async()
            .await;

        let price = client(&server).get_price("ETHUSDT").await.unwrap();
        assert_eq!(price, 2450.25);
    }

    #[tokio::test]
    async fn test_listed_symbols() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v3/ticker/price")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"[{"symbol":"ETHUSDT","price":"2450.25"},{"symbol":"ETHBTC","price":"0.05"}]"#)
            .create_async()
            .await;
        server
            .mock("GET", "/fapi/v1/ticker/price")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"[{"symbol":"ETHUSDT","price":"2450.10","time":1700000000000}]"#)
            .create_async()
            .await;

        let client = client(&server);

        assert_eq!(client.spot_symbols().await.unwrap(), vec!["ETHUSDT", "ETHBTC"]);
        assert_eq!(client.futures_symbols().await.unwrap(), vec!["ETHUSDT"]);
    }

    #[tokio::test]
    async fn test_get_price_retries_then_fails() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/fapi/v1/ticker/price")
            .match_query(mockito::Matcher::Any)
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let result = client(&server).get_price("ETHUSDT").await;

        mock.assert_async().await;
        assert!(matches!(result, Err(BotError::Data(_))));
    }
}

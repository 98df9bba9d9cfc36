use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use crate::error::BotError;
use crate::Result;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 1000;
/// Symbols per quotes request
const CHUNK_SIZE: usize = 100;
/// Basic plan allows 30 calls per minute
const REQUESTS_PER_MINUTE: u32 = 30;

type CmcRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

// ============== Response Types ==============

#[derive(Debug, Deserialize)]
struct QuotesResponse {
    #[serde(default)]
    data: HashMap<String, Vec<QuoteEntry>>,
}

#[derive(Debug, Deserialize)]
struct QuoteEntry {
    cmc_rank: Option<u32>,
    quote: HashMap<String, UsdQuote>,
}

#[derive(Debug, Deserialize)]
struct UsdQuote {
    price: Option<f64>,
}

// ============== Public Types ==============

/// Market cap rank and USD price of one coin
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoinQuote {
    pub rank: u32,
    pub price: f64,
}

/// CoinMarketCap Pro API client
#[derive(Clone)]
pub struct CoinMarketCapClient {
    client: Client,
    base_url: String,
    api_key: String,
    rate_limiter: Arc<CmcRateLimiter>,
    initial_backoff: Duration,
}

impl CoinMarketCapClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| BotError::Config(format!("failed to build HTTP client: {}", e)))?;
        let rpm = NonZeroU32::new(REQUESTS_PER_MINUTE)
            .ok_or_else(|| BotError::Config("requests per minute must be non-zero".into()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_minute(rpm))),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    pub fn with_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Rank and price for each base asset CoinMarketCap knows
    ///
    /// Symbols are queried in chunks of 100. Coins without a rank or USD
    /// price are left out of the result.
    pub async fn quotes(&self, symbols: &[String]) -> Result<HashMap<String, CoinQuote>> {
        let mut quotes = HashMap::new();

        for chunk in symbols.chunks(CHUNK_SIZE) {
            let response = self.get_quotes(&chunk.join(",")).await?;
            for (symbol, entries) in response.data {
                // the first entry is the highest ranked coin using that ticker
                let Some(entry) = entries.into_iter().next() else {
                    continue;
                };
                let price = entry.quote.get("USD").and_then(|q| q.price);
                if let (Some(rank), Some(price)) = (entry.cmc_rank, price) {
                    quotes.insert(symbol, CoinQuote { rank, price });
                }
            }
        }

        tracing::debug!(requested = symbols.len(), found = quotes.len(), "Fetched CMC quotes");
        Ok(quotes)
    }

    async fn get_quotes(&self, symbols: &str) -> Result<QuotesResponse> {
        let url = format!("{}/v2/cryptocurrency/quotes/latest", self.base_url);
        let mut last_error = None;

        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            match self.get_quotes_once(&url, symbols).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if attempt < MAX_RETRIES {
                        let backoff = self.initial_backoff * 2_u32.pow(attempt - 1);
                        tracing::warn!(
                            "CMC attempt {}/{} failed: {}. Retrying in {:?}...",
                            attempt,
                            MAX_RETRIES,
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

    async fn get_quotes_once(&self, url: &str, symbols: &str) -> Result<QuotesResponse> {
        let response = self
            .client
            .get(url)
            .header("X-CMC_PRO_API_KEY", &self.api_key)
            .header("Accept", "application/json")
            .query(&[("symbol", symbols)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BotError::Data(format!("CMC HTTP {}: {}", status, body)));
        }
        Ok(response.json::<QuotesResponse>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(server: &mockito::ServerGuard) -> CoinMarketCapClient {
        CoinMarketCapClient::new(server.url(), "test_key")
            .unwrap()
            .with_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_quotes_parses_rank_and_price() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v2/cryptocurrency/quotes/latest")
            .match_header("X-CMC_PRO_API_KEY", "test_key")
            .match_query(mockito::Matcher::UrlEncoded("symbol".into(), "ARB,DOGE,NEW".into()))
            .with_status(200)
            .with_body(
                r#"{"data": {
                    "ARB": [
                        {"cmc_rank": 60, "quote": {"USD": {"price": 0.75}}},
                        {"cmc_rank": 4000, "quote": {"USD": {"price": 0.01}}}
                    ],
                    "DOGE": [{"cmc_rank": 9, "quote": {"USD": {"price": 0.12}}}],
                    "NEW": [{"cmc_rank": null, "quote": {"USD": {"price": null}}}]
                }}"#,
            )
            .create_async()
            .await;

        let symbols = vec!["ARB".to_string(), "DOGE".to_string(), "NEW".to_string()];
        let quotes = client(&server).quotes(&symbols).await.unwrap();

        mock.assert_async().await;
        assert_eq!(quotes.len(), 2);
        assert_eq!(quotes["ARB"], CoinQuote { rank: 60, price: 0.75 });
        assert_eq!(quotes["DOGE"].rank, 9);
        assert!(!quotes.contains_key("NEW"));
    }

    #[tokio::test]
    async fn test_quotes_chunks_requests() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v2/cryptocurrency/quotes/latest")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"data": {}}"#)
            .expect(3)
            .create_async()
            .await;

        let symbols: Vec<String> = (0..250).map(|i| format!("C{}", i)).collect();
        let quotes = client(&server).quotes(&symbols).await.unwrap();

        mock.assert_async().await;
        assert!(quotes.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_key_is_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/cryptocurrency/quotes/latest")
            .match_query(mockito::Matcher::Any)
            .with_status(401)
            .with_body(r#"{"status": {"error_message": "This API Key is invalid."}}"#)
            .expect(3)
            .create_async()
            .await;

        let result = client(&server).quotes(&["BTC".to_string()]).await;
        assert!(matches!(result, Err(BotError::Data(_))));
    }
}
